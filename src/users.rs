use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

use crate::error::EngineError;
use crate::types::User;

pub(crate) const USER_COLUMNS: &str = "id, name, referral_code, sponsor_id, wallet_balance, \
     monthly_purchase, is_active, kyc_status, kyc_reason, activated_at, created_at";

/// Registers a user, optionally under the owner of `sponsor_code`.
/// The user stays inactive until their first paid order.
pub async fn register(pool: &PgPool, name: &str, sponsor_code: Option<&str>) -> Result<User> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Invalid("name must not be empty".into()).into());
    }

    let sponsor_id = match sponsor_code.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => Some(
            sqlx::query_scalar::<_, i64>(r#"SELECT id FROM users WHERE referral_code = $1"#)
                .bind(code)
                .fetch_optional(pool)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("sponsor code {code}")))?,
        ),
        None => None,
    };

    let user = sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (name, sponsor_id) VALUES ($1, $2) RETURNING {USER_COLUMNS}"
    ))
    .bind(name)
    .bind(sponsor_id)
    .fetch_one(pool)
    .await?;

    info!(user_id = user.id, sponsor_id = ?user.sponsor_id, "user registered");
    Ok(user)
}

pub async fn get(pool: &PgPool, user_id: i64) -> Result<User> {
    let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;
    Ok(user)
}
