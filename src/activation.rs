use anyhow::{Result, bail};
use sqlx::{Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::hierarchy;

const CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    Activated { referral_code: String, placed: u64 },
    AlreadyActive,
}

/// `prefix` followed by 8 uppercase hex characters.
pub fn referral_code(prefix: &str) -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", raw[..8].to_uppercase())
}

async fn unused_referral_code(tx: &mut Transaction<'_, Postgres>, prefix: &str) -> Result<String> {
    for _ in 0..CODE_ATTEMPTS {
        let code = referral_code(prefix);
        let taken = sqlx::query_scalar::<_, bool>(
            r#"SELECT EXISTS (SELECT 1 FROM users WHERE referral_code = $1)"#,
        )
        .bind(&code)
        .fetch_one(tx.as_mut())
        .await?;
        if !taken {
            return Ok(code);
        }
    }
    bail!("could not find a free referral code after {CODE_ATTEMPTS} attempts")
}

/// Activates `user_id` on their first paid order.
///
/// The user row is locked first, so two orders paid at the same time activate
/// the user once. Calling this for an active user changes nothing.
pub async fn activate(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    code_prefix: &str,
) -> Result<Activation> {
    let row = sqlx::query_as::<_, (Option<i64>, bool, Option<String>)>(
        r#"SELECT sponsor_id, is_active, referral_code FROM users WHERE id = $1 FOR UPDATE"#,
    )
    .bind(user_id)
    .fetch_optional(tx.as_mut())
    .await?;

    let (sponsor_id, is_active, existing_code) =
        row.ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;

    if is_active && existing_code.is_some() {
        return Ok(Activation::AlreadyActive);
    }

    let referral_code = match existing_code {
        Some(code) => code,
        None => unused_referral_code(tx, code_prefix).await?,
    };

    sqlx::query(
        r#"UPDATE users
           SET is_active = TRUE, referral_code = $2, activated_at = COALESCE(activated_at, NOW())
           WHERE id = $1"#,
    )
    .bind(user_id)
    .bind(&referral_code)
    .execute(tx.as_mut())
    .await?;

    let placed = hierarchy::place(tx, user_id, sponsor_id).await?;

    info!(user_id, %referral_code, placed, "user activated");
    Ok(Activation::Activated {
        referral_code,
        placed,
    })
}
