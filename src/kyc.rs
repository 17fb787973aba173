//! KYC status gate. Only the status matters here; documents live elsewhere.

use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

use crate::error::EngineError;
use crate::types::{KycStatus, User};
use crate::users::USER_COLUMNS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KycAction {
    Submit,
    Approve,
    Reject,
}

/// The status `action` leads to from `from`, if the move is allowed.
pub fn transition(from: KycStatus, action: KycAction) -> Result<KycStatus, EngineError> {
    match (from, action) {
        (KycStatus::NotSubmitted | KycStatus::Rejected, KycAction::Submit) => Ok(KycStatus::Pending),
        (KycStatus::Pending, KycAction::Approve) => Ok(KycStatus::Approved),
        (KycStatus::Pending, KycAction::Reject) => Ok(KycStatus::Rejected),
        (from, action) => Err(EngineError::InvalidState(format!(
            "cannot {} kyc in status {from}",
            match action {
                KycAction::Submit => "submit",
                KycAction::Approve => "approve",
                KycAction::Reject => "reject",
            }
        ))),
    }
}

async fn apply(pool: &PgPool, user_id: i64, action: KycAction, reason: Option<String>) -> Result<User> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_scalar::<_, String>(
        r#"SELECT kyc_status FROM users WHERE id = $1 FOR UPDATE"#,
    )
    .bind(user_id)
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;

    let next = transition(current.parse()?, action)?;

    let user = sqlx::query_as::<_, User>(&format!(
        "UPDATE users SET kyc_status = $2, kyc_reason = $3 WHERE id = $1 RETURNING {USER_COLUMNS}"
    ))
    .bind(user_id)
    .bind(next.as_str())
    .bind(reason)
    .fetch_one(tx.as_mut())
    .await?;

    tx.commit().await?;
    info!(user_id, status = %next, "kyc status changed");
    Ok(user)
}

pub async fn submit(pool: &PgPool, user_id: i64) -> Result<User> {
    apply(pool, user_id, KycAction::Submit, None).await
}

/// Admin decision on a pending submission.
pub async fn review(pool: &PgPool, user_id: i64, approve: bool, reason: Option<String>) -> Result<User> {
    let action = if approve {
        KycAction::Approve
    } else {
        KycAction::Reject
    };
    apply(pool, user_id, action, reason).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let s = transition(KycStatus::NotSubmitted, KycAction::Submit).unwrap();
        let s = transition(s, KycAction::Approve).unwrap();
        assert_eq!(s, KycStatus::Approved);
    }

    #[test]
    fn rejected_users_can_resubmit() {
        let s = transition(KycStatus::Pending, KycAction::Reject).unwrap();
        assert_eq!(transition(s, KycAction::Submit), Ok(KycStatus::Pending));
    }

    #[test]
    fn reviews_need_a_pending_submission() {
        assert!(matches!(
            transition(KycStatus::NotSubmitted, KycAction::Approve),
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(
            transition(KycStatus::Approved, KycAction::Submit),
            Err(EngineError::InvalidState(_))
        ));
    }
}
