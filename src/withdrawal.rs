//! Two-phase withdrawals.
//!
//! A request posts a zero-amount `withdrawal_request` entry and holds funds.
//! Approval posts the `withdrawal` debit; rejection posts a zero-amount
//! `withdrawal_reversal` and releases the hold. All three entries share the
//! `withdrawal:<id>` reference, so the ledger carries the whole history while
//! its sum keeps matching the wallet.

use anyhow::Result;
use sqlx::PgPool;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::ledger::{self, NewLedgerEntry};
use crate::types::{KycStatus, LedgerEntryType, Withdrawal, WithdrawalStatus};

const WITHDRAWAL_COLUMNS: &str = "id, user_id, amount, status, reason, requested_at, decided_at";

/// Checks a request against the user's state. Runs before any write.
pub fn check_request(
    kyc: KycStatus,
    amount: i64,
    available: i64,
    min_withdrawal: i64,
) -> Result<(), EngineError> {
    if amount <= 0 {
        return Err(EngineError::InvalidAmount("amount must be > 0".into()));
    }
    if kyc != KycStatus::Approved {
        return Err(EngineError::KycNotApproved);
    }
    if amount < min_withdrawal {
        return Err(EngineError::BelowMinimum {
            minimum: min_withdrawal,
        });
    }
    if amount > available {
        return Err(EngineError::InsufficientBalance {
            requested: amount,
            available: available.max(0),
        });
    }
    Ok(())
}

#[instrument(skip(pool, settings))]
pub async fn request(pool: &PgPool, user_id: i64, amount: i64, settings: &EngineSettings) -> Result<Withdrawal> {
    if amount <= 0 {
        return Err(EngineError::InvalidAmount("amount must be > 0".into()).into());
    }

    let mut tx = pool.begin().await?;

    // The lock serializes concurrent requests from the same user.
    let (balance, kyc) = sqlx::query_as::<_, (i64, String)>(
        r#"SELECT wallet_balance, kyc_status FROM users WHERE id = $1 FOR UPDATE"#,
    )
    .bind(user_id)
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;

    let held = sqlx::query_scalar::<_, i64>(
        r#"SELECT COALESCE(SUM(amount), 0)::BIGINT FROM withdrawals WHERE user_id = $1 AND status = $2"#,
    )
    .bind(user_id)
    .bind(WithdrawalStatus::Pending.as_str())
    .fetch_one(tx.as_mut())
    .await?;

    check_request(kyc.parse()?, amount, balance - held, settings.min_withdrawal)?;

    let withdrawal = sqlx::query_as::<_, Withdrawal>(&format!(
        "INSERT INTO withdrawals (id, user_id, amount, status) VALUES ($1, $2, $3, $4)
         RETURNING {WITHDRAWAL_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(amount)
    .bind(WithdrawalStatus::Pending.as_str())
    .fetch_one(tx.as_mut())
    .await?;

    ledger::post_entry(&mut tx, &marker(&withdrawal, LedgerEntryType::WithdrawalRequest, 0)).await?;

    tx.commit().await?;
    info!(withdrawal_id = %withdrawal.id, user_id, amount, "withdrawal requested");
    Ok(withdrawal)
}

fn marker(w: &Withdrawal, entry_type: LedgerEntryType, amount: i64) -> NewLedgerEntry {
    NewLedgerEntry {
        user_id: w.user_id,
        entry_type,
        amount,
        level_depth: 0,
        reference: format!("withdrawal:{}", w.id),
    }
}

fn ensure_pending(w: &Withdrawal) -> Result<(), EngineError> {
    if w.status != WithdrawalStatus::Pending {
        return Err(EngineError::InvalidState(format!(
            "withdrawal {} is already {}",
            w.id, w.status
        )));
    }
    Ok(())
}

/// Approves a pending request and debits the wallet.
#[instrument(skip(pool))]
pub async fn approve(pool: &PgPool, withdrawal_id: Uuid) -> Result<Withdrawal> {
    let mut tx = pool.begin().await?;

    let pending = sqlx::query_as::<_, Withdrawal>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE id = $1 FOR UPDATE"
    ))
    .bind(withdrawal_id)
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or_else(|| EngineError::NotFound(format!("withdrawal {withdrawal_id}")))?;
    ensure_pending(&pending)?;

    ledger::post_entry(&mut tx, &marker(&pending, LedgerEntryType::Withdrawal, -pending.amount)).await?;

    let approved = sqlx::query_as::<_, Withdrawal>(&format!(
        "UPDATE withdrawals SET status = $2, decided_at = NOW() WHERE id = $1
         RETURNING {WITHDRAWAL_COLUMNS}"
    ))
    .bind(withdrawal_id)
    .bind(WithdrawalStatus::Approved.as_str())
    .fetch_one(tx.as_mut())
    .await?;

    tx.commit().await?;
    info!(user_id = approved.user_id, amount = approved.amount, "withdrawal approved");
    Ok(approved)
}

/// Rejects a pending request and releases the hold. The reversal entry is
/// zero because the request never debited the wallet.
#[instrument(skip(pool))]
pub async fn reject(pool: &PgPool, withdrawal_id: Uuid, reason: Option<String>) -> Result<Withdrawal> {
    let mut tx = pool.begin().await?;

    let pending = sqlx::query_as::<_, Withdrawal>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE id = $1 FOR UPDATE"
    ))
    .bind(withdrawal_id)
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or_else(|| EngineError::NotFound(format!("withdrawal {withdrawal_id}")))?;
    ensure_pending(&pending)?;

    ledger::post_entry(&mut tx, &marker(&pending, LedgerEntryType::WithdrawalReversal, 0)).await?;

    let rejected = sqlx::query_as::<_, Withdrawal>(&format!(
        "UPDATE withdrawals SET status = $2, reason = $3, decided_at = NOW() WHERE id = $1
         RETURNING {WITHDRAWAL_COLUMNS}"
    ))
    .bind(withdrawal_id)
    .bind(WithdrawalStatus::Rejected.as_str())
    .bind(reason)
    .fetch_one(tx.as_mut())
    .await?;

    tx.commit().await?;
    info!(user_id = rejected.user_id, amount = rejected.amount, "withdrawal rejected");
    Ok(rejected)
}

pub async fn list_for_user(pool: &PgPool, user_id: i64) -> Result<Vec<Withdrawal>> {
    let rows = sqlx::query_as::<_, Withdrawal>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE user_id = $1 ORDER BY requested_at DESC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kyc_is_checked_first() {
        assert_eq!(
            check_request(KycStatus::Pending, 60_000, 1_000_000, 50_000),
            Err(EngineError::KycNotApproved)
        );
        assert_eq!(
            check_request(KycStatus::Rejected, 60_000, 1_000_000, 50_000),
            Err(EngineError::KycNotApproved)
        );
    }

    #[test]
    fn minimum_applies() {
        assert_eq!(
            check_request(KycStatus::Approved, 49_999, 1_000_000, 50_000),
            Err(EngineError::BelowMinimum { minimum: 50_000 })
        );
    }

    #[test]
    fn cannot_exceed_available_funds() {
        assert_eq!(
            check_request(KycStatus::Approved, 60_000, 59_999, 50_000),
            Err(EngineError::InsufficientBalance {
                requested: 60_000,
                available: 59_999
            })
        );
        assert_eq!(check_request(KycStatus::Approved, 60_000, 60_000, 50_000), Ok(()));
    }

    #[test]
    fn markers_share_the_withdrawal_reference() {
        let w = Withdrawal {
            id: Uuid::nil(),
            user_id: 9,
            amount: 60_000,
            status: WithdrawalStatus::Pending,
            reason: None,
            requested_at: chrono::Utc::now(),
            decided_at: None,
        };
        let request = marker(&w, LedgerEntryType::WithdrawalRequest, 0);
        let debit = marker(&w, LedgerEntryType::Withdrawal, -w.amount);
        assert_eq!(request.reference, debit.reference);
        assert_eq!(request.reference, format!("withdrawal:{}", Uuid::nil()));
        assert_eq!((request.amount, debit.amount), (0, -60_000));
        assert_eq!(debit.user_id, 9);
    }

    #[test]
    fn non_positive_amounts_are_invalid() {
        assert!(matches!(
            check_request(KycStatus::Approved, 0, 100, 1),
            Err(EngineError::InvalidAmount(_))
        ));
    }
}
