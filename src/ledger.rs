//! Append-only ledger and the wallet balances derived from it.
//!
//! `post_entry` is the only code path that changes `users.wallet_balance`; it
//! writes the entry and the balance in the caller's transaction so the two can
//! never disagree.

use anyhow::Result;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument, warn};

use crate::error::EngineError;
use crate::types::{LedgerEntry, LedgerEntryType, WithdrawalStatus};

/// An entry about to be posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub user_id: i64,
    pub entry_type: LedgerEntryType,
    pub amount: i64,
    pub level_depth: i32,
    pub reference: String,
}

/// Posts `entry` and applies it to the wallet.
///
/// Returns `false` when the same `(user, type, reference, level)` was already
/// posted; the wallet is left alone in that case. Debits that would take the
/// balance below zero fail with [`EngineError::InsufficientBalance`] and must
/// roll back the transaction.
pub async fn post_entry(tx: &mut Transaction<'_, Postgres>, entry: &NewLedgerEntry) -> Result<bool> {
    let res = sqlx::query(
        r#"INSERT INTO ledger (user_id, entry_type, amount, level_depth, reference)
           VALUES ($1, $2, $3, $4, $5)
           ON CONFLICT (user_id, entry_type, reference, level_depth) DO NOTHING"#,
    )
    .bind(entry.user_id)
    .bind(entry.entry_type.as_str())
    .bind(entry.amount)
    .bind(entry.level_depth)
    .bind(&entry.reference)
    .execute(tx.as_mut())
    .await?;

    if res.rows_affected() == 0 {
        debug!(
            user_id = entry.user_id,
            entry_type = %entry.entry_type,
            reference = %entry.reference,
            "ledger entry already posted"
        );
        return Ok(false);
    }

    let updated = sqlx::query(
        r#"UPDATE users SET wallet_balance = wallet_balance + $2
           WHERE id = $1 AND wallet_balance + $2 >= 0"#,
    )
    .bind(entry.user_id)
    .bind(entry.amount)
    .execute(tx.as_mut())
    .await?;

    if updated.rows_affected() == 0 {
        let balance = sqlx::query_scalar::<_, i64>(r#"SELECT wallet_balance FROM users WHERE id = $1"#)
            .bind(entry.user_id)
            .fetch_optional(tx.as_mut())
            .await?;
        return Err(match balance {
            None => EngineError::NotFound(format!("user {}", entry.user_id)),
            Some(available) => EngineError::InsufficientBalance {
                requested: -entry.amount,
                available,
            },
        }
        .into());
    }

    debug!(
        user_id = entry.user_id,
        entry_type = %entry.entry_type,
        amount = entry.amount,
        "ledger entry posted"
    );
    Ok(true)
}

/// A user's wallet as shown to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Wallet {
    pub user_id: i64,
    pub balance: i64,
    /// Held by pending withdrawal requests.
    pub pending_withdrawals: i64,
    /// What can still be requested for withdrawal.
    pub available: i64,
    /// Sum of all credits ever posted.
    pub lifetime_credited: i64,
}

pub async fn wallet(pool: &PgPool, user_id: i64) -> Result<Wallet> {
    let row = sqlx::query_as::<_, (i64, i64, i64)>(
        r#"SELECT u.wallet_balance,
                  COALESCE((SELECT SUM(w.amount) FROM withdrawals w
                            WHERE w.user_id = u.id AND w.status = $2), 0)::BIGINT,
                  COALESCE((SELECT SUM(l.amount) FROM ledger l
                            WHERE l.user_id = u.id AND l.amount > 0), 0)::BIGINT
           FROM users u WHERE u.id = $1"#,
    )
    .bind(user_id)
    .bind(WithdrawalStatus::Pending.as_str())
    .fetch_optional(pool)
    .await?;

    let (balance, pending_withdrawals, lifetime_credited) =
        row.ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;

    Ok(Wallet {
        user_id,
        balance,
        pending_withdrawals,
        available: balance - pending_withdrawals,
        lifetime_credited,
    })
}

/// One page of a user's ledger, newest first, plus the total entry count.
pub async fn entries_for_user(
    pool: &PgPool,
    user_id: i64,
    page: u32,
    per_page: u32,
) -> Result<(Vec<LedgerEntry>, u64)> {
    let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);

    let entries = sqlx::query_as::<_, LedgerEntry>(
        r#"SELECT id, user_id, entry_type, amount, level_depth, reference, created_at
           FROM ledger WHERE user_id = $1
           ORDER BY created_at DESC, id DESC
           LIMIT $2 OFFSET $3"#,
    )
    .bind(user_id)
    .bind(i64::from(per_page))
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let total = sqlx::query_scalar::<_, i64>(r#"SELECT COUNT(*) FROM ledger WHERE user_id = $1"#)
        .bind(user_id)
        .fetch_one(pool)
        .await?;

    Ok((entries, total.max(0) as u64))
}

/// A user whose wallet no longer matches their ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct BalanceMismatch {
    pub user_id: i64,
    pub wallet_balance: i64,
    pub ledger_sum: i64,
    /// `wallet_balance - ledger_sum`.
    pub drift: i64,
}

/// Compares every wallet with the sum of its ledger entries. Read-only.
#[instrument(skip(pool))]
pub async fn reconcile(pool: &PgPool) -> Result<Vec<BalanceMismatch>> {
    let mismatches = sqlx::query_as::<_, BalanceMismatch>(
        r#"SELECT u.id AS user_id,
                  u.wallet_balance,
                  COALESCE(SUM(l.amount), 0)::BIGINT AS ledger_sum,
                  (u.wallet_balance - COALESCE(SUM(l.amount), 0))::BIGINT AS drift
           FROM users u LEFT JOIN ledger l ON l.user_id = u.id
           GROUP BY u.id, u.wallet_balance
           HAVING u.wallet_balance <> COALESCE(SUM(l.amount), 0)
           ORDER BY u.id"#,
    )
    .fetch_all(pool)
    .await?;

    for m in &mismatches {
        warn!(
            user_id = m.user_id,
            wallet_balance = m.wallet_balance,
            ledger_sum = m.ledger_sum,
            drift = m.drift,
            "wallet does not match ledger"
        );
    }
    Ok(mismatches)
}
