//! Self-income joining bonus installments.

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::ledger::{self, NewLedgerEntry};
use crate::types::{LedgerEntryType, PayoutStatus, SelfPayout};

/// One installment of a plan, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedInstalment {
    pub instalment_no: i32,
    pub amount: i64,
    pub due_at: DateTime<Utc>,
}

/// Splits `total` into `count` installments spaced `interval` apart, the first
/// due at `first_due`. Early installments absorb the remainder one paisa each,
/// so the plan always sums to `total`.
pub fn plan_installments(
    total: i64,
    count: u32,
    interval: TimeDelta,
    first_due: DateTime<Utc>,
) -> Vec<PlannedInstalment> {
    if count == 0 || total <= 0 {
        return Vec::new();
    }
    let n = i64::from(count);
    let base = total / n;
    let extra = total % n;

    (0..n)
        .map(|i| PlannedInstalment {
            instalment_no: (i + 1) as i32,
            amount: base + i64::from(i < extra),
            due_at: first_due + interval * i as i32,
        })
        .filter(|p| p.amount > 0)
        .collect()
}

/// Stores a plan for `order_id`. Re-scheduling the same order inserts nothing.
pub async fn schedule(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    order_id: Uuid,
    plan: &[PlannedInstalment],
) -> Result<u64> {
    let mut inserted = 0;
    for p in plan {
        let res = sqlx::query(
            r#"INSERT INTO self_payout_schedule (user_id, order_id, instalment_no, amount, due_at, status)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (order_id, instalment_no) DO NOTHING"#,
        )
        .bind(user_id)
        .bind(order_id)
        .bind(p.instalment_no)
        .bind(p.amount)
        .bind(p.due_at)
        .bind(PayoutStatus::Scheduled.as_str())
        .execute(tx.as_mut())
        .await?;
        inserted += res.rows_affected();
    }
    Ok(inserted)
}

/// What one payout run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PayoutRunSummary {
    pub processed: u64,
    pub credited: i64,
}

/// Credits installments due at or before `now`, at most `batch` of them.
/// `now` is only the due-date cutoff; `processed_at` records the database clock.
///
/// Each installment is locked with `SKIP LOCKED` and settled in its own
/// transaction, so concurrent runs never credit the same row twice.
#[instrument(skip(pool))]
pub async fn process_due(pool: &PgPool, now: DateTime<Utc>, batch: i64) -> Result<PayoutRunSummary> {
    let mut summary = PayoutRunSummary::default();

    while (summary.processed as i64) < batch {
        let mut tx = pool.begin().await?;

        let due = sqlx::query_as::<_, SelfPayout>(
            r#"SELECT id, user_id, order_id, instalment_no, amount, due_at, status, processed_at
               FROM self_payout_schedule
               WHERE status = $1 AND due_at <= $2
               ORDER BY due_at, id
               LIMIT 1
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(PayoutStatus::Scheduled.as_str())
        .bind(now)
        .fetch_optional(tx.as_mut())
        .await?;

        let Some(due) = due else {
            tx.commit().await?;
            break;
        };

        let credited = ledger::post_entry(
            &mut tx,
            &NewLedgerEntry {
                user_id: due.user_id,
                entry_type: LedgerEntryType::SelfJoiningInstalment,
                amount: due.amount,
                level_depth: 0,
                reference: format!("schedule:{}", due.id),
            },
        )
        .await?;
        if !credited {
            warn!(schedule_id = due.id, "installment already in ledger, marking processed");
        }

        sqlx::query(
            r#"UPDATE self_payout_schedule SET status = $2, processed_at = NOW() WHERE id = $1"#,
        )
        .bind(due.id)
        .bind(PayoutStatus::Processed.as_str())
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;

        summary.processed += 1;
        if credited {
            summary.credited += due.amount;
        }
    }

    if summary.processed > 0 {
        info!(
            processed = summary.processed,
            credited = summary.credited,
            "installments paid out"
        );
    }
    Ok(summary)
}

pub async fn schedule_for_user(pool: &PgPool, user_id: i64) -> Result<Vec<SelfPayout>> {
    let rows = sqlx::query_as::<_, SelfPayout>(
        r#"SELECT id, user_id, order_id, instalment_no, amount, due_at, status, processed_at
           FROM self_payout_schedule
           WHERE user_id = $1
           ORDER BY due_at, instalment_no"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
