//! Monthly turnover pool.
//!
//! A share of the month's paid turnover is split evenly between active
//! members who bought at least `pool_min_purchase` that month. Each period is
//! distributed once, and closing a period restarts the users'
//! `monthly_purchase` counters.

use anyhow::Result;
use chrono::{DateTime, Months, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, instrument};

use crate::commission::{bps_of, split_evenly};
use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::ledger::{self, NewLedgerEntry};
use crate::types::{LedgerEntryType, OrderStatus, PoolDistribution};

/// A calendar month, `[start, end)` in UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPeriod {
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PoolPeriod {
    /// Parses `YYYY-MM`.
    pub fn parse(label: &str) -> Result<Self, EngineError> {
        let invalid = || EngineError::Invalid(format!("period must look like YYYY-MM, got {label:?}"));
        if label.len() != 7 || label.as_bytes()[4] != b'-' {
            return Err(invalid());
        }
        let first = NaiveDate::parse_from_str(&format!("{label}-01"), "%Y-%m-%d").map_err(|_| invalid())?;
        let next = first.checked_add_months(Months::new(1)).ok_or_else(invalid)?;

        Ok(Self {
            label: label.to_string(),
            start: first.and_time(chrono::NaiveTime::MIN).and_utc(),
            end: next.and_time(chrono::NaiveTime::MIN).and_utc(),
        })
    }

    pub fn reference(&self) -> String {
        format!("pool:{}", self.label)
    }
}

/// How a period's pool is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAllocation {
    pub pool_amount: i64,
    pub recipients: usize,
    pub share: i64,
    pub undistributed: i64,
}

/// Splits `share_bps` of `turnover` evenly between `eligible` members. When
/// the pool is too small to give everyone a paisa, nobody is paid and the
/// whole pool stays undistributed.
pub fn allocate(turnover: i64, share_bps: u32, eligible: usize) -> PoolAllocation {
    let pool_amount = bps_of(turnover, share_bps);
    match split_evenly(pool_amount, eligible) {
        (share, remainder) if share > 0 => PoolAllocation {
            pool_amount,
            recipients: eligible,
            share,
            undistributed: remainder,
        },
        _ => PoolAllocation {
            pool_amount,
            recipients: 0,
            share: 0,
            undistributed: pool_amount,
        },
    }
}

/// Rebases every `monthly_purchase` to the purchases processed after the
/// latest closed period.
async fn restart_monthly_purchases(tx: &mut Transaction<'_, Postgres>, paid: &[&str]) -> Result<u64> {
    let latest = sqlx::query_scalar::<_, Option<String>>(r#"SELECT MAX(period) FROM pool_distributions"#)
        .fetch_one(tx.as_mut())
        .await?;
    let Some(latest) = latest else {
        return Ok(0);
    };
    let cutoff = PoolPeriod::parse(&latest)?.end;

    let res = sqlx::query(
        r#"UPDATE users u SET monthly_purchase = COALESCE((
               SELECT SUM(o.total) FROM orders o
               WHERE o.user_id = u.id AND o.status = ANY($2)
                 AND o.commission_processed_at IS NOT NULL AND o.paid_at >= $1
           ), 0)::BIGINT"#,
    )
    .bind(cutoff)
    .bind(paid.to_vec())
    .execute(tx.as_mut())
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip(pool, settings), fields(period = %period.label))]
pub async fn distribute(pool: &PgPool, period: &PoolPeriod, settings: &EngineSettings) -> Result<PoolDistribution> {
    let mut tx = pool.begin().await?;

    let done = sqlx::query_scalar::<_, bool>(
        r#"SELECT EXISTS (SELECT 1 FROM pool_distributions WHERE period = $1)"#,
    )
    .bind(&period.label)
    .fetch_one(tx.as_mut())
    .await?;
    if done {
        return Err(EngineError::AlreadyDistributed(period.label.clone()).into());
    }

    // Newest first: order processing locks a buyer before their (older) sponsors.
    sqlx::query(r#"SELECT id FROM users ORDER BY id DESC FOR UPDATE"#)
        .execute(tx.as_mut())
        .await?;

    let paid = [OrderStatus::Paid.as_str(), OrderStatus::Delivered.as_str()];

    let turnover = sqlx::query_scalar::<_, i64>(
        r#"SELECT COALESCE(SUM(total), 0)::BIGINT FROM orders
           WHERE paid_at >= $1 AND paid_at < $2 AND status = ANY($3)"#,
    )
    .bind(period.start)
    .bind(period.end)
    .bind(paid.to_vec())
    .fetch_one(tx.as_mut())
    .await?;

    let recipients = sqlx::query_scalar::<_, i64>(
        r#"SELECT u.id FROM users u JOIN orders o ON o.user_id = u.id
           WHERE u.is_active AND o.paid_at >= $1 AND o.paid_at < $2 AND o.status = ANY($3)
           GROUP BY u.id
           HAVING SUM(o.total) >= $4
           ORDER BY u.id"#,
    )
    .bind(period.start)
    .bind(period.end)
    .bind(paid.to_vec())
    .bind(settings.pool_min_purchase)
    .fetch_all(tx.as_mut())
    .await?;

    let alloc = allocate(turnover, settings.pool_share_bps, recipients.len());

    if alloc.recipients > 0 {
        for user_id in &recipients {
            ledger::post_entry(
                &mut tx,
                &NewLedgerEntry {
                    user_id: *user_id,
                    entry_type: LedgerEntryType::PoolIncome,
                    amount: alloc.share,
                    level_depth: 0,
                    reference: period.reference(),
                },
            )
            .await?;
        }
    }

    // The primary key on `period` turns a concurrent second run into an error.
    let record = sqlx::query_as::<_, PoolDistribution>(
        r#"INSERT INTO pool_distributions (period, turnover, pool_amount, recipients, share, undistributed)
           VALUES ($1, $2, $3, $4, $5, $6)
           RETURNING period, turnover, pool_amount, recipients, share, undistributed, created_at"#,
    )
    .bind(&period.label)
    .bind(turnover)
    .bind(alloc.pool_amount)
    .bind(alloc.recipients as i64)
    .bind(alloc.share)
    .bind(alloc.undistributed)
    .fetch_one(tx.as_mut())
    .await?;

    let counters = restart_monthly_purchases(&mut tx, &paid).await?;

    tx.commit().await?;
    info!(
        turnover,
        pool_amount = alloc.pool_amount,
        recipients = alloc.recipients,
        share = alloc.share,
        undistributed = alloc.undistributed,
        counters,
        "turnover pool distributed"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn period_bounds_cover_the_month() {
        let p = PoolPeriod::parse("2026-10").unwrap();
        assert_eq!(p.start, Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap());
        assert_eq!(p.end, Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap());
        assert_eq!(p.reference(), "pool:2026-10");
    }

    #[test]
    fn december_rolls_into_next_year() {
        let p = PoolPeriod::parse("2026-12").unwrap();
        assert_eq!(p.end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn pool_splits_evenly_with_a_remainder() {
        // 2% of 300_050 is 6_001
        assert_eq!(
            allocate(300_050, 200, 2),
            PoolAllocation {
                pool_amount: 6_001,
                recipients: 2,
                share: 3_000,
                undistributed: 1
            }
        );
    }

    #[test]
    fn pool_without_members_is_kept() {
        assert_eq!(
            allocate(300_050, 200, 0),
            PoolAllocation {
                pool_amount: 6_001,
                recipients: 0,
                share: 0,
                undistributed: 6_001
            }
        );
    }

    #[test]
    fn pool_smaller_than_one_paisa_each_is_kept() {
        let alloc = allocate(100, 200, 3);
        assert_eq!(alloc.pool_amount, 2);
        assert_eq!((alloc.recipients, alloc.share, alloc.undistributed), (0, 0, 2));
    }

    #[test]
    fn malformed_periods_are_rejected() {
        for bad in ["2026-13", "2026-1", "26-10", "2026/10", "", "2026-10-01"] {
            assert!(
                matches!(PoolPeriod::parse(bad), Err(EngineError::Invalid(_))),
                "{bad} parsed"
            );
        }
    }
}
