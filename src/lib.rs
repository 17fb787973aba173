//! Commission engine and wallet ledger for a multi-level-marketing shop.
//!
//! A paid order activates the buyer (first order only), pays commissions up to
//! five sponsor levels, schedules the joining bonus, and records every
//! movement in an append-only ledger that the wallet balances are derived from.

pub mod activation;
mod api;
pub mod commission;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod kyc;
pub mod ledger;
pub mod orders;
pub mod payout;
pub mod pool;
mod responses;
pub mod scheduler;
pub mod types;
pub mod users;
pub mod withdrawal;

use anyhow::Context;
use anyhow::Result;
pub use api::{AppState, init_router};
use chrono::Utc;
pub use crate::config::{Config, EngineSettings};
pub use error::EngineError;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction, postgres::PgPoolOptions};
use tracing::{info, instrument, warn};
pub use types::{LedgerEntry, LedgerEntryType, Order, OrderStatus, User};
use uuid::Uuid;

use crate::activation::Activation;
use crate::ledger::NewLedgerEntry;

/// Initializes the database pool.
pub async fn init_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}

/// Applies the embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;
    Ok(())
}

/// What processing an order did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// The order is not paid yet; nothing happened.
    NotPaid { status: OrderStatus },
    /// Commissions for the order were already credited.
    AlreadyProcessed,
    /// Commissions were credited and the order stamped as processed.
    Processed {
        /// This order activated the buyer.
        activated: bool,
        /// Ledger entries posted for sponsors.
        commissions: usize,
        /// Paisa credited to sponsors.
        commission_total: i64,
        /// Joining-bonus installments scheduled for the buyer.
        instalments: u64,
    },
}

/// Marks a pending order paid and processes it, in one transaction.
/// Confirming an order that is already paid only (re)processes it.
#[instrument(skip(pool, settings))]
pub async fn confirm_payment(pool: &PgPool, order_id: Uuid, settings: &EngineSettings) -> Result<ProcessOutcome> {
    let mut tx = pool.begin().await?;
    let mut order = orders::lock(&mut tx, order_id).await?;
    orders::mark_paid(&mut tx, &mut order).await?;
    let outcome = process_locked(&mut tx, &order, settings).await?;
    tx.commit().await?;
    Ok(outcome)
}

/// Credits commissions for a paid order. Safe to retry.
#[instrument(skip(pool, settings))]
pub async fn process_paid_order(pool: &PgPool, order_id: Uuid, settings: &EngineSettings) -> Result<ProcessOutcome> {
    let mut tx = pool.begin().await?;
    let order = orders::lock(&mut tx, order_id).await?;
    let outcome = process_locked(&mut tx, &order, settings).await?;
    tx.commit().await?;
    Ok(outcome)
}

async fn process_locked(
    tx: &mut Transaction<'_, Postgres>,
    order: &Order,
    settings: &EngineSettings,
) -> Result<ProcessOutcome> {
    if !order.status.is_paid() {
        return Ok(ProcessOutcome::NotPaid {
            status: order.status,
        });
    }
    if order.commission_processed_at.is_some() {
        return Ok(ProcessOutcome::AlreadyProcessed);
    }

    let activated = matches!(
        activation::activate(tx, order.user_id, &settings.referral_prefix).await?,
        Activation::Activated { .. }
    );

    sqlx::query(r#"UPDATE users SET monthly_purchase = monthly_purchase + $2 WHERE id = $1"#)
        .bind(order.user_id)
        .bind(order.total)
        .execute(tx.as_mut())
        .await?;

    // Only the order that activates the buyer is treated as joining; a second
    // order flagged as joining is paid as a repurchase.
    let joining = order.is_joining_order && activated;
    if order.is_joining_order && !joining {
        warn!(order_id = %order.id, buyer = order.user_id, "buyer already active, joining order paid as repurchase");
    }

    let (rates, entry_type) = if joining {
        (&settings.sponsor_rates, LedgerEntryType::SponsorCommission)
    } else {
        (&settings.repurchase_rates, LedgerEntryType::RepurchaseCommission)
    };

    let ancestors = hierarchy::ancestors(tx, order.user_id).await?;
    let reference = format!("order:{}", order.id);

    let mut commissions = 0;
    let mut commission_total = 0;
    for entry in commission::compute(order.total, &ancestors, rates) {
        let posted = ledger::post_entry(
            tx,
            &NewLedgerEntry {
                user_id: entry.beneficiary_id,
                entry_type,
                amount: entry.amount,
                level_depth: i32::from(entry.level),
                reference: reference.clone(),
            },
        )
        .await?;
        if posted {
            commissions += 1;
            commission_total += entry.amount;
        }
    }

    let mut instalments = 0;
    if joining {
        let bonus = commission::bps_of(order.total, settings.joining_bonus_bps);
        let paid_at = order.paid_at.unwrap_or_else(Utc::now);
        let plan = payout::plan_installments(
            bonus,
            settings.joining_instalments,
            settings.instalment_interval,
            paid_at + settings.instalment_interval,
        );
        instalments = payout::schedule(tx, order.user_id, order.id, &plan).await?;
    }

    sqlx::query(r#"UPDATE orders SET commission_processed_at = NOW() WHERE id = $1"#)
        .bind(order.id)
        .execute(tx.as_mut())
        .await?;

    info!(
        order_id = %order.id,
        buyer = order.user_id,
        activated,
        commissions,
        commission_total,
        instalments,
        "order processed"
    );

    Ok(ProcessOutcome::Processed {
        activated,
        commissions,
        commission_total,
        instalments,
    })
}
