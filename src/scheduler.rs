//! In-process payout loop.
//!
//! There is no cross-process coordination beyond the row locks taken by
//! `payout::process_due`, which already make overlapping runs safe.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::payout;

pub fn spawn_payout_worker(pool: PgPool, every: Duration, batch: i64) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(every_secs = every.as_secs(), batch, "payout worker started");
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            // Keep draining while full batches come back.
            loop {
                match payout::process_due(&pool, Utc::now(), batch).await {
                    Ok(summary) if summary.processed as i64 >= batch => continue,
                    Ok(_) => break,
                    Err(e) => {
                        error!("payout run failed: {:?}", e);
                        break;
                    }
                }
            }
        }
    })
}
