use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

use crate::commission::{BPS_DENOMINATOR, LevelRates};
use crate::error::EngineError;

const LIST_KEYS: [&str; 2] = ["sponsor_rates_bps", "repurchase_rates_bps"];

/// Process configuration, read from the environment (and `.env`).
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    /// Per-level rates for joining orders, level 1 first.
    pub sponsor_rates_bps: Vec<u32>,
    /// Per-level rates for repeat purchases, level 1 first.
    pub repurchase_rates_bps: Vec<u32>,
    /// Self-income bonus on a joining order.
    pub joining_bonus_bps: u32,
    pub joining_instalments: u32,
    pub instalment_interval_days: i64,
    /// Paisa.
    pub min_withdrawal: i64,
    pub pool_share_bps: u32,
    /// Paisa a user must buy in a month to share that month's pool.
    pub pool_min_purchase: i64,
    pub payout_interval_secs: u64,
    pub payout_batch_size: i64,
    pub referral_prefix: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(config::Environment::default())
    }

    pub fn load(env: config::Environment) -> Result<Self, config::ConfigError> {
        let mut env = env.try_parsing(true).list_separator(",");
        for key in LIST_KEYS {
            env = env.with_list_parse_key(key);
        }

        let config = config::Config::builder()
            .set_default("server_port", 8000)?
            .set_default("database_max_connections", 8)?
            .set_default("sponsor_rates_bps", vec![1000, 500, 300, 200, 100])?
            .set_default("repurchase_rates_bps", vec![500, 300, 200, 100, 50])?
            .set_default("joining_bonus_bps", 1000)?
            .set_default("joining_instalments", 10)?
            .set_default("instalment_interval_days", 7)?
            .set_default("min_withdrawal", 50_000)?
            .set_default("pool_share_bps", 200)?
            .set_default("pool_min_purchase", 100_000)?
            .set_default("payout_interval_secs", 3600)?
            .set_default("payout_batch_size", 100)?
            .set_default("referral_prefix", "MLM")?
            .add_source(env)
            .build()?;
        config.try_deserialize()
    }

    pub fn payout_interval(&self) -> Duration {
        Duration::from_secs(self.payout_interval_secs.max(1))
    }

    /// Validated engine settings.
    pub fn settings(&self) -> Result<EngineSettings, EngineError> {
        let sponsor_rates = LevelRates::new(self.sponsor_rates_bps.clone())?;
        let repurchase_rates = LevelRates::new(self.repurchase_rates_bps.clone())?;

        let joining_payout = u64::from(sponsor_rates.total_bps()) + u64::from(self.joining_bonus_bps);
        if joining_payout > u64::from(BPS_DENOMINATOR) {
            return Err(EngineError::InvalidRates(format!(
                "joining order pays out {joining_payout} bps including the self bonus"
            )));
        }
        if self.pool_share_bps > BPS_DENOMINATOR {
            return Err(EngineError::InvalidRates(format!(
                "pool share of {} bps exceeds turnover",
                self.pool_share_bps
            )));
        }
        if self.instalment_interval_days <= 0 {
            return Err(EngineError::Invalid(
                "instalment_interval_days must be positive".into(),
            ));
        }
        if self.min_withdrawal <= 0 || self.payout_batch_size <= 0 {
            return Err(EngineError::Invalid(
                "min_withdrawal and payout_batch_size must be positive".into(),
            ));
        }

        Ok(EngineSettings {
            sponsor_rates,
            repurchase_rates,
            joining_bonus_bps: self.joining_bonus_bps,
            joining_instalments: self.joining_instalments,
            instalment_interval: TimeDelta::days(self.instalment_interval_days),
            min_withdrawal: self.min_withdrawal,
            pool_share_bps: self.pool_share_bps,
            pool_min_purchase: self.pool_min_purchase,
            payout_batch_size: self.payout_batch_size,
            referral_prefix: self.referral_prefix.clone(),
        })
    }
}

/// The business rules the engine runs with.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub sponsor_rates: LevelRates,
    pub repurchase_rates: LevelRates,
    pub joining_bonus_bps: u32,
    pub joining_instalments: u32,
    pub instalment_interval: TimeDelta,
    pub min_withdrawal: i64,
    pub pool_share_bps: u32,
    pub pool_min_purchase: i64,
    pub payout_batch_size: i64,
    pub referral_prefix: String,
}
