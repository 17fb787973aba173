//! End-to-end flow against a real Postgres.
//!
//! Runs only when `TEST_DATABASE_URL` points at a scratch database; otherwise
//! each test returns immediately.

use std::collections::HashMap;

use chrono::{TimeDelta, Utc};
use mlm_ledger::{
    Config, EngineError, EngineSettings, LedgerEntryType, ProcessOutcome, confirm_payment, hierarchy, kyc,
    ledger::{self, NewLedgerEntry},
    orders::{self, NewOrder},
    payout,
    pool::{self, PoolPeriod},
    process_paid_order, run_migrations, users, withdrawal,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn setup() -> Option<(PgPool, EngineSettings)> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let vars = HashMap::from([
        ("DATABASE_URL".to_string(), url.clone()),
        ("MIN_WITHDRAWAL".to_string(), "5000".to_string()),
    ]);
    let cfg = Config::load(config::Environment::default().source(Some(vars))).unwrap();
    let settings = cfg.settings().unwrap();

    let pool = PgPoolOptions::new().max_connections(4).connect(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    Some((pool, settings))
}

async fn new_order(pool: &PgPool, user_id: i64, total: i64, is_joining_order: bool) -> Uuid {
    let order = orders::create_order(
        pool,
        NewOrder {
            id: None,
            user_id,
            total,
            is_joining_order,
        },
    )
    .await
    .unwrap();
    order.id
}

async fn paid_order(
    pool: &PgPool,
    settings: &EngineSettings,
    user_id: i64,
    total: i64,
    is_joining_order: bool,
) -> (Uuid, ProcessOutcome) {
    let order_id = new_order(pool, user_id, total, is_joining_order).await;
    let outcome = confirm_payment(pool, order_id, settings).await.unwrap();
    (order_id, outcome)
}

async fn paid_joining_order(pool: &PgPool, settings: &EngineSettings, user_id: i64, total: i64) -> (Uuid, ProcessOutcome) {
    paid_order(pool, settings, user_id, total, true).await
}

async fn ledger_for(pool: &PgPool, user_id: i64, reference: &str) -> Vec<(LedgerEntryType, i64)> {
    let (entries, _) = ledger::entries_for_user(pool, user_id, 1, 100).await.unwrap();
    let mut found: Vec<_> = entries
        .into_iter()
        .filter(|e| e.reference == reference)
        .map(|e| (e.entry_type, e.amount))
        .collect();
    found.reverse();
    found
}

fn engine_error(err: anyhow::Error) -> EngineError {
    err.downcast::<EngineError>().expect("engine error")
}

#[tokio::test]
async fn commissions_withdrawals_and_payouts() {
    let Some((pool, settings)) = setup().await else {
        return;
    };

    // A (root) <- B <- C
    let a = users::register(&pool, "Asha", None).await.unwrap();
    let (_, outcome) = paid_joining_order(&pool, &settings, a.id, 100_000).await;
    assert_eq!(
        outcome,
        ProcessOutcome::Processed {
            activated: true,
            commissions: 0,
            commission_total: 0,
            instalments: 10
        }
    );
    let a = users::get(&pool, a.id).await.unwrap();
    assert!(a.is_active);
    let a_code = a.referral_code.clone().unwrap();

    let b = users::register(&pool, "Bala", Some(&a_code)).await.unwrap();
    paid_joining_order(&pool, &settings, b.id, 100_000).await;
    let b_code = users::get(&pool, b.id).await.unwrap().referral_code.unwrap();

    let c = users::register(&pool, "Chitra", Some(&b_code)).await.unwrap();
    let (c_order, _) = paid_joining_order(&pool, &settings, c.id, 100_000).await;

    // level 1 = 10%, level 2 = 5%
    assert_eq!(ledger::wallet(&pool, a.id).await.unwrap().balance, 10_000 + 5_000);
    assert_eq!(ledger::wallet(&pool, b.id).await.unwrap().balance, 10_000);

    // retries credit nothing
    assert_eq!(
        process_paid_order(&pool, c_order, &settings).await.unwrap(),
        ProcessOutcome::AlreadyProcessed
    );
    assert_eq!(
        confirm_payment(&pool, c_order, &settings).await.unwrap(),
        ProcessOutcome::AlreadyProcessed
    );
    assert_eq!(ledger::wallet(&pool, a.id).await.unwrap().balance, 15_000);

    let downline = hierarchy::downline(&pool, a.id).await.unwrap();
    assert_eq!(downline.len(), 2);
    assert_eq!(downline[1].depth, 2);

    // withdrawals are gated on kyc
    let err = withdrawal::request(&pool, a.id, 12_000, &settings).await.unwrap_err();
    assert_eq!(engine_error(err), EngineError::KycNotApproved);
    kyc::submit(&pool, a.id).await.unwrap();
    kyc::review(&pool, a.id, true, None).await.unwrap();

    let err = withdrawal::request(&pool, a.id, 4_000, &settings).await.unwrap_err();
    assert_eq!(engine_error(err), EngineError::BelowMinimum { minimum: 5_000 });

    let first = withdrawal::request(&pool, a.id, 12_000, &settings).await.unwrap();
    let err = withdrawal::request(&pool, a.id, 6_000, &settings).await.unwrap_err();
    assert_eq!(
        engine_error(err),
        EngineError::InsufficientBalance {
            requested: 6_000,
            available: 3_000
        }
    );
    // a request does not touch the balance
    assert_eq!(ledger::wallet(&pool, a.id).await.unwrap().balance, 15_000);

    withdrawal::reject(&pool, first.id, Some("bank details".into())).await.unwrap();
    assert_eq!(ledger::wallet(&pool, a.id).await.unwrap().available, 15_000);

    let second = withdrawal::request(&pool, a.id, 12_000, &settings).await.unwrap();
    withdrawal::approve(&pool, second.id).await.unwrap();
    let err = withdrawal::approve(&pool, second.id).await.unwrap_err();
    assert!(matches!(engine_error(err), EngineError::InvalidState(_)));
    assert_eq!(ledger::wallet(&pool, a.id).await.unwrap().balance, 3_000);

    // the ledger carries each request and its outcome
    assert_eq!(
        ledger_for(&pool, a.id, &format!("withdrawal:{}", first.id)).await,
        vec![
            (LedgerEntryType::WithdrawalRequest, 0),
            (LedgerEntryType::WithdrawalReversal, 0)
        ]
    );
    assert_eq!(
        ledger_for(&pool, a.id, &format!("withdrawal:{}", second.id)).await,
        vec![
            (LedgerEntryType::WithdrawalRequest, 0),
            (LedgerEntryType::Withdrawal, -12_000)
        ]
    );

    // pay out every installment, including A's 10% joining bonus
    payout::process_due(&pool, Utc::now() + TimeDelta::days(365), 1_000_000)
        .await
        .unwrap();
    let schedule = payout::schedule_for_user(&pool, a.id).await.unwrap();
    assert_eq!(schedule.len(), 10);
    let ran_at = Utc::now() + TimeDelta::minutes(1);
    assert!(
        schedule
            .iter()
            .all(|s| s.processed_at.is_some_and(|at| at <= ran_at))
    );
    assert_eq!(ledger::wallet(&pool, a.id).await.unwrap().balance, 13_000);

    let mismatches = ledger::reconcile(&pool).await.unwrap();
    assert!(
        mismatches
            .iter()
            .all(|m| ![a.id, b.id, c.id].contains(&m.user_id))
    );
}

#[tokio::test]
async fn repair_restores_deleted_links() {
    let Some((pool, settings)) = setup().await else {
        return;
    };

    let root = users::register(&pool, "Root", None).await.unwrap();
    paid_joining_order(&pool, &settings, root.id, 10_000).await;
    let code = users::get(&pool, root.id).await.unwrap().referral_code.unwrap();
    let child = users::register(&pool, "Child", Some(&code)).await.unwrap();
    paid_joining_order(&pool, &settings, child.id, 10_000).await;

    sqlx::query("DELETE FROM hierarchy WHERE descendant_id = $1")
        .bind(child.id)
        .execute(&pool)
        .await
        .unwrap();

    let report = hierarchy::repair_orphans(&pool).await.unwrap();
    assert!(report.inserted >= 1);
    assert_eq!(hierarchy::downline(&pool, root.id).await.unwrap()[0].members, 1);
}

#[tokio::test]
async fn unknown_sponsor_code_is_rejected() {
    let Some((pool, _)) = setup().await else {
        return;
    };
    let err = users::register(&pool, "Nobody", Some("NOPE0000")).await.unwrap_err();
    assert!(matches!(engine_error(err), EngineError::NotFound(_)));
}

#[tokio::test]
async fn duplicate_postings_are_ignored_and_overdrafts_roll_back() {
    let Some((pool, _)) = setup().await else {
        return;
    };
    let user = users::register(&pool, "Deepa", None).await.unwrap();
    let credit = NewLedgerEntry {
        user_id: user.id,
        entry_type: LedgerEntryType::PoolIncome,
        amount: 700,
        level_depth: 0,
        reference: format!("manual:{}", Uuid::new_v4()),
    };

    let mut tx = pool.begin().await.unwrap();
    assert!(ledger::post_entry(&mut tx, &credit).await.unwrap());
    assert!(!ledger::post_entry(&mut tx, &credit).await.unwrap());
    tx.commit().await.unwrap();
    assert_eq!(ledger::wallet(&pool, user.id).await.unwrap().balance, 700);

    let debit = NewLedgerEntry {
        entry_type: LedgerEntryType::Withdrawal,
        amount: -701,
        ..credit
    };
    let mut tx = pool.begin().await.unwrap();
    let err = ledger::post_entry(&mut tx, &debit).await.unwrap_err();
    assert_eq!(
        engine_error(err),
        EngineError::InsufficientBalance {
            requested: 701,
            available: 700
        }
    );
    tx.rollback().await.unwrap();

    let (entries, total) = ledger::entries_for_user(&pool, user.id, 1, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(entries[0].amount, 700);
    assert_eq!(ledger::wallet(&pool, user.id).await.unwrap().balance, 700);
}

#[tokio::test]
async fn concurrent_first_orders_activate_once() {
    let Some((pool, settings)) = setup().await else {
        return;
    };
    let user = users::register(&pool, "Esha", None).await.unwrap();
    let first = new_order(&pool, user.id, 20_000, true).await;
    let second = new_order(&pool, user.id, 20_000, true).await;

    let (a, b) = tokio::join!(
        confirm_payment(&pool, first, &settings),
        confirm_payment(&pool, second, &settings)
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let activations = outcomes
        .iter()
        .filter(|o| matches!(o, ProcessOutcome::Processed { activated: true, .. }))
        .count();
    assert_eq!(activations, 1);

    // only the activating order earns the joining bonus
    let instalments: u64 = outcomes
        .iter()
        .map(|o| match o {
            ProcessOutcome::Processed { instalments, .. } => *instalments,
            other => panic!("unexpected outcome {other:?}"),
        })
        .sum();
    assert_eq!(instalments, 10);
    assert_eq!(payout::schedule_for_user(&pool, user.id).await.unwrap().len(), 10);

    let user = users::get(&pool, user.id).await.unwrap();
    assert!(user.is_active);
    assert!(user.referral_code.is_some());
    assert_eq!(user.monthly_purchase, 40_000);
}

#[tokio::test]
async fn pool_pays_members_above_the_minimum_once() {
    let Some((pool, settings)) = setup().await else {
        return;
    };
    // a month no other run touches
    let n = Uuid::new_v4().as_u128();
    let label = format!("{:04}-{:02}", 1000 + n % 1000, 1 + (n / 1000) % 12);
    let period = PoolPeriod::parse(&label).unwrap();

    let x = users::register(&pool, "Farah", None).await.unwrap();
    let y = users::register(&pool, "Gopal", None).await.unwrap();
    let z = users::register(&pool, "Hari", None).await.unwrap();
    let (xo, _) = paid_order(&pool, &settings, x.id, 100_000, false).await;
    let (yo, _) = paid_order(&pool, &settings, y.id, 150_050, false).await;
    let (zo, _) = paid_order(&pool, &settings, z.id, 50_000, false).await;

    sqlx::query("UPDATE orders SET paid_at = $1 WHERE id = ANY($2)")
        .bind(period.start + TimeDelta::days(1))
        .bind(vec![xo, yo, zo])
        .execute(&pool)
        .await
        .unwrap();

    // 2% of 300_050, split between the two members at or above 100_000
    let record = pool::distribute(&pool, &period, &settings).await.unwrap();
    assert_eq!(record.turnover, 300_050);
    assert_eq!(record.pool_amount, 6_001);
    assert_eq!(record.recipients, 2);
    assert_eq!(record.share, 3_000);
    assert_eq!(record.undistributed, 1);

    let reference = period.reference();
    assert_eq!(
        ledger_for(&pool, x.id, &reference).await,
        vec![(LedgerEntryType::PoolIncome, 3_000)]
    );
    assert_eq!(
        ledger_for(&pool, y.id, &reference).await,
        vec![(LedgerEntryType::PoolIncome, 3_000)]
    );
    assert!(ledger_for(&pool, z.id, &reference).await.is_empty());

    // counters restart once the period is closed
    assert_eq!(users::get(&pool, x.id).await.unwrap().monthly_purchase, 0);

    let err = pool::distribute(&pool, &period, &settings).await.unwrap_err();
    assert_eq!(engine_error(err), EngineError::AlreadyDistributed(label));
    assert_eq!(
        ledger_for(&pool, x.id, &reference).await,
        vec![(LedgerEntryType::PoolIncome, 3_000)]
    );
}
