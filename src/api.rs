use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::error::{
    ApiError, ApiErrorWithMeta, E_DB_FAILURE, E_JOB_FAILURE, E_PROCESS_FAILURE, E_VALIDATION,
};
use crate::hierarchy::{self, LevelCount, RepairReport};
use crate::ledger::{self, BalanceMismatch, Wallet};
use crate::orders::{self, NewOrder};
use crate::payout::{self, PayoutRunSummary};
use crate::pool::{self, PoolPeriod};
use crate::responses::{ApiOk, Pagination, RequestMeta, meta_middleware};
use crate::types::{LedgerEntry, Order, PoolDistribution, SelfPayout, User, Withdrawal};
use crate::{ProcessOutcome, confirm_payment, kyc, process_paid_order, users, withdrawal};

const MAX_PER_PAGE: u32 = 100;
const DEFAULT_PER_PAGE: u32 = 20;

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The database pool.
    pub pool: PgPool,
    /// Validated business rules.
    pub settings: Arc<EngineSettings>,
}

impl AppState {
    pub fn new(pool: PgPool, settings: EngineSettings) -> Self {
        Self {
            pool,
            settings: Arc::new(settings),
        }
    }
}

#[derive(Deserialize)]
pub struct RegisterUserRequest {
    pub name: String,
    /// Referral code of the sponsor.
    pub sponsor_code: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    /// The ID of the order; generated when absent.
    pub id: Option<Uuid>,
    /// The buyer.
    pub user_id: i64,
    /// Order value in paisa.
    pub total: i64,
    #[serde(default)]
    pub is_joining_order: bool,
}

#[derive(Deserialize)]
pub struct WithdrawalRequest {
    pub user_id: i64,
    pub amount: i64,
}

#[derive(Deserialize)]
pub struct RejectWithdrawalRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct KycReviewRequest {
    pub approve: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Serialize)]
pub struct ProcessResponse {
    pub order_id: Uuid,
    #[serde(flatten)]
    pub outcome: ProcessOutcome,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/users", post(register_user_handler))
        .route("/users/{id}", get(get_user_handler))
        .route("/users/{id}/downline", get(downline_handler))
        .route("/orders", post(create_order_handler))
        .route("/orders/{id}", get(get_order_handler))
        .route("/orders/{id}/pay", post(pay_order_handler))
        .route("/orders/{id}/process", post(process_order_handler))
        .route("/orders/{id}/deliver", post(deliver_order_handler))
        .route("/wallet/{user_id}", get(wallet_handler))
        .route("/ledger/{user_id}", get(ledger_handler))
        .route("/payouts/{user_id}", get(payouts_handler))
        .route("/kyc/{user_id}/submit", post(kyc_submit_handler))
        .route("/kyc/{user_id}/review", post(kyc_review_handler))
        .route("/withdrawals", post(request_withdrawal_handler))
        .route("/withdrawals/user/{user_id}", get(list_withdrawals_handler))
        .route("/withdrawals/{id}/approve", post(approve_withdrawal_handler))
        .route("/withdrawals/{id}/reject", post(reject_withdrawal_handler))
        .route("/jobs/payouts", post(run_payouts_handler))
        .route("/jobs/pool/{period}", post(run_pool_handler))
        .route("/admin/reconcile", get(reconcile_handler))
        .route("/admin/hierarchy/repair", post(repair_hierarchy_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn register_user_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RegisterUserRequest>,
) -> Result<ApiOk<User>, ApiErrorWithMeta> {
    let user = users::register(&st.pool, &req.name, req.sponsor_code.as_deref())
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;
    Ok(ApiOk::created("user registered", user, meta))
}

async fn get_user_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<User>, ApiErrorWithMeta> {
    let user = users::get(&st.pool, id)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;
    Ok(ApiOk::ok("user fetched", user, meta))
}

async fn downline_handler(
    State(st): State<AppState>,
    Path(id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<LevelCount>>, ApiErrorWithMeta> {
    let levels = hierarchy::downline(&st.pool, id)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;
    Ok(ApiOk::ok("downline fetched", levels, meta))
}

async fn create_order_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<ApiOk<Order>, ApiErrorWithMeta> {
    let order = orders::create_order(
        &st.pool,
        NewOrder {
            id: req.id,
            user_id: req.user_id,
            total: req.total,
            is_joining_order: req.is_joining_order,
        },
    )
    .await
    .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;

    Ok(ApiOk::created("order created", order, meta))
}

async fn get_order_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Order>, ApiErrorWithMeta> {
    let order = orders::get(&st.pool, id)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;
    Ok(ApiOk::ok("order fetched", order, meta))
}

async fn pay_order_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<ProcessResponse>, ApiErrorWithMeta> {
    let outcome = confirm_payment(&st.pool, id, &st.settings)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_PROCESS_FAILURE))?;

    Ok(ApiOk::ok(
        "payment confirmed",
        ProcessResponse {
            order_id: id,
            outcome,
        },
        meta,
    ))
}

async fn process_order_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<ProcessResponse>, ApiErrorWithMeta> {
    let outcome = process_paid_order(&st.pool, id, &st.settings)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_PROCESS_FAILURE))?;

    Ok(ApiOk::ok(
        "order processed",
        ProcessResponse {
            order_id: id,
            outcome,
        },
        meta,
    ))
}

async fn deliver_order_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Order>, ApiErrorWithMeta> {
    let order = orders::mark_delivered(&st.pool, id)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;
    Ok(ApiOk::ok("order delivered", order, meta))
}

async fn wallet_handler(
    State(st): State<AppState>,
    Path(user_id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Wallet>, ApiErrorWithMeta> {
    let wallet = ledger::wallet(&st.pool, user_id)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;
    Ok(ApiOk::ok("wallet fetched", wallet, meta))
}

async fn ledger_handler(
    State(st): State<AppState>,
    Path(user_id): Path<i64>,
    Query(q): Query<PageQuery>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<LedgerEntry>>, ApiErrorWithMeta> {
    let page = q.page.unwrap_or(1);
    let per_page = q.per_page.unwrap_or(DEFAULT_PER_PAGE);
    if page == 0 || per_page == 0 || per_page > MAX_PER_PAGE {
        return Err(ApiError::BadRequest(format!(
            "page must be >= 1 and per_page between 1 and {MAX_PER_PAGE}"
        ))
        .with_meta(meta)
        .with_code(E_VALIDATION));
    }

    let (entries, total) = ledger::entries_for_user(&st.pool, user_id, page, per_page)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;

    Ok(ApiOk::ok("ledger fetched", entries, meta).paginated(Pagination::new(page, per_page, total)))
}

async fn payouts_handler(
    State(st): State<AppState>,
    Path(user_id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<SelfPayout>>, ApiErrorWithMeta> {
    let schedule = payout::schedule_for_user(&st.pool, user_id)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;
    Ok(ApiOk::ok("payout schedule fetched", schedule, meta))
}

async fn kyc_submit_handler(
    State(st): State<AppState>,
    Path(user_id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<User>, ApiErrorWithMeta> {
    let user = kyc::submit(&st.pool, user_id)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;
    Ok(ApiOk::ok("kyc submitted", user, meta))
}

async fn kyc_review_handler(
    State(st): State<AppState>,
    Path(user_id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<KycReviewRequest>,
) -> Result<ApiOk<User>, ApiErrorWithMeta> {
    let user = kyc::review(&st.pool, user_id, req.approve, req.reason)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;
    Ok(ApiOk::ok("kyc reviewed", user, meta))
}

async fn request_withdrawal_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<WithdrawalRequest>,
) -> Result<ApiOk<Withdrawal>, ApiErrorWithMeta> {
    let w = withdrawal::request(&st.pool, req.user_id, req.amount, &st.settings)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;
    Ok(ApiOk::created("withdrawal requested", w, meta))
}

async fn list_withdrawals_handler(
    State(st): State<AppState>,
    Path(user_id): Path<i64>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Withdrawal>>, ApiErrorWithMeta> {
    let rows = withdrawal::list_for_user(&st.pool, user_id)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_DB_FAILURE))?;
    Ok(ApiOk::ok("withdrawals fetched", rows, meta))
}

async fn approve_withdrawal_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Withdrawal>, ApiErrorWithMeta> {
    let w = withdrawal::approve(&st.pool, id)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_PROCESS_FAILURE))?;
    Ok(ApiOk::ok("withdrawal approved", w, meta))
}

async fn reject_withdrawal_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RejectWithdrawalRequest>,
) -> Result<ApiOk<Withdrawal>, ApiErrorWithMeta> {
    let w = withdrawal::reject(&st.pool, id, req.reason)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_PROCESS_FAILURE))?;
    Ok(ApiOk::ok("withdrawal rejected", w, meta))
}

async fn run_payouts_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<PayoutRunSummary>, ApiErrorWithMeta> {
    let summary = payout::process_due(&st.pool, Utc::now(), st.settings.payout_batch_size)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_JOB_FAILURE))?;
    Ok(ApiOk::ok("payouts processed", summary, meta))
}

async fn run_pool_handler(
    State(st): State<AppState>,
    Path(period): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<PoolDistribution>, ApiErrorWithMeta> {
    let period = PoolPeriod::parse(&period)
        .map_err(|e| ApiErrorWithMeta::from_engine(e.into(), &meta, E_VALIDATION))?;

    let record = pool::distribute(&st.pool, &period, &st.settings)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_JOB_FAILURE))?;
    Ok(ApiOk::created("pool distributed", record, meta))
}

async fn reconcile_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<BalanceMismatch>>, ApiErrorWithMeta> {
    let mismatches = ledger::reconcile(&st.pool)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_JOB_FAILURE))?;
    let message = if mismatches.is_empty() {
        "ledger and wallets agree"
    } else {
        "wallet mismatches found"
    };
    Ok(ApiOk::ok(message, mismatches, meta))
}

async fn repair_hierarchy_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<RepairReport>, ApiErrorWithMeta> {
    let report = hierarchy::repair_orphans(&st.pool)
        .await
        .map_err(|e| ApiErrorWithMeta::from_engine(e, &meta, E_JOB_FAILURE))?;
    Ok(ApiOk::ok("hierarchy repaired", report, meta))
}
