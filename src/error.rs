use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::responses::RequestMeta;

pub const E_BAD_AMOUNT: &str = "BAD_AMOUNT";
pub const E_VALIDATION: &str = "VALIDATION";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_CONFLICT: &str = "CONFLICT";
pub const E_INVALID_STATE: &str = "INVALID_STATE";
pub const E_KYC_NOT_APPROVED: &str = "KYC_NOT_APPROVED";
pub const E_INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";
pub const E_BELOW_MINIMUM: &str = "BELOW_MINIMUM";
pub const E_ALREADY_DISTRIBUTED: &str = "ALREADY_DISTRIBUTED";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_PROCESS_FAILURE: &str = "PROCESS_FAILURE";
pub const E_JOB_FAILURE: &str = "JOB_FAILURE";

/// Postgres SQLSTATE for `unique_violation`.
pub(crate) const PG_UNIQUE_VIOLATION: &str = "23505";
/// Postgres SQLSTATE for `foreign_key_violation`.
pub(crate) const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

/// Business rejections raised by the engine before (or instead of) any mutation.
///
/// These travel inside `anyhow::Error` and are recovered at the HTTP edge with
/// `downcast_ref`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    InvalidAmount(String),
    #[error("{0}")]
    Invalid(String),
    #[error("invalid level rates: {0}")]
    InvalidRates(String),
    #[error("kyc is not approved")]
    KycNotApproved,
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: i64, available: i64 },
    #[error("amount is below the minimum withdrawal of {minimum}")]
    BelowMinimum { minimum: i64 },
    #[error("pool for period {0} was already distributed")]
    AlreadyDistributed(String),
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => E_NOT_FOUND,
            EngineError::Conflict(_) => E_CONFLICT,
            EngineError::InvalidState(_) => E_INVALID_STATE,
            EngineError::InvalidAmount(_) => E_BAD_AMOUNT,
            EngineError::Invalid(_) | EngineError::InvalidRates(_) => E_VALIDATION,
            EngineError::KycNotApproved => E_KYC_NOT_APPROVED,
            EngineError::InsufficientBalance { .. } => E_INSUFFICIENT_BALANCE,
            EngineError::BelowMinimum { .. } => E_BELOW_MINIMUM,
            EngineError::AlreadyDistributed(_) => E_ALREADY_DISTRIBUTED,
            EngineError::UnknownVariant { .. } => E_DB_FAILURE,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
        }
    }

    /// Classifies an engine failure. Typed rejections keep their own code,
    /// anything else falls back to `fallback_code`.
    pub fn classify(err: anyhow::Error, fallback_code: &'static str) -> (Self, &'static str) {
        if let Some(engine) = err.downcast_ref::<EngineError>() {
            let code = engine.code();
            if matches!(engine, EngineError::UnknownVariant { .. }) {
                return (ApiError::Internal(err), code);
            }
            let msg = engine.to_string();
            let api = match engine {
                EngineError::NotFound(_) => ApiError::NotFound(msg),
                EngineError::Conflict(_)
                | EngineError::InvalidState(_)
                | EngineError::AlreadyDistributed(_) => ApiError::Conflict(msg),
                EngineError::InvalidAmount(_)
                | EngineError::Invalid(_)
                | EngineError::InvalidRates(_)
                | EngineError::BelowMinimum { .. } => ApiError::BadRequest(msg),
                EngineError::KycNotApproved => ApiError::Forbidden(msg),
                EngineError::InsufficientBalance { .. } | EngineError::UnknownVariant { .. } => {
                    ApiError::Unprocessable(msg)
                }
            };
            return (api, code);
        }

        if let Some(sqlx::Error::Database(db_err)) = err.downcast_ref::<sqlx::Error>() {
            if db_err.code().as_deref() == Some(PG_UNIQUE_VIOLATION) {
                return (
                    ApiError::Conflict("resource already exists".into()),
                    E_CONFLICT,
                );
            }
        }

        (ApiError::Internal(err), fallback_code)
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    /// Shorthand used by handlers: classify `err` and attach request metadata.
    pub fn from_engine(err: anyhow::Error, meta: &RequestMeta, fallback_code: &'static str) -> Self {
        let (error, code) = ApiError::classify(err, fallback_code);
        error.with_meta(meta.clone()).with_code(code)
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(e) => {
                error!(request_id = %self.meta.request_id, "internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}

/// Maps a failed insert/update to a typed rejection when the database
/// reported a constraint we know how to explain.
pub(crate) fn constraint_violation(
    err: sqlx::Error,
    on_unique: impl FnOnce() -> EngineError,
    on_foreign_key: impl FnOnce() -> EngineError,
) -> anyhow::Error {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some(PG_UNIQUE_VIOLATION) => return on_unique().into(),
            Some(PG_FOREIGN_KEY_VIOLATION) => return on_foreign_key().into(),
            _ => {}
        }
    }
    err.into()
}
