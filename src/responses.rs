use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request metadata echoed in every response body.
#[derive(Clone, Debug, Serialize)]
pub struct RequestMeta {
    pub request_id: String,
    /// RFC3339
    pub request_at: String,
    pub timestamp: i64,
}

impl RequestMeta {
    /// Reuses a caller-supplied `x-request-id` so retries of the same payment
    /// callback can be correlated in the logs.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        Self {
            request_id,
            request_at: now.to_rfc3339(),
            timestamp: now.timestamp(),
        }
    }
}

pub async fn meta_middleware(mut req: Request<Body>, next: Next) -> Response {
    let meta = RequestMeta::from_headers(req.headers());
    let header = HeaderValue::from_str(&meta.request_id).ok();
    req.extensions_mut().insert(meta);

    let mut res = next.run(req).await;
    if let Some(value) = header {
        res.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    res
}

#[derive(Clone, Debug, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub total_pages: u32,
}

impl Pagination {
    pub fn new(page: u32, per_page: u32, total: u64) -> Self {
        let total_pages = match per_page {
            0 => 0,
            n => u32::try_from(total.div_ceil(u64::from(n))).unwrap_or(u32::MAX),
        };
        Self {
            page,
            per_page,
            total,
            total_pages,
        }
    }
}

#[derive(Serialize)]
struct SuccessEnvelope<T> {
    message: String,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pagination: Option<Pagination>,
    meta: RequestMeta,
}

/// A successful JSON response.
pub struct ApiOk<T> {
    status: StatusCode,
    envelope: SuccessEnvelope<T>,
}

impl<T> ApiOk<T> {
    pub fn ok(message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self::new(StatusCode::OK, message.into(), data, meta)
    }

    pub fn created(message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self::new(StatusCode::CREATED, message.into(), data, meta)
    }

    fn new(status: StatusCode, message: String, data: T, meta: RequestMeta) -> Self {
        let envelope = SuccessEnvelope {
            message,
            data,
            pagination: None,
            meta,
        };
        Self { status, envelope }
    }

    pub fn paginated(self, pagination: Pagination) -> Self {
        Self {
            envelope: SuccessEnvelope {
                pagination: Some(pagination),
                ..self.envelope
            },
            ..self
        }
    }
}

impl<T: Serialize> IntoResponse for ApiOk<T> {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}
