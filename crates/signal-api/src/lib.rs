//! HTTP surface: on-demand analysis plus read access to stored signals.

pub mod on_demand;
pub mod quota;
pub mod routes;
pub mod stream;

pub use on_demand::{ItemAnalysis, OnDemandError, OnDemandGateway, MAX_ITEMS_PER_REQUEST};
pub use quota::QuotaLimiter;
pub use routes::router;

use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use signal_core::{AnalysisStore, SignalError, SignalProduced};
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<OnDemandGateway>,
    pub store: Arc<dyn AnalysisStore>,
    /// Source for `/ws/signals`; the stream reports itself disabled when unset
    pub signals: Option<broadcast::Sender<SignalProduced>>,
}

impl AppState {
    pub fn new(gateway: Arc<OnDemandGateway>) -> Self {
        let store = Arc::clone(gateway.service().store());
        Self {
            gateway,
            store,
            signals: None,
        }
    }

    pub fn with_signal_stream(mut self, signals: broadcast::Sender<SignalProduced>) -> Self {
        self.signals = Some(signals);
        self
    }
}

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    OnDemand(OnDemandError),
    NotFound(String),
    BadRequest(String),
    Store(SignalError),
}

impl From<OnDemandError> for ApiError {
    fn from(e: OnDemandError) -> Self {
        ApiError::OnDemand(e)
    }
}

impl From<SignalError> for ApiError {
    fn from(e: SignalError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut retry_after_secs = None;
        let (status, message) = match self {
            ApiError::OnDemand(OnDemandError::QuotaExceeded { retry_after }) => {
                // Round up so clients never retry inside the window
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                retry_after_secs = Some(secs.max(1));
                (StatusCode::TOO_MANY_REQUESTS, "Quota exceeded".to_string())
            }
            ApiError::OnDemand(e @ OnDemandError::InProgress(_)) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::OnDemand(OnDemandError::InvalidRequest(msg)) | ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, msg)
            }
            ApiError::OnDemand(OnDemandError::Store(e)) | ApiError::Store(e) => {
                tracing::error!(error = %e, "Store failure while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
        };

        let mut body = json!({
            "success": false,
            "error": message,
        });
        if let Some(secs) = retry_after_secs {
            body["retry_after_secs"] = json!(secs);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
