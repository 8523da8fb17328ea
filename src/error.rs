use salvo::http::StatusCode;
use salvo::prelude::*;
use serde_json::json;
use thiserror::Error;

use crate::store::error::StoreError;

/// Error kinds per the routing core's propagation policy: resolution errors
/// are mapped to HTTP codes at ingress, `Upstream` passes the forwarded
/// response through verbatim, and nothing here is retried - bridges and
/// homeservers own their own retry logic.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("bridge not found: {0}")]
    BridgeNotFound(String),

    #[error("route not found: {0}")]
    RouteNotFound(String),

    #[error("upstream error (status {status}): {body}")]
    Upstream { status: u16, body: serde_json::Value },

    #[error("outbound request timed out")]
    Timeout,

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BridgeNotFound(_) => StatusCode::NOT_FOUND,
            AppError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> serde_json::Value {
        match self {
            AppError::Upstream { body, .. } => body.clone(),
            other => json!({ "error": other.to_string() }),
        }
    }
}

#[async_trait]
impl Writer for AppError {
    async fn write(mut self, _req: &mut Request, _depot: &mut Depot, res: &mut Response) {
        res.status_code(self.status_code());
        res.render(Json(self.body()));
    }
}

pub type AppResult<T> = Result<T, AppError>;
