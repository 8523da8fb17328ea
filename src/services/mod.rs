//! The two directions of traffic a bridge process can generate: calls it
//! makes outward (handled by [`bridge_service`], forwarded to the real
//! homeserver) and calls the homeserver delivers inward (handled by
//! [`homeserver_service`], forwarded to the right bridge).

pub mod bridge_service;
pub mod homeserver_service;

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::http_client::HttpClient;

/// A request about to be forwarded to a bridge or homeserver. Headers and
/// query params are plain string maps; `body` is `Value::Null` when the
/// inbound request had no JSON body (or wasn't JSON at all).
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: Value,
}

impl ServiceResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn empty_ok() -> Self {
        Self {
            status: 200,
            body: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Forwards `req` to `base_url/path`, replacing any existing `authorization`
/// header with `Bearer {bearer}`. The upstream's status and body are
/// returned verbatim as a `ServiceResponse` - non-2xx upstream responses are
/// not treated as errors here, only transport failures (timeout, connection
/// refused) are.
pub async fn dispatch(
    http: &HttpClient,
    base_url: &str,
    req: &ServiceRequest,
    path: &str,
    bearer: &str,
    timeout_seconds: u64,
) -> AppResult<ServiceResponse> {
    let method = Method::from_bytes(req.method.as_bytes())
        .map_err(|e| AppError::BadRequest(format!("invalid HTTP method '{}': {e}", req.method)))?;
    let url = format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'));

    let mut builder = http
        .client()
        .request(method, &url)
        .timeout(Duration::from_secs(timeout_seconds))
        .query(&req.query);

    for (key, value) in &req.headers {
        let lower = key.to_ascii_lowercase();
        if lower == "authorization" || lower == "host" || lower == "content-length" {
            continue;
        }
        builder = builder.header(key, value);
    }
    builder = builder.bearer_auth(bearer);

    if !req.body.is_null() {
        builder = builder.json(&req.body);
    }

    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            AppError::Timeout
        } else {
            AppError::Internal(format!("outbound request to {url} failed: {e}"))
        }
    })?;

    let status = response.status().as_u16();
    let body = match response.json::<Value>().await {
        Ok(v) => v,
        Err(e) => {
            warn!(url = %url, error = %e, "upstream response was not valid JSON");
            Value::Null
        }
    };
    Ok(ServiceResponse { status, body })
}
