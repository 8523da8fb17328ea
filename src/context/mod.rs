//! Assembles everything an ingress handler needs from a raw inbound HTTP
//! call: parsed body, resolved bridge/homeserver, and a standing audit row
//! that gets filled in as the request progresses.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use crate::error::AppError;
use crate::identity::IdentityTranslator;
use crate::resolver::{BridgeResolver, ResolveInput};
use crate::services::bridge_service::BridgeServiceHandle;
use crate::services::ServiceRequest;
use crate::store::{
    Homeserver, HomeserverRepo, NewRequestRecord, RequestRepo, RequestSource, RequestUpdate, SqliteHomeserverRepo,
    SqliteRequestRepo,
};

/// Dependencies `RequestContext::build` needs, gathered in one place so
/// ingress handlers don't have to pass five separate arguments. Every field
/// is a cheap handle (pool-backed repo or `Arc`-backed resolver), so this is
/// `Clone` and held directly by `App` rather than borrowed.
#[derive(Clone)]
pub struct ContextDeps {
    pub requests: SqliteRequestRepo,
    pub resolver: BridgeResolver,
    pub homeservers: SqliteHomeserverRepo,
    pub identity: IdentityTranslator,
}

/// A resolution failure that happened after the audit row was already
/// persisted. `request_id` is `-1` when the row itself couldn't be created
/// (a storage failure, not a resolution failure) - callers should only log
/// a response against a non-negative id.
pub struct ContextBuildError {
    pub request_id: i64,
    pub error: AppError,
}

pub struct RequestContext {
    pub request_id: i64,
    pub source: RequestSource,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Value,
    pub bridge: BridgeServiceHandle,
    pub homeserver: Homeserver,
    requests: SqliteRequestRepo,
    identity: IdentityTranslator,
}

impl RequestContext {
    pub async fn build(
        deps: &ContextDeps,
        source: RequestSource,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        query: HashMap<String, String>,
        raw_body: &[u8],
    ) -> Result<RequestContext, ContextBuildError> {
        let body: Value = serde_json::from_slice(raw_body).unwrap_or(Value::Null);

        let homeserver_result = resolve_homeserver(deps, &path, &body).await;

        let resolution = deps
            .resolver
            .resolve(ResolveInput {
                source,
                headers: &headers,
                path: &path,
                body: &body,
                query: &query,
            })
            .await;

        let (bridge_handle, discovery_method, discovery_error) = match &resolution {
            Ok((handle, method)) => (Some(handle.clone()), Some(*method), None),
            Err(e) => (None, None, Some(e.to_string())),
        };

        let new = NewRequestRecord {
            source,
            bridge_id: bridge_handle.as_ref().map(|h| h.bridge.id),
            homeserver_id: homeserver_result.as_ref().ok().map(|hs| hs.id),
            bridge_discovery_method: discovery_method,
            discovery_error: discovery_error.clone(),
            method: method.clone(),
            path: path.clone(),
            inbound_request: build_inbound_snapshot(&method, &path, &headers, &query, &body),
        };

        let record = deps
            .requests
            .create_request(new)
            .await
            .map_err(|e| ContextBuildError {
                request_id: -1,
                error: AppError::from(e),
            })?;

        let homeserver = match homeserver_result {
            Ok(hs) => hs,
            Err(e) => {
                return Err(ContextBuildError {
                    request_id: record.id,
                    error: e,
                });
            }
        };

        let bridge = match bridge_handle {
            Some(handle) => handle,
            None => {
                return Err(ContextBuildError {
                    request_id: record.id,
                    error: resolution.unwrap_err(),
                });
            }
        };

        Ok(RequestContext {
            request_id: record.id,
            source,
            method,
            path,
            headers,
            query,
            body,
            bridge,
            homeserver,
            requests: deps.requests.clone(),
            identity: deps.identity.clone(),
        })
    }

    pub fn identity(&self) -> &IdentityTranslator {
        &self.identity
    }

    pub fn as_service_request(&self) -> ServiceRequest {
        ServiceRequest {
            method: self.method.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            query: self.query.clone(),
            body: self.body.clone(),
        }
    }

    pub async fn log_outbound_request(&self, outbound: &ServiceRequest) {
        let update = RequestUpdate {
            outbound_at: Some(Utc::now()),
            outbound_request: Some(serde_json::json!({
                "method": outbound.method,
                "path": outbound.path,
                "query": outbound.query,
                "body": outbound.body,
            })),
            ..Default::default()
        };
        if let Err(e) = self.requests.update_request(self.request_id, update).await {
            warn!(request_id = self.request_id, error = %e, "failed to log outbound request");
        }
    }

    pub async fn log_response(&self, status: u16, body: &Value) {
        let update = RequestUpdate {
            response: Some(body.clone()),
            response_status: Some(status as i32),
            ..Default::default()
        };
        if let Err(e) = self.requests.update_request(self.request_id, update).await {
            warn!(request_id = self.request_id, error = %e, "failed to log response");
        }
    }
}

/// Resolves the `Homeserver` row this request concerns: the server name
/// embedded in an encoded username found in the path or body, falling back
/// to the sole registered homeserver (id 1) for deployments fronting just
/// one. A multiplexer fronting several homeservers needs every namespaced
/// username to carry its target, which the encoding already guarantees.
async fn resolve_homeserver(deps: &ContextDeps, path: &str, body: &Value) -> Result<Homeserver, AppError> {
    if let Some(decoded) = deps.identity.find(path) {
        if let Ok(hs) = deps.homeservers.get_by_name(&decoded.homeserver).await {
            return Ok(hs);
        }
    }
    if let Ok(Some(found)) = crate::util::find_first_matching(body, |s| deps.identity.contains_encoded(s)) {
        if let Some(decoded) = deps.identity.find(&found) {
            if let Ok(hs) = deps.homeservers.get_by_name(&decoded.homeserver).await {
                return Ok(hs);
            }
        }
    }
    deps.homeservers.get_by_id(1).await.map_err(AppError::from)
}

fn build_inbound_snapshot(
    method: &str,
    path: &str,
    headers: &HashMap<String, String>,
    query: &HashMap<String, String>,
    body: &Value,
) -> Value {
    serde_json::json!({
        "method": method,
        "path": path,
        "headers": headers,
        "query": query,
        "body": body,
    })
}
