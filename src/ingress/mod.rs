//! The two catch-all HTTP entry points: everything the homeserver sends to
//! "the AS" lands on `/homeserver/<path>`, everything a bridge sends
//! believing it is talking to the homeserver lands on `/bridge/<path>`.
//!
//! Both build a `RequestContext`, hand off to the matching service, and log
//! the response on the same audit row - the state machine `context::mod`
//! already encodes (`created -> resolved -> dispatched -> response_logged`).

use std::collections::HashMap;

use salvo::prelude::*;
use serde_json::Value;
use tracing::warn;

use crate::context::{ContextBuildError, ContextDeps, RequestContext};
use crate::error::AppError;
use crate::services::homeserver_service::HomeserverService;
use crate::store::{RequestRepo, RequestSource, RequestUpdate};
use crate::web::metrics::global_metrics;

pub fn router(deps: ContextDeps, homeserver_service: std::sync::Arc<HomeserverService>) -> Router {
    Router::new()
        .hoop(affix_state::inject(deps).inject(homeserver_service))
        .push(Router::with_path("homeserver/<path:**>").goal(homeserver_ingress))
        .push(Router::with_path("bridge/<path:**>").goal(bridge_ingress))
}

#[handler]
async fn homeserver_ingress(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    handle(RequestSource::Homeserver, req, depot, res).await;
}

#[handler]
async fn bridge_ingress(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    handle(RequestSource::Bridge, req, depot, res).await;
}

async fn handle(source: RequestSource, req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let deps: &ContextDeps = depot.obtain().expect("ContextDeps injected at router construction");
    let homeserver_service: &std::sync::Arc<HomeserverService> =
        depot.obtain().expect("HomeserverService injected at router construction");

    let path = req.uri().path().trim_start_matches('/').to_string();
    let path = path
        .strip_prefix("homeserver/")
        .or_else(|| path.strip_prefix("bridge/"))
        .unwrap_or(&path)
        .to_string();
    let method = req.method().to_string();
    let headers = snapshot_headers(req);
    let query = snapshot_query(req);
    let raw_body = req.payload().await.map(|b| b.to_vec()).unwrap_or_default();
    global_metrics().record_inbound_request(source.as_str());

    let ctx = match RequestContext::build(deps, source, method, path.clone(), headers, query, &raw_body).await {
        Ok(ctx) => ctx,
        Err(ContextBuildError { request_id, error }) => {
            if is_empty_transaction_with_no_mapping(source, &path, &raw_body, &error) {
                let body = serde_json::json!({});
                log_build_failure_response(deps, request_id, 200, &body).await;
                res.status_code(StatusCode::OK);
                res.render(Json(body));
                return;
            }

            log_build_failure_response(deps, request_id, error.status_code().as_u16(), &error.body()).await;
            res.status_code(error.status_code());
            res.render(Json(error.body()));
            return;
        }
    };

    let outbound = ctx.as_service_request();
    ctx.log_outbound_request(&outbound).await;

    let result = match source {
        RequestSource::Bridge => ctx.bridge.service.send(&outbound, &ctx.bridge, &ctx.homeserver).await,
        RequestSource::Homeserver => {
            homeserver_service
                .handle_inbound(&outbound, Some(&ctx.bridge), ctx.identity(), &ctx.homeserver.name)
                .await
        }
    };

    let target = match source {
        RequestSource::Bridge => "homeserver",
        RequestSource::Homeserver => "bridge",
    };

    match result {
        Ok(response) => {
            global_metrics().record_outbound_forward(target);
            ctx.log_response(response.status, &response.body).await;
            res.status_code(StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK));
            res.render(Json(response.body));
        }
        Err(e) => {
            global_metrics().record_outbound_failure(target, &e.status_code().as_u16().to_string());
            ctx.log_response(e.status_code().as_u16(), &e.body()).await;
            res.status_code(e.status_code());
            res.render(Json(e.body()));
        }
    }
}

/// Per §4.8: a `BridgeNotFound` on a homeserver-sourced transactions path
/// whose `events` array is empty or missing is not an error - there was
/// nothing to deliver, so the AS spec's answer is a bare 200.
fn is_empty_transaction_with_no_mapping(source: RequestSource, path: &str, raw_body: &[u8], error: &AppError) -> bool {
    if source != RequestSource::Homeserver {
        return false;
    }
    if !matches!(error, AppError::BridgeNotFound(_)) {
        return false;
    }
    if !path.starts_with("_matrix/app/v1/transactions/") {
        return false;
    }
    let body: Value = serde_json::from_slice(raw_body).unwrap_or(Value::Null);
    match body.get("events").and_then(Value::as_array) {
        Some(events) => events.is_empty(),
        None => true,
    }
}

fn snapshot_headers(req: &Request) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
        }
    }
    headers
}

fn snapshot_query(req: &Request) -> HashMap<String, String> {
    req.queries().iter().map(|(k, v)| (k.clone(), v.to_string())).collect()
}

/// Logs a response against an audit row that was already persisted by a
/// failed `RequestContext::build` (no `RequestContext` exists to carry this
/// write, since construction never completed).
async fn log_build_failure_response(deps: &ContextDeps, request_id: i64, status: u16, body: &Value) {
    if request_id < 0 {
        return;
    }
    let update = RequestUpdate {
        response: Some(body.clone()),
        response_status: Some(status as i32),
        ..Default::default()
    };
    if let Err(e) = deps.requests.update_request(request_id, update).await {
        warn!(request_id, error = %e, "failed to log response for a failed context build");
    }
}
