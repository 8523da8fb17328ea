//! Bearer-token-gated bridge management surface: list live bridges and
//! soft-delete one (cascading to its `Request`/`TransactionMapping`/
//! `RoomBridgeMapping` rows and invalidating the registry cache). Modeled on
//! the teacher's `ProvisioningApi` - a single struct injected into the
//! router's depot, auth resolved per-request from the `Authorization` header.

use salvo::affix_state;
use salvo::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::registry::BridgeRegistry;
use crate::store::{Bridge, BridgeRepo, Store};

#[derive(Clone)]
pub struct AdminApi {
    store: Store,
    registry: BridgeRegistry,
    token: String,
}

pub fn router(store: Store, registry: BridgeRegistry, token: String) -> Router {
    let api = AdminApi { store, registry, token };
    Router::with_path("admin")
        .hoop(affix_state::inject(api))
        .push(Router::with_path("bridges").get(list_bridges))
        .push(Router::with_path("bridges/<id>").delete(delete_bridge))
}

#[derive(Debug, Serialize)]
struct BridgeSummary {
    id: i64,
    orchestrator_id: String,
    bridge_service: String,
    owner_matrix_username: String,
    matrix_bot_username: String,
    live_status: String,
    ready_status: String,
}

impl From<&Bridge> for BridgeSummary {
    fn from(b: &Bridge) -> Self {
        Self {
            id: b.id,
            orchestrator_id: b.orchestrator_id.clone(),
            bridge_service: b.bridge_service.as_str().to_string(),
            owner_matrix_username: b.owner_matrix_username.clone(),
            matrix_bot_username: b.matrix_bot_username.clone(),
            live_status: b.live_status.clone(),
            ready_status: b.ready_status.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[handler]
async fn list_bridges(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let api: &AdminApi = depot.obtain().expect("AdminApi injected at router construction");
    if !require_auth(req, api, res) {
        return;
    }

    match api.store.bridges().list_all().await {
        Ok(bridges) => {
            let summaries: Vec<BridgeSummary> = bridges.iter().map(BridgeSummary::from).collect();
            res.render(Json(serde_json::json!({
                "bridges": summaries,
                "count": summaries.len(),
            })));
        }
        Err(e) => {
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
            res.render(Json(ErrorBody { error: e.to_string() }));
        }
    }
}

#[handler]
async fn delete_bridge(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let api: &AdminApi = depot.obtain().expect("AdminApi injected at router construction");
    if !require_auth(req, api, res) {
        return;
    }

    let Some(id) = req.param::<i64>("id") else {
        res.status_code(StatusCode::BAD_REQUEST);
        res.render(Json(ErrorBody { error: "invalid bridge id".into() }));
        return;
    };

    let bridge = match api.store.bridges().get_by_id(id).await {
        Ok(bridge) => bridge,
        Err(_) => {
            res.status_code(StatusCode::NOT_FOUND);
            res.render(Json(ErrorBody { error: "bridge not found".into() }));
            return;
        }
    };

    match api.store.bridges().soft_delete_cascade(id).await {
        Ok(()) => {
            api.registry.invalidate(&bridge);
            info!(action = "soft_delete_bridge", bridge_id = id, "bridge soft-deleted");
            res.render(Json(serde_json::json!({ "success": true })));
        }
        Err(e) => {
            warn!(action = "soft_delete_bridge", bridge_id = id, error = %e, "soft-delete failed");
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
            res.render(Json(ErrorBody { error: e.to_string() }));
        }
    }
}

fn require_auth(req: &Request, api: &AdminApi, res: &mut Response) -> bool {
    let Some(provided) = extract_bearer(req) else {
        res.status_code(StatusCode::UNAUTHORIZED);
        res.render(Json(ErrorBody { error: "missing authorization token".into() }));
        return false;
    };
    if provided != api.token {
        res.status_code(StatusCode::UNAUTHORIZED);
        res.render(Json(ErrorBody { error: "invalid authorization token".into() }));
        return false;
    }
    true
}

fn extract_bearer(req: &Request) -> Option<String> {
    let header = req.header::<String>("Authorization")?;
    Some(header.strip_prefix("Bearer ").unwrap_or(&header).trim().to_string())
}
