//! Handling for traffic a bridge process sends, believing it is talking
//! directly to a homeserver. `WhatsappBridgeService` is the one concrete
//! implementation today; every other known bridge platform speaks the same
//! Matrix client-server surface and is served by it too (see
//! `registry::BridgeRegistry::build_handle`).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::http_client::HttpClient;
use crate::identity::{Direction, IdentityTranslator};
use crate::route::RouteRegistry;
use crate::services::homeserver_service::HomeserverService;
use crate::services::{dispatch, ServiceRequest, ServiceResponse};
use crate::store::{Bridge, Homeserver, RoomBridgeRepo, SqliteRoomBridgeRepo, SqliteTransactionRepo, TransactionRepo};

#[async_trait]
pub trait BridgeService: Send + Sync {
    /// Handles one request a bridge sent, forwarding it on to the real
    /// homeserver (or answering locally) and returning the response the
    /// bridge should see.
    async fn send(&self, req: &ServiceRequest, handle: &BridgeServiceHandle, homeserver: &Homeserver) -> AppResult<ServiceResponse>;
}

/// A live handle to one bridge: its database row, the concrete
/// `BridgeService` it's served by, and everything needed to forward traffic
/// in either direction. Cheaply cloneable - cloning shares the underlying
/// `reqwest::Client` and `Arc`s, it does not open new connections.
#[derive(Clone)]
pub struct BridgeServiceHandle {
    pub bridge: Arc<Bridge>,
    pub service: Arc<dyn BridgeService>,
    pub homeserver_service: Arc<HomeserverService>,
    pub identity: IdentityTranslator,
    pub outbound_timeout_seconds: u64,
    pub http: HttpClient,
    pub transactions: SqliteTransactionRepo,
    pub rooms: SqliteRoomBridgeRepo,
    pub appservice_id: String,
}

impl BridgeServiceHandle {
    /// The bridge's own bot user, fully qualified on `hs_name`. Distinct from
    /// `IdentityTranslator::encode`, which always carries a `__<local>`
    /// suffix for puppeted ghosts - the bridge's bot itself has none.
    pub fn bot_username(&self, hs_name: &str) -> String {
        format!(
            "@{}{}_{}:{}",
            self.identity.namespace(),
            self.bridge.bridge_service.as_str(),
            self.bridge.orchestrator_id,
            hs_name
        )
    }

    /// Forwards `req` to this bridge's own HTTP endpoint, presenting the
    /// `hs_token` it was registered with (the token a real homeserver would
    /// use to authenticate transaction delivery). `path_override` replaces
    /// `req.path` when the forwarded path differs from the inbound one.
    pub async fn forward_to_bridge(&self, req: &ServiceRequest, path_override: Option<String>) -> AppResult<ServiceResponse> {
        let base_url = format!("http://{}:{}", self.bridge.ip, self.bridge.port);
        let path = path_override.unwrap_or_else(|| req.path.clone());
        dispatch(&self.http, &base_url, req, &path, &self.bridge.hs_token, self.outbound_timeout_seconds).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    MatrixVersions,
    Whoami,
    Ping,
    MediaConfig,
    AvatarUrl,
    Displayname,
    Register,
    Generic,
}

/// Serves the handful of endpoints a Matrix-protocol bridge needs from "its"
/// homeserver: version/capability probes, its own bot identity, ghost-user
/// registration, profile fields, and transaction pings - plus a generic
/// fallback that forwards everything else with usernames translated.
pub struct WhatsappBridgeService {
    routes: RouteRegistry<Endpoint>,
}

impl WhatsappBridgeService {
    pub fn new() -> Self {
        let mut routes = RouteRegistry::new();
        routes.add_exact("_matrix/client/versions", Endpoint::MatrixVersions, None);
        routes.add_exact("_matrix/client/v3/account/whoami", Endpoint::Whoami, None);
        routes.add_regex(
            r"^_matrix/client/v1/appservice/[^/]+/ping$",
            Endpoint::Ping,
            Some("transaction_id mapping before forwarding to homeserver"),
        )
        .expect("static ping regex is valid");
        routes.add_exact("_matrix/client/v1/media/config", Endpoint::MediaConfig, None);
        routes.add_regex(
            r"^_matrix/client/v3/profile/[^/]+/avatar_url$",
            Endpoint::AvatarUrl,
            None,
        )
        .expect("static avatar_url regex is valid");
        routes.add_regex(
            r"^_matrix/client/v3/profile/[^/]+/displayname$",
            Endpoint::Displayname,
            None,
        )
        .expect("static displayname regex is valid");
        routes.add_exact("_matrix/client/v3/register", Endpoint::Register, None);
        routes.set_fallback(Endpoint::Generic);
        Self { routes }
    }

    async fn matrix_versions(&self, req: &ServiceRequest, handle: &BridgeServiceHandle, homeserver: &Homeserver) -> AppResult<ServiceResponse> {
        handle.homeserver_service.forward(req, homeserver, &req.path).await
    }

    async fn whoami(&self, req: &ServiceRequest, handle: &BridgeServiceHandle, homeserver: &Homeserver) -> AppResult<ServiceResponse> {
        let mut response = handle.homeserver_service.forward(req, homeserver, &req.path).await?;
        if let Some(obj) = response.body.as_object_mut() {
            obj.insert(
                "user_id".to_string(),
                Value::String(format!("@{}:{}", handle.bridge.matrix_bot_username, homeserver.name)),
            );
        }
        Ok(response)
    }

    /// Rewrites `_matrix/client/v1/appservice/<anything>/ping` to this
    /// multiplexer's own registered appservice id before forwarding, and
    /// remembers which bridge originated `transaction_id` so the reply
    /// (delivered back through `HomeserverService::handle_inbound`) can be
    /// routed to the same bridge.
    async fn ping(&self, req: &ServiceRequest, handle: &BridgeServiceHandle, homeserver: &Homeserver) -> AppResult<ServiceResponse> {
        let transaction_id = req
            .body
            .get("transaction_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::BadRequest("ping request missing transaction_id".into()))?;

        handle
            .transactions
            .upsert(transaction_id, &handle.bridge.as_token, handle.bridge.id)
            .await
            .map_err(AppError::from)?;

        let segments: Vec<&str> = req.path.split('/').collect();
        let rewritten_path = segments
            .iter()
            .enumerate()
            .map(|(i, s)| if i == 4 { handle.appservice_id.as_str() } else { *s })
            .collect::<Vec<_>>()
            .join("/");

        handle.homeserver_service.forward(req, homeserver, &rewritten_path).await
    }

    async fn media_config(&self, req: &ServiceRequest, handle: &BridgeServiceHandle, homeserver: &Homeserver) -> AppResult<ServiceResponse> {
        handle.homeserver_service.forward(req, homeserver, &req.path).await
    }

    /// Profile lookups for the bridge's own bot arrive addressed to the
    /// plain username the bridge thinks it owns; they must be re-pointed at
    /// this bridge's actual registered bot identity and carry that same
    /// identity as the `user_id` masquerade query param, since only the
    /// multiplexer's appservice user is registered on the real homeserver.
    async fn profile(&self, req: &ServiceRequest, handle: &BridgeServiceHandle, homeserver: &Homeserver) -> AppResult<ServiceResponse> {
        let bot_username = handle.bot_username(&homeserver.name);
        let own_plain = format!("@{}:{}", handle.bridge.matrix_bot_username, homeserver.name);
        let new_path = req.path.replacen(&own_plain, &bot_username, 1);

        let mut forwarded = req.clone();
        forwarded.query.insert("user_id".to_string(), bot_username);

        handle.homeserver_service.forward(&forwarded, homeserver, &new_path).await
    }

    /// Rewrites the plain localpart a bridge wants to register into this
    /// multiplexer's namespaced form before forwarding, so the resulting
    /// ghost user lands under this bridge's slice of the namespace.
    async fn register(&self, req: &ServiceRequest, handle: &BridgeServiceHandle, homeserver: &Homeserver) -> AppResult<ServiceResponse> {
        let mut body = req.body.clone();
        if let Some(username) = body.get("username").and_then(Value::as_str).map(str::to_string) {
            let encoded = handle.identity.encode_localpart(handle.bridge.bridge_service.as_str(), &handle.bridge.orchestrator_id, &username);
            if let Some(obj) = body.as_object_mut() {
                obj.insert("username".to_string(), Value::String(encoded));
            }
        }
        let mut forwarded = req.clone();
        forwarded.body = body;
        handle.homeserver_service.forward(&forwarded, homeserver, &req.path).await
    }

    /// Everything not given a dedicated handler: translate embedded
    /// usernames to the homeserver-visible encoded form on the way out, and
    /// back to plain on the way in, so the bridge never has to know about
    /// the shared namespace.
    async fn generic(&self, req: &ServiceRequest, handle: &BridgeServiceHandle, homeserver: &Homeserver) -> AppResult<ServiceResponse> {
        let rewritten_body = handle
            .identity
            .rewrite_usernames_in_body(&req.body, Direction::ToHomeserver, &handle.bridge, &homeserver.name)?;
        let rewritten_path = handle
            .identity
            .rewrite_text(&req.path, Direction::ToHomeserver, &handle.bridge, &homeserver.name);

        let mut forwarded = req.clone();
        forwarded.body = rewritten_body;
        if let Some(user_id) = forwarded.query.get("user_id").cloned() {
            let rewritten = handle.identity.rewrite_text(&user_id, Direction::ToHomeserver, &handle.bridge, &homeserver.name);
            forwarded.query.insert("user_id".to_string(), rewritten);
        }

        let mut response = handle.homeserver_service.forward(&forwarded, homeserver, &rewritten_path).await?;
        response.body = handle
            .identity
            .rewrite_usernames_in_body(&response.body, Direction::ToBridge, &handle.bridge, &homeserver.name)
            .unwrap_or(response.body);

        if rewritten_path.starts_with("_matrix/client/v3/createRoom") {
            if let Some(room_id) = response.body.get("room_id").and_then(Value::as_str) {
                if let Err(e) = handle.rooms.upsert(room_id, handle.bridge.id).await {
                    warn!(room_id, bridge_id = handle.bridge.id, error = %e, "failed to record room-bridge mapping for created room");
                }
            }
        } else if let Some(room_id) = extract_room_id_from_send_path(&rewritten_path) {
            if let Err(e) = handle.rooms.upsert(&room_id, handle.bridge.id).await {
                warn!(room_id, bridge_id = handle.bridge.id, error = %e, "failed to record room-bridge mapping for send");
            }
        }

        Ok(response)
    }
}

impl Default for WhatsappBridgeService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BridgeService for WhatsappBridgeService {
    async fn send(&self, req: &ServiceRequest, handle: &BridgeServiceHandle, homeserver: &Homeserver) -> AppResult<ServiceResponse> {
        match self.routes.match_or_fallback(&req.path)? {
            Endpoint::MatrixVersions => self.matrix_versions(req, handle, homeserver).await,
            Endpoint::Whoami => self.whoami(req, handle, homeserver).await,
            Endpoint::Ping => self.ping(req, handle, homeserver).await,
            Endpoint::MediaConfig => self.media_config(req, handle, homeserver).await,
            Endpoint::AvatarUrl | Endpoint::Displayname => self.profile(req, handle, homeserver).await,
            Endpoint::Register => self.register(req, handle, homeserver).await,
            Endpoint::Generic => self.generic(req, handle, homeserver).await,
        }
    }
}

/// `_matrix/client/v3/rooms/{room_id}/send/{event_type}/{txn_id}` - pulls
/// `room_id` out so the mapping can be recorded even though the room wasn't
/// created through this bridge (e.g. it was invited into by another user).
fn extract_room_id_from_send_path(path: &str) -> Option<String> {
    let mut segments = path.split('/');
    loop {
        match segments.next() {
            Some("rooms") => return segments.next().map(str::to_string),
            Some(_) => continue,
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_room_id_from_send_path() {
        let path = "_matrix/client/v3/rooms/!abc123:example.org/send/m.room.message/txn1";
        assert_eq!(
            extract_room_id_from_send_path(path).as_deref(),
            Some("!abc123:example.org")
        );
    }

    #[test]
    fn no_room_id_when_path_has_no_rooms_segment() {
        assert_eq!(extract_room_id_from_send_path("_matrix/client/versions"), None);
    }
}
