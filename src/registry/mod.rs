//! Materializes a `Bridge` database row into a live `BridgeService` handle
//! and caches it by the key the caller resolved with.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::http_client::HttpClient;
use crate::identity::IdentityTranslator;
use crate::services::bridge_service::{BridgeServiceHandle, WhatsappBridgeService};
use crate::services::homeserver_service::HomeserverService;
use crate::store::{Bridge, BridgeLookup, BridgeRepo, BridgeServiceKind, SqliteBridgeRepo, SqliteRoomBridgeRepo, SqliteTransactionRepo};

/// Cache key, mirroring the four ways a caller may ask for a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    AsToken(String),
    Id(i64),
    OrchestratorId(String),
    OwnerAndService(String, String),
}

impl From<&BridgeLookup> for CacheKey {
    fn from(lookup: &BridgeLookup) -> Self {
        match lookup {
            BridgeLookup::AsToken(t) => CacheKey::AsToken(t.clone()),
            BridgeLookup::Id(id) => CacheKey::Id(*id),
            BridgeLookup::OrchestratorId(oid) => CacheKey::OrchestratorId(oid.clone()),
            BridgeLookup::OwnerAndService(owner, service) => {
                CacheKey::OwnerAndService(owner.clone(), service.as_str().to_string())
            }
        }
    }
}

#[derive(Clone)]
pub struct BridgeRegistry {
    bridges: SqliteBridgeRepo,
    transactions: SqliteTransactionRepo,
    rooms: SqliteRoomBridgeRepo,
    homeserver_service: Arc<HomeserverService>,
    identity: IdentityTranslator,
    config: Config,
    handles: Arc<Mutex<HashMap<CacheKey, BridgeServiceHandle>>>,
}

impl BridgeRegistry {
    pub fn new(
        bridges: SqliteBridgeRepo,
        transactions: SqliteTransactionRepo,
        rooms: SqliteRoomBridgeRepo,
        homeserver_service: Arc<HomeserverService>,
        identity: IdentityTranslator,
        config: Config,
    ) -> Self {
        Self {
            bridges,
            transactions,
            rooms,
            homeserver_service,
            identity,
            config,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn get(&self, lookup: BridgeLookup) -> AppResult<BridgeServiceHandle> {
        let cache_key = CacheKey::from(&lookup);
        if let Some(handle) = self.handles.lock().get(&cache_key).cloned() {
            crate::web::metrics::global_metrics().record_cache_hit("bridge_registry");
            return Ok(handle);
        }
        crate::web::metrics::global_metrics().record_cache_miss("bridge_registry");

        let bridge = self
            .bridges
            .get(lookup)
            .await
            .map_err(|_| AppError::BridgeNotFound("bridge not found".into()))?;

        let handle = self.build_handle(bridge);
        self.handles.lock().insert(cache_key, handle.clone());
        Ok(handle)
    }

    pub async fn get_by_as_token(&self, as_token: &str) -> AppResult<BridgeServiceHandle> {
        self.get(BridgeLookup::AsToken(as_token.to_string())).await
    }

    pub async fn get_by_orchestrator_id(&self, orchestrator_id: &str) -> AppResult<BridgeServiceHandle> {
        self.get(BridgeLookup::OrchestratorId(orchestrator_id.to_string())).await
    }

    pub async fn get_by_id(&self, id: i64) -> AppResult<BridgeServiceHandle> {
        self.get(BridgeLookup::Id(id)).await
    }

    pub async fn get_by_owner_and_service(&self, owner: &str, service: &BridgeServiceKind) -> AppResult<BridgeServiceHandle> {
        self.get(BridgeLookup::OwnerAndService(owner.to_string(), service.clone())).await
    }

    /// Invalidates every cache entry for `bridge` (all four keys it could be
    /// looked up by). Called after `soft_delete_cascade`.
    pub fn invalidate(&self, bridge: &Bridge) {
        let mut handles = self.handles.lock();
        handles.remove(&CacheKey::AsToken(bridge.as_token.clone()));
        handles.remove(&CacheKey::Id(bridge.id));
        handles.remove(&CacheKey::OrchestratorId(bridge.orchestrator_id.clone()));
        handles.remove(&CacheKey::OwnerAndService(
            bridge.owner_matrix_username.clone(),
            bridge.bridge_service.as_str().to_string(),
        ));
    }

    fn build_handle(&self, bridge: Bridge) -> BridgeServiceHandle {
        let service: Arc<dyn crate::services::bridge_service::BridgeService> = match bridge.bridge_service {
            BridgeServiceKind::Whatsapp => Arc::new(WhatsappBridgeService::new()),
            // Every known foreign network speaks the same Matrix AS protocol on
            // its side of the multiplexer; the default service implementation
            // covers them all until a platform needs bespoke behavior.
            _ => Arc::new(WhatsappBridgeService::new()),
        };

        BridgeServiceHandle {
            bridge: Arc::new(bridge),
            service,
            homeserver_service: self.homeserver_service.clone(),
            identity: self.identity.clone(),
            outbound_timeout_seconds: self.config.appservice.outbound_timeout_seconds,
            http: HttpClient::new(),
            transactions: self.transactions.clone(),
            rooms: self.rooms.clone(),
            appservice_id: self.config.appservice.id.clone(),
        }
    }
}
