use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use parking_lot::Mutex;

use super::error::{StoreError, StoreResult};
use super::models::{Bridge, BridgeServiceKind};
use super::schema::{bridges, requests, room_bridge_mappings, transaction_mappings};
use super::SqlitePool;

/// The ways a bridge can be looked up; mirrors the constructor arguments
/// `BridgeRegistry`/`BridgeResolver` use to identify a bridge.
#[derive(Debug, Clone)]
pub enum BridgeLookup {
    AsToken(String),
    Id(i64),
    OrchestratorId(String),
    OwnerAndService(String, BridgeServiceKind),
}

#[async_trait]
pub trait BridgeRepo: Send + Sync {
    async fn get_by_as_token(&self, as_token: &str) -> StoreResult<Bridge>;
    async fn get_by_orchestrator_id(&self, orchestrator_id: &str) -> StoreResult<Bridge>;
    async fn get_by_id(&self, id: i64) -> StoreResult<Bridge>;
    async fn get_by_owner_and_service(
        &self,
        owner_matrix_username: &str,
        service: &BridgeServiceKind,
    ) -> StoreResult<Bridge>;
    async fn get(&self, lookup: BridgeLookup) -> StoreResult<Bridge>;
    async fn list_by_owner(&self, owner_matrix_username: &str) -> StoreResult<Vec<Bridge>>;
    /// Every non-deleted bridge, ordered by id. Used by the admin surface;
    /// not part of the resolver's point-lookup paths.
    async fn list_all(&self) -> StoreResult<Vec<Bridge>>;
    async fn create(&self, bridge: NewBridge) -> StoreResult<Bridge>;
    /// Soft-delete a bridge and hard-delete every child row keyed by its
    /// `bridge_id` (requests, transaction mappings, room mappings) within
    /// one transaction.
    async fn soft_delete_cascade(&self, id: i64) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct NewBridge {
    pub orchestrator_id: String,
    pub bridge_service: BridgeServiceKind,
    pub as_token: String,
    pub hs_token: String,
    pub ip: String,
    pub port: u16,
    pub owner_matrix_username: String,
    pub matrix_bot_username: String,
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = bridges)]
struct Row {
    id: i64,
    orchestrator_id: String,
    bridge_service: String,
    as_token: String,
    hs_token: String,
    ip: String,
    port: i32,
    owner_matrix_username: String,
    matrix_bot_username: String,
    live_status: String,
    ready_status: String,
    status_updated_at: String,
    bridge_management_room_id: Option<String>,
    deleted_at: Option<String>,
}

impl Row {
    fn into_model(self) -> StoreResult<Bridge> {
        Ok(Bridge {
            id: self.id,
            orchestrator_id: self.orchestrator_id,
            bridge_service: BridgeServiceKind::parse(&self.bridge_service),
            as_token: self.as_token,
            hs_token: self.hs_token,
            ip: self.ip,
            port: self.port as u16,
            owner_matrix_username: self.owner_matrix_username,
            matrix_bot_username: self.matrix_bot_username,
            live_status: self.live_status,
            ready_status: self.ready_status,
            status_updated_at: parse_ts(&self.status_updated_at)?,
            bridge_management_room_id: self.bridge_management_room_id,
            deleted_at: self.deleted_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Storage(format!("invalid timestamp '{s}': {e}")))
}

#[derive(Insertable)]
#[diesel(table_name = bridges)]
struct NewRow<'a> {
    orchestrator_id: &'a str,
    bridge_service: &'a str,
    as_token: &'a str,
    hs_token: &'a str,
    ip: &'a str,
    port: i32,
    owner_matrix_username: &'a str,
    matrix_bot_username: &'a str,
    live_status: &'a str,
    ready_status: &'a str,
    status_updated_at: String,
}

type BridgeCache = Arc<Mutex<lru::LruCache<String, Bridge>>>;

/// Point lookups cached by `as_token` and `orchestrator_id` per the data
/// model's cacheability requirement. Any soft-delete invalidates both caches
/// for the affected bridge; there is no positive-lookup TTL because
/// invalidation is exact rather than time-based.
#[derive(Clone)]
pub struct SqliteBridgeRepo {
    pool: SqlitePool,
    by_as_token: BridgeCache,
    by_orchestrator_id: BridgeCache,
}

impl SqliteBridgeRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            by_as_token: Arc::new(Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(2048).unwrap(),
            ))),
            by_orchestrator_id: Arc::new(Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(2048).unwrap(),
            ))),
        }
    }

    fn invalidate(&self, bridge: &Bridge) {
        self.by_as_token.lock().pop(&bridge.as_token);
        self.by_orchestrator_id.lock().pop(&bridge.orchestrator_id);
    }
}

#[async_trait]
impl BridgeRepo for SqliteBridgeRepo {
    async fn get_by_as_token(&self, as_token: &str) -> StoreResult<Bridge> {
        if let Some(cached) = self.by_as_token.lock().get(as_token).cloned() {
            return Ok(cached);
        }
        let pool = self.pool.clone();
        let token = as_token.to_string();
        let bridge = tokio::task::spawn_blocking(move || -> StoreResult<Bridge> {
            let mut conn = pool.get()?;
            let row: Row = bridges::table
                .filter(bridges::as_token.eq(&token))
                .filter(bridges::deleted_at.is_null())
                .first(&mut conn)?;
            row.into_model()
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))??;
        self.by_as_token
            .lock()
            .put(bridge.as_token.clone(), bridge.clone());
        Ok(bridge)
    }

    async fn get_by_orchestrator_id(&self, orchestrator_id: &str) -> StoreResult<Bridge> {
        if let Some(cached) = self.by_orchestrator_id.lock().get(orchestrator_id).cloned() {
            return Ok(cached);
        }
        let pool = self.pool.clone();
        let oid = orchestrator_id.to_string();
        let bridge = tokio::task::spawn_blocking(move || -> StoreResult<Bridge> {
            let mut conn = pool.get()?;
            let row: Row = bridges::table
                .filter(bridges::orchestrator_id.eq(&oid))
                .filter(bridges::deleted_at.is_null())
                .first(&mut conn)?;
            row.into_model()
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))??;
        self.by_orchestrator_id
            .lock()
            .put(bridge.orchestrator_id.clone(), bridge.clone());
        Ok(bridge)
    }

    async fn get_by_id(&self, id: i64) -> StoreResult<Bridge> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<Bridge> {
            let mut conn = pool.get()?;
            let row: Row = bridges::table
                .filter(bridges::id.eq(id))
                .filter(bridges::deleted_at.is_null())
                .first(&mut conn)?;
            row.into_model()
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn get_by_owner_and_service(
        &self,
        owner_matrix_username: &str,
        service: &BridgeServiceKind,
    ) -> StoreResult<Bridge> {
        let pool = self.pool.clone();
        let owner = owner_matrix_username.to_string();
        let service_str = service.as_str().to_string();
        tokio::task::spawn_blocking(move || -> StoreResult<Bridge> {
            let mut conn = pool.get()?;
            let row: Row = bridges::table
                .filter(bridges::owner_matrix_username.eq(&owner))
                .filter(bridges::bridge_service.eq(&service_str))
                .filter(bridges::deleted_at.is_null())
                .first(&mut conn)?;
            row.into_model()
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn get(&self, lookup: BridgeLookup) -> StoreResult<Bridge> {
        match lookup {
            BridgeLookup::AsToken(t) => self.get_by_as_token(&t).await,
            BridgeLookup::Id(id) => self.get_by_id(id).await,
            BridgeLookup::OrchestratorId(oid) => self.get_by_orchestrator_id(&oid).await,
            BridgeLookup::OwnerAndService(owner, service) => {
                self.get_by_owner_and_service(&owner, &service).await
            }
        }
    }

    async fn list_by_owner(&self, owner_matrix_username: &str) -> StoreResult<Vec<Bridge>> {
        let pool = self.pool.clone();
        let owner = owner_matrix_username.to_string();
        let rows = tokio::task::spawn_blocking(move || -> StoreResult<Vec<Row>> {
            let mut conn = pool.get()?;
            let rows: Vec<Row> = bridges::table
                .filter(bridges::owner_matrix_username.eq(&owner))
                .filter(bridges::deleted_at.is_null())
                .order(bridges::id.asc())
                .load(&mut conn)?;
            Ok(rows)
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))??;
        rows.into_iter().map(Row::into_model).collect()
    }

    async fn list_all(&self) -> StoreResult<Vec<Bridge>> {
        let pool = self.pool.clone();
        let rows = tokio::task::spawn_blocking(move || -> StoreResult<Vec<Row>> {
            let mut conn = pool.get()?;
            let rows: Vec<Row> = bridges::table
                .filter(bridges::deleted_at.is_null())
                .order(bridges::id.asc())
                .load(&mut conn)?;
            Ok(rows)
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))??;
        rows.into_iter().map(Row::into_model).collect()
    }

    async fn create(&self, bridge: NewBridge) -> StoreResult<Bridge> {
        let pool = self.pool.clone();
        let now = Utc::now().to_rfc3339();
        tokio::task::spawn_blocking(move || -> StoreResult<Bridge> {
            let mut conn = pool.get()?;
            diesel::insert_into(bridges::table)
                .values(&NewRow {
                    orchestrator_id: &bridge.orchestrator_id,
                    bridge_service: bridge.bridge_service.as_str(),
                    as_token: &bridge.as_token,
                    hs_token: &bridge.hs_token,
                    ip: &bridge.ip,
                    port: bridge.port as i32,
                    owner_matrix_username: &bridge.owner_matrix_username,
                    matrix_bot_username: &bridge.matrix_bot_username,
                    live_status: "starting",
                    ready_status: "not_ready",
                    status_updated_at: now,
                })
                .execute(&mut conn)?;
            let row: Row = bridges::table
                .filter(bridges::as_token.eq(&bridge.as_token))
                .first(&mut conn)?;
            row.into_model()
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn soft_delete_cascade(&self, id: i64) -> StoreResult<()> {
        let pool = self.pool.clone();
        let now = Utc::now().to_rfc3339();
        let bridge = tokio::task::spawn_blocking(move || -> StoreResult<Bridge> {
            let mut conn = pool.get()?;
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::update(bridges::table.filter(bridges::id.eq(id)))
                    .set(bridges::deleted_at.eq(Some(now.clone())))
                    .execute(conn)?;
                diesel::delete(requests::table.filter(requests::bridge_id.eq(id))).execute(conn)?;
                diesel::delete(
                    transaction_mappings::table.filter(transaction_mappings::bridge_id.eq(id)),
                )
                .execute(conn)?;
                diesel::delete(
                    room_bridge_mappings::table.filter(room_bridge_mappings::bridge_id.eq(id)),
                )
                .execute(conn)?;
                Ok(())
            })?;
            let row: Row = bridges::table.find(id).first(conn)?;
            row.into_model()
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))??;
        self.invalidate(&bridge);
        Ok(())
    }
}
