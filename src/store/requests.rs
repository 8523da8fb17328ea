use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;

use super::error::{StoreError, StoreResult};
use super::models::{BridgeResolutionMethod, NewRequestRecord, RequestRecord, RequestSource, RequestUpdate};
use super::schema::requests;
use super::SqlitePool;

#[async_trait]
pub trait RequestRepo: Send + Sync {
    async fn create_request(&self, new: NewRequestRecord) -> StoreResult<RequestRecord>;
    async fn update_request(&self, id: i64, update: RequestUpdate) -> StoreResult<()>;
}

#[derive(Queryable, Identifiable)]
#[diesel(table_name = requests)]
struct Row {
    id: i64,
    inbound_at: String,
    outbound_at: Option<String>,
    source: String,
    bridge_id: Option<i64>,
    homeserver_id: Option<i64>,
    bridge_discovery_method: Option<String>,
    discovery_error: Option<String>,
    method: String,
    path: String,
    inbound_request: String,
    outbound_request: Option<String>,
    response: Option<String>,
    response_status: Option<i32>,
}

impl Row {
    fn into_model(self) -> StoreResult<RequestRecord> {
        Ok(RequestRecord {
            id: self.id,
            inbound_at: parse_ts(&self.inbound_at)?,
            outbound_at: self.outbound_at.as_deref().map(parse_ts).transpose()?,
            source: parse_source(&self.source)?,
            bridge_id: self.bridge_id,
            homeserver_id: self.homeserver_id,
            bridge_discovery_method: self
                .bridge_discovery_method
                .as_deref()
                .map(parse_method),
            discovery_error: self.discovery_error,
            method: self.method,
            path: self.path,
            inbound_request: parse_json(&self.inbound_request),
            outbound_request: self.outbound_request.as_deref().map(parse_json),
            response: self.response.as_deref().map(parse_json),
            response_status: self.response_status,
        })
    }
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Storage(format!("invalid timestamp '{s}': {e}")))
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
}

fn parse_source(s: &str) -> StoreResult<RequestSource> {
    match s {
        "homeserver" => Ok(RequestSource::Homeserver),
        "bridge" => Ok(RequestSource::Bridge),
        other => Err(StoreError::Storage(format!("unknown request source '{other}'"))),
    }
}

fn parse_method(s: &str) -> BridgeResolutionMethod {
    match s {
        "auth_token" => BridgeResolutionMethod::AuthToken,
        "query_user_id" => BridgeResolutionMethod::QueryUserId,
        "path_username" => BridgeResolutionMethod::PathUsername,
        "transaction_id" => BridgeResolutionMethod::TransactionId,
        "transaction_events" => BridgeResolutionMethod::TransactionEvents,
        "room_id" => BridgeResolutionMethod::RoomId,
        "body_username" => BridgeResolutionMethod::BodyUsername,
        _ => BridgeResolutionMethod::OwnerUsername,
    }
}

#[derive(Clone)]
pub struct SqliteRequestRepo {
    pool: SqlitePool,
}

impl SqliteRequestRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestRepo for SqliteRequestRepo {
    async fn create_request(&self, new: NewRequestRecord) -> StoreResult<RequestRecord> {
        let pool = self.pool.clone();
        let now = Utc::now().to_rfc3339();
        let inbound_json = serde_json::to_string(&new.inbound_request)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let method_str = new.bridge_discovery_method.map(|m| m.as_str().to_string());
        tokio::task::spawn_blocking(move || -> StoreResult<RequestRecord> {
            let mut conn = pool.get()?;
            diesel::insert_into(requests::table)
                .values((
                    requests::inbound_at.eq(&now),
                    requests::source.eq(new.source.as_str()),
                    requests::bridge_id.eq(new.bridge_id),
                    requests::homeserver_id.eq(new.homeserver_id),
                    requests::bridge_discovery_method.eq(&method_str),
                    requests::discovery_error.eq(&new.discovery_error),
                    requests::method.eq(&new.method),
                    requests::path.eq(&new.path),
                    requests::inbound_request.eq(&inbound_json),
                ))
                .execute(&mut conn)?;
            let id: i64 = diesel::select(diesel::dsl::sql::<diesel::sql_types::BigInt>(
                "last_insert_rowid()",
            ))
            .get_result(&mut conn)?;
            let row: Row = requests::table.find(id).first(&mut conn)?;
            row.into_model()
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn update_request(&self, id: i64, update: RequestUpdate) -> StoreResult<()> {
        let pool = self.pool.clone();
        let outbound_at = update.outbound_at.map(|dt| dt.to_rfc3339());
        let outbound_request = update
            .outbound_request
            .map(|v| serde_json::to_string(&v).unwrap_or_default());
        let response = update
            .response
            .map(|v| serde_json::to_string(&v).unwrap_or_default());
        let response_status = update.response_status;
        // Each field is applied with its own statement so a partial update
        // (e.g. logging only the outbound leg) never clobbers columns a
        // different call already populated.
        tokio::task::spawn_blocking(move || -> StoreResult<()> {
            let mut conn = pool.get()?;
            if let Some(outbound_at) = outbound_at {
                diesel::update(requests::table.filter(requests::id.eq(id)))
                    .set(requests::outbound_at.eq(outbound_at))
                    .execute(&mut conn)?;
            }
            if let Some(outbound_request) = outbound_request {
                diesel::update(requests::table.filter(requests::id.eq(id)))
                    .set(requests::outbound_request.eq(outbound_request))
                    .execute(&mut conn)?;
            }
            if let Some(response) = response {
                diesel::update(requests::table.filter(requests::id.eq(id)))
                    .set(requests::response.eq(response))
                    .execute(&mut conn)?;
            }
            if let Some(response_status) = response_status {
                diesel::update(requests::table.filter(requests::id.eq(id)))
                    .set(requests::response_status.eq(response_status))
                    .execute(&mut conn)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }
}
