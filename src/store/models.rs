use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Matrix homeserver this multiplexer fronts. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Homeserver {
    pub id: i64,
    pub url: String,
    /// The server-name suffix used in `@user:name`.
    pub name: String,
    pub hs_token: String,
}

/// The foreign network a bridge process speaks. Stored as free text so new
/// platforms never require a migration; `Other` covers anything the
/// orchestrator hands us that isn't one of the well-known variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeServiceKind {
    Whatsapp,
    Discord,
    Telegram,
    Signal,
    Slack,
    #[serde(untagged)]
    Other(String),
}

impl BridgeServiceKind {
    pub fn as_str(&self) -> &str {
        match self {
            BridgeServiceKind::Whatsapp => "whatsapp",
            BridgeServiceKind::Discord => "discord",
            BridgeServiceKind::Telegram => "telegram",
            BridgeServiceKind::Signal => "signal",
            BridgeServiceKind::Slack => "slack",
            BridgeServiceKind::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "whatsapp" => BridgeServiceKind::Whatsapp,
            "discord" => BridgeServiceKind::Discord,
            "telegram" => BridgeServiceKind::Telegram,
            "signal" => BridgeServiceKind::Signal,
            "slack" => BridgeServiceKind::Slack,
            other => BridgeServiceKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for BridgeServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running bridge process. Soft-deleted bridges are excluded from every
/// resolution path; `as_token` is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bridge {
    pub id: i64,
    pub orchestrator_id: String,
    pub bridge_service: BridgeServiceKind,
    pub as_token: String,
    pub hs_token: String,
    pub ip: String,
    pub port: u16,
    pub owner_matrix_username: String,
    pub matrix_bot_username: String,
    pub live_status: String,
    pub ready_status: String,
    pub status_updated_at: DateTime<Utc>,
    pub bridge_management_room_id: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Bridge {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Associates a transaction id (from a bridge's `ping`) with the bridge that
/// originated it. Upsert-only; last writer wins for a given `transaction_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMapping {
    pub transaction_id: String,
    pub bridge_as_token: String,
    pub bridge_id: i64,
}

/// Records which bridge is responsible for a Matrix room, learned from
/// observed outbound sends. Upsert-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomBridgeMapping {
    pub room_id: String,
    pub bridge_id: i64,
    pub last_seen_at: DateTime<Utc>,
}

/// Which side of the multiplexer a request arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestSource {
    Homeserver,
    Bridge,
}

impl RequestSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestSource::Homeserver => "homeserver",
            RequestSource::Bridge => "bridge",
        }
    }
}

/// Which `BridgeResolver` strategy, if any, resolved a request's bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeResolutionMethod {
    AuthToken,
    QueryUserId,
    PathUsername,
    TransactionId,
    TransactionEvents,
    RoomId,
    BodyUsername,
    OwnerUsername,
}

impl BridgeResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeResolutionMethod::AuthToken => "auth_token",
            BridgeResolutionMethod::QueryUserId => "query_user_id",
            BridgeResolutionMethod::PathUsername => "path_username",
            BridgeResolutionMethod::TransactionId => "transaction_id",
            BridgeResolutionMethod::TransactionEvents => "transaction_events",
            BridgeResolutionMethod::RoomId => "room_id",
            BridgeResolutionMethod::BodyUsername => "body_username",
            BridgeResolutionMethod::OwnerUsername => "owner_username",
        }
    }
}

/// Audit record for a single inbound request. Exactly one of these is
/// persisted per inbound HTTP call, regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: i64,
    pub inbound_at: DateTime<Utc>,
    pub outbound_at: Option<DateTime<Utc>>,
    pub source: RequestSource,
    pub bridge_id: Option<i64>,
    pub homeserver_id: Option<i64>,
    pub bridge_discovery_method: Option<BridgeResolutionMethod>,
    pub discovery_error: Option<String>,
    pub method: String,
    pub path: String,
    pub inbound_request: serde_json::Value,
    pub outbound_request: Option<serde_json::Value>,
    pub response: Option<serde_json::Value>,
    pub response_status: Option<i32>,
}

/// Fields needed to create a new audit row; `id`/`outbound_*`/`response*`
/// are filled in later via `RequestRepo::update_request`.
#[derive(Debug, Clone)]
pub struct NewRequestRecord {
    pub source: RequestSource,
    pub bridge_id: Option<i64>,
    pub homeserver_id: Option<i64>,
    pub bridge_discovery_method: Option<BridgeResolutionMethod>,
    pub discovery_error: Option<String>,
    pub method: String,
    pub path: String,
    pub inbound_request: serde_json::Value,
}

/// Partial update applied to a `RequestRecord` as a request progresses
/// through `create row -> resolve -> dispatch -> outbound -> response ->
/// update row`. Every field is optional so a single call can log just the
/// outbound leg, just the response, or both on the final update.
#[derive(Debug, Clone, Default)]
pub struct RequestUpdate {
    pub outbound_at: Option<DateTime<Utc>>,
    pub outbound_request: Option<serde_json::Value>,
    pub response: Option<serde_json::Value>,
    pub response_status: Option<i32>,
}
