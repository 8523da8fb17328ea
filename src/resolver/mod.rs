//! Ordered chain of strategies that maps an inbound request to the bridge
//! that owns it. First non-null result wins; a strategy that errors
//! internally is logged and treated as a non-match rather than aborting the
//! chain.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::identity::{IdentityTranslator, MAX_WALK_DEPTH};
use crate::registry::BridgeRegistry;
use crate::services::bridge_service::BridgeServiceHandle;
use crate::store::models::{BridgeResolutionMethod, RequestSource};
use crate::store::{BridgeServiceKind, RoomBridgeRepo, SqliteRoomBridgeRepo, SqliteTransactionRepo, TransactionRepo};

#[derive(Clone)]
pub struct BridgeResolver {
    registry: BridgeRegistry,
    transactions: SqliteTransactionRepo,
    rooms: SqliteRoomBridgeRepo,
    identity: IdentityTranslator,
    transaction_id_in_path: Regex,
}

pub struct ResolveInput<'a> {
    pub source: RequestSource,
    pub headers: &'a HashMap<String, String>,
    pub path: &'a str,
    pub body: &'a Value,
    pub query: &'a HashMap<String, String>,
}

impl BridgeResolver {
    pub fn new(
        registry: BridgeRegistry,
        transactions: SqliteTransactionRepo,
        rooms: SqliteRoomBridgeRepo,
        identity: IdentityTranslator,
    ) -> Self {
        Self {
            registry,
            transactions,
            rooms,
            identity,
            transaction_id_in_path: Regex::new(r"_matrix/app/v1/transactions/(?P<txn_id>\w+)").unwrap(),
        }
    }

    pub async fn resolve(&self, input: ResolveInput<'_>) -> Result<(BridgeServiceHandle, BridgeResolutionMethod), AppError> {
        if let Some(handle) = self.try_step("auth_token", self.from_auth_token(&input)).await {
            return Ok((handle, BridgeResolutionMethod::AuthToken));
        }
        if let Some(handle) = self.try_step("query_user_id", self.from_query_user_id(&input)).await {
            return Ok((handle, BridgeResolutionMethod::QueryUserId));
        }
        if let Some(handle) = self.try_step("path_username", self.from_path_username(&input)).await {
            return Ok((handle, BridgeResolutionMethod::PathUsername));
        }
        if let Some(handle) = self.try_step("transaction_id", self.from_transaction_id(&input)).await {
            return Ok((handle, BridgeResolutionMethod::TransactionId));
        }
        if let Some(handle) = self.try_step("transaction_events", self.from_transaction_events(&input)).await {
            return Ok((handle, BridgeResolutionMethod::TransactionEvents));
        }
        if let Some(handle) = self.try_step("room_id", self.from_room_id(&input)).await {
            return Ok((handle, BridgeResolutionMethod::RoomId));
        }
        if let Some(handle) = self.try_step("body_username", self.from_body_username(&input)).await {
            return Ok((handle, BridgeResolutionMethod::BodyUsername));
        }
        if let Some(handle) = self.try_step("owner_username", self.from_owner_username(&input)).await {
            return Ok((handle, BridgeResolutionMethod::OwnerUsername));
        }

        Err(AppError::BridgeNotFound(format!(
            "could not identify bridge for {:?} request to {}",
            input.source, input.path
        )))
    }

    /// Runs one strategy future, logging (and swallowing) any internal error
    /// so a single misbehaving strategy never aborts the chain.
    async fn try_step(
        &self,
        name: &str,
        fut: impl std::future::Future<Output = Result<Option<BridgeServiceHandle>, AppError>>,
    ) -> Option<BridgeServiceHandle> {
        match fut.await {
            Ok(Some(handle)) => {
                debug!(resolver = name, "bridge resolved");
                Some(handle)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(resolver = name, error = %e, "resolver strategy failed, trying next");
                None
            }
        }
    }

    async fn from_auth_token(&self, input: &ResolveInput<'_>) -> Result<Option<BridgeServiceHandle>, AppError> {
        if input.source != RequestSource::Bridge {
            return Ok(None);
        }
        let Some(token) = extract_bearer_token(input.headers) else {
            return Ok(None);
        };
        match self.registry.get_by_as_token(&token).await {
            Ok(handle) => Ok(Some(handle)),
            Err(AppError::BridgeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn from_query_user_id(&self, input: &ResolveInput<'_>) -> Result<Option<BridgeServiceHandle>, AppError> {
        let Some(user_id) = input.query.get("user_id") else {
            return Ok(None);
        };
        let Some(decoded) = self.identity.find(user_id) else {
            return Ok(None);
        };
        match self.registry.get_by_orchestrator_id(&decoded.orchestrator_id).await {
            Ok(handle) => Ok(Some(handle)),
            Err(AppError::BridgeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn from_path_username(&self, input: &ResolveInput<'_>) -> Result<Option<BridgeServiceHandle>, AppError> {
        if input.source != RequestSource::Homeserver {
            return Ok(None);
        }
        let Some(decoded) = self.identity.find(input.path) else {
            return Ok(None);
        };
        match self.registry.get_by_orchestrator_id(&decoded.orchestrator_id).await {
            Ok(handle) => Ok(Some(handle)),
            Err(AppError::BridgeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn from_transaction_id(&self, input: &ResolveInput<'_>) -> Result<Option<BridgeServiceHandle>, AppError> {
        if input.source != RequestSource::Homeserver {
            return Ok(None);
        }
        let from_path = self
            .transaction_id_in_path
            .captures(input.path)
            .and_then(|c| c.name("txn_id"))
            .map(|m| m.as_str().to_string());
        let from_body = input.body.get("transaction_id").and_then(Value::as_str).map(str::to_string);
        let Some(txn_id) = from_path.or(from_body) else {
            return Ok(None);
        };

        let mapping = match self.transactions.get_by_transaction(&txn_id).await {
            Ok(mapping) => mapping,
            Err(_) => return Ok(None),
        };
        match self.registry.get_by_as_token(&mapping.bridge_as_token).await {
            Ok(handle) => Ok(Some(handle)),
            Err(AppError::BridgeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn from_transaction_events(&self, input: &ResolveInput<'_>) -> Result<Option<BridgeServiceHandle>, AppError> {
        if input.source != RequestSource::Homeserver {
            return Ok(None);
        }
        if !input.path.starts_with("_matrix/app/v1/transactions/") {
            return Ok(None);
        }
        let Some(events) = input.body.get("events").and_then(Value::as_array) else {
            return Ok(None);
        };
        if events.is_empty() {
            return Ok(None);
        }

        let namespace_prefix = format!("@{}", self.identity.namespace());
        let mut usernames = Vec::new();
        for event in events {
            extract_bridge_usernames_from_event(event, &namespace_prefix, &mut usernames);
        }
        let Some(username) = usernames.into_iter().next() else {
            return Ok(None);
        };
        let Some(decoded) = self.identity.find(&username) else {
            return Ok(None);
        };
        match self.registry.get_by_orchestrator_id(&decoded.orchestrator_id).await {
            Ok(handle) => Ok(Some(handle)),
            Err(AppError::BridgeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn from_room_id(&self, input: &ResolveInput<'_>) -> Result<Option<BridgeServiceHandle>, AppError> {
        if input.source != RequestSource::Homeserver {
            return Ok(None);
        }
        if !input.path.starts_with("_matrix/app/v1/transactions/") {
            return Ok(None);
        }
        let Some(events) = input.body.get("events").and_then(Value::as_array) else {
            return Ok(None);
        };

        let mut room_ids = Vec::new();
        for event in events {
            if let Some(room_id) = event.get("room_id").and_then(Value::as_str) {
                if !room_ids.contains(&room_id.to_string()) {
                    room_ids.push(room_id.to_string());
                }
            }
        }

        for room_id in room_ids {
            let bridge_id = match self.rooms.get_bridge_id_by_room(&room_id).await {
                Ok(id) => id,
                Err(_) => continue,
            };
            match self.registry.get_by_id(bridge_id).await {
                Ok(handle) => return Ok(Some(handle)),
                Err(AppError::BridgeNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn from_body_username(&self, input: &ResolveInput<'_>) -> Result<Option<BridgeServiceHandle>, AppError> {
        if input.source != RequestSource::Homeserver {
            return Ok(None);
        }
        let namespace_prefix = format!("@{}", self.identity.namespace());
        let found = crate::util::find_first_matching(input.body, |s| s.starts_with(&namespace_prefix))?;
        let Some(username) = found else {
            return Ok(None);
        };
        let Some(decoded) = self.identity.find(&username) else {
            return Ok(None);
        };
        match self.registry.get_by_orchestrator_id(&decoded.orchestrator_id).await {
            Ok(handle) => Ok(Some(handle)),
            Err(AppError::BridgeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn from_owner_username(&self, input: &ResolveInput<'_>) -> Result<Option<BridgeServiceHandle>, AppError> {
        if input.source != RequestSource::Homeserver {
            return Ok(None);
        }
        let namespace_prefix = format!("@{}", self.identity.namespace());
        let owner = crate::util::find_first_matching(input.body, |s| {
            s.starts_with('@') && !s.starts_with(&namespace_prefix) && s.contains(':')
        })?;
        let bridge_username = crate::util::find_first_matching(input.body, |s| s.starts_with(&namespace_prefix))?;
        let (Some(owner), Some(bridge_username)) = (owner, bridge_username) else {
            return Ok(None);
        };
        let Some(decoded) = self.identity.find(&bridge_username) else {
            return Ok(None);
        };
        let service = BridgeServiceKind::parse(&decoded.bridge_type);
        match self.registry.get_by_owner_and_service(&owner, &service).await {
            Ok(handle) => Ok(Some(handle)),
            Err(AppError::BridgeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn extract_bearer_token(headers: &HashMap<String, String>) -> Option<String> {
    let auth = headers.get("authorization").or_else(|| headers.get("Authorization"))?;
    Some(auth.strip_prefix("Bearer ").unwrap_or(auth).trim().to_string())
}

const DIRECT_USERNAME_FIELDS: &[&str] = &["user_id", "sender", "creator", "target", "kick", "ban"];

/// Mirrors the original resolver's recursive scan of an event's `sender`,
/// `state_key`, `user_id`, `content.*` (incl. `formatted_body` matrix.to
/// mentions and `m.relates_to.m.in_reply_to.sender`), `invite_room_state[]`,
/// `unsigned.invite_room_state[]`, and `unsigned.prev_content.*`.
fn extract_bridge_usernames_from_event(event: &Value, namespace_prefix: &str, out: &mut Vec<String>) {
    push_if_prefixed(event.get("sender"), namespace_prefix, out);
    push_if_prefixed(event.get("state_key"), namespace_prefix, out);
    push_if_prefixed(event.get("user_id"), namespace_prefix, out);

    if let Some(content) = event.get("content") {
        extract_usernames_from_content(content, namespace_prefix, 0, out);
    }

    if let Some(invite_room_state) = event.get("invite_room_state").and_then(Value::as_array) {
        for state_event in invite_room_state {
            push_if_prefixed(state_event.get("state_key"), namespace_prefix, out);
            push_if_prefixed(state_event.get("sender"), namespace_prefix, out);
        }
    }

    if let Some(unsigned) = event.get("unsigned") {
        if let Some(invite_room_state) = unsigned.get("invite_room_state").and_then(Value::as_array) {
            for state_event in invite_room_state {
                push_if_prefixed(state_event.get("state_key"), namespace_prefix, out);
            }
        }
        if let Some(prev_content) = unsigned.get("prev_content") {
            extract_usernames_from_content(prev_content, namespace_prefix, 0, out);
        }
    }
}

fn extract_usernames_from_content(content: &Value, namespace_prefix: &str, depth: usize, out: &mut Vec<String>) {
    if depth > MAX_WALK_DEPTH {
        return;
    }
    let Some(map) = content.as_object() else {
        return;
    };

    for field in DIRECT_USERNAME_FIELDS {
        push_if_prefixed(map.get(*field), namespace_prefix, out);
    }

    if let Some(formatted_body) = map.get("formatted_body").and_then(Value::as_str) {
        for mention in find_matrix_to_mentions(formatted_body, namespace_prefix) {
            out.push(mention);
        }
    }

    if let Some(relates_to) = map.get("m.relates_to") {
        if let Some(reply_sender) = relates_to
            .get("m.in_reply_to")
            .and_then(|r| r.get("sender"))
            .and_then(Value::as_str)
        {
            if reply_sender.starts_with(namespace_prefix) {
                out.push(reply_sender.to_string());
            }
        }
    }

    for (key, value) in map {
        if DIRECT_USERNAME_FIELDS.contains(&key.as_str()) {
            continue;
        }
        match value {
            Value::Object(_) => extract_usernames_from_content(value, namespace_prefix, depth + 1, out),
            Value::Array(items) => {
                for item in items {
                    if item.is_object() {
                        extract_usernames_from_content(item, namespace_prefix, depth + 1, out);
                    } else if let Some(s) = item.as_str() {
                        if s.starts_with(namespace_prefix) {
                            out.push(s.to_string());
                        }
                    }
                }
            }
            Value::String(s) if s.starts_with(namespace_prefix) => out.push(s.clone()),
            _ => {}
        }
    }
}

fn push_if_prefixed(value: Option<&Value>, prefix: &str, out: &mut Vec<String>) {
    if let Some(s) = value.and_then(Value::as_str) {
        if s.starts_with(prefix) {
            out.push(s.to_string());
        }
    }
}

fn find_matrix_to_mentions(formatted_body: &str, namespace_prefix: &str) -> Vec<String> {
    let pattern = format!(r#"https://matrix\.to/#/({}[^"'>]+)"#, regex::escape(namespace_prefix));
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    re.captures_iter(formatted_body)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}
