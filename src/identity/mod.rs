//! Bidirectional translation between the homeserver-visible, namespaced form
//! of a bridge user id and the plain form a bridge process expects.
//!
//! Encoded: `@<namespace><bridge_type>_<orchestrator_id>__<local>:<server>`
//! Plain:   `@<local>:<server>`

use regex::Regex;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::store::Bridge;

/// Direction of a username rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Plain (bridge-visible) -> encoded (homeserver-visible).
    ToHomeserver,
    /// Encoded (homeserver-visible) -> plain (bridge-visible).
    ToBridge,
}

/// The four named groups captured out of an encoded username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedUsername {
    pub bridge_type: String,
    pub orchestrator_id: String,
    pub local: String,
    pub homeserver: String,
}

/// Maximum nesting depth walked by `rewrite_usernames_in_body` and the
/// resolver's transaction-event scan. Bodies deeper than this are rejected
/// rather than walked, to bound stack growth on adversarial input.
pub const MAX_WALK_DEPTH: usize = 64;

#[derive(Clone)]
pub struct IdentityTranslator {
    namespace: String,
    pattern: Regex,
}

impl IdentityTranslator {
    pub fn new(namespace: &str) -> AppResult<Self> {
        let escaped = regex::escape(namespace);
        let pattern = Regex::new(&format!(
            r"@{escaped}(?P<bridge_type>[^_]+)_(?P<bridge_id>[^_]+)__(?P<bridge_username>[^:]+):(?P<homeserver>[^\s/]+)"
        ))
        .map_err(|e| AppError::Internal(format!("invalid namespace for username regex: {e}")))?;
        Ok(Self {
            namespace: namespace.to_string(),
            pattern,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Finds and decodes the first encoded username inside `text`, wherever
    /// it occurs (path, full matrix.to link, etc.). Returns `None` if no
    /// encoded username is present.
    pub fn find(&self, text: &str) -> Option<DecodedUsername> {
        let caps = self.pattern.captures(text)?;
        Some(DecodedUsername {
            bridge_type: caps.name("bridge_type")?.as_str().to_string(),
            orchestrator_id: caps.name("bridge_id")?.as_str().to_string(),
            local: caps.name("bridge_username")?.as_str().to_string(),
            homeserver: caps.name("homeserver")?.as_str().to_string(),
        })
    }

    /// True if `text` contains at least one encoded username.
    pub fn contains_encoded(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    pub fn encode(&self, bridge_type: &str, orchestrator_id: &str, local: &str, homeserver: &str) -> String {
        format!(
            "@{}{}_{}__{}:{}",
            self.namespace, bridge_type, orchestrator_id, local, homeserver
        )
    }

    /// Same encoding as [`Self::encode`] but without the leading `@` or
    /// trailing `:homeserver` - the form Matrix's `/register` endpoint wants
    /// in its `username` field (a localpart, not a full user id).
    pub fn encode_localpart(&self, bridge_type: &str, orchestrator_id: &str, local: &str) -> String {
        format!("{}{}_{}__{}", self.namespace, bridge_type, orchestrator_id, local)
    }

    /// Public entry point for rewriting a single scalar string (a path
    /// segment, a matrix.to link) in one direction. Unlike
    /// [`Self::rewrite_usernames_in_body`] this does not walk nested
    /// structures; callers with a single string (as opposed to a JSON body)
    /// use this directly.
    pub fn rewrite_text(&self, s: &str, to: Direction, bridge: &Bridge, hs_name: &str) -> String {
        self.rewrite_string(s, to, bridge, hs_name)
    }

    fn decode_exact(&self, username: &str) -> Option<DecodedUsername> {
        let caps = self.pattern.captures(username)?;
        if caps.get(0)?.as_str() != username {
            return None;
        }
        Some(DecodedUsername {
            bridge_type: caps.name("bridge_type")?.as_str().to_string(),
            orchestrator_id: caps.name("bridge_id")?.as_str().to_string(),
            local: caps.name("bridge_username")?.as_str().to_string(),
            homeserver: caps.name("homeserver")?.as_str().to_string(),
        })
    }

    fn plain_local(&self, username: &str) -> AppResult<(&str, &str)> {
        let rest = username
            .strip_prefix('@')
            .ok_or_else(|| AppError::BadRequest(format!("not a matrix user id: {username}")))?;
        rest.split_once(':')
            .ok_or_else(|| AppError::BadRequest(format!("not a matrix user id: {username}")))
    }

    /// Rewrites a single username between its plain and encoded forms for
    /// the given bridge/homeserver context.
    ///
    /// `translate_username(translate_username(u, ToHomeserver), ToBridge) == u`
    /// for every valid plain `u`.
    pub fn translate_username(&self, u: &str, to: Direction, bridge: &Bridge, hs_name: &str) -> AppResult<String> {
        match to {
            Direction::ToHomeserver => {
                let (local, _server) = self.plain_local(u)?;
                Ok(self.encode(bridge.bridge_service.as_str(), &bridge.orchestrator_id, local, hs_name))
            }
            Direction::ToBridge => {
                let decoded = self
                    .decode_exact(u)
                    .ok_or_else(|| AppError::BadRequest(format!("not an encoded username: {u}")))?;
                Ok(format!("@{}:{}", decoded.local, decoded.homeserver))
            }
        }
    }

    /// Rewrites every matching username string found anywhere inside `body`,
    /// recursively. Preserves JSON shape: same keys, same array lengths,
    /// non-string scalars untouched. Depth-bounded to `MAX_WALK_DEPTH`.
    pub fn rewrite_usernames_in_body(&self, body: &Value, to: Direction, bridge: &Bridge, hs_name: &str) -> AppResult<Value> {
        self.walk(body, to, bridge, hs_name, 0)
    }

    fn walk(&self, value: &Value, to: Direction, bridge: &Bridge, hs_name: &str, depth: usize) -> AppResult<Value> {
        if depth > MAX_WALK_DEPTH {
            return Err(AppError::BadRequest("request body nesting exceeds maximum depth".into()));
        }
        match value {
            Value::String(s) => Ok(Value::String(self.rewrite_string(s, to, bridge, hs_name))),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.walk(item, to, bridge, hs_name, depth + 1)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.walk(v, to, bridge, hs_name, depth + 1)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Best-effort rewrite of a single scalar string: only strings that look
    /// like the relevant form (plain `@local:server` or an embedded encoded
    /// username) are touched; anything else passes through unchanged.
    fn rewrite_string(&self, s: &str, to: Direction, bridge: &Bridge, hs_name: &str) -> String {
        match to {
            Direction::ToHomeserver => {
                if s.starts_with('@') && !self.contains_encoded(s) {
                    if let Ok((local, server)) = self.plain_local(s) {
                        if server == hs_name {
                            return self.encode(bridge.bridge_service.as_str(), &bridge.orchestrator_id, local, hs_name);
                        }
                    }
                }
                s.to_string()
            }
            Direction::ToBridge => {
                if let Some(decoded) = self.find(s) {
                    let encoded_full = self.encode(&decoded.bridge_type, &decoded.orchestrator_id, &decoded.local, &decoded.homeserver);
                    if s == encoded_full {
                        return format!("@{}:{}", decoded.local, decoded.homeserver);
                    }
                    let plain = format!("@{}:{}", decoded.local, decoded.homeserver);
                    return s.replacen(&encoded_full, &plain, 1);
                }
                s.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::BridgeServiceKind;
    use chrono::Utc;

    fn test_bridge() -> Bridge {
        Bridge {
            id: 7,
            orchestrator_id: "7".into(),
            bridge_service: BridgeServiceKind::Whatsapp,
            as_token: "as-abc".into(),
            hs_token: "hs-abc".into(),
            ip: "10.0.0.1".into(),
            port: 8080,
            owner_matrix_username: "@alice:example.org".into(),
            matrix_bot_username: "whatsappbot".into(),
            live_status: "running".into(),
            ready_status: "ready".into(),
            status_updated_at: Utc::now(),
            bridge_management_room_id: None,
            deleted_at: None,
        }
    }

    #[test]
    fn round_trip_identity() {
        let t = IdentityTranslator::new("_bridge_manager__").unwrap();
        let bridge = test_bridge();
        let plain = "@alice:example.org";
        let encoded = t.translate_username(plain, Direction::ToHomeserver, &bridge, "example.org").unwrap();
        assert_eq!(encoded, "@_bridge_manager__whatsapp_7__alice:example.org");
        let back = t.translate_username(&encoded, Direction::ToBridge, &bridge, "example.org").unwrap();
        assert_eq!(back, plain);
    }

    #[test]
    fn find_decodes_embedded_username() {
        let t = IdentityTranslator::new("_bridge_manager__").unwrap();
        let decoded = t.find("https://matrix.to/#/@_bridge_manager__whatsapp_7__alice:example.org").unwrap();
        assert_eq!(decoded.bridge_type, "whatsapp");
        assert_eq!(decoded.orchestrator_id, "7");
        assert_eq!(decoded.local, "alice");
        assert_eq!(decoded.homeserver, "example.org");
    }

    #[test]
    fn rewrite_preserves_shape() {
        let t = IdentityTranslator::new("_bridge_manager__").unwrap();
        let bridge = test_bridge();
        let body = serde_json::json!({
            "sender": "@_bridge_manager__whatsapp_7__alice:example.org",
            "count": 3,
            "nested": { "list": ["a", "@_bridge_manager__whatsapp_7__alice:example.org", null] }
        });
        let rewritten = t.rewrite_usernames_in_body(&body, Direction::ToBridge, &bridge, "example.org").unwrap();
        assert_eq!(rewritten["sender"], "@alice:example.org");
        assert_eq!(rewritten["count"], 3);
        assert_eq!(rewritten["nested"]["list"].as_array().unwrap().len(), 3);
        assert_eq!(rewritten["nested"]["list"][1], "@alice:example.org");
        assert!(rewritten["nested"]["list"][2].is_null());
    }

    #[test]
    fn depth_bound_rejects_deep_nesting() {
        let t = IdentityTranslator::new("_bridge_manager__").unwrap();
        let bridge = test_bridge();
        let mut value = Value::String("leaf".into());
        for _ in 0..(MAX_WALK_DEPTH + 10) {
            value = Value::Array(vec![value]);
        }
        let err = t.rewrite_usernames_in_body(&value, Direction::ToBridge, &bridge, "example.org").unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
