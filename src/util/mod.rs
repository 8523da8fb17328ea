//! Depth-bounded JSON traversal shared by the resolver's content scan and
//! the identity translator's body rewrite.

use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::identity::MAX_WALK_DEPTH;

/// Walks `value` depth-first, calling `visit` on every string scalar found.
/// Bails with `BadRequest` if nesting exceeds `MAX_WALK_DEPTH`.
pub fn walk_strings(value: &Value, visit: &mut dyn FnMut(&str)) -> AppResult<()> {
    walk_strings_at(value, visit, 0)
}

fn walk_strings_at(value: &Value, visit: &mut dyn FnMut(&str), depth: usize) -> AppResult<()> {
    if depth > MAX_WALK_DEPTH {
        return Err(AppError::BadRequest("request body nesting exceeds maximum depth".into()));
    }
    match value {
        Value::String(s) => {
            visit(s);
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                walk_strings_at(item, visit, depth + 1)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for v in map.values() {
                walk_strings_at(v, visit, depth + 1)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Returns the first string anywhere in `value` for which `predicate` holds.
pub fn find_first_matching(value: &Value, predicate: impl Fn(&str) -> bool) -> AppResult<Option<String>> {
    let mut found = None;
    walk_strings(value, &mut |s| {
        if found.is_none() && predicate(s) {
            found = Some(s.to_string());
        }
    })?;
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_first_match_depth_first() {
        let body = json!({"a": {"b": "nope"}, "c": ["yes-match", "other"]});
        let found = find_first_matching(&body, |s| s.starts_with("yes")).unwrap();
        assert_eq!(found.as_deref(), Some("yes-match"));
    }

    #[test]
    fn depth_bound_enforced() {
        let mut value = json!("leaf");
        for _ in 0..(MAX_WALK_DEPTH + 5) {
            value = json!([value]);
        }
        let err = find_first_matching(&value, |_| true).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
