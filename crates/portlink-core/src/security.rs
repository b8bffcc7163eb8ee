//! Security layer: origin allow-listing and payload sanitization.
//!
//! Origin matching is exact on the normalized scheme+host+port triple. There
//! is no wildcard, no subdomain matching, and no implicit same-origin
//! fallback: an empty allow-list rejects everything (strict deny, as the
//! policy layer does for an empty allowlist).

use serde_json::{Map, Value};
use url::Url;

use crate::error::{PortLinkError, Result};

/// Wildcard target-origin marker. Never accepted for sending.
pub const WILDCARD_ORIGIN: &str = "*";

/// Opaque origin reported for non-network contexts (`file://`, sandboxed
/// frames). Never accepted.
pub const NULL_ORIGIN: &str = "null";

/// Maximum payload nesting depth. Deeper structure is truncated by the
/// sanitizer and rejected by the schema validator.
pub const MAX_PAYLOAD_DEPTH: usize = 64;

/// Normalize an origin string to its `scheme://host[:port]` ASCII form.
/// Returns `None` for the wildcard, opaque origins, or anything unparseable.
pub fn normalize_origin(origin: &str) -> Option<String> {
    if origin.is_empty() || origin == WILDCARD_ORIGIN || origin == NULL_ORIGIN {
        return None;
    }
    let url = Url::parse(origin).ok()?;
    let origin = url.origin();
    if !matches!(origin, url::Origin::Tuple(..)) {
        return None;
    }
    Some(origin.ascii_serialization())
}

/// Check an inbound origin against the allow-list.
///
/// Exact scheme+host+port match after normalization through the URL parser,
/// so `https://A.test` and `https://a.test:443` both match `https://a.test`,
/// while a scheme or port difference never does. Empty origin or empty
/// allow-list is always invalid.
pub fn validate_origin(origin: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return false;
    }
    let Some(normalized) = normalize_origin(origin) else {
        return false;
    };
    allowed
        .iter()
        .any(|a| normalize_origin(a).as_deref() == Some(normalized.as_str()))
}

/// Reject target origins that would leak messages to every listener.
///
/// Wildcard and opaque origins are configuration mistakes, not transient
/// conditions; callers surface this synchronously as a hard failure.
pub fn require_safe_target_origin(origin: &str) -> Result<String> {
    normalize_origin(origin).ok_or_else(|| {
        PortLinkError::Security(format!(
            "refusing unsafe target origin {origin:?} (wildcard, opaque, or unparseable)"
        ))
    })
}

/// Structural clone of a payload, bounded by [`MAX_PAYLOAD_DEPTH`].
///
/// Strips non-finite numbers and truncates subtrees past the depth bound to
/// `null` (fails closed instead of recursing unboundedly). Idempotent: the
/// output passes through unchanged. If the value cannot be round-tripped at
/// all, returns an empty object/array matching the input's shape so one
/// malformed payload cannot halt dispatch.
pub fn sanitize_payload(payload: &Value) -> Value {
    match serde_json::to_string(payload)
        .ok()
        .and_then(|s| serde_json::from_str::<Value>(&s).ok())
    {
        Some(round_tripped) => clone_bounded(&round_tripped, 0),
        None => empty_of_shape(payload),
    }
}

fn empty_of_shape(payload: &Value) -> Value {
    match payload {
        Value::Array(_) => Value::Array(Vec::new()),
        _ => Value::Object(Map::new()),
    }
}

fn clone_bounded(value: &Value, depth: usize) -> Value {
    if depth >= MAX_PAYLOAD_DEPTH {
        return Value::Null;
    }
    match value {
        Value::Number(n) => {
            // serde_json only builds finite floats, but a foreign Value built
            // with arbitrary-precision features may not re-serialize; keep
            // the finite check local and cheap.
            match n.as_f64() {
                Some(f) if !f.is_finite() => Value::Null,
                _ => Value::Number(n.clone()),
            }
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| clone_bounded(v, depth + 1)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), clone_bounded(v, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    fn allowed(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_origin_matches() {
        let list = allowed(&["https://a.test"]);
        assert!(validate_origin("https://a.test", &list));
        // Case normalization and default-port folding.
        assert!(validate_origin("https://A.TEST", &list));
        assert!(validate_origin("https://a.test:443", &list));
    }

    #[test]
    fn scheme_and_port_differences_rejected() {
        let list = allowed(&["https://a.test"]);
        assert!(!validate_origin("http://a.test", &list));
        assert!(!validate_origin("https://a.test:8443", &list));
        assert!(!validate_origin("https://sub.a.test", &list));
    }

    #[test]
    fn empty_sides_always_invalid() {
        assert!(!validate_origin("https://a.test", &[]));
        assert!(!validate_origin("", &allowed(&["https://a.test"])));
        assert!(!validate_origin("null", &allowed(&["https://a.test"])));
        assert!(!validate_origin("*", &allowed(&["https://a.test"])));
    }

    #[test]
    fn unsafe_target_origins_hard_fail() {
        assert!(require_safe_target_origin("*").is_err());
        assert!(require_safe_target_origin("null").is_err());
        assert!(require_safe_target_origin("").is_err());
        assert_eq!(
            require_safe_target_origin("https://A.test:443").unwrap(),
            "https://a.test"
        );
    }

    #[test]
    fn sanitize_is_idempotent() {
        let v = json!({"a": [1, 2, {"b": null}], "c": "x"});
        let once = sanitize_payload(&v);
        let twice = sanitize_payload(&once);
        assert_eq!(once, twice);
        assert_eq!(once, v);
    }

    #[test]
    fn sanitize_truncates_past_max_depth() {
        let mut v = json!("leaf");
        for _ in 0..(MAX_PAYLOAD_DEPTH + 8) {
            v = json!([v]);
        }
        let cleaned = sanitize_payload(&v);
        // Still produced a value, and re-sanitizing it changes nothing.
        assert_eq!(sanitize_payload(&cleaned), cleaned);
        let as_str = serde_json::to_string(&cleaned).unwrap();
        assert!(as_str.contains("null"));
        assert!(!as_str.contains("leaf"));
    }
}
