//! Redacted structured event emission.
//!
//! Components report operational events through [`log_event`]; payloads are
//! scrubbed of credential-shaped values before anything reaches a log sink.
//! This is a projection layer only: nothing here is authoritative and no
//! event is ever stored by the fabric itself.

use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

/// Key fragments whose values are always scrubbed (case-insensitive).
const SENSITIVE_KEY_PARTS: &[&str] = &["secret", "key", "password", "token", "authorization"];

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| lower.contains(part))
}

/// Recursively replace values under credential-shaped keys.
pub fn redact_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if is_sensitive_key(k) {
                    out.insert(k.clone(), Value::String(REDACTED.into()));
                } else {
                    out.insert(k.clone(), redact_payload(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_payload).collect()),
        other => other.clone(),
    }
}

/// Emit a monitoring event with a redacted payload.
pub fn log_event(name: &str, payload: &Value) {
    let redacted = redact_payload(payload);
    tracing::info!(target: "taskfabric::monitor", event = name, payload = %redacted);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scrubs_sensitive_keys_at_any_depth() {
        let payload = json!({
            "task_id": "t-1",
            "api_key": "sk-live-1234",
            "nested": {
                "PASSWORD": "hunter2",
                "auth": {"Authorization": "Bearer abc"},
                "count": 3
            },
            "items": [{"client_secret": "shh", "ok": true}]
        });
        let redacted = redact_payload(&payload);
        assert_eq!(redacted["task_id"], "t-1");
        assert_eq!(redacted["api_key"], "[REDACTED]");
        assert_eq!(redacted["nested"]["PASSWORD"], "[REDACTED]");
        assert_eq!(redacted["nested"]["auth"]["Authorization"], "[REDACTED]");
        assert_eq!(redacted["nested"]["count"], 3);
        assert_eq!(redacted["items"][0]["client_secret"], "[REDACTED]");
        assert_eq!(redacted["items"][0]["ok"], true);
    }

    #[test]
    fn non_sensitive_payloads_pass_through() {
        let payload = json!({"flow": "rag.query", "records": 2});
        assert_eq!(redact_payload(&payload), payload);
    }
}
