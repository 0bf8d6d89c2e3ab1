//! Parameter redaction for the per-request audit log line.

use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

pub fn redact_params(params: Option<&Value>) -> Value {
    params.map(redact_value).unwrap_or(Value::Null)
}

fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    let item = if is_sensitive_key(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_value(item)
                    };
                    (key.clone(), item)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "api_key" | "apikey"
    ) || ["token", "secret", "password", "credential"]
        .iter()
        .any(|needle| normalized.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_sensitive_keys_at_any_depth() {
        let params = json!({
            "name": "borrow_movie",
            "arguments": {
                "borrower": "Ada",
                "api_key": "hidden",
                "nested": [{"refresh_token": "hidden"}]
            }
        });

        let redacted = redact_params(Some(&params));
        assert_eq!(redacted["name"], "borrow_movie");
        assert_eq!(redacted["arguments"]["borrower"], "Ada");
        assert_eq!(redacted["arguments"]["api_key"], REDACTED);
        assert_eq!(redacted["arguments"]["nested"][0]["refresh_token"], REDACTED);
    }

    #[test]
    fn progress_token_is_masked_too() {
        assert!(is_sensitive_key("progressToken"));
        assert!(!is_sensitive_key("title"));
    }

    #[test]
    fn missing_params_audit_as_null() {
        assert_eq!(redact_params(None), Value::Null);
    }
}
