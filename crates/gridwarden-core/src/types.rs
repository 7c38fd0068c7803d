//! Common types used throughout Gridwarden

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Tool parameters: a plain key/value map, never positional
pub type Params = serde_json::Map<String, Value>;

/// UTC timestamp
pub type Timestamp = DateTime<Utc>;

/// Current UTC time
pub fn now() -> Timestamp {
    Utc::now()
}

/// Stable cache key for a tool invocation.
///
/// `serde_json::Map` keeps keys sorted, so two parameter maps with the same
/// content always serialize identically regardless of insertion order.
pub fn invocation_key(tool: &str, params: &Params) -> String {
    let args = serde_json::to_string(params).unwrap_or_default();
    format!("{}:{}", tool, args)
}

/// Truncate to at most `max` characters, marking the cut
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max).collect();
    format!("{}…[truncated]", kept)
}

/// Read a string parameter
pub fn param_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Read a non-negative integer parameter, accepting numeric strings
pub fn param_u32(params: &Params, key: &str) -> Option<u32> {
    match params.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read a boolean flag, defaulting to false
pub fn param_flag(params: &Params, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Build a parameter map from a JSON object literal (non-objects give an empty map)
pub fn params_from(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

/// Normalize a `values` parameter into rows: a matrix stays as is, a flat
/// list becomes a single column, a scalar becomes one cell
pub fn values_matrix(values: &Value) -> Vec<Vec<Value>> {
    match values {
        Value::Array(rows) if !rows.is_empty() && rows.iter().all(Value::is_array) => rows
            .iter()
            .filter_map(|r| r.as_array().cloned())
            .collect(),
        Value::Array(items) => items.iter().map(|v| vec![v.clone()]).collect(),
        scalar => vec![vec![scalar.clone()]],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invocation_key_ignores_insertion_order() {
        let mut a = Params::new();
        a.insert("sheet".into(), json!("Sheet1"));
        a.insert("range".into(), json!("A1:D10"));

        let mut b = Params::new();
        b.insert("range".into(), json!("A1:D10"));
        b.insert("sheet".into(), json!("Sheet1"));

        assert_eq!(invocation_key("read_range", &a), invocation_key("read_range", &b));
        assert_ne!(invocation_key("read_range", &a), invocation_key("clear_range", &a));
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate_chars("short", 10), "short");
        let cut = truncate_chars("abcdefghij", 4);
        assert!(cut.starts_with("abcd"));
        assert!(cut.ends_with("[truncated]"));
    }

    #[test]
    fn numeric_strings_are_accepted_as_counts() {
        let params = params_from(json!({"count": "12", "start": 3, "bad": -1}));
        assert_eq!(param_u32(&params, "count"), Some(12));
        assert_eq!(param_u32(&params, "start"), Some(3));
        assert_eq!(param_u32(&params, "bad"), None);
    }

    #[test]
    fn flat_lists_become_a_column() {
        assert_eq!(values_matrix(&json!([1, 2])), vec![vec![json!(1)], vec![json!(2)]]);
        assert_eq!(values_matrix(&json!([[1, 2]])), vec![vec![json!(1), json!(2)]]);
        assert_eq!(values_matrix(&json!("x")), vec![vec![json!("x")]]);
    }
}
