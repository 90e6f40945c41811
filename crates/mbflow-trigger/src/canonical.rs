//! Canonical JSON: keys sorted lexicographically at every depth, no
//! insignificant whitespace. Webhook signatures hash this form so clients
//! can reproduce it from the parsed payload.

use std::collections::BTreeMap;

use serde_json::Value;

pub fn to_canonical_json(value: &Value) -> String {
  match value {
    Value::Null => "null".to_string(),
    Value::Bool(b) => b.to_string(),
    Value::Number(n) => n.to_string(),
    Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
    Value::Array(items) => {
      let rendered: Vec<String> = items.iter().map(to_canonical_json).collect();
      format!("[{}]", rendered.join(","))
    }
    Value::Object(map) => {
      let sorted: BTreeMap<&String, &Value> = map.iter().collect();
      let rendered: Vec<String> = sorted
        .into_iter()
        .map(|(key, value)| {
          format!(
            "{}:{}",
            serde_json::to_string(key).unwrap_or_default(),
            to_canonical_json(value)
          )
        })
        .collect();
      format!("{{{}}}", rendered.join(","))
    }
  }
}
