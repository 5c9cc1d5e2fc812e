use serde_json::{Map, Value};

/// Key-naming convention for request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStyle {
    /// `snapshot_id`: canonical.
    Snake,
    /// `snapshotId`
    Camel,
}

impl KeyStyle {
    pub fn alternate(self) -> Self {
        match self {
            KeyStyle::Snake => KeyStyle::Camel,
            KeyStyle::Camel => KeyStyle::Snake,
        }
    }

    pub fn apply(self, key: &str) -> String {
        match self {
            KeyStyle::Snake => to_snake_case(key),
            KeyStyle::Camel => to_camel_case(key),
        }
    }

    /// Whether `key` is already written in this style. Single-word keys match
    /// both styles.
    pub fn matches(self, key: &str) -> bool {
        match self {
            KeyStyle::Snake => !key.chars().any(|c| c.is_ascii_uppercase() || c == '-'),
            KeyStyle::Camel => !key.contains(['_', '-']),
        }
    }
}

/// Request parameters, keyed in snake_case unless restyled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(to_snake_case(key), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Copy with top-level keys rewritten in `style`. Values are untouched.
    pub fn restyled(&self, style: KeyStyle) -> Self {
        Self(
            self.0
                .iter()
                .map(|(k, v)| (style.apply(k), v.clone()))
                .collect(),
        )
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

pub fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower_or_digit = false;
    for c in key.chars() {
        if c == '-' || c == ' ' {
            out.push('_');
            prev_lower_or_digit = false;
        } else if c.is_ascii_uppercase() {
            if prev_lower_or_digit {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower_or_digit = false;
        } else {
            out.push(c);
            prev_lower_or_digit = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

pub fn to_camel_case(key: &str) -> String {
    let snake = to_snake_case(key);
    let mut out = String::with_capacity(snake.len());
    let mut upper_next = false;
    for c in snake.chars() {
        if c == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Recursively rewrites every object key to snake_case so responses mixing
/// `power-status`, `powerStatus` and `power_status` decode into one schema.
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (to_snake_case(&k), normalize_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn case_conversions() {
        assert_eq!(to_snake_case("snapshotId"), "snapshot_id");
        assert_eq!(to_snake_case("power-status"), "power_status");
        assert_eq!(to_snake_case("main_ip"), "main_ip");
        assert_eq!(to_snake_case("v6MainIp"), "v6_main_ip");
        assert_eq!(to_camel_case("snapshot_id"), "snapshotId");
        assert_eq!(to_camel_case("power-status"), "powerStatus");
        assert_eq!(to_camel_case("label"), "label");
    }

    #[test]
    fn key_style_matching() {
        assert!(KeyStyle::Snake.matches("snapshot_id"));
        assert!(!KeyStyle::Snake.matches("snapshotId"));
        assert!(KeyStyle::Camel.matches("snapshotId"));
        assert!(!KeyStyle::Camel.matches("snapshot_id"));
        assert!(KeyStyle::Snake.matches("label"));
        assert!(KeyStyle::Camel.matches("label"));
    }

    #[test]
    fn restyle_only_touches_keys() {
        let p = Params::new()
            .with("snapshot_id", "snap_1")
            .with("label", "my_box");
        let camel = p.restyled(KeyStyle::Camel);
        assert_eq!(camel.get("snapshotId"), Some(&json!("snap_1")));
        assert_eq!(camel.get("label"), Some(&json!("my_box")));
        assert_eq!(camel.restyled(KeyStyle::Snake), p);
    }

    #[test]
    fn normalize_nested_keys() {
        let v = normalize_keys(json!({
            "instance": {"powerStatus": "running", "main-ip": "1.2.3.4"},
            "items": [{"dateCreated": "x"}]
        }));
        assert_eq!(v["instance"]["power_status"], "running");
        assert_eq!(v["instance"]["main_ip"], "1.2.3.4");
        assert_eq!(v["items"][0]["date_created"], "x");
    }
}
