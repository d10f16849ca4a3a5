//! Cluster and host environment maps
//!
//! Env entries are written as `KEY=VALUE`. A value containing `;` becomes a
//! list so templates can iterate over it.

use serde_json::{Map, Value};

/// Flattened key/value map handed to the template renderer.
pub type EnvMap = Map<String, Value>;

const LIST_SEPARATOR: char = ';';

/// Parse `KEY=VALUE` entries. Entries without `=` are ignored; later
/// entries win over earlier ones with the same key.
pub fn parse_env(entries: &[String]) -> EnvMap {
    let mut env = EnvMap::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            tracing::debug!(entry = %entry, "skipping env entry without '='");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        env.insert(key.to_string(), parse_value(value));
    }
    env
}

fn parse_value(value: &str) -> Value {
    if value.contains(LIST_SEPARATOR) {
        Value::Array(
            value
                .split(LIST_SEPARATOR)
                .filter(|v| !v.is_empty())
                .map(|v| Value::String(v.to_string()))
                .collect(),
        )
    } else {
        Value::String(value.to_string())
    }
}

/// Host entries win on key collision.
pub fn merge_env(cluster: &EnvMap, host: &EnvMap) -> EnvMap {
    let mut merged = cluster.clone();
    for (key, value) in host {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entries(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_env() {
        let env = parse_env(&entries(&[
            "PodCIDR=100.64.0.0/10",
            "Names=a;b;c",
            "Broken",
            "Url=http://x?a=b",
        ]));

        assert_eq!(env["PodCIDR"], json!("100.64.0.0/10"));
        assert_eq!(env["Names"], json!(["a", "b", "c"]));
        assert_eq!(env["Url"], json!("http://x?a=b"));
        assert!(!env.contains_key("Broken"));
    }

    #[test]
    fn test_host_env_wins() {
        let cluster = parse_env(&entries(&["A=cluster", "B=cluster"]));
        let host = parse_env(&entries(&["B=host", "C=host"]));

        let merged = merge_env(&cluster, &host);
        assert_eq!(merged["A"], json!("cluster"));
        assert_eq!(merged["B"], json!("host"));
        assert_eq!(merged["C"], json!("host"));
    }
}
