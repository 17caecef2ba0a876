//! Order-insensitive comparison of desired and stored Consul state.
//!
//! Both sides are reduced to a canonical JSON form before comparison:
//! object keys are lower-cased, zero values (`null`, `false`, `0`, `""`,
//! empty arrays and objects) are dropped, and arrays are sorted by their
//! serialized form.

use crate::{config_entry::ConfigEntry, resource::Resource};
use serde_json::{Map, Value};

/// Fields of a config entry that are owned by Consul or by the controller and
/// never count as drift.
const IGNORED_ENTRY_FIELDS: &[&str] = &["meta", "namespace", "partition", "createindex", "modifyindex"];

/// Returns a canonical form of `value`, or `None` if it is a zero value.
///
/// Keys listed in `ignored` (lower-case) are removed at every depth.
pub fn normalize(value: &Value, ignored: &[&str]) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Array(items) => {
            let mut items = items
                .iter()
                .filter_map(|v| normalize(v, ignored))
                .collect::<Vec<_>>();
            if items.is_empty() {
                return None;
            }
            items.sort_by_cached_key(|v| v.to_string());
            Some(Value::Array(items))
        }
        Value::Object(map) => {
            let map = map
                .iter()
                .filter_map(|(k, v)| {
                    let k = k.to_ascii_lowercase();
                    if ignored.contains(&k.as_str()) {
                        return None;
                    }
                    normalize(v, ignored).map(|v| (k, v))
                })
                .collect::<Map<_, _>>();
            if map.is_empty() {
                return None;
            }
            Some(Value::Object(map))
        }
        v => Some(v.clone()),
    }
}

/// Compares two JSON documents after normalization.
pub fn equivalent(a: &Value, b: &Value, ignored: &[&str]) -> bool {
    normalize(a, ignored) == normalize(b, ignored)
}

/// Whether a stored config entry is equivalent to the desired one.
///
/// Top-level namespace, partition, meta and raft indexes are ignored. The
/// kind-specific `ignored` keys (lower-case) are dropped at every depth.
pub fn entry_matches(desired: &ConfigEntry, stored: &ConfigEntry, ignored: &[&str]) -> bool {
    if !desired.kind.eq_ignore_ascii_case(&stored.kind) || desired.name != stored.name {
        return false;
    }

    equivalent(
        &Value::Object(strip_entry_fields(&desired.body)),
        &Value::Object(strip_entry_fields(&stored.body)),
        ignored,
    )
}

fn strip_entry_fields(body: &Map<String, Value>) -> Map<String, Value> {
    body.iter()
        .filter(|(k, _)| !IGNORED_ENTRY_FIELDS.contains(&k.to_ascii_lowercase().as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Whether a stored resource is equivalent to the desired one.
///
/// Status, generation, version and the ID's UID are ignored.
pub fn resource_matches(desired: &Resource, stored: &Resource) -> bool {
    desired.id.name == stored.id.name
        && desired.id.ty == stored.id.ty
        && desired.id.tenancy == stored.id.tenancy
        && desired.metadata == stored.metadata
        && equivalent(&desired.data, &stored.data, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        meta,
        resource::{ResourceId, ResourceType, Tenancy},
    };
    use serde_json::json;

    const TYPE: ResourceType = ResourceType {
        group: "auth",
        group_version: "v2beta1",
        kind: "TrafficPermissions",
    };

    fn entry(body: Value) -> ConfigEntry {
        ConfigEntry::new("service-defaults", "web").with_body(body.as_object().cloned().unwrap())
    }

    fn resource(data: Value) -> Resource {
        let tenancy = Tenancy {
            namespace: "default".to_string(),
            partition: "default".to_string(),
            peer_name: "local".to_string(),
        };
        Resource::new(
            ResourceId::new(TYPE, "web", tenancy),
            meta::resource_meta(),
            data,
        )
    }

    #[test]
    fn zero_values_equal_missing() {
        assert!(equivalent(
            &json!({"Protocol": "http", "Mode": "", "Expose": {}, "Checks": false}),
            &json!({"Protocol": "http"}),
            &[],
        ));
    }

    #[test]
    fn arrays_compare_unordered() {
        assert!(equivalent(
            &json!({"Addresses": ["b", "a"]}),
            &json!({"Addresses": ["a", "b"]}),
            &[],
        ));
        assert!(!equivalent(
            &json!({"Addresses": ["a", "a"]}),
            &json!({"Addresses": ["a"]}),
            &[],
        ));
    }

    #[test]
    fn entry_ignores_server_fields() {
        let mut stored = entry(json!({"Protocol": "http", "CreateIndex": 7}));
        stored.meta = meta::entry_meta("dc2");
        stored.namespace = "apps".to_string();
        stored.modify_index = 9;
        assert!(entry_matches(&entry(json!({"Protocol": "http"})), &stored, &[]));
        assert!(!entry_matches(&entry(json!({"Protocol": "grpc"})), &stored, &[]));
    }

    #[test]
    fn entry_key_case_is_irrelevant() {
        assert!(entry_matches(
            &entry(json!({"Tls": {"Incoming": {"TlsMinVersion": "TLSv1_2"}}})),
            &entry(json!({"TLS": {"Incoming": {"TLSMinVersion": "TLSv1_2"}}})),
            &[],
        ));
    }

    #[test]
    fn entry_nested_namespaces_are_compared() {
        assert!(!entry_matches(
            &entry(json!({"Sources": [{"Name": "api", "Namespace": "a"}]})),
            &entry(json!({"Sources": [{"Name": "api", "Namespace": "b"}]})),
            &[],
        ));
    }

    #[test]
    fn entry_kind_specific_ignores() {
        let desired = entry(json!({"Sources": [{"Name": "api", "Action": "allow"}]}));
        let stored = entry(
            json!({"Sources": [{"Name": "api", "Action": "allow", "Precedence": 9, "Type": "consul"}]}),
        );
        assert!(!entry_matches(&desired, &stored, &[]));
        assert!(entry_matches(&desired, &stored, &["precedence", "type"]));
    }

    #[test]
    fn resource_ignores_server_fields() {
        let desired = resource(json!({"action": "ACTION_ALLOW"}));
        let mut stored = desired.clone();
        stored.id.uid = "01HX".to_string();
        stored.version = "12".to_string();
        stored.generation = "01HY".to_string();
        stored.status = Some(json!({"conditions": []}));
        assert!(resource_matches(&desired, &stored));

        stored.data = json!({"action": "ACTION_DENY"});
        assert!(!resource_matches(&desired, &stored));
    }

    #[test]
    fn resource_tenancy_is_compared() {
        let desired = resource(json!({}));
        let mut stored = desired.clone();
        stored.id.tenancy.namespace = "other".to_string();
        assert!(!resource_matches(&desired, &stored));
    }
}
