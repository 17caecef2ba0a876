use super::*;
use crate::k8s::config::{
    service_intentions::{IntentionDestination, SourceIntention},
    ServiceDefaultsSpec, ServiceIntentionsSpec,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;

fn tenancy(enable_namespaces: bool, enable_mirroring: bool) -> TenancyConfig {
    TenancyConfig {
        enable_namespaces,
        destination_namespace: "ns1".to_string(),
        enable_mirroring,
        ..Default::default()
    }
}

fn intentions(ns: &str, name: &str) -> ServiceIntentions {
    let mut obj = ServiceIntentions::new(
        name,
        ServiceIntentionsSpec {
            destination: IntentionDestination {
                name: "web".to_string(),
                namespace: String::new(),
            },
            sources: vec![SourceIntention {
                name: "api".to_string(),
                action: "allow".to_string(),
                ..Default::default()
            }],
        },
    );
    obj.metadata.namespace = Some(ns.to_string());
    obj
}

fn service_defaults(ns: &str, name: &str, protocol: &str) -> ServiceDefaults {
    let mut obj = ServiceDefaults::new(
        name,
        ServiceDefaultsSpec {
            protocol: protocol.to_string(),
            ..Default::default()
        },
    );
    obj.metadata.namespace = Some(ns.to_string());
    obj
}

fn review_entry<K: ConfigEntryResource>(
    obj: &mut K,
    existing: &[K],
    tenancy: &TenancyConfig,
) -> Result<json_patch::Patch> {
    let rules = Rules {
        default: <K as ConfigEntryResource>::default_namespace_fields,
        validate: <K as ConfigEntryResource>::validate,
        lists_existing: TenancyConfig::requires_unique_names,
        conflict: name_conflict::<K>,
        update: any_update::<K>,
    };
    review(obj, None, existing, tenancy, &rules)
}

fn review_intentions(
    obj: &mut ServiceIntentions,
    old: Option<&ServiceIntentions>,
    existing: &[ServiceIntentions],
    tenancy: &TenancyConfig,
) -> Result<json_patch::Patch> {
    let rules = Rules {
        default: <ServiceIntentions as ConfigEntryResource>::default_namespace_fields,
        validate: <ServiceIntentions as ConfigEntryResource>::validate,
        lists_existing: |_: &TenancyConfig| true,
        conflict: destination_conflict,
        update: destination_unchanged,
    };
    review(obj, old, existing, tenancy, &rules)
}

/// A client whose API server answers GETs from `objects`, keyed by path, and
/// reports everything else as not found.
fn client(objects: Vec<(&str, serde_json::Value)>) -> Client {
    let objects = Arc::new(
        objects
            .into_iter()
            .map(|(path, obj)| (path.to_string(), obj))
            .collect::<HashMap<_, _>>(),
    );
    let api = tower::service_fn(move |req: Request<kube::client::Body>| {
        let rsp = match objects.get(req.uri().path()) {
            Some(obj) => Response::new(Body::from(obj.to_string())),
            None => {
                let status = json!({
                    "apiVersion": "v1",
                    "kind": "Status",
                    "status": "Failure",
                    "message": format!("{} not found", req.uri().path()),
                    "reason": "NotFound",
                    "code": 404,
                });
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::from(status.to_string()))
                    .unwrap()
            }
        };
        future::ok::<_, std::convert::Infallible>(rsp)
    });
    Client::new(api, "default")
}

fn admission(tenancy: TenancyConfig, inject: Option<InjectConfig>) -> Admission {
    Admission::new(client(vec![]), tenancy, inject)
}

fn intentions_list(items: &[ServiceIntentions]) -> (&'static str, serde_json::Value) {
    (
        "/apis/consul.hashicorp.com/v1alpha1/serviceintentions",
        json!({
            "apiVersion": "consul.hashicorp.com/v1alpha1",
            "kind": "ServiceIntentionsList",
            "metadata": {"resourceVersion": "12"},
            "items": items,
        }),
    )
}

fn request(
    group: &str,
    kind: &str,
    operation: &str,
    object: serde_json::Value,
) -> AdmissionRequest {
    update_request(group, kind, operation, object, serde_json::Value::Null)
}

fn update_request(
    group: &str,
    kind: &str,
    operation: &str,
    object: serde_json::Value,
    old_object: serde_json::Value,
) -> AdmissionRequest {
    let review: Review = serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "8b5e6a2c",
            "kind": {"group": group, "version": "v1alpha1", "kind": kind},
            "resource": {"group": group, "version": "v1alpha1", "resource": kind.to_lowercase()},
            "namespace": "default",
            "name": "web",
            "operation": operation,
            "userInfo": {},
            "object": object,
            "oldObject": old_object,
            "dryRun": false,
        },
    }))
    .unwrap();
    review.try_into().unwrap()
}

#[test]
fn defaulting_produces_a_patch() {
    let mut obj = intentions("default", "web");
    let patch = review_entry(&mut obj, &[], &tenancy(true, false)).unwrap();
    assert_eq!(
        serde_json::to_value(&patch).unwrap(),
        json!([{"op": "add", "path": "/spec/destination/namespace", "value": "ns1"}]),
    );
    assert_eq!(obj.spec.destination.namespace, "ns1");
}

#[test]
fn no_patch_without_namespaces() {
    let mut obj = intentions("default", "web");
    let patch = review_entry(&mut obj, &[], &tenancy(false, false)).unwrap();
    assert!(patch.0.is_empty());
}

#[test]
fn rejects_names_defined_in_other_namespaces() {
    let mut obj = service_defaults("default", "web", "http");
    let existing = [
        service_defaults("default", "api", "http"),
        service_defaults("other", "web", "tcp"),
    ];
    let error = review_entry(&mut obj, &existing, &tenancy(false, false)).unwrap_err();
    assert_eq!(
        error.to_string(),
        "ServiceDefaults resource with name \"web\" is already defined – all ServiceDefaults resources must have unique names across namespaces"
    );
}

#[test]
fn allows_the_object_itself() {
    let mut obj = service_defaults("default", "web", "http");
    let existing = [service_defaults("default", "web", "http")];
    assert!(review_entry(&mut obj, &existing, &tenancy(false, false)).is_ok());
}

#[test]
fn validation_errors_deny() {
    let mut obj = service_defaults("default", "web", "udp");
    let error = review_entry(&mut obj, &[], &tenancy(false, false))
        .unwrap_err()
        .to_string();
    assert!(
        error.starts_with("ServiceDefaults.consul.hashicorp.com \"web\" is invalid"),
        "{error}"
    );
    assert!(error.contains("spec.protocol"), "{error}");
}

#[test]
fn matches_kinds_case_insensitively() {
    let obj = json!({"apiVersion": "consul.hashicorp.com/v1alpha1", "kind": "ServiceDefaults", "metadata": {"name": "web"}});
    let req = request("Consul.Hashicorp.com", "servicedefaults", "CREATE", obj);
    assert!(is_kind::<ServiceDefaults>(&req));
    assert!(!is_kind::<ServiceIntentions>(&req));
    assert!(!is_kind::<Pod>(&req));
}

#[tokio::test]
async fn admits_valid_entries() {
    let obj = json!({
        "apiVersion": "consul.hashicorp.com/v1alpha1",
        "kind": "ServiceDefaults",
        "metadata": {"name": "web", "namespace": "default"},
        "spec": {"protocol": "http"},
    });
    // Mirrored namespaces never collide, so no listing is needed.
    let rsp = admission(tenancy(true, true), None)
        .admit(request("consul.hashicorp.com", "ServiceDefaults", "CREATE", obj))
        .await;
    assert!(rsp.allowed);
    assert_eq!(rsp.result.message, "valid ServiceDefaults request");
}

#[tokio::test]
async fn denies_invalid_entries() {
    let obj = json!({
        "apiVersion": "consul.hashicorp.com/v1alpha1",
        "kind": "ServiceDefaults",
        "metadata": {"name": "web", "namespace": "default"},
        "spec": {"protocol": "udp"},
    });
    let rsp = admission(tenancy(true, true), None)
        .admit(request("consul.hashicorp.com", "ServiceDefaults", "UPDATE", obj))
        .await;
    assert!(!rsp.allowed);
    assert!(rsp.result.message.contains("spec.protocol"));
}

#[tokio::test]
async fn rejects_unknown_kinds() {
    let obj = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "web"}});
    let rsp = admission(tenancy(false, false), None)
        .admit(request("", "ConfigMap", "CREATE", obj))
        .await;
    assert!(!rsp.allowed);
    assert_eq!(rsp.result.message, "unsupported resource type: .v1alpha1.ConfigMap");
}

#[tokio::test]
async fn pods_require_injection() {
    let pod = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "web"}});

    let rsp = admission(tenancy(false, false), None)
        .admit(request("", "Pod", "CREATE", pod.clone()))
        .await;
    assert!(!rsp.allowed, "pods are not admitted when injection is disabled");

    // Only creates are mutated.
    let rsp = admission(tenancy(false, false), Some(InjectConfig::default()))
        .admit(request("", "Pod", "UPDATE", pod))
        .await;
    assert!(rsp.allowed);
    assert!(rsp.patch.is_none());
}

fn with_destination(mut obj: ServiceIntentions, name: &str) -> ServiceIntentions {
    obj.spec.destination.name = name.to_string();
    obj
}

#[test]
fn rejects_shared_destinations() {
    let existing = [intentions("apps", "web-a")];

    let mut obj = intentions("apps", "web-b");
    let error = review_intentions(&mut obj, None, &existing, &tenancy(false, false)).unwrap_err();
    assert_eq!(
        error.to_string(),
        "an existing ServiceIntentions resource has `spec.destination.name: web`"
    );

    // Without mirroring every Kubernetes namespace shares one Consul namespace.
    let mut obj = intentions("other", "web-b");
    assert!(review_intentions(&mut obj, None, &existing, &tenancy(true, false)).is_err());

    let mut obj = with_destination(intentions("apps", "web-b"), "api");
    assert!(review_intentions(&mut obj, None, &existing, &tenancy(false, false)).is_ok());
}

#[test]
fn mirrored_destinations_are_scoped_to_namespaces() {
    let existing = [intentions("apps", "web-a")];

    let mut obj = intentions("apps", "web-b");
    let error = review_intentions(&mut obj, None, &existing, &tenancy(true, true)).unwrap_err();
    assert_eq!(
        error.to_string(),
        "an existing ServiceIntentions resource has `spec.destination.name: web` and `spec.destination.namespace: apps`"
    );

    let mut obj = intentions("other", "web-b");
    assert!(review_intentions(&mut obj, None, &existing, &tenancy(true, true)).is_ok());
}

#[test]
fn destination_is_immutable() {
    let old = intentions("default", "web");

    let mut obj = with_destination(intentions("default", "web"), "api");
    let error = review_intentions(&mut obj, Some(&old), &[], &tenancy(false, false)).unwrap_err();
    assert_eq!(
        error.to_string(),
        "spec.destination.name and spec.destination.namespace are immutable fields for ServiceIntentions"
    );

    let mut obj = intentions("default", "web");
    obj.spec.destination.namespace = "billing".to_string();
    assert!(review_intentions(&mut obj, Some(&old), &[], &tenancy(true, false)).is_err());

    let mut obj = intentions("default", "web");
    obj.spec.sources[0].action = "deny".to_string();
    assert!(review_intentions(&mut obj, Some(&old), &[], &tenancy(false, false)).is_ok());
}

#[tokio::test]
async fn denies_intentions_for_a_taken_destination() {
    let api = client(vec![intentions_list(&[intentions("apps", "web-a")])]);
    let obj = serde_json::to_value(intentions("default", "web-b")).unwrap();
    let rsp = Admission::new(api, tenancy(false, false), None)
        .admit(request("consul.hashicorp.com", "ServiceIntentions", "CREATE", obj))
        .await;
    assert!(!rsp.allowed);
    assert_eq!(
        rsp.result.message,
        "an existing ServiceIntentions resource has `spec.destination.name: web`"
    );

    let api = client(vec![intentions_list(&[intentions("apps", "web-a")])]);
    let obj = serde_json::to_value(with_destination(intentions("default", "web-b"), "api")).unwrap();
    let rsp = Admission::new(api, tenancy(false, false), None)
        .admit(request("consul.hashicorp.com", "ServiceIntentions", "CREATE", obj))
        .await;
    assert!(rsp.allowed, "{}", rsp.result.message);
    assert_eq!(rsp.result.message, "valid ServiceIntentions request");
}

#[tokio::test]
async fn denies_destination_changes() {
    let old = serde_json::to_value(intentions("default", "web")).unwrap();
    let obj = serde_json::to_value(with_destination(intentions("default", "web"), "api")).unwrap();
    let rsp = admission(tenancy(false, false), None)
        .admit(update_request(
            "consul.hashicorp.com",
            "ServiceIntentions",
            "UPDATE",
            obj,
            old,
        ))
        .await;
    assert!(!rsp.allowed);
    assert_eq!(
        rsp.result.message,
        "spec.destination.name and spec.destination.namespace are immutable fields for ServiceIntentions"
    );
}

#[tokio::test]
async fn listing_failures_deny() {
    let obj = json!({
        "apiVersion": "consul.hashicorp.com/v1alpha1",
        "kind": "ServiceDefaults",
        "metadata": {"name": "web", "namespace": "default"},
        "spec": {"protocol": "http"},
    });
    let rsp = admission(tenancy(false, false), None)
        .admit(request("consul.hashicorp.com", "ServiceDefaults", "CREATE", obj))
        .await;
    assert!(!rsp.allowed);
    assert!(
        rsp.result
            .message
            .starts_with("error listing ServiceDefaults resources: "),
        "{}",
        rsp.result.message
    );
}

#[tokio::test]
async fn injects_created_pods() {
    let api = client(vec![(
        "/api/v1/namespaces/default",
        json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "default"}}),
    )]);
    let pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": "web", "namespace": "default"},
        "spec": {
            "containers": [{
                "name": "web",
                "image": "web:1.0",
                "ports": [{"containerPort": 8080, "name": "http"}],
            }],
        },
    });
    let rsp = Admission::new(api, tenancy(false, false), Some(InjectConfig::default()))
        .admit(request("", "Pod", "CREATE", pod))
        .await;
    assert!(rsp.allowed, "{}", rsp.result.message);
    assert_eq!(rsp.result.message, "valid Pod request");
    assert!(rsp.patch.is_some());
}
