use super::{now, FakeConsul, FakeStore};
use crate::{reconcile_resource, Outcome};
use consul_controller_core::{meta, Resource, TenancyConfig};
use consul_controller_k8s_api::{
    auth::{Destination, TrafficPermissions, TrafficPermissionsSpec},
    ConditionStatus, MeshResource, ObjectMeta, SyncedResource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use pretty_assertions::assert_eq;

fn permissions(action: &str) -> TrafficPermissions {
    TrafficPermissions {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("apps".to_string()),
            finalizers: Some(vec![meta::FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: TrafficPermissionsSpec {
            destination: Some(Destination {
                identity_name: "web".to_string(),
            }),
            action: action.to_string(),
            permissions: vec![],
        },
        status: None,
    }
}

fn deleting(mut obj: TrafficPermissions) -> TrafficPermissions {
    obj.metadata.deletion_timestamp = Some(Time(now()));
    obj
}

async fn reconcile(
    store: &FakeStore<TrafficPermissions>,
    consul: &FakeConsul,
) -> Result<Outcome, crate::Error> {
    reconcile_resource(store, consul, &TenancyConfig::default(), "apps", "web", now()).await
}

#[tokio::test]
async fn missing_object_is_ignored() {
    let store = FakeStore::<TrafficPermissions>::default();
    let consul = FakeConsul::default();
    assert_eq!(reconcile(&store, &consul).await.unwrap(), Outcome::Done);
    assert!(consul.resources.lock().is_empty());
}

#[tokio::test]
async fn adds_finalizer_and_creates() {
    let mut obj = permissions("allow");
    obj.metadata.finalizers = None;
    let store = FakeStore::with([obj]);
    let consul = FakeConsul::default();

    assert_eq!(reconcile(&store, &consul).await.unwrap(), Outcome::Done);

    let obj = store.get_obj("apps", "web").unwrap();
    assert!(obj.has_finalizer());
    assert_eq!(obj.synced(), ConditionStatus::True);
    assert_eq!(obj.status.as_ref().unwrap().last_synced_time, Some(now()));

    let tenancy = TenancyConfig::default();
    let stored = consul.resource(&obj.resource_id(&tenancy)).unwrap();
    assert!(meta::is_managed(&stored.metadata));
    assert_eq!(stored.data["action"], "ACTION_ALLOW");
    assert!(obj.matches(&stored, &tenancy));
}

#[tokio::test]
async fn updates_divergent_resource() {
    let tenancy = TenancyConfig::default();
    let consul = FakeConsul::default();
    consul.insert_resource(permissions("deny").to_resource(&tenancy));
    let store = FakeStore::with([permissions("allow")]);

    reconcile(&store, &consul).await.unwrap();

    let obj = store.get_obj("apps", "web").unwrap();
    let stored = consul.resource(&obj.resource_id(&tenancy)).unwrap();
    assert_eq!(stored.data["action"], "ACTION_ALLOW");
    assert_eq!(*consul.writes.lock(), 1);
    assert_eq!(obj.synced(), ConditionStatus::True);
}

#[tokio::test]
async fn matching_resource_only_records_status() {
    let tenancy = TenancyConfig::default();
    let consul = FakeConsul::default();
    consul.insert_resource(permissions("allow").to_resource(&tenancy));
    let store = FakeStore::with([permissions("allow")]);

    reconcile(&store, &consul).await.unwrap();
    assert_eq!(*consul.writes.lock(), 0);
    assert_eq!(
        store.get_obj("apps", "web").unwrap().synced(),
        ConditionStatus::True
    );

    // Already synced: nothing to write at all.
    store.updates.lock().clear();
    reconcile(&store, &consul).await.unwrap();
    assert!(store.updates.lock().is_empty());
}

#[tokio::test]
async fn unowned_resource_is_not_touched() {
    let tenancy = TenancyConfig::default();
    let consul = FakeConsul::default();
    let foreign = Resource::new(
        permissions("deny").resource_id(&tenancy),
        Default::default(),
        permissions("deny").data(),
    );
    consul.insert_resource(foreign.clone());
    let store = FakeStore::with([permissions("allow")]);

    let error = reconcile(&store, &consul).await.unwrap_err();
    assert_eq!(error.to_string(), "resource already exists in Consul");
    assert_eq!(consul.resource(&foreign.id), Some(foreign));

    let status = store.get_obj("apps", "web").unwrap().status.unwrap();
    assert_eq!(status.conditions[0].status, ConditionStatus::False);
    assert_eq!(status.conditions[0].reason, "ExternallyManagedConfigError");
    assert_eq!(
        status.conditions[0].message,
        "resource already exists in Consul"
    );
}

#[tokio::test]
async fn missing_namespace_requeues() {
    let consul = FakeConsul::default();
    consul.missing_namespaces.lock().insert("default".to_string());
    let store = FakeStore::with([permissions("allow")]);

    assert_eq!(reconcile(&store, &consul).await.unwrap(), Outcome::Requeue);
    assert!(store.get_obj("apps", "web").unwrap().status.is_none());
}

#[tokio::test]
async fn write_failure_is_recorded() {
    let consul = FakeConsul::default();
    consul.fail("write");
    let store = FakeStore::with([permissions("allow")]);

    let error = reconcile(&store, &consul).await.unwrap_err();
    assert_eq!(
        error.to_string(),
        "writing resource to Consul: unexpected response from consul (500): write failed"
    );
    let status = store.get_obj("apps", "web").unwrap().status.unwrap();
    assert_eq!(status.conditions[0].status, ConditionStatus::False);
    assert_eq!(status.conditions[0].reason, "ConsulAgentError");
    assert_eq!(status.conditions[0].message, error.to_string());
}

#[tokio::test]
async fn update_failure_leaves_status_unknown() {
    let tenancy = TenancyConfig::default();
    let consul = FakeConsul::default();
    consul.insert_resource(permissions("deny").to_resource(&tenancy));
    consul.fail("write");
    let store = FakeStore::with([permissions("allow")]);

    let error = reconcile(&store, &consul).await.unwrap_err();
    assert!(error
        .to_string()
        .starts_with("updating resource in Consul: "));
    let status = store.get_obj("apps", "web").unwrap().status.unwrap();
    assert_eq!(status.conditions[0].status, ConditionStatus::Unknown);
    assert_eq!(status.conditions[0].reason, "ConsulAgentError");
}

#[tokio::test]
async fn status_write_failure_wins() {
    let consul = FakeConsul::default();
    consul.fail("write");
    let store = FakeStore::with([permissions("allow")]);
    store.fail("update_status");

    let error = reconcile(&store, &consul).await.unwrap_err();
    assert!(
        matches!(error, crate::Error::Kube(kube::Error::Api(ref rsp)) if rsp.code == 500),
        "{error:?}"
    );
}

#[tokio::test]
async fn deletion_removes_owned_resource_and_finalizer() {
    let tenancy = TenancyConfig::default();
    let consul = FakeConsul::default();
    let id = permissions("allow").resource_id(&tenancy);
    consul.insert_resource(permissions("allow").to_resource(&tenancy));
    let store = FakeStore::with([deleting(permissions("allow"))]);

    assert_eq!(reconcile(&store, &consul).await.unwrap(), Outcome::Done);
    assert_eq!(consul.resource(&id), None);
    assert!(store.get_obj("apps", "web").is_none());
}

#[tokio::test]
async fn deletion_keeps_unowned_resource() {
    let tenancy = TenancyConfig::default();
    let consul = FakeConsul::default();
    let foreign = Resource::new(
        permissions("allow").resource_id(&tenancy),
        Default::default(),
        permissions("allow").data(),
    );
    consul.insert_resource(foreign.clone());
    let store = FakeStore::with([deleting(permissions("allow"))]);

    reconcile(&store, &consul).await.unwrap();
    assert_eq!(consul.resource(&foreign.id), Some(foreign));
    assert!(store.get_obj("apps", "web").is_none());
}

#[tokio::test]
async fn deletion_tolerates_missing_resource() {
    let consul = FakeConsul::default();
    let store = FakeStore::with([deleting(permissions("allow"))]);
    reconcile(&store, &consul).await.unwrap();
    assert!(store.get_obj("apps", "web").is_none());
}

#[tokio::test]
async fn deletion_tolerates_missing_namespace() {
    let consul = FakeConsul::default();
    consul.missing_namespaces.lock().insert("default".to_string());
    let store = FakeStore::with([deleting(permissions("allow"))]);
    assert_eq!(reconcile(&store, &consul).await.unwrap(), Outcome::Done);
    assert!(store.get_obj("apps", "web").is_none());
}

#[tokio::test]
async fn deletion_failure_keeps_finalizer() {
    let tenancy = TenancyConfig::default();
    let consul = FakeConsul::default();
    consul.insert_resource(permissions("allow").to_resource(&tenancy));
    consul.fail("delete");
    let store = FakeStore::with([deleting(permissions("allow"))]);

    let error = reconcile(&store, &consul).await.unwrap_err();
    assert!(error
        .to_string()
        .starts_with("deleting resource from Consul: "));
    let obj = store.get_obj("apps", "web").unwrap();
    assert!(obj.has_finalizer());
    assert_eq!(obj.synced(), ConditionStatus::False);
}
