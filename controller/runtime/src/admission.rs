use crate::k8s::{
    auth::TrafficPermissions,
    config::{ExportedServices, Mesh, ProxyDefaults, ServiceDefaults, ServiceIntentions},
    mesh::{MeshGateway, ProxyConfiguration},
    Api, Client, ConfigEntryResource, Invalid, MeshResource, Namespace, Pod, ResourceExt,
    SyncedResource,
};
use anyhow::{anyhow, bail, Result};
use consul_controller_core::TenancyConfig;
use consul_controller_inject::{InjectConfig, Injection};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{
    api::ListParams,
    core::{admission::Operation, DynamicObject},
    Resource,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Serves the mutating webhooks for pods and for every synced kind.
#[derive(Clone)]
pub struct Admission {
    client: Client,
    tenancy: Arc<TenancyConfig>,
    /// Unset when pod injection is disabled.
    inject: Option<Arc<InjectConfig>>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

/// How objects of one kind are defaulted and checked.
struct Rules<K> {
    default: fn(&mut K, &TenancyConfig),
    validate: fn(&K, &TenancyConfig) -> Result<(), Invalid>,
    /// Whether creates are compared against every stored object of the kind.
    lists_existing: fn(&TenancyConfig) -> bool,
    /// Rejects creating the first object while the second is stored.
    conflict: fn(&K, &K, &TenancyConfig) -> Result<()>,
    /// Rejects replacing the first object with the second.
    update: fn(&K, &K) -> Result<()>,
}

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_slice(&bytes) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(
        client: Client,
        tenancy: TenancyConfig,
        inject: Option<InjectConfig>,
    ) -> Self {
        Self {
            client,
            tenancy: Arc::new(tenancy),
            inject: inject.map(Arc::new),
        }
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        if is_kind::<Pod>(&req) {
            if let Some(inject) = self.inject.clone() {
                return self.admit_pod(req, &inject).await;
            }
        }

        if is_kind::<ServiceDefaults>(&req) {
            return self.admit_entry::<ServiceDefaults>(req).await;
        }
        if is_kind::<ProxyDefaults>(&req) {
            return self.admit_entry::<ProxyDefaults>(req).await;
        }
        if is_kind::<Mesh>(&req) {
            return self.admit_entry::<Mesh>(req).await;
        }
        if is_kind::<ServiceIntentions>(&req) {
            return self.admit_intentions(req).await;
        }
        if is_kind::<ExportedServices>(&req) {
            return self.admit_entry::<ExportedServices>(req).await;
        }

        if is_kind::<TrafficPermissions>(&req) {
            return self.admit_mesh::<TrafficPermissions>(req).await;
        }
        if is_kind::<MeshGateway>(&req) {
            return self.admit_mesh::<MeshGateway>(req).await;
        }
        if is_kind::<ProxyConfiguration>(&req) {
            return self.admit_mesh::<ProxyConfiguration>(req).await;
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    async fn admit_entry<K: ConfigEntryResource>(self, req: AdmissionRequest) -> AdmissionResponse {
        let rules = Rules {
            default: <K as ConfigEntryResource>::default_namespace_fields,
            validate: <K as ConfigEntryResource>::validate,
            lists_existing: TenancyConfig::requires_unique_names,
            conflict: name_conflict::<K>,
            update: any_update::<K>,
        };
        self.admit_object(req, rules).await
    }

    /// Intentions are named for their destination in Consul, so uniqueness
    /// and immutability apply to the destination rather than the object name.
    async fn admit_intentions(self, req: AdmissionRequest) -> AdmissionResponse {
        let rules = Rules {
            default: <ServiceIntentions as ConfigEntryResource>::default_namespace_fields,
            validate: <ServiceIntentions as ConfigEntryResource>::validate,
            lists_existing: |_: &TenancyConfig| true,
            conflict: destination_conflict,
            update: destination_unchanged,
        };
        self.admit_object(req, rules).await
    }

    async fn admit_mesh<K: MeshResource>(self, req: AdmissionRequest) -> AdmissionResponse {
        let rules = Rules {
            default: <K as MeshResource>::default_namespace_fields,
            validate: <K as MeshResource>::validate,
            lists_existing: TenancyConfig::requires_unique_names,
            conflict: name_conflict::<K>,
            update: any_update::<K>,
        };
        self.admit_object(req, rules).await
    }

    async fn admit_object<K: SyncedResource>(
        self,
        req: AdmissionRequest,
        rules: Rules<K>,
    ) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let kind = req.kind.kind.clone();

        let mut obj = match parse::<K>(&req) {
            Ok(obj) => obj,
            Err(error) => {
                info!(%error, "Failed to parse {}", kind);
                return rsp.deny(error);
            }
        };

        let old = match req.old_object.as_ref() {
            Some(old) if req.operation == Operation::Update => match convert::<K>(old) {
                Ok(old) => Some(old),
                Err(error) => {
                    info!(%error, "Failed to parse previous {}", kind);
                    return rsp.deny(error);
                }
            },
            _ => None,
        };

        let listed = req.operation == Operation::Create && (rules.lists_existing)(&self.tenancy);
        let existing = if listed {
            match Api::<K>::all(self.client.clone())
                .list(&ListParams::default())
                .await
            {
                Ok(list) => list.items,
                Err(error) => {
                    warn!(%error, %kind, "Failed to list existing resources");
                    return rsp.deny(format_args!("error listing {kind} resources: {error}"));
                }
            }
        } else {
            Vec::new()
        };

        match review(&mut obj, old.as_ref(), &existing, &self.tenancy, &rules) {
            Ok(patch) => allow(rsp, format!("valid {kind} request"), patch),
            Err(error) => {
                let ns = obj.namespace().unwrap_or_default();
                let name = obj.name_any();
                info!(%error, %ns, %name, %kind, "Denied");
                rsp.deny(error)
            }
        }
    }

    async fn admit_pod(self, req: AdmissionRequest, inject: &InjectConfig) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        if req.operation != Operation::Create {
            return rsp;
        }

        let pod = match parse::<Pod>(&req) {
            Ok(pod) => pod,
            Err(error) => {
                info!(%error, "Failed to parse pod");
                return rsp.deny(error);
            }
        };

        let ns = req.namespace.clone().unwrap_or_default();
        let namespace = match Api::<Namespace>::all(self.client.clone()).get(&ns).await {
            Ok(namespace) => namespace,
            Err(error) => {
                warn!(%error, %ns, "Failed to get namespace");
                return rsp.deny(format_args!("error getting namespace {ns:?}: {error}"));
            }
        };

        match consul_controller_inject::inject(inject, &pod, &namespace) {
            Ok(Injection::Skipped) => {
                debug!(%ns, pod = %req.name, "Skipping injection");
                rsp
            }
            Ok(Injection::Patched(patch)) => allow(rsp, "valid Pod request".to_string(), patch),
            Err(error) => {
                info!(%error, %ns, pod = %req.name, "Denied");
                rsp.deny(format_args!("error injecting pod: {error}"))
            }
        }
    }
}

/// Applies defaulting to `obj` and decides whether it may be admitted.
///
/// `old` is the object being replaced by an update. `existing` holds every
/// stored object of the kind when a create must be compared against them.
/// Returns the patch produced by defaulting.
fn review<K: SyncedResource>(
    obj: &mut K,
    old: Option<&K>,
    existing: &[K],
    tenancy: &TenancyConfig,
    rules: &Rules<K>,
) -> Result<json_patch::Patch> {
    if let Some(old) = old {
        (rules.update)(old, &*obj)?;
    }

    let before = serde_json::to_value(&*obj)?;
    (rules.default)(obj, tenancy);
    let after = serde_json::to_value(&*obj)?;
    let patch = json_patch::diff(&before, &after);

    for other in existing {
        (rules.conflict)(&*obj, other, tenancy)?;
    }

    (rules.validate)(&*obj, tenancy)?;
    Ok(patch)
}

/// Without mirroring, objects from different namespaces share a Consul
/// namespace and so need distinct names.
fn name_conflict<K: SyncedResource>(obj: &K, other: &K, _: &TenancyConfig) -> Result<()> {
    let name = obj.name_any();
    if other.name_any() == name && other.namespace() != obj.namespace() {
        let kind = K::kind(&());
        bail!(
            "{kind} resource with name {name:?} is already defined – all {kind} resources must have unique names across namespaces"
        );
    }
    Ok(())
}

fn any_update<K>(_: &K, _: &K) -> Result<()> {
    Ok(())
}

fn destination_conflict(
    obj: &ServiceIntentions,
    other: &ServiceIntentions,
    tenancy: &TenancyConfig,
) -> Result<()> {
    if other.name_any() == obj.name_any() && other.namespace() == obj.namespace() {
        return Ok(());
    }

    let name = &obj.spec.destination.name;
    if other.spec.destination.name != *name {
        return Ok(());
    }
    if tenancy.requires_unique_names() {
        bail!("an existing ServiceIntentions resource has `spec.destination.name: {name}`");
    }

    let ns = obj.consul_namespace(tenancy);
    if other.consul_namespace(tenancy) == ns {
        bail!(
            "an existing ServiceIntentions resource has `spec.destination.name: {name}` and `spec.destination.namespace: {ns}`"
        );
    }
    Ok(())
}

fn destination_unchanged(old: &ServiceIntentions, new: &ServiceIntentions) -> Result<()> {
    if old.spec.destination != new.spec.destination {
        bail!("spec.destination.name and spec.destination.namespace are immutable fields for ServiceIntentions");
    }
    Ok(())
}

fn allow(mut rsp: AdmissionResponse, message: String, patch: json_patch::Patch) -> AdmissionResponse {
    rsp.result.message = message;
    if patch.0.is_empty() {
        return rsp;
    }
    let denied = rsp.clone();
    rsp.with_patch(patch).unwrap_or_else(|error| {
        warn!(%error, "Failed to encode patch");
        denied.deny(error)
    })
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn parse<T: DeserializeOwned>(req: &AdmissionRequest) -> Result<T> {
    let obj = req
        .object
        .as_ref()
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;
    convert(obj)
}

fn convert<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

#[cfg(test)]
mod tests;
