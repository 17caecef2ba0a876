//! Runs a `kube` controller per synced kind.

use crate::{consul::ConsulClient, lease::LEASE_DURATION, metrics::ReconcileMetrics, FIELD_MANAGER};
use chrono::Utc;
use consul_controller_k8s_api::{
    auth::TrafficPermissions,
    config::{ExportedServices, Mesh, ProxyDefaults, ServiceDefaults, ServiceIntentions},
    mesh::{MeshGateway, ProxyConfiguration},
    peering::{PeeringAcceptor, PeeringDialer, PeeringResource, PEERING_TOKEN_LABEL},
    Api, Client, ConfigEntryResource, MeshResource, ResourceExt, Secret, SyncedResource,
};
use consul_controller_k8s_sync::{
    self as sync, retry::RetryPolicy, EntryContext, Error, KubeStore, Outcome,
};
use futures::prelude::*;
use kube::runtime::{
    controller::{Action, Controller},
    reflector::ObjectRef,
    watcher,
};
use std::{future::Future, sync::Arc};
use tokio::{sync::watch, time};
use tracing::{info_span, Instrument};

/// State shared by every reconcile.
pub(crate) struct Context {
    pub client: Client,
    pub consul: ConsulClient,
    pub entries: EntryContext,
    pub retry: RetryPolicy<String>,
    pub metrics: ReconcileMetrics,
    pub claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    pub hostname: String,
}

/// Spawns the controllers once this replica holds the write lease.
pub(crate) async fn spawn(ctx: Arc<Context>, resource_apis: bool) {
    let mut claims = ctx.claims.clone();
    let hostname = ctx.hostname.clone();
    if claims
        .wait_for(|claim| claim.is_current_for(&hostname))
        .await
        .is_err()
    {
        tracing::warn!("Lease manager stopped before leadership was acquired");
        return;
    }
    tracing::info!(%hostname, "Acquired write lease; starting controllers");

    spawn_entry::<ServiceDefaults>(&ctx);
    spawn_entry::<ProxyDefaults>(&ctx);
    spawn_entry::<Mesh>(&ctx);
    spawn_entry::<ServiceIntentions>(&ctx);
    spawn_entry::<ExportedServices>(&ctx);

    if resource_apis {
        spawn_mesh::<TrafficPermissions>(&ctx);
        spawn_mesh::<MeshGateway>(&ctx);
        spawn_mesh::<ProxyConfiguration>(&ctx);
    }

    spawn_acceptors(&ctx);
    spawn_dialers(&ctx);
}

fn spawn_mesh<K: MeshResource>(ctx: &Arc<Context>) {
    let kind = K::TYPE.kind;
    let controller = Controller::new(Api::<K>::all(ctx.client.clone()), watcher::Config::default());
    tokio::spawn(
        run(controller, ctx.clone(), kind, move |obj: Arc<K>, ctx: Arc<Context>| async move {
            let (ns, name) = key(&*obj);
            let store = KubeStore::<K>::new(ctx.client.clone(), FIELD_MANAGER);
            ctx.reconcile(kind, &ns, &name, async {
                sync::reconcile_resource(
                    &store,
                    &ctx.consul,
                    &ctx.entries.tenancy,
                    &ns,
                    &name,
                    Utc::now(),
                )
                .await
            })
            .await
        })
        .instrument(info_span!("controller", %kind)),
    );
}

fn spawn_entry<K: ConfigEntryResource>(ctx: &Arc<Context>) {
    let kind = K::CONSUL_KIND;
    let controller = Controller::new(Api::<K>::all(ctx.client.clone()), watcher::Config::default());
    tokio::spawn(
        run(controller, ctx.clone(), kind, move |obj: Arc<K>, ctx: Arc<Context>| async move {
            let (ns, name) = key(&*obj);
            let store = KubeStore::<K>::new(ctx.client.clone(), FIELD_MANAGER);
            ctx.reconcile(kind, &ns, &name, async {
                sync::reconcile_entry(&store, &ctx.consul, &ctx.entries, &ns, &name, Utc::now())
                    .await
            })
            .await
        })
        .instrument(info_span!("controller", %kind)),
    );
}

fn spawn_acceptors(ctx: &Arc<Context>) {
    const KIND: &str = "PeeringAcceptor";
    let controller = Controller::new(
        Api::<PeeringAcceptor>::all(ctx.client.clone()),
        watcher::Config::default(),
    );
    let acceptors = controller.store();
    let controller = controller.watches(
        Api::<Secret>::all(ctx.client.clone()),
        token_secrets(),
        move |secret| acceptors_for(&secret, &acceptors.state()),
    );
    tokio::spawn(
        run(controller, ctx.clone(), KIND, |obj: Arc<PeeringAcceptor>, ctx: Arc<Context>| async move {
            let (ns, name) = key(&*obj);
            let store = KubeStore::<PeeringAcceptor>::new(ctx.client.clone(), FIELD_MANAGER);
            let secrets = KubeStore::<Secret>::new(ctx.client.clone(), FIELD_MANAGER);
            let partition = ctx.entries.tenancy.entry_partition();
            ctx.reconcile(KIND, &ns, &name, async {
                sync::reconcile_acceptor(
                    &store,
                    &secrets,
                    &ctx.consul,
                    &partition,
                    &ns,
                    &name,
                    Utc::now(),
                )
                .await
            })
            .await
        })
        .instrument(info_span!("controller", kind = KIND)),
    );
}

fn spawn_dialers(ctx: &Arc<Context>) {
    const KIND: &str = "PeeringDialer";
    let controller = Controller::new(
        Api::<PeeringDialer>::all(ctx.client.clone()),
        watcher::Config::default(),
    );
    let dialers = controller.store();
    let controller = controller.watches(
        Api::<Secret>::all(ctx.client.clone()),
        token_secrets(),
        move |secret| dialers_for(&secret, &dialers.state()),
    );
    tokio::spawn(
        run(controller, ctx.clone(), KIND, |obj: Arc<PeeringDialer>, ctx: Arc<Context>| async move {
            let (ns, name) = key(&*obj);
            let store = KubeStore::<PeeringDialer>::new(ctx.client.clone(), FIELD_MANAGER);
            let secrets = KubeStore::<Secret>::new(ctx.client.clone(), FIELD_MANAGER);
            let partition = ctx.entries.tenancy.entry_partition();
            ctx.reconcile(KIND, &ns, &name, async {
                sync::reconcile_dialer(
                    &store,
                    &secrets,
                    &ctx.consul,
                    &partition,
                    &ns,
                    &name,
                    Utc::now(),
                )
                .await
            })
            .await
        })
        .instrument(info_span!("controller", kind = KIND)),
    );
}

async fn run<K, F, Fut>(
    controller: Controller<K>,
    ctx: Arc<Context>,
    kind: &'static str,
    reconcile: F,
) where
    K: SyncedResource,
    F: FnMut(Arc<K>, Arc<Context>) -> Fut,
    Fut: Future<Output = Result<Action, Error>> + Send + 'static,
{
    controller
        .shutdown_on_signal()
        .run(
            reconcile,
            move |obj: Arc<K>, error: &Error, ctx: Arc<Context>| {
                let (ns, name) = key(&*obj);
                ctx.failed(kind, &ns, &name, error)
            },
            ctx,
        )
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => tracing::debug!(%obj, "Reconciled"),
                Err(error) => tracing::debug!(%error, "Reconcile failed"),
            }
        })
        .await;
    tracing::info!("Controller stopped");
}

// === impl Context ===

impl Context {
    fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.hostname)
    }

    async fn reconcile(
        &self,
        kind: &'static str,
        ns: &str,
        name: &str,
        reconcile: impl Future<Output = Result<Outcome, Error>>,
    ) -> Result<Action, Error> {
        if !self.is_leader() {
            tracing::debug!(%ns, %name, "Not the leader; skipping reconcile");
            return Ok(Action::requeue(LEASE_DURATION));
        }

        let started = time::Instant::now();
        let outcome = reconcile.await;
        self.metrics.reconciled(kind, started);

        match outcome? {
            Outcome::Done => {
                self.retry.succeeded(&retry_key(kind, ns, name));
                Ok(Action::await_change())
            }
            Outcome::Requeue => {
                let delay = self
                    .retry
                    .failed(retry_key(kind, ns, name), std::time::Instant::now());
                Ok(Action::requeue(delay))
            }
        }
    }

    fn failed(&self, kind: &'static str, ns: &str, name: &str, error: &Error) -> Action {
        self.metrics.failed(kind, error);
        let delay = self
            .retry
            .failed(retry_key(kind, ns, name), std::time::Instant::now());
        tracing::warn!(%kind, %ns, %name, %error, ?delay, "Reconcile failed");
        Action::requeue(delay)
    }
}

fn key<K: ResourceExt>(obj: &K) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn retry_key(kind: &str, ns: &str, name: &str) -> String {
    format!("{kind}/{ns}/{name}")
}

fn token_secrets() -> watcher::Config {
    watcher::Config::default().labels(&format!("{PEERING_TOKEN_LABEL}=true"))
}

/// Acceptors that last wrote their token to `secret`.
fn acceptors_for(
    secret: &Secret,
    acceptors: &[Arc<PeeringAcceptor>],
) -> Vec<ObjectRef<PeeringAcceptor>> {
    referencing(secret, acceptors, |acceptor| {
        acceptor.secret_ref().map(|r| r.secret.name.clone())
    })
}

/// Dialers whose spec names `secret`.
fn dialers_for(secret: &Secret, dialers: &[Arc<PeeringDialer>]) -> Vec<ObjectRef<PeeringDialer>> {
    referencing(secret, dialers, |dialer| Some(dialer.secret().name))
}

fn referencing<K: PeeringResource>(
    secret: &Secret,
    objs: &[Arc<K>],
    secret_name: impl Fn(&K) -> Option<String>,
) -> Vec<ObjectRef<K>> {
    let ns = secret.namespace();
    let name = secret.name_any();
    objs.iter()
        .filter(|obj| obj.namespace() == ns)
        .filter(|obj| secret_name(obj).as_deref() == Some(name.as_str()))
        .map(|obj| ObjectRef::from_obj(&**obj))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use consul_controller_k8s_api::{
        peering::{Peer, PeeringAcceptorSpec, PeeringDialerSpec, PeeringStatus, SecretRef, SecretRefStatus},
        ObjectMeta,
    };
    use pretty_assertions::assert_eq;

    fn secret(ns: &str, name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn secret_ref(name: &str) -> SecretRef {
        SecretRef {
            name: name.to_string(),
            key: "data".to_string(),
            backend: "kubernetes".to_string(),
        }
    }

    fn acceptor(ns: &str, name: &str, status_secret: Option<&str>) -> Arc<PeeringAcceptor> {
        let mut acceptor = PeeringAcceptor::new(
            name,
            PeeringAcceptorSpec {
                peer: Peer {
                    secret: Some(secret_ref("spec-token")),
                },
            },
        );
        acceptor.metadata.namespace = Some(ns.to_string());
        acceptor.status = status_secret.map(|name| PeeringStatus {
            secret_ref: Some(SecretRefStatus {
                secret: secret_ref(name),
                resource_version: "1".to_string(),
            }),
            ..Default::default()
        });
        Arc::new(acceptor)
    }

    fn dialer(ns: &str, name: &str, secret: &str) -> Arc<PeeringDialer> {
        let mut dialer = PeeringDialer::new(
            name,
            PeeringDialerSpec {
                peer: Peer {
                    secret: Some(secret_ref(secret)),
                },
            },
        );
        dialer.metadata.namespace = Some(ns.to_string());
        Arc::new(dialer)
    }

    #[test]
    fn secret_changes_requeue_acceptors_by_status() {
        let acceptors = [
            acceptor("default", "dc2", Some("dc2-token")),
            acceptor("default", "dc3", Some("dc3-token")),
            acceptor("other", "dc2", Some("dc2-token")),
            acceptor("default", "pending", None),
        ];
        let refs = acceptors_for(&secret("default", "dc2-token"), &acceptors);
        assert_eq!(refs, vec![ObjectRef::from_obj(&*acceptors[0])]);

        // The spec's secret is not consulted until a token has been written.
        assert!(acceptors_for(&secret("default", "spec-token"), &acceptors).is_empty());
    }

    #[test]
    fn secret_changes_requeue_dialers_by_spec() {
        let dialers = [
            dialer("default", "dc1", "dc1-token"),
            dialer("default", "dc1-backup", "dc1-token"),
            dialer("other", "dc1", "dc1-token"),
        ];
        let refs = dialers_for(&secret("default", "dc1-token"), &dialers);
        assert_eq!(
            refs,
            vec![
                ObjectRef::from_obj(&*dialers[0]),
                ObjectRef::from_obj(&*dialers[1]),
            ]
        );
    }

    #[test]
    fn retry_keys_are_scoped_by_kind() {
        assert_ne!(
            retry_key("service-defaults", "default", "web"),
            retry_key("service-intentions", "default", "web"),
        );
    }

    #[test]
    fn token_secrets_are_selected_by_label() {
        assert_eq!(
            token_secrets().label_selector.as_deref(),
            Some("consul.hashicorp.com/peering-token=true")
        );
    }
}
