use crate::{Error, Outcome, Store};
use chrono::{DateTime, Utc};
use consul_controller_core::PeeringService;
use consul_controller_k8s_api::{
    peering::{
        PeeringAcceptor, PeeringDialer, PeeringResource, SecretRef, SecretRefStatus,
        KUBERNETES_BACKEND, PEERING_TOKEN_LABEL,
    },
    ConditionStatus, ObjectMeta, Reason, ResourceExt, Secret, SyncedResource,
};
use k8s_openapi::ByteString;

/// Keeps a peering token, generated by Consul, in the Secret named by a
/// [`PeeringAcceptor`].
#[tracing::instrument(skip_all, fields(%namespace, %name))]
pub async fn reconcile_acceptor(
    store: &dyn Store<PeeringAcceptor>,
    secrets: &dyn Store<Secret>,
    consul: &dyn PeeringService,
    partition: &str,
    namespace: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Outcome, Error> {
    let Some(mut acceptor) = store.get(namespace, name).await? else {
        tracing::debug!("PeeringAcceptor not found");
        return Ok(Outcome::Done);
    };

    if !acceptor.is_deleting() {
        if !acceptor.has_finalizer() {
            acceptor.add_finalizer();
            store.update(&acceptor).await?;
            return Ok(Outcome::Requeue);
        }
    } else {
        if acceptor.has_finalizer() {
            tracing::info!("PeeringAcceptor was deleted; deleting peering from Consul");
            consul.delete(name, partition).await?;
            let secret = acceptor.secret();
            if secret.backend == KUBERNETES_BACKEND {
                secrets.delete(namespace, &secret.name).await?;
            }
            acceptor.remove_finalizer();
            store.update(&acceptor).await?;
        }
        return Ok(Outcome::Done);
    }

    let spec_secret = acceptor.secret();
    let existing = match secrets.get(namespace, &spec_secret.name).await {
        Ok(existing) => existing,
        Err(e) => {
            return Err(record_failure(store, &mut acceptor, Reason::KubernetesError, e.into(), now).await)
        }
    };

    if consul.read(name, partition).await?.is_none() {
        tracing::info!("Peering does not exist in Consul; generating a token");
        if let Some(stale) = acceptor.secret_ref().map(|s| s.secret.name.clone()) {
            tracing::info!(secret = %stale, "Deleting stale secret");
            if let Err(e) = secrets.delete(namespace, &stale).await {
                return Err(record_failure(store, &mut acceptor, Reason::KubernetesError, e.into(), now).await);
            }
        }
        return generate(store, secrets, consul, partition, acceptor, None, now).await;
    }

    let (regenerate, renamed) = match should_generate(&acceptor, existing.is_some()) {
        Ok(decision) => decision,
        Err(error) => {
            return Err(record_failure(store, &mut acceptor, Reason::InternalError, error, now).await)
        }
    };
    if !regenerate {
        return Ok(Outcome::Done);
    }

    tracing::info!("Generating a new token for an existing peering");
    let stale = renamed
        .then(|| acceptor.secret_ref().map(|s| s.secret.name.clone()))
        .flatten();
    generate(store, secrets, consul, partition, acceptor, stale, now).await
}

/// Generates a token, stores it in the spec Secret, deletes `stale`, and
/// records the Secret in the status.
async fn generate(
    store: &dyn Store<PeeringAcceptor>,
    secrets: &dyn Store<Secret>,
    consul: &dyn PeeringService,
    partition: &str,
    mut acceptor: PeeringAcceptor,
    stale: Option<String>,
    now: DateTime<Utc>,
) -> Result<Outcome, Error> {
    let name = acceptor.name_any();
    let namespace = acceptor.namespace().unwrap_or_default();
    let spec_secret = acceptor.secret();

    let token = match consul.generate_token(&name, partition).await {
        Ok(token) => token,
        Err(e) => {
            return Err(record_failure(store, &mut acceptor, Reason::ConsulAgentError, e.into(), now).await)
        }
    };

    if spec_secret.backend == KUBERNETES_BACKEND {
        let secret = token_secret(&namespace, &spec_secret, &token);
        if let Err(e) = create_or_update(secrets, secret).await {
            return Err(record_failure(store, &mut acceptor, Reason::KubernetesError, e.into(), now).await);
        }
    }

    if let Some(stale) = stale {
        tracing::info!(secret = %stale, "Deleting stale secret");
        if let Err(e) = secrets.delete(&namespace, &stale).await {
            return Err(record_failure(store, &mut acceptor, Reason::KubernetesError, e.into(), now).await);
        }
    }

    synced(store, &mut acceptor, String::new(), now).await?;
    Ok(Outcome::Done)
}

/// Returns whether a new token is needed and whether the Secret was renamed.
fn should_generate(acceptor: &PeeringAcceptor, secret_exists: bool) -> Result<(bool, bool), Error> {
    if let Some(status) = acceptor.secret_ref() {
        let spec = acceptor.secret();
        if status.secret.name != spec.name {
            return Ok((true, true));
        }
        if status.secret.key != spec.key {
            return Ok((true, false));
        }
        if status.secret.backend != spec.backend {
            return Err(Error::BackendChanged);
        }
        if acceptor.version_bumped()? {
            return Ok((true, false));
        }
    }

    Ok((!secret_exists, false))
}

/// Establishes a peering with the token held in the Secret named by a
/// [`PeeringDialer`].
#[tracing::instrument(skip_all, fields(%namespace, %name))]
pub async fn reconcile_dialer(
    store: &dyn Store<PeeringDialer>,
    secrets: &dyn Store<Secret>,
    consul: &dyn PeeringService,
    partition: &str,
    namespace: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Outcome, Error> {
    let Some(mut dialer) = store.get(namespace, name).await? else {
        tracing::debug!("PeeringDialer not found");
        return Ok(Outcome::Done);
    };

    if !dialer.is_deleting() {
        if !dialer.has_finalizer() {
            dialer.add_finalizer();
            dialer = store.update(&dialer).await?;
        }
    } else {
        if dialer.has_finalizer() {
            tracing::info!("PeeringDialer was deleted; deleting peering from Consul");
            consul.delete(name, partition).await?;
            dialer.remove_finalizer();
            store.update(&dialer).await?;
        }
        return Ok(Outcome::Done);
    }

    let spec = dialer.secret();
    let spec_secret = match secrets.get(namespace, &spec.name).await {
        Ok(Some(secret)) => secret,
        Ok(None) => {
            let error = Error::MissingSecret;
            return Err(record_failure(store, &mut dialer, Reason::InternalError, error, now).await);
        }
        Err(e) => {
            return Err(record_failure(store, &mut dialer, Reason::KubernetesError, e.into(), now).await)
        }
    };

    let status_secret = match dialer.secret_ref().map(|s| s.secret.name.clone()) {
        Some(status_name) => match secrets.get(namespace, &status_name).await {
            Ok(secret) => secret,
            Err(e) => {
                return Err(record_failure(store, &mut dialer, Reason::KubernetesError, e.into(), now).await)
            }
        },
        None => None,
    };

    if status_secret.is_none() {
        tracing::info!(secret = %spec.name, "Establishing peering with the spec secret");
        return establish(store, consul, partition, dialer, &spec_secret, now).await;
    }

    if consul.read(name, partition).await?.is_none() {
        tracing::info!(secret = %spec.name, "Peering does not exist in Consul; establishing peering");
        return establish(store, consul, partition, dialer, &spec_secret, now).await;
    }

    if secrets_differ(&dialer, &spec_secret) {
        tracing::info!(secret = %spec.name, "Spec secret differs from status; re-establishing peering");
        return establish(store, consul, partition, dialer, &spec_secret, now).await;
    }

    match dialer.version_bumped() {
        Ok(true) => {
            tracing::info!(secret = %spec.name, "Peering version was incremented; re-establishing peering");
            establish(store, consul, partition, dialer, &spec_secret, now).await
        }
        Ok(false) => Ok(Outcome::Done),
        Err(e) => Err(record_failure(store, &mut dialer, Reason::InternalError, e.into(), now).await),
    }
}

async fn establish(
    store: &dyn Store<PeeringDialer>,
    consul: &dyn PeeringService,
    partition: &str,
    mut dialer: PeeringDialer,
    spec_secret: &Secret,
    now: DateTime<Utc>,
) -> Result<Outcome, Error> {
    let key = dialer.secret().key;
    let token = spec_secret
        .data
        .as_ref()
        .and_then(|data| data.get(&key))
        .map(|token| String::from_utf8_lossy(&token.0).into_owned())
        .unwrap_or_default();

    if let Err(e) = consul.establish(&dialer.name_any(), partition, &token).await {
        return Err(record_failure(store, &mut dialer, Reason::ConsulAgentError, e.into(), now).await);
    }

    let resource_version = spec_secret.resource_version().unwrap_or_default();
    synced(store, &mut dialer, resource_version, now).await?;
    Ok(Outcome::Done)
}

fn secrets_differ(dialer: &PeeringDialer, spec_secret: &Secret) -> bool {
    let Some(status) = dialer.secret_ref() else {
        return true;
    };
    status.secret != dialer.secret()
        || Some(&status.resource_version) != spec_secret.metadata.resource_version.as_ref()
}

/// Records a successful sync of the spec Secret at `resource_version`.
async fn synced<K: PeeringResource>(
    store: &dyn Store<K>,
    obj: &mut K,
    resource_version: String,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let requested = obj.requested_version()?;
    let secret = obj.secret();
    let status = obj.peering_status_mut();
    status.secret_ref = Some(SecretRefStatus {
        secret,
        resource_version,
    });
    if let Some(requested) = requested {
        if status.latest_peering_version.map_or(true, |latest| latest < requested) {
            status.latest_peering_version = Some(requested);
        }
    }
    obj.set_last_synced(now);
    obj.set_synced(ConditionStatus::True, None, "", now);
    *obj = store.update_status(obj).await?;
    Ok(())
}

/// Records a failure in the status and returns `error`. A failure to write the
/// status is only logged.
async fn record_failure<K: PeeringResource>(
    store: &dyn Store<K>,
    obj: &mut K,
    reason: Reason,
    error: Error,
    now: DateTime<Utc>,
) -> Error {
    obj.set_synced(ConditionStatus::False, Some(reason), error.to_string(), now);
    if let Err(update) = store.update_status(obj).await {
        tracing::error!(error = %update, "Failed to update peering status");
    }
    error
}

fn token_secret(namespace: &str, secret: &SecretRef, token: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(secret.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [(PEERING_TOKEN_LABEL.to_string(), "true".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        data: Some(
            [(secret.key.clone(), ByteString(token.as_bytes().to_vec()))]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    }
}

async fn create_or_update(secrets: &dyn Store<Secret>, mut secret: Secret) -> Result<(), kube::Error> {
    let namespace = secret.metadata.namespace.clone().unwrap_or_default();
    let name = secret.metadata.name.clone().unwrap_or_default();
    match secrets.get(&namespace, &name).await? {
        Some(existing) => {
            secret.metadata.resource_version = existing.metadata.resource_version;
            secrets.update(&secret).await?;
        }
        None => {
            secrets.create(&secret).await?;
        }
    }
    Ok(())
}
