use crate::{
    status::{sync_failed, sync_successful, sync_unknown, sync_unknown_with_error},
    Error, Outcome, Store,
};
use chrono::{DateTime, Utc};
use consul_controller_core::{meta, RemoteError, ResourceService, TenancyConfig};
use consul_controller_k8s_api::{ConditionStatus, MeshResource, Reason};

/// Converges the Consul resource API toward the object `namespace/name`.
#[tracing::instrument(skip_all, fields(kind = %K::TYPE, %namespace, %name))]
pub async fn reconcile_resource<K: MeshResource>(
    store: &dyn Store<K>,
    consul: &dyn ResourceService,
    tenancy: &TenancyConfig,
    namespace: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Outcome, Error> {
    let Some(mut obj) = store.get(namespace, name).await? else {
        tracing::debug!("Resource deleted");
        return Ok(Outcome::Done);
    };

    if !obj.is_deleting() && !obj.has_finalizer() {
        tracing::debug!("Adding finalizer");
        obj.add_finalizer();
        sync_unknown(&mut obj, now);
        obj = store.update(&obj).await?;
    }

    let id = obj.resource_id(tenancy);

    if obj.is_deleting() {
        if !obj.has_finalizer() {
            return Ok(Outcome::Done);
        }

        let stored = match consul.read(&id).await {
            Ok(stored) => Some(stored),
            // Nothing can be stored in a namespace that no longer exists.
            Err(e) if e.is_not_found() || e.is_namespace_not_found() => None,
            Err(e) => return Err(Error::consul("getting resource from Consul", e)),
        };
        if let Some(stored) = stored.filter(|r| meta::is_managed(&r.metadata)) {
            tracing::info!(%id, "Deleting resource from Consul");
            if let Err(e) = consul.delete(&stored.id).await {
                let error = Error::consul("deleting resource from Consul", e);
                return Err(sync_failed(store, &mut obj, Reason::ConsulAgentError, error, now).await);
            }
        }

        tracing::debug!("Removing finalizer");
        obj.remove_finalizer();
        store.update(&obj).await?;
        return Ok(Outcome::Done);
    }

    let stored = match consul.read(&id).await {
        Ok(stored) => stored,
        Err(RemoteError::NamespaceNotFound(ns)) => {
            tracing::info!(namespace = %ns, "Consul namespace not found; requeueing");
            return Ok(Outcome::Requeue);
        }
        Err(RemoteError::NotFound) => {
            tracing::info!(%id, "Writing resource to Consul");
            if let Err(e) = consul.write(obj.to_resource(tenancy)).await {
                let error = Error::consul("writing resource to Consul", e);
                return Err(sync_failed(store, &mut obj, Reason::ConsulAgentError, error, now).await);
            }
            sync_successful(store, &mut obj, now).await?;
            return Ok(Outcome::Done);
        }
        Err(e) => {
            return Err(sync_failed(store, &mut obj, Reason::ConsulAgentError, e.into(), now).await);
        }
    };

    if !meta::is_managed(&stored.metadata) {
        let error = Error::ResourceExists;
        return Err(sync_failed(
            store,
            &mut obj,
            Reason::ExternallyManagedConfigError,
            error,
            now,
        )
        .await);
    }

    if !obj.matches(&stored, tenancy) {
        tracing::info!(%id, "Updating resource in Consul");
        if let Err(e) = consul.write(obj.to_resource(tenancy)).await {
            let error = Error::consul("updating resource in Consul", e);
            return Err(
                sync_unknown_with_error(store, &mut obj, Reason::ConsulAgentError, error, now).await,
            );
        }
        sync_successful(store, &mut obj, now).await?;
    } else if obj.synced() != ConditionStatus::True {
        sync_successful(store, &mut obj, now).await?;
    }

    Ok(Outcome::Done)
}
