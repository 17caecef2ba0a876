use crate::{
    status::{sync_failed, sync_successful, sync_unknown, sync_unknown_with_error},
    Error, Outcome, Store,
};
use chrono::{DateTime, Utc};
use consul_controller_core::{
    meta, ConfigEntry, ConfigEntryService, NamespaceSpec, RemoteError, TenancyConfig,
};
use consul_controller_k8s_api::{ConditionStatus, ConfigEntryResource, Reason};

/// Settings shared by every config-entry reconciler.
#[derive(Clone, Debug, Default)]
pub struct EntryContext {
    /// The local Consul datacenter, recorded as the owner of written entries.
    pub datacenter: String,
    pub tenancy: TenancyConfig,
    /// ACL policy attached to namespaces created on demand.
    pub cross_namespace_policy: Option<String>,
}

/// Converges the Consul config entry for the object `namespace/name`.
#[tracing::instrument(skip_all, fields(kind = K::CONSUL_KIND, %namespace, %name))]
pub async fn reconcile_entry<K: ConfigEntryResource>(
    store: &dyn Store<K>,
    consul: &dyn ConfigEntryService,
    ctx: &EntryContext,
    namespace: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Outcome, Error> {
    let Some(mut obj) = store.get(namespace, name).await? else {
        tracing::debug!("Resource deleted");
        return Ok(Outcome::Done);
    };

    let entry = obj.to_entry(&ctx.tenancy, &ctx.datacenter);

    if !obj.is_deleting() {
        if !obj.has_finalizer() {
            tracing::debug!("Adding finalizer");
            let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
            finalizers.push(meta::FINALIZER.to_string());
            obj = match store.patch_finalizers(&obj, &finalizers).await {
                Ok(obj) => obj,
                Err(e) => {
                    let error = Error::AddFinalizer(e);
                    return Err(sync_failed(store, &mut obj, Reason::ConsulPatchError, error, now).await);
                }
            };
            sync_unknown(&mut obj, now);
            obj.set_last_synced(now);
            obj = store.update_status(&obj).await?;
        }
    } else {
        if obj.has_finalizer() {
            delete_entry(store, consul, ctx, &mut obj, &entry, now).await?;
        }
        return Ok(Outcome::Done);
    }

    let stored = match get(consul, &entry).await {
        Ok(stored) => stored,
        Err(RemoteError::NotFound) => {
            tracing::info!("Config entry not found in Consul");
            if ctx.tenancy.enable_namespaces {
                let ns = NamespaceSpec {
                    name: entry.namespace.clone(),
                    partition: entry.partition.clone(),
                    cross_namespace_policy: ctx.cross_namespace_policy.clone(),
                };
                if let Err(e) = consul.ensure_namespace(&ns).await {
                    let error = Error::consul(format!("creating consul namespace {:?}", ns.name), e);
                    return Err(sync_failed(store, &mut obj, Reason::ConsulAgentError, error, now).await);
                }
            }
            if let Err(e) = consul.set(&entry).await {
                let error = Error::consul("writing config entry to consul", e);
                return Err(sync_failed(store, &mut obj, Reason::ConsulAgentError, error, now).await);
            }
            tracing::info!("Config entry created");
            sync_successful(store, &mut obj, now).await?;
            return Ok(Outcome::Done);
        }
        Err(e) => {
            return Err(sync_failed(store, &mut obj, Reason::ConsulAgentError, e.into(), now).await);
        }
    };

    let source_dc = meta::source_datacenter(&stored.meta);
    let migrating = source_dc != ctx.datacenter;
    let matches = obj.matches(&stored);

    // A foreign entry that already matches is left alone and marked synced.
    if !matches && migrating && !obj.migrate_requested() {
        let error = if source_dc.is_empty() {
            Error::EntryExists
        } else {
            Error::OtherDatacenter(source_dc.to_string())
        };
        return Err(sync_failed(
            store,
            &mut obj,
            Reason::ExternallyManagedConfigError,
            error,
            now,
        )
        .await);
    }

    if !matches {
        if migrating {
            let error = Error::MigrationMismatch {
                consul: serde_json::to_string(&stored).unwrap_or_default(),
                kube: serde_json::to_string(&entry).unwrap_or_default(),
            };
            return Err(sync_failed(store, &mut obj, Reason::MigrationFailedError, error, now).await);
        }

        tracing::info!(modify_index = stored.modify_index, "Config entry does not match Consul");
        update(store, consul, &mut obj, &entry, now).await?;
    } else if migrating && obj.migrate_requested() {
        tracing::info!("Migrating config entry to be managed by Kubernetes");
        update(store, consul, &mut obj, &entry, now).await?;
    } else if obj.synced() != ConditionStatus::True {
        sync_successful(store, &mut obj, now).await?;
    }

    Ok(Outcome::Done)
}

async fn get(consul: &dyn ConfigEntryService, entry: &ConfigEntry) -> Result<ConfigEntry, RemoteError> {
    consul
        .get(&entry.kind, &entry.name, &entry.namespace, &entry.partition)
        .await
}

async fn update<K: ConfigEntryResource>(
    store: &dyn Store<K>,
    consul: &dyn ConfigEntryService,
    obj: &mut K,
    entry: &ConfigEntry,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    if let Err(e) = consul.set(entry).await {
        let error = Error::consul("updating config entry in consul", e);
        return Err(sync_unknown_with_error(store, obj, Reason::ConsulAgentError, error, now).await);
    }
    tracing::info!("Config entry updated");
    sync_successful(store, obj, now).await
}

/// Deletes the entry from Consul if this datacenter owns it, then releases the
/// finalizer.
async fn delete_entry<K: ConfigEntryResource>(
    store: &dyn Store<K>,
    consul: &dyn ConfigEntryService,
    ctx: &EntryContext,
    obj: &mut K,
    entry: &ConfigEntry,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    tracing::info!("Deletion event");
    match get(consul, entry).await {
        Ok(stored) => {
            let source_dc = meta::source_datacenter(&stored.meta);
            if source_dc == ctx.datacenter {
                if let Err(e) = consul
                    .delete(&entry.kind, &entry.name, &entry.namespace, &entry.partition)
                    .await
                {
                    let error = Error::consul("deleting config entry from consul", e);
                    return Err(sync_failed(store, obj, Reason::ConsulAgentError, error, now).await);
                }
                tracing::info!("Deleted config entry from Consul");
            } else {
                tracing::info!(
                    external_datacenter = %source_dc,
                    "Config entry was created in another datacenter; skipping delete from Consul"
                );
            }
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(Error::consul("getting config entry from consul", e)),
    }

    obj.remove_finalizer();
    let finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    *obj = store.patch_finalizers(obj, &finalizers).await?;
    tracing::debug!("Removed finalizer");
    Ok(())
}
