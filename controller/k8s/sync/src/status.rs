use crate::{Error, Store};
use chrono::{DateTime, Utc};
use consul_controller_k8s_api::{ConditionStatus, Reason, SyncedResource};

/// Records a failed sync and returns `error`.
///
/// If the status cannot be written, `error` is logged and the write error is
/// returned instead.
pub(crate) async fn sync_failed<K: SyncedResource>(
    store: &dyn Store<K>,
    obj: &mut K,
    reason: Reason,
    error: Error,
    now: DateTime<Utc>,
) -> Error {
    obj.set_synced(ConditionStatus::False, Some(reason), error.to_string(), now);
    match store.update_status(obj).await {
        Ok(updated) => {
            *obj = updated;
            error
        }
        Err(update) => {
            tracing::error!(%error, %reason, "Failed to record sync failure");
            update.into()
        }
    }
}

pub(crate) async fn sync_successful<K: SyncedResource>(
    store: &dyn Store<K>,
    obj: &mut K,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    obj.set_synced(ConditionStatus::True, None, "", now);
    obj.set_last_synced(now);
    *obj = store.update_status(obj).await?;
    Ok(())
}

/// Sets the condition to `Unknown` without writing it.
pub(crate) fn sync_unknown<K: SyncedResource>(obj: &mut K, now: DateTime<Utc>) {
    obj.set_synced(ConditionStatus::Unknown, None, "", now);
}

/// Records that the outcome of a sync is unknown and returns `error`.
pub(crate) async fn sync_unknown_with_error<K: SyncedResource>(
    store: &dyn Store<K>,
    obj: &mut K,
    reason: Reason,
    error: Error,
    now: DateTime<Utc>,
) -> Error {
    obj.set_synced(
        ConditionStatus::Unknown,
        Some(reason),
        error.to_string(),
        now,
    );
    match store.update_status(obj).await {
        Ok(updated) => {
            *obj = updated;
            error
        }
        Err(update) => {
            tracing::error!(%error, %reason, "Failed to record sync state");
            update.into()
        }
    }
}
