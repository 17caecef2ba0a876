use consul_controller_k8s_api::{Api, Patch, PatchParams, PostParams};
use kube::{api::DeleteParams, core::NamespaceResourceScope};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, marker::PhantomData};

/// Kubernetes access for a single kind of namespaced object.
///
/// Writes return the object as stored so that later writes carry the
/// current resource version.
#[async_trait::async_trait]
pub trait Store<K>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, kube::Error>;

    async fn create(&self, obj: &K) -> Result<K, kube::Error>;

    async fn update(&self, obj: &K) -> Result<K, kube::Error>;

    /// Writes the object's status subresource.
    async fn update_status(&self, obj: &K) -> Result<K, kube::Error>;

    /// Replaces the object's finalizers with a merge patch.
    async fn patch_finalizers(&self, obj: &K, finalizers: &[String]) -> Result<K, kube::Error>;

    /// Deletes the object. Succeeds if it does not exist.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
}

/// A [`Store`] backed by the Kubernetes API.
pub struct KubeStore<K> {
    client: kube::Client,
    field_manager: &'static str,
    _kind: PhantomData<fn() -> K>,
}

// === impl KubeStore ===

impl<K> KubeStore<K> {
    pub fn new(client: kube::Client, field_manager: &'static str) -> Self {
        Self {
            client,
            field_manager,
            _kind: PhantomData,
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.to_string()),
            ..Default::default()
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.to_string()),
            ..Default::default()
        }
    }
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self::new(self.client.clone(), self.field_manager)
    }
}

#[async_trait::async_trait]
impl<K> Store<K> for KubeStore<K>
where
    K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    K: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, kube::Error> {
        Api::<K>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
    }

    async fn create(&self, obj: &K) -> Result<K, kube::Error> {
        self.api(obj).create(&self.post_params(), obj).await
    }

    async fn update(&self, obj: &K) -> Result<K, kube::Error> {
        self.api(obj)
            .replace(&name(obj), &self.post_params(), obj)
            .await
    }

    async fn update_status(&self, obj: &K) -> Result<K, kube::Error> {
        let mut value = serde_json::to_value(obj).map_err(kube::Error::SerdeError)?;
        let status = value
            .get_mut("status")
            .map(serde_json::Value::take)
            .unwrap_or_default();
        let patch = Patch::Merge(serde_json::json!({ "status": status }));
        self.api(obj)
            .patch_status(&name(obj), &self.patch_params(), &patch)
            .await
    }

    async fn patch_finalizers(&self, obj: &K, finalizers: &[String]) -> Result<K, kube::Error> {
        let patch = Patch::Merge(serde_json::json!({
            "metadata": { "finalizers": finalizers },
        }));
        self.api(obj)
            .patch(&name(obj), &self.patch_params(), &patch)
            .await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api = Api::<K>::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(error),
        }
    }
}

impl<K> KubeStore<K>
where
    K: kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    fn api(&self, obj: &K) -> Api<K> {
        let ns = obj.meta().namespace.as_deref().unwrap_or_default();
        Api::namespaced(self.client.clone(), ns)
    }
}

fn name<K: kube::Resource>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

pub(crate) fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}
