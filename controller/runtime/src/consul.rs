//! An HTTP client for the Consul APIs the controllers depend on.

use bytes::Bytes;
use consul_controller_core::{
    meta, ConfigEntry, ConfigEntryService, NamespaceSpec, Peering, PeeringService, RemoteError,
    Resource, ResourceId, ResourceService, Tenancy,
};
use http_body_util::{BodyExt, Full};
use hyper::{http, Method, Request, StatusCode};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde::{Deserialize, Serialize};
use tokio::time;

const REQUEST_TIMEOUT: time::Duration = time::Duration::from_secs(10);
const TOKEN_HEADER: &str = "x-consul-token";
const NAMESPACE_DESCRIPTION: &str = "Auto-generated by consul-k8s";

#[derive(Clone, Debug)]
pub struct ConsulClient {
    http: Client<HttpConnector, Full<Bytes>>,
    /// Scheme and authority, e.g. `http://consul-server:8500`.
    base: String,
    token: Option<http::HeaderValue>,
}

/// Rejected client settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid Consul token: {0}")]
    Token(#[from] http::header::InvalidHeaderValue),

    /// Only plaintext HTTP is spoken to Consul.
    #[error("unsupported scheme {0:?} in Consul address; use an http:// address")]
    Scheme(String),
}

/// Query parameters; empty values are omitted.
#[derive(Debug, Default)]
struct Query(Vec<(&'static str, String)>);

#[derive(Deserialize)]
struct WireResource {
    id: WireId,
    #[serde(default)]
    metadata: meta::Meta,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    version: String,
    #[serde(default)]
    generation: String,
    #[serde(default)]
    status: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireId {
    name: String,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    tenancy: Tenancy,
}

#[derive(Serialize)]
struct WriteResource<'r> {
    metadata: &'r meta::Meta,
    data: &'r serde_json::Value,
    #[serde(skip_serializing_if = "str::is_empty")]
    version: &'r str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct NamespaceBody<'n> {
    name: &'n str,
    description: &'static str,
    #[serde(rename = "ACLs", skip_serializing_if = "Option::is_none")]
    acls: Option<NamespaceAcls<'n>>,
    meta: meta::Meta,
    #[serde(skip_serializing_if = "str::is_empty")]
    partition: &'n str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct NamespaceAcls<'n> {
    policy_defaults: Vec<PolicyLink<'n>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyLink<'n> {
    name: &'n str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PeeringRequest<'p> {
    peer_name: &'p str,
    #[serde(skip_serializing_if = "Option::is_none")]
    peering_token: Option<&'p str>,
    #[serde(skip_serializing_if = "str::is_empty")]
    partition: &'p str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TokenResponse {
    peering_token: String,
}

// === impl ConsulClient ===

impl ConsulClient {
    pub fn new(addr: &str, token: Option<&str>) -> Result<Self, ConfigError> {
        let authority = match addr.split_once("://") {
            Some(("http", authority)) => authority,
            Some((scheme, _)) => return Err(ConfigError::Scheme(scheme.to_string())),
            None => addr,
        };
        let base = format!("http://{}", authority.trim_end_matches('/'));

        let token = match token.filter(|t| !t.is_empty()) {
            Some(t) => {
                let mut value = http::HeaderValue::from_str(t)?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        Ok(Self {
            http: Client::builder(TokioExecutor::new()).build_http(),
            base,
            token,
        })
    }

    /// Issues a request and returns the body of a successful response.
    ///
    /// `namespace` names the Consul namespace the request targets so that a
    /// missing namespace can be reported as such.
    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        query: &Query,
        namespace: &str,
        body: Option<&B>,
    ) -> Result<Bytes, RemoteError> {
        let body = match body {
            Some(b) => Full::new(Bytes::from(serde_json::to_vec(b)?)),
            None => Full::default(),
        };
        let mut req = Request::builder()
            .method(method.clone())
            .uri(format!("{}{}{}", self.base, path, query))
            .header(http::header::CONTENT_TYPE, "application/json");
        if let Some(token) = &self.token {
            req = req.header(TOKEN_HEADER, token.clone());
        }
        let req = req.body(body).map_err(RemoteError::transport)?;

        tracing::trace!(%method, %path, "Sending Consul request");
        let rsp = time::timeout(REQUEST_TIMEOUT, self.http.request(req))
            .await
            .map_err(RemoteError::transport)?
            .map_err(RemoteError::transport)?;
        let status = rsp.status();
        let bytes = rsp
            .into_body()
            .collect()
            .await
            .map_err(RemoteError::transport)?
            .to_bytes();

        if status.is_success() {
            return Ok(bytes);
        }
        Err(classify(status, &bytes, namespace))
    }

    async fn fetch(&self, path: &str, query: &Query, namespace: &str) -> Result<Bytes, RemoteError> {
        self.send::<()>(Method::GET, path, query, namespace, None)
            .await
    }

    async fn delete_ignoring_missing(
        &self,
        path: &str,
        query: &Query,
        namespace: &str,
    ) -> Result<(), RemoteError> {
        match self
            .send::<()>(Method::DELETE, path, query, namespace, None)
            .await
        {
            Ok(_) | Err(RemoteError::NotFound) => Ok(()),
            Err(error) => Err(error),
        }
    }
}

#[async_trait::async_trait]
impl ResourceService for ConsulClient {
    async fn read(&self, id: &ResourceId) -> Result<Resource, RemoteError> {
        let bytes = self
            .fetch(&resource_path(id), &tenancy_query(&id.tenancy), &id.tenancy.namespace)
            .await?;
        decode_resource(id, &bytes)
    }

    async fn write(&self, resource: Resource) -> Result<Resource, RemoteError> {
        let body = WriteResource {
            metadata: &resource.metadata,
            data: &resource.data,
            version: &resource.version,
        };
        let bytes = self
            .send(
                Method::PUT,
                &resource_path(&resource.id),
                &tenancy_query(&resource.id.tenancy),
                &resource.id.tenancy.namespace,
                Some(&body),
            )
            .await?;
        decode_resource(&resource.id, &bytes)
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), RemoteError> {
        self.delete_ignoring_missing(
            &resource_path(id),
            &tenancy_query(&id.tenancy),
            &id.tenancy.namespace,
        )
        .await
    }
}

#[async_trait::async_trait]
impl ConfigEntryService for ConsulClient {
    async fn get(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        partition: &str,
    ) -> Result<ConfigEntry, RemoteError> {
        let bytes = self
            .fetch(
                &format!("/v1/config/{kind}/{name}"),
                &entry_query(namespace, partition),
                namespace,
            )
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn set(&self, entry: &ConfigEntry) -> Result<(), RemoteError> {
        let bytes = self
            .send(
                Method::PUT,
                "/v1/config",
                &entry_query(&entry.namespace, &entry.partition),
                &entry.namespace,
                Some(entry),
            )
            .await?;
        if !serde_json::from_slice::<bool>(&bytes)? {
            return Err(RemoteError::Api {
                status: StatusCode::OK.as_u16(),
                message: format!("config entry {}/{} was not written", entry.kind, entry.name),
            });
        }
        Ok(())
    }

    async fn delete(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        partition: &str,
    ) -> Result<(), RemoteError> {
        self.delete_ignoring_missing(
            &format!("/v1/config/{kind}/{name}"),
            &entry_query(namespace, partition),
            namespace,
        )
        .await
    }

    async fn ensure_namespace(&self, ns: &NamespaceSpec) -> Result<(), RemoteError> {
        let query = Query::default().with("partition", &ns.partition);
        match self
            .fetch(&format!("/v1/namespace/{}", ns.name), &query, "")
            .await
        {
            Ok(bytes) if &bytes[..] != b"null" => return Ok(()),
            Ok(_) | Err(RemoteError::NotFound) => {}
            Err(error) => return Err(error),
        }

        tracing::info!(namespace = %ns.name, "Creating Consul namespace");
        let body = namespace_body(ns);
        self.send(Method::PUT, "/v1/namespace", &Query::default(), "", Some(&body))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PeeringService for ConsulClient {
    async fn read(&self, name: &str, partition: &str) -> Result<Option<Peering>, RemoteError> {
        let query = Query::default().with("partition", partition);
        match self
            .fetch(&format!("/v1/peering/{name}"), &query, "")
            .await
        {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(RemoteError::NotFound) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn generate_token(&self, name: &str, partition: &str) -> Result<String, RemoteError> {
        let body = PeeringRequest {
            peer_name: name,
            peering_token: None,
            partition,
        };
        let bytes = self
            .send(
                Method::POST,
                "/v1/peering/token",
                &Query::default(),
                "",
                Some(&body),
            )
            .await?;
        let TokenResponse { peering_token } = serde_json::from_slice(&bytes)?;
        Ok(peering_token)
    }

    async fn establish(&self, name: &str, partition: &str, token: &str) -> Result<(), RemoteError> {
        let body = PeeringRequest {
            peer_name: name,
            peering_token: Some(token),
            partition,
        };
        self.send(
            Method::POST,
            "/v1/peering/establish",
            &Query::default(),
            "",
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, name: &str, partition: &str) -> Result<(), RemoteError> {
        let query = Query::default().with("partition", partition);
        self.delete_ignoring_missing(&format!("/v1/peering/{name}"), &query, "")
            .await
    }
}

// === impl Query ===

impl Query {
    fn with(mut self, key: &'static str, value: &str) -> Self {
        if !value.is_empty() {
            self.0.push((key, value.to_string()));
        }
        self
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{k}={v}")?;
        }
        Ok(())
    }
}

fn resource_path(id: &ResourceId) -> String {
    format!(
        "/api/{}/{}/{}/{}",
        id.ty.group, id.ty.group_version, id.ty.kind, id.name
    )
}

fn tenancy_query(tenancy: &Tenancy) -> Query {
    Query::default()
        .with("partition", &tenancy.partition)
        .with("namespace", &tenancy.namespace)
        .with("peer_name", &tenancy.peer_name)
}

fn entry_query(namespace: &str, partition: &str) -> Query {
    Query::default()
        .with("ns", namespace)
        .with("partition", partition)
}

fn namespace_body(ns: &NamespaceSpec) -> NamespaceBody<'_> {
    NamespaceBody {
        name: &ns.name,
        description: NAMESPACE_DESCRIPTION,
        acls: ns.cross_namespace_policy.as_deref().map(|policy| NamespaceAcls {
            policy_defaults: vec![PolicyLink { name: policy }],
        }),
        meta: meta::resource_meta(),
        partition: &ns.partition,
    }
}

fn decode_resource(id: &ResourceId, bytes: &[u8]) -> Result<Resource, RemoteError> {
    let wire = serde_json::from_slice::<WireResource>(bytes)?;
    Ok(Resource {
        id: ResourceId {
            name: wire.id.name,
            ty: id.ty,
            tenancy: wire.id.tenancy,
            uid: wire.id.uid,
        },
        metadata: wire.metadata,
        data: wire.data,
        version: wire.version,
        generation: wire.generation,
        status: wire.status,
    })
}

/// Maps an unsuccessful response onto a [`RemoteError`].
fn classify(status: StatusCode, body: &[u8], namespace: &str) -> RemoteError {
    let message = String::from_utf8_lossy(body).trim().to_string();
    let lower = message.to_ascii_lowercase();
    if status.is_client_error()
        && lower.contains("namespace")
        && (lower.contains("not found") || lower.contains("does not exist"))
    {
        return RemoteError::NamespaceNotFound(namespace.to_string());
    }
    if status == StatusCode::NOT_FOUND {
        return RemoteError::NotFound;
    }
    RemoteError::Api {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consul_controller_core::ResourceType;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const PERMISSIONS: ResourceType = ResourceType {
        group: "auth",
        group_version: "v2beta1",
        kind: "TrafficPermissions",
    };

    fn id() -> ResourceId {
        ResourceId::new(
            PERMISSIONS,
            "web",
            Tenancy {
                namespace: "default".to_string(),
                partition: "default".to_string(),
                peer_name: "local".to_string(),
            },
        )
    }

    #[test]
    fn resource_urls() {
        let id = id();
        assert_eq!(
            format!("{}{}", resource_path(&id), tenancy_query(&id.tenancy)),
            "/api/auth/v2beta1/TrafficPermissions/web?partition=default&namespace=default&peer_name=local"
        );
    }

    #[test]
    fn entry_query_omits_empty_tenancy() {
        assert_eq!(entry_query("", "").to_string(), "");
        assert_eq!(entry_query("apps", "").to_string(), "?ns=apps");
        assert_eq!(
            entry_query("apps", "team-a").to_string(),
            "?ns=apps&partition=team-a"
        );
    }

    #[rstest]
    #[case(StatusCode::NOT_FOUND, "", "not found")]
    #[case(StatusCode::BAD_REQUEST, "Namespace \"apps\" not found", "consul namespace \"apps\" not found")]
    #[case(StatusCode::NOT_FOUND, "namespace does not exist", "consul namespace \"apps\" not found")]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, "namespace not found\n", "unexpected response from consul (500): namespace not found")]
    #[case(StatusCode::FORBIDDEN, "Permission denied", "unexpected response from consul (403): Permission denied")]
    fn classifies_errors(#[case] status: StatusCode, #[case] body: &str, #[case] expected: &str) {
        assert_eq!(classify(status, body.as_bytes(), "apps").to_string(), expected);
    }

    #[test]
    fn decodes_resources() {
        let body = serde_json::json!({
            "id": {
                "name": "web",
                "uid": "01HX",
                "type": {"group": "auth", "groupVersion": "v2beta1", "kind": "TrafficPermissions"},
                "tenancy": {"namespace": "default", "partition": "default", "peerName": "local"},
            },
            "metadata": {"external-source": "kubernetes"},
            "data": {"action": "ACTION_ALLOW"},
            "version": "42",
            "generation": "01HY",
        });
        let resource = decode_resource(&id(), body.to_string().as_bytes()).unwrap();
        assert_eq!(resource.id.uid, "01HX");
        assert_eq!(resource.id.ty, PERMISSIONS);
        assert_eq!(resource.id.tenancy, id().tenancy);
        assert!(meta::is_managed(&resource.metadata));
        assert_eq!(resource.data["action"], "ACTION_ALLOW");
        assert_eq!(resource.version, "42");
        assert_eq!(resource.status, None);
    }

    #[test]
    fn namespace_request() {
        let ns = NamespaceSpec {
            name: "k8s-apps".to_string(),
            partition: String::new(),
            cross_namespace_policy: Some("cross-namespace-policy".to_string()),
        };
        assert_eq!(
            serde_json::to_value(namespace_body(&ns)).unwrap(),
            serde_json::json!({
                "Name": "k8s-apps",
                "Description": "Auto-generated by consul-k8s",
                "ACLs": {"PolicyDefaults": [{"Name": "cross-namespace-policy"}]},
                "Meta": {"external-source": "kubernetes"},
            })
        );
    }

    #[test]
    fn peering_requests() {
        let body = PeeringRequest {
            peer_name: "dc2",
            peering_token: Some("abc"),
            partition: "",
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"PeerName": "dc2", "PeeringToken": "abc"})
        );
    }

    #[tokio::test]
    async fn builds_client() {
        let client = ConsulClient::new("consul-server:8500/", Some("secret")).unwrap();
        assert_eq!(client.base, "http://consul-server:8500");
        assert!(client.token.as_ref().unwrap().is_sensitive());

        let client = ConsulClient::new("http://consul.example.com", Some("")).unwrap();
        assert_eq!(client.base, "http://consul.example.com");
        assert!(client.token.is_none());

        let error = ConsulClient::new("https://consul.example.com", None).unwrap_err();
        assert_eq!(
            error.to_string(),
            r#"unsupported scheme "https" in Consul address; use an http:// address"#
        );
        assert!(matches!(
            ConsulClient::new("consul:8500", Some("bad\ntoken")),
            Err(ConfigError::Token(_))
        ));
    }
}
