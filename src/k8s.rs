//! Cluster metadata client (spec §6, ambient per SPEC_FULL §A.6): fetches
//! the owning pod's labels, node name, and `logflow.io/conf[_<cname>]`
//! annotation once per container, over HTTPS with the in-cluster service
//! account token and CA bundle.
//!
//! Grounded on `original_source/kubectl.go` (`init`, `getPod`): same
//! `KUBERNETES_SERVICE_HOST`/`_PORT` discovery, same token/CA mount paths,
//! 404 → no metadata (non-kubernetes or already-gone pod). Transport is
//! `hyper` + `hyper-openssl`, matching `vector`'s HTTP client stack rather
//! than `reqwest`.

use std::fs;

use hyper::client::{Client, HttpConnector};
use hyper::{Body, Method, Request, StatusCode};
use hyper_openssl::HttpsConnector;
use openssl::ssl::{SslConnector, SslMethod};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;
use serde::Deserialize;
use serde_json::{Map, Value};

const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const ANNOTATION_NAME: &str = "logflow.io/conf";

#[derive(Deserialize, Default)]
struct PodMetadata {
    #[serde(default)]
    labels: Map<String, Value>,
    #[serde(default)]
    annotations: Map<String, Value>,
}

#[derive(Deserialize, Default)]
struct PodSpec {
    #[serde(rename = "nodeName", default)]
    node_name: Option<String>,
}

#[derive(Deserialize, Default)]
struct Pod {
    #[serde(default)]
    metadata: PodMetadata,
    #[serde(default)]
    spec: PodSpec,
}

pub struct MetadataClient {
    client: Option<Client<HttpsConnector<HttpConnector>>>,
    base: String,
    auth: String,
}

impl MetadataClient {
    /// A client with no transport configured: every [`fetch`](Self::fetch)
    /// call returns bare filename-derived identity fields only. Used when
    /// cluster discovery fails so metadata stays best-effort rather than
    /// fatal.
    pub fn unavailable() -> Self {
        MetadataClient { client: None, base: String::new(), auth: String::new() }
    }

    /// Reads the in-cluster token/CA bundle once. `Ok(None)` (a client
    /// with no base/token) when `KUBERNETES_SERVICE_HOST`/`_PORT` aren't
    /// set — the non-kubernetes environment the original treats as
    /// `errNonKubernetes`.
    pub fn discover() -> std::io::Result<Self> {
        let (host, port) = (std::env::var("KUBERNETES_SERVICE_HOST"), std::env::var("KUBERNETES_SERVICE_PORT"));
        let (Ok(host), Ok(port)) = (host, port) else {
            return Ok(MetadataClient { client: None, base: String::new(), auth: String::new() });
        };

        let token = fs::read_to_string(TOKEN_PATH)?;
        let ca_pem = fs::read(CA_PATH)?;
        let ca = X509::from_pem(&ca_pem).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut builder = SslConnector::builder(SslMethod::tls()).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let mut store = X509StoreBuilder::new().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        store.add_cert(ca).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        builder.set_cert_store(store.build());

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let https = HttpsConnector::with_connector(http, builder).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        Ok(MetadataClient {
            client: Some(Client::builder().build(https)),
            base: format!("https://{host}:{port}/api/v1"),
            auth: format!("Bearer {}", token.trim()),
        })
    }

    /// Fetches `{pod, namespace, container_name, container_id, labels,
    /// nodename, annotation?}` for the container identified by
    /// `log_file_stem` (spec §6). Returns `Ok(None)` when running outside
    /// a cluster, the pod is gone (404), or any transient error occurs —
    /// metadata is best-effort, never fatal to the spool it's attached to.
    pub async fn fetch(&self, identity: &crate::identity::ContainerIdentity, dot_replacer: &str, container_name: &str) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("pod".into(), identity.pod.clone().into());
        out.insert("namespace".into(), identity.namespace.clone().into());
        out.insert("container_name".into(), identity.container_name.clone().into());
        out.insert("container_id".into(), identity.container_id.clone().into());

        let Some(client) = &self.client else { return out };

        match self.get_pod(client, &identity.namespace, &identity.pod).await {
            Ok(Some(pod)) => {
                let labels = relabel(pod.metadata.labels, dot_replacer);
                out.insert("labels".into(), Value::Object(labels));
                if let Some(node) = pod.spec.node_name {
                    out.insert("nodename".into(), node.into());
                }
                if let Some(conf) = select_annotation(&pod.metadata.annotations, container_name) {
                    out.insert("annotation".into(), conf.into());
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(pod = %identity.pod, namespace = %identity.namespace, error = %e, "failed to fetch pod metadata"),
        }
        out
    }

    async fn get_pod(&self, client: &Client<HttpsConnector<HttpConnector>>, namespace: &str, pod: &str) -> Result<Option<Pod>, hyper::Error> {
        let uri: http::Uri = format!("{}/namespaces/{namespace}/pods/{pod}", self.base).parse().expect("valid pod metadata uri");
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("authorization", self.auth.clone())
            .body(Body::empty())
            .expect("well-formed metadata request");
        let resp = client.request(req).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::OK => {
                let bytes = hyper::body::to_bytes(resp.into_body()).await?;
                match serde_json::from_slice::<Pod>(&bytes) {
                    Ok(pod) => Ok(Some(pod)),
                    Err(_) => Ok(None),
                }
            }
            other => {
                tracing::warn!(status = %other, "unexpected status fetching pod metadata");
                Ok(None)
            }
        }
    }
}

/// Pod label keys containing `.` are rewritten with `dot_replacer` before
/// being embedded in `.k8s` (SPEC_FULL §B, `original_source/logdir.go`'s
/// `dotAlt`).
fn relabel(labels: Map<String, Value>, dot_replacer: &str) -> Map<String, Value> {
    if dot_replacer.is_empty() {
        return labels;
    }
    let mut out = Map::new();
    for (k, v) in labels {
        let key = if k.contains('.') { k.replace('.', dot_replacer) } else { k };
        out.insert(key, v);
    }
    out
}

/// Prefers `logflow.io/conf_<container_name>` over the bare
/// `logflow.io/conf` key (SPEC_FULL §B, `a8nName`).
fn select_annotation(annotations: &Map<String, Value>, container_name: &str) -> Option<String> {
    let scoped = format!("{ANNOTATION_NAME}_{container_name}");
    annotations.get(&scoped).or_else(|| annotations.get(ANNOTATION_NAME)).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relabel_replaces_dots() {
        let mut labels = Map::new();
        labels.insert("app.kubernetes.io/name".into(), "x".into());
        let out = relabel(labels, "_");
        assert!(out.contains_key("app_kubernetes_io/name"));
    }

    #[test]
    fn select_annotation_prefers_container_scoped_key() {
        let mut ann = Map::new();
        ann.insert("logflow.io/conf".into(), "format = json".into());
        ann.insert("logflow.io/conf_sidecar".into(), "format = none".into());
        assert_eq!(select_annotation(&ann, "sidecar").unwrap(), "format = none");
        assert_eq!(select_annotation(&ann, "main").unwrap(), "format = json");
    }
}
