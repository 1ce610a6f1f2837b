// Per-cluster reverse proxy handlers, built once per endpoint and CA

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, Uri};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use corral::auth::{IMPERSONATE_GROUP_HEADER, IMPERSONATE_USER_HEADER};
use corral::dialer::{host_port, BoxConn};
use corral::models::cluster::Cluster;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};

pub const CLUSTER_PREFIX: &str = "/k8s/clusters/";
pub const CLUSTER_ID_HEADER: &str = "X-API-Cluster-Id";

/// Target cluster and the path to forward, from `/k8s/clusters/<id>/<path>`
/// or, for any other path, the `X-API-Cluster-Id` header.
pub fn route_target(uri: &Uri, headers: &HeaderMap) -> Option<(String, String)> {
    let path = uri.path();
    if let Some(rest) = path.strip_prefix(CLUSTER_PREFIX) {
        let (id, tail) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        return (!id.is_empty()).then(|| (id.to_string(), tail.to_string()));
    }
    headers
        .get(CLUSTER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|id| (id.to_string(), path.to_string()))
}

/// Host part of `host:port`, IPv6 brackets removed.
fn host_of(host_port: &str) -> &str {
    let host = match host_port.rsplit_once(':') {
        Some((host, _)) => host,
        None => host_port,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

fn fingerprint(cluster: &Cluster) -> String {
    format!(
        "{}|{}|{}",
        cluster.status.api_endpoint, cluster.status.ca_cert, cluster.status.service_account_token
    )
}

fn tls_connector(cluster: &Cluster) -> Result<TlsConnector> {
    let invalid = |msg: String| GatewayError::InvalidCa(cluster.name().to_string(), msg);
    if cluster.status.ca_cert.is_empty() {
        return Err(invalid("no CA certificate recorded".to_string()));
    }
    let pem = STANDARD
        .decode(cluster.status.ca_cert.trim())
        .map_err(|e| invalid(e.to_string()))?;

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(&pem) {
        let cert = cert.map_err(|e| invalid(e.to_string()))?;
        roots.add(cert).map_err(|e| invalid(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(invalid("bundle holds no certificates".to_string()));
    }

    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| invalid(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Forwards requests to one cluster's API server over a dialed connection,
/// trusting the cluster CA and authenticating as its service account.
pub struct ClusterProxy {
    cluster: String,
    host_port: String,
    server_name: ServerName<'static>,
    tls: Option<TlsConnector>,
    bearer: String,
    fingerprint: String,
}

impl std::fmt::Debug for ClusterProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterProxy")
            .field("cluster", &self.cluster)
            .field("host_port", &self.host_port)
            .finish_non_exhaustive()
    }
}

impl ClusterProxy {
    pub fn build(cluster: &Cluster) -> Result<Self> {
        let endpoint = &cluster.status.api_endpoint;
        if endpoint.is_empty() {
            return Err(GatewayError::NoEndpoint(cluster.name().to_string()));
        }
        let host_port = host_port(endpoint);
        let server_name = ServerName::try_from(host_of(&host_port).to_string())
            .map_err(|e| GatewayError::BadRequest(format!("invalid endpoint {}: {}", endpoint, e)))?;
        let tls = if endpoint.starts_with("http://") {
            None
        } else {
            Some(tls_connector(cluster)?)
        };

        Ok(Self {
            cluster: cluster.name().to_string(),
            host_port,
            server_name,
            tls,
            bearer: cluster.status.service_account_token.clone(),
            fingerprint: fingerprint(cluster),
        })
    }

    /// Address to dial for this cluster's API server.
    pub fn address(&self) -> &str {
        &self.host_port
    }

    /// Sends `req` to `path` on the cluster, replacing caller credentials with
    /// the service-account token and the impersonation headers in `identity`.
    pub async fn forward(
        &self,
        conn: BoxConn,
        mut req: Request<Body>,
        path: &str,
        identity: &[(&'static str, String)],
    ) -> Result<Response<Body>> {
        let target = match req.uri().query() {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        };
        *req.uri_mut() = target
            .parse()
            .map_err(|e| GatewayError::BadRequest(format!("invalid path {}: {}", target, e)))?;

        let header_value = |value: &str| {
            HeaderValue::from_str(value).map_err(|e| GatewayError::BadRequest(e.to_string()))
        };
        let headers = req.headers_mut();
        for name in [
            header::AUTHORIZATION.as_str(),
            header::COOKIE.as_str(),
            CLUSTER_ID_HEADER,
            IMPERSONATE_USER_HEADER,
            IMPERSONATE_GROUP_HEADER,
        ] {
            headers.remove(name);
        }
        headers.insert(header::HOST, header_value(&self.host_port)?);
        if !self.bearer.is_empty() {
            headers.insert(header::AUTHORIZATION, header_value(&format!("Bearer {}", self.bearer))?);
        }
        for (name, value) in identity {
            headers.append(*name, header_value(value)?);
        }

        let response = match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connect(self.server_name.clone(), conn)
                    .await
                    .map_err(|e| self.upstream(e))?;
                self.send(TokioIo::new(stream), req).await?
            }
            None => self.send(TokioIo::new(conn), req).await?,
        };
        Ok(response.map(Body::new))
    }

    async fn send<I>(&self, io: I, req: Request<Body>) -> Result<Response<Incoming>>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| self.upstream(e))?;
        let cluster = self.cluster.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(cluster = %cluster, "upstream connection closed: {}", e);
            }
        });
        sender.send_request(req).await.map_err(|e| self.upstream(e))
    }

    fn upstream(&self, e: impl std::fmt::Display) -> GatewayError {
        GatewayError::Upstream(self.cluster.clone(), e.to_string())
    }
}

/// Proxy handlers by cluster name, rebuilt when the endpoint, CA or token
/// of the cluster changes.
#[derive(Clone, Default)]
pub struct ProxyCache {
    proxies: Arc<RwLock<HashMap<String, Arc<ClusterProxy>>>>,
}

impl ProxyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self, cluster: &Cluster) -> Result<Arc<ClusterProxy>> {
        let current = fingerprint(cluster);
        if let Some(proxy) = self.proxies.read().get(cluster.name()) {
            if proxy.fingerprint == current {
                return Ok(proxy.clone());
            }
        }

        let proxy = Arc::new(ClusterProxy::build(cluster)?);
        info!(cluster = %cluster.name(), endpoint = %cluster.status.api_endpoint, "built cluster proxy");
        self.proxies
            .write()
            .insert(cluster.name().to_string(), proxy.clone());
        Ok(proxy)
    }

    pub fn evict(&self, cluster: &str) {
        self.proxies.write().remove(cluster);
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
