// Dialer factory: how to reach a cluster's API server or a node's docker socket

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::models::cluster::{condition, driver, node_condition, Cluster, Node};
use crate::store::{SharedStore, StoreError};

pub mod tunnel;

pub use tunnel::{TunnelServer, TunnelSession};

pub const NATIVE_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const TUNNEL_DIAL_TIMEOUT: Duration = Duration::from_secs(15);
pub const LOCAL_API_ADDRESS: &str = "127.0.0.1:6443";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const DOCKER_PIPE: &str = "//./pipe/docker_engine";

pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxConn>;
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("waiting for cluster agent to connect")]
    WaitingForAgent,

    #[error("can not build dialer to [{0}]")]
    NoDialer(String),

    #[error("tunnel authentication failed")]
    Unauthorized,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Direct TCP (or unix socket) connections from this process.
#[derive(Debug, Clone)]
pub struct NativeDialer {
    timeout: Duration,
}

impl NativeDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for NativeDialer {
    fn default() -> Self {
        Self::new(NATIVE_DIAL_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for NativeDialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxConn> {
        match network {
            "tcp" | "tcp4" | "tcp6" => {
                let stream = tokio::time::timeout(self.timeout, TcpStream::connect(address))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial {} timed out", address)))??;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            "unix" => {
                let stream = tokio::net::UnixStream::connect(address).await?;
                Ok(Box::new(stream))
            }
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported network {}", other),
            )),
        }
    }
}

/// Dials through an agent's tunnel session, optionally rewriting one address.
pub struct TunnelDialer {
    session: Arc<TunnelSession>,
    timeout: Duration,
    rewrite: Option<(String, String)>,
}

impl TunnelDialer {
    pub fn new(session: Arc<TunnelSession>) -> Self {
        Self {
            session,
            timeout: TUNNEL_DIAL_TIMEOUT,
            rewrite: None,
        }
    }

    pub fn rewriting(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rewrite = Some((from.into(), to.into()));
        self
    }
}

#[async_trait]
impl Dialer for TunnelDialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<BoxConn> {
        let address = match &self.rewrite {
            Some((from, to)) if from == address => to.as_str(),
            _ => address,
        };
        self.session.dial(network, address, self.timeout).await
    }
}

/// Reaches the docker daemon of a node through the node agent's session.
pub struct DockerDialer {
    session: Arc<TunnelSession>,
    windows: bool,
}

#[async_trait]
impl Dialer for DockerDialer {
    async fn dial(&self, _network: &str, _address: &str) -> io::Result<BoxConn> {
        if self.windows {
            self.session.dial("npipe", DOCKER_PIPE, TUNNEL_DIAL_TIMEOUT).await
        } else {
            self.session.dial("unix", DOCKER_SOCKET, TUNNEL_DIAL_TIMEOUT).await
        }
    }
}

/// Session key of a node agent.
pub fn node_session_key(cluster: &str, machine: &str) -> String {
    format!("{}:{}", cluster, machine)
}

/// `host:port` of an API endpoint URL, defaulting the port to 443.
pub fn host_port(endpoint: &str) -> String {
    let rest = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint);
    let authority = rest.split('/').next().unwrap_or(rest);
    let has_port = match authority.rfind(':') {
        // IPv6 literals keep their colons inside brackets.
        Some(idx) => !authority[idx..].contains(']'),
        None => false,
    };
    if has_port {
        authority.to_string()
    } else {
        format!("{}:443", authority)
    }
}

fn is_cloud_driver(cluster: &Cluster) -> bool {
    !cluster.spec.internal
        && cluster.status.driver != driver::IMPORTED
        && cluster.status.driver != driver::RKE
        && cluster.status.driver != driver::LOCAL
        && !cluster.status.driver.is_empty()
}

/// Lookup-only factory producing dialers; safe to share across tasks.
#[derive(Clone)]
pub struct DialerFactory {
    clusters: SharedStore<Cluster>,
    nodes: SharedStore<Node>,
    tunnels: TunnelServer,
}

impl DialerFactory {
    pub fn new(clusters: SharedStore<Cluster>, nodes: SharedStore<Node>, tunnels: TunnelServer) -> Self {
        Self {
            clusters,
            nodes,
            tunnels,
        }
    }

    pub fn tunnels(&self) -> &TunnelServer {
        &self.tunnels
    }

    /// A dialer reaching the API server of `cluster_name`.
    pub async fn cluster_dialer(&self, cluster_name: &str) -> Result<Arc<dyn Dialer>, DialError> {
        let cluster = self.clusters.get("", cluster_name).await?;
        if cluster.spec.internal || cluster.status.driver == driver::LOCAL {
            return Ok(Arc::new(NativeDialer::default()));
        }

        let api_host_port = host_port(&cluster.status.api_endpoint);
        if is_cloud_driver(&cluster) {
            return Ok(Arc::new(NativeDialer::default()));
        }

        if let Some(session) = self.tunnels.session(cluster_name) {
            let mut dialer = TunnelDialer::new(session);
            if cluster.status.driver == driver::RKE {
                if let Some(target) = self.translate_cluster_address(&cluster, &api_host_port).await? {
                    dialer = dialer.rewriting(api_host_port, target);
                }
            }
            return Ok(Arc::new(dialer));
        }

        if cluster.status.driver != driver::RKE {
            return Err(DialError::WaitingForAgent);
        }

        // No cluster agent yet: go through a provisioned node's agent.
        for node in self.nodes.list(Some(cluster_name)).await? {
            if node.metadata.deletion_timestamp.is_some()
                || !node.status.conditions.is_true(node_condition::PROVISIONED)
            {
                continue;
            }
            let key = node_session_key(cluster_name, &node.metadata.name);
            if let Some(session) = self.tunnels.session(&key) {
                debug!(cluster = cluster_name, node = %node.metadata.name, "dialing cluster through node agent");
                return Ok(Arc::new(
                    TunnelDialer::new(session).rewriting(api_host_port, LOCAL_API_ADDRESS),
                ));
            }
        }

        Err(DialError::WaitingForAgent)
    }

    /// A dialer reaching the docker daemon of one machine.
    pub async fn docker_dialer(&self, cluster_name: &str, machine_name: &str) -> Result<Arc<dyn Dialer>, DialError> {
        let key = node_session_key(cluster_name, machine_name);
        let session = self
            .tunnels
            .session(&key)
            .ok_or_else(|| DialError::NoDialer(key.clone()))?;
        let windows = match self.nodes.get_opt(cluster_name, machine_name).await? {
            Some(node) => node.is_windows(),
            None => false,
        };
        Ok(Arc::new(DockerDialer { session, windows }))
    }

    /// While the cluster is not ready, prefer the private address of a healthy
    /// node over the published API endpoint.
    async fn translate_cluster_address(
        &self,
        cluster: &Cluster,
        api_host_port: &str,
    ) -> Result<Option<String>, DialError> {
        if cluster.status.conditions.is_true(condition::READY) {
            return Ok(None);
        }
        let port = api_host_port.rsplit(':').next().unwrap_or("443");
        let nodes = self.nodes.list(Some(cluster.name())).await?;
        let target = nodes
            .iter()
            .filter(|n| {
                n.status.conditions.is_true(node_condition::REGISTERED)
                    && n.status.conditions.is_true(node_condition::PROVISIONED)
                    && n.status.ready
                    && !n.status.internal_ip.is_empty()
            })
            .find(|n| {
                n.status
                    .node_config
                    .as_ref()
                    .map_or(false, |c| c.has_role("controlplane"))
            })
            .map(|n| format!("{}:{}", n.status.internal_ip, port));
        Ok(target)
    }
}
