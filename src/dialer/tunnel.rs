// Multiplexed agent tunnel: many logical connections over one agent websocket

use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{node_session_key, BoxConn, DialError};
use crate::models::cluster::ClusterRegistrationToken;
use crate::store::SharedStore;

pub const TOKEN_HEADER: &str = "X-API-Tunnel-Token";
pub const NODE_HEADER: &str = "X-API-Tunnel-Node";
pub const BY_TOKEN_INDEX: &str = "clusterRegistrationTokenByToken";

const HEADER_LEN: usize = 9;
const PIPE_BUFFER: usize = 64 * 1024;
const READ_CHUNK: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Connect = 1,
    Connected = 2,
    Data = 3,
    Close = 4,
    Error = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(b: u8) -> Result<Self, FrameError> {
        Ok(match b {
            1 => FrameKind::Connect,
            2 => FrameKind::Connected,
            3 => FrameKind::Data,
            4 => FrameKind::Close,
            5 => FrameKind::Error,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
}

/// `[u64 be connection id][u8 kind][payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub conn_id: u64,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(conn_id: u64, kind: FrameKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            conn_id,
            kind,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.conn_id.to_be_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated(buf.len()));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[..8]);
        Ok(Self {
            conn_id: u64::from_be_bytes(id),
            kind: FrameKind::try_from(buf[8])?,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

enum Inbound {
    Connected,
    Data(Vec<u8>),
    Close,
    Error(String),
}

/// One connected agent. Dials become `Connect` frames; the agent answers
/// `Connected` or `Error` and then both sides exchange `Data` until `Close`.
pub struct TunnelSession {
    key: String,
    outbound: mpsc::Sender<Frame>,
    conns: Mutex<HashMap<u64, mpsc::Sender<Inbound>>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl TunnelSession {
    pub fn new(key: impl Into<String>, outbound: mpsc::Sender<Frame>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            outbound,
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn active_connections(&self) -> usize {
        self.conns.lock().len()
    }

    pub async fn dial(self: &Arc<Self>, network: &str, address: &str, timeout: Duration) -> io::Result<BoxConn> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "tunnel session closed"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel(64);
        self.conns.lock().insert(id, tx);

        let connect = Frame::new(id, FrameKind::Connect, format!("{}://{}", network, address));
        if self.outbound.send(connect).await.is_err() {
            self.conns.lock().remove(&id);
            return Err(io::Error::new(io::ErrorKind::NotConnected, "tunnel session closed"));
        }

        let reply = tokio::time::timeout(timeout, rx.recv()).await;
        match reply {
            Ok(Some(Inbound::Connected)) => {}
            Ok(Some(Inbound::Error(msg))) => {
                self.conns.lock().remove(&id);
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, msg));
            }
            Ok(_) => {
                self.conns.lock().remove(&id);
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel closed during dial"));
            }
            Err(_) => {
                self.conns.lock().remove(&id);
                let _ = self.outbound.try_send(Frame::new(id, FrameKind::Close, Vec::new()));
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {} through {} timed out", address, self.key),
                ));
            }
        }

        let (local, remote) = tokio::io::duplex(PIPE_BUFFER);
        tokio::spawn(pump(self.clone(), id, remote, rx));
        Ok(Box::new(local))
    }

    /// Routes a frame received from the agent.
    pub async fn handle_frame(&self, frame: Frame) {
        let inbound = match frame.kind {
            FrameKind::Connected => Inbound::Connected,
            FrameKind::Data => Inbound::Data(frame.payload),
            FrameKind::Close => Inbound::Close,
            FrameKind::Error => Inbound::Error(String::from_utf8_lossy(&frame.payload).into_owned()),
            FrameKind::Connect => {
                let reply = Frame::new(frame.conn_id, FrameKind::Error, "connect is not accepted from agents");
                let _ = self.outbound.send(reply).await;
                return;
            }
        };
        let target = self.conns.lock().get(&frame.conn_id).cloned();
        match target {
            Some(tx) => {
                if tx.send(inbound).await.is_err() {
                    self.conns.lock().remove(&frame.conn_id);
                }
            }
            None => debug!(session = %self.key, conn = frame.conn_id, "frame for unknown connection"),
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
        self.conns.lock().clear();
    }
}

async fn pump(
    session: Arc<TunnelSession>,
    id: u64,
    remote: tokio::io::DuplexStream,
    mut rx: mpsc::Receiver<Inbound>,
) {
    let (mut rd, mut wr) = tokio::io::split(remote);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut notify_close = true;
    loop {
        tokio::select! {
            n = rd.read(&mut buf) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = Frame::new(id, FrameKind::Data, buf[..n].to_vec());
                    if session.outbound.send(frame).await.is_err() {
                        notify_close = false;
                        break;
                    }
                }
            },
            msg = rx.recv() => match msg {
                Some(Inbound::Data(data)) => {
                    if wr.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(Inbound::Connected) => {}
                Some(Inbound::Close) | Some(Inbound::Error(_)) | None => {
                    notify_close = false;
                    break;
                }
            },
            _ = session.closed.cancelled() => {
                notify_close = false;
                break;
            }
        }
    }
    let _ = wr.shutdown().await;
    session.conns.lock().remove(&id);
    if notify_close {
        let _ = session.outbound.send(Frame::new(id, FrameKind::Close, Vec::new())).await;
    }
}

/// Registry of live agent sessions, keyed by cluster name or `cluster:machine`.
#[derive(Clone, Default)]
pub struct TunnelServer {
    sessions: Arc<RwLock<HashMap<String, Arc<TunnelSession>>>>,
}

impl TunnelServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins a new session under `key`, replacing (and closing) any previous one.
    pub fn register(&self, key: &str, outbound: mpsc::Sender<Frame>) -> Arc<TunnelSession> {
        let session = TunnelSession::new(key, outbound);
        if let Some(old) = self.sessions.write().insert(key.to_string(), session.clone()) {
            old.close();
        }
        session
    }

    /// Drops the session only if it is still the one registered under `key`.
    pub fn remove(&self, key: &str, session: &Arc<TunnelSession>) {
        let mut sessions = self.sessions.write();
        if sessions.get(key).map_or(false, |s| Arc::ptr_eq(s, session)) {
            sessions.remove(key);
        }
    }

    pub fn session(&self, key: &str) -> Option<Arc<TunnelSession>> {
        self.sessions.read().get(key).filter(|s| !s.is_closed()).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one agent connection until either direction ends.
    pub async fn serve<I, O>(&self, key: &str, mut incoming: I, mut outgoing: O)
    where
        I: Stream<Item = Vec<u8>> + Unpin,
        O: Sink<Vec<u8>> + Unpin,
    {
        let (tx, mut rx) = mpsc::channel::<Frame>(256);
        let session = self.register(key, tx);
        info!(session = key, "agent connected");

        let writer = async {
            while let Some(frame) = rx.recv().await {
                if outgoing.send(frame.encode()).await.is_err() {
                    break;
                }
            }
        };
        let reader = async {
            while let Some(bytes) = incoming.next().await {
                match Frame::decode(&bytes) {
                    Ok(frame) => session.handle_frame(frame).await,
                    Err(e) => {
                        warn!(session = key, "dropping agent connection: {}", e);
                        break;
                    }
                }
            }
        };
        tokio::select! {
            _ = writer => {}
            _ = reader => {}
        }

        session.close();
        self.remove(key, &session);
        info!(session = key, "agent disconnected");
    }
}

/// Registers the token index used by `authorize`.
pub fn index_registration_tokens(tokens: &SharedStore<ClusterRegistrationToken>) {
    tokens.add_index(
        BY_TOKEN_INDEX,
        Arc::new(|t: &ClusterRegistrationToken| {
            if t.status.token.is_empty() {
                vec![]
            } else {
                vec![t.status.token.clone()]
            }
        }),
    );
}

/// Maps agent credentials to a session key: the cluster name for cluster
/// agents, `cluster:machine` for node agents.
pub async fn authorize(
    tokens: &SharedStore<ClusterRegistrationToken>,
    token: &str,
    node: Option<&str>,
) -> Result<String, DialError> {
    if token.is_empty() {
        return Err(DialError::Unauthorized);
    }
    let found = tokens.by_index(BY_TOKEN_INDEX, token).await?;
    let record = found.into_iter().next().ok_or(DialError::Unauthorized)?;
    let cluster = record.metadata.namespace;
    Ok(match node {
        Some(machine) if !machine.is_empty() => node_session_key(&cluster, machine),
        _ => cluster,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObjectMeta;
    use crate::store::MemoryStore;

    /// Answers every connect and echoes data back.
    fn spawn_echo_agent(session: Arc<TunnelSession>, mut rx: mpsc::Receiver<Frame>) {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let reply = match frame.kind {
                    FrameKind::Connect if frame.payload.ends_with(b"refused:1") => {
                        Frame::new(frame.conn_id, FrameKind::Error, "connection refused")
                    }
                    FrameKind::Connect => Frame::new(frame.conn_id, FrameKind::Connected, Vec::new()),
                    FrameKind::Data => Frame::new(frame.conn_id, FrameKind::Data, frame.payload),
                    _ => continue,
                };
                session.handle_frame(reply).await;
            }
        });
    }

    #[test]
    fn frame_decode_rejects_garbage() {
        assert_eq!(Frame::decode(&[0, 1]), Err(FrameError::Truncated(2)));
        let mut buf = Frame::new(7, FrameKind::Data, b"x".to_vec()).encode();
        buf[8] = 42;
        assert_eq!(Frame::decode(&buf), Err(FrameError::UnknownKind(42)));
    }

    #[tokio::test]
    async fn dial_round_trips_bytes() {
        let (tx, rx) = mpsc::channel(16);
        let session = TunnelSession::new("c-1", tx);
        spawn_echo_agent(session.clone(), rx);

        let mut conn = session
            .dial("tcp", "10.0.0.1:443", Duration::from_secs(1))
            .await
            .unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn dial_surfaces_agent_error() {
        let (tx, rx) = mpsc::channel(16);
        let session = TunnelSession::new("c-1", tx);
        spawn_echo_agent(session.clone(), rx);

        let err = session
            .dial("tcp", "refused:1", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(session.active_connections(), 0);
    }

    #[tokio::test]
    async fn register_replaces_previous_session() {
        let server = TunnelServer::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        let first = server.register("c-1", tx1);
        let second = server.register("c-1", tx2);
        assert!(first.is_closed());

        server.remove("c-1", &first);
        assert!(server.session("c-1").is_some());
        server.remove("c-1", &second);
        assert!(server.session("c-1").is_none());
    }

    #[tokio::test]
    async fn authorize_maps_token_to_session_key() {
        let tokens: SharedStore<ClusterRegistrationToken> = Arc::new(MemoryStore::new());
        index_registration_tokens(&tokens);
        let mut record = ClusterRegistrationToken {
            metadata: ObjectMeta::namespaced("c-7", "default-token"),
            ..Default::default()
        };
        record.status.token = "secret".into();
        tokens.create(record).await.unwrap();

        assert_eq!(authorize(&tokens, "secret", None).await.unwrap(), "c-7");
        assert_eq!(authorize(&tokens, "secret", Some("m-1")).await.unwrap(), "c-7:m-1");
        assert!(matches!(
            authorize(&tokens, "wrong", None).await,
            Err(DialError::Unauthorized)
        ));
    }
}
