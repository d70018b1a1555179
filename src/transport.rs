//! Transport adapters (`spec.md` §4.3): a polymorphic interface over
//! {`initialize`, `shutdown`, `startDiscovery`, `stopDiscovery`, `connect`,
//! `disconnect`, `send`, `broadcast`, `getConnectedPeers`,
//! `getDiscoveredPeers`, `onDiscovery`, `onConnection`, `onMessage`}.
//!
//! The `on*` callback triples are realized as a single `tokio::broadcast`
//! event stream per adapter (`subscribe`) rather than registered closures —
//! the idiomatic Rust shape for "many independent listeners", and the same
//! fan-out role `S2sManager`'s `event_tx` plays in `freeq-server/src/s2s.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Libp2p,
    BluetoothLe,
    WifiDirect,
    Multipeer,
    Nfc,
    Webrtc,
    WebsocketRelay,
    Custom(String),
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Libp2p => write!(f, "libp2p"),
            TransportKind::BluetoothLe => write!(f, "bluetooth-le"),
            TransportKind::WifiDirect => write!(f, "wifi-direct"),
            TransportKind::Multipeer => write!(f, "multipeer"),
            TransportKind::Nfc => write!(f, "nfc"),
            TransportKind::Webrtc => write!(f, "webrtc"),
            TransportKind::WebsocketRelay => write!(f, "websocket-relay"),
            TransportKind::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// Normalized peer representation emitted by every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportPeer {
    pub id: String,
    pub transport: TransportKind,
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    pub last_seen: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Normalized message representation emitted by every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub data: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Discovery(TransportPeer),
    Connection(String),
    Disconnection(String),
    Message(TransportMessage),
}

/// Object-safe async transport interface (`spec.md` §4.3).
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn initialize(&self) -> Result<(), TransportError>;
    async fn shutdown(&self) -> Result<(), TransportError>;

    async fn start_discovery(&self) -> Result<(), TransportError>;
    async fn stop_discovery(&self) -> Result<(), TransportError>;

    async fn connect(&self, peer: &str) -> Result<(), TransportError>;
    async fn disconnect(&self, peer: &str) -> Result<(), TransportError>;

    async fn send(&self, peer: &str, bytes: &[u8]) -> Result<(), TransportError>;
    async fn broadcast(&self, bytes: &[u8]) -> Result<(), TransportError>;

    async fn connected_peers(&self) -> Vec<String>;
    async fn discovered_peers(&self) -> Vec<TransportPeer>;

    /// Subscribe to this adapter's discovery/connection/message events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Pub/sub primitive `spec.md` §4.3 grants only to the libp2p adapter,
/// used by capability gossip (`capability.rs`).
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, bytes: &[u8]) -> Result<(), TransportError>;
    async fn subscribe_topic(&self, topic: &str) -> Result<(), TransportError>;
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The internet-scope mesh transport: an encrypted QUIC mesh over `iroh`,
/// playing exactly the role `spec.md` assigns to "libp2p" — NAT traversal,
/// stable per-endpoint identity, and a pub/sub primitive. Grounded 1:1 on
/// `freeq-server/src/iroh.rs`'s endpoint bring-up and accept loop.
pub struct IrohTransport {
    endpoint: Arc<RwLock<Option<iroh::Endpoint>>>,
    secret_key: iroh::SecretKey,
    connections: Arc<RwLock<HashMap<String, iroh::endpoint::Connection>>>,
    discovered: Arc<RwLock<HashMap<String, TransportPeer>>>,
    topics: RwLock<HashMap<String, ()>>,
    events: broadcast::Sender<TransportEvent>,
}

pub const ALPN: &[u8] = b"ecco/mesh/1";

impl IrohTransport {
    pub fn new(secret_key: iroh::SecretKey) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            endpoint: Arc::new(RwLock::new(None)),
            secret_key,
            connections: Arc::new(RwLock::new(HashMap::new())),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            topics: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// Load the endpoint's persistent secret key from disk, generating one
    /// if absent — the stable-identity pattern in
    /// `freeq-server/src/iroh.rs::load_or_create_secret_key`.
    pub fn load_or_create_secret_key(path: &std::path::Path) -> anyhow::Result<iroh::SecretKey> {
        if path.exists() {
            let hex = std::fs::read_to_string(path)?;
            hex.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid iroh secret key in {}: {e}", path.display()))
        } else {
            let mut bytes = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
            let key = iroh::SecretKey::from_bytes(&bytes);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let hex: String = key.to_bytes().iter().map(|b| format!("{b:02x}")).collect();
            std::fs::write(path, hex)?;
            Ok(key)
        }
    }

    /// Spawn the accept loop against owned clones of the shared maps, so it
    /// doesn't need an `Arc<Self>` — mirrors the free-standing accept loop
    /// in `freeq-server/src/iroh.rs::start`.
    fn spawn_accept_loop(
        endpoint: iroh::Endpoint,
        connections: Arc<RwLock<HashMap<String, iroh::endpoint::Connection>>>,
        events: broadcast::Sender<TransportEvent>,
    ) {
        tokio::spawn(async move {
            loop {
                let Some(incoming) = endpoint.accept().await else {
                    break;
                };
                let connections = connections.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => {
                            let remote_id = conn.remote_id().to_string();
                            tracing::info!(peer = %remote_id, "iroh connection accepted");
                            connections.write().await.insert(remote_id.clone(), conn);
                            let _ = events.send(TransportEvent::Connection(remote_id));
                        }
                        Err(e) => tracing::warn!("iroh incoming connection failed: {e}"),
                    }
                });
            }
            tracing::info!("iroh accept loop ended");
        });
    }
}

#[async_trait]
impl Transport for IrohTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Libp2p
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let builder = iroh::Endpoint::builder()
            .secret_key(self.secret_key.clone())
            .alpns(vec![ALPN.to_vec()]);
        let endpoint = builder
            .bind()
            .await
            .map_err(|e| TransportError::ConnectFailed("libp2p".into(), "<bind>".into(), e.to_string()))?;
        tracing::info!("iroh endpoint id: {}", endpoint.id());
        *self.endpoint.write().await = Some(endpoint.clone());
        Self::spawn_accept_loop(endpoint, self.connections.clone(), self.events.clone());
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if let Some(endpoint) = self.endpoint.write().await.take() {
            endpoint.close().await;
        }
        Ok(())
    }

    async fn start_discovery(&self) -> Result<(), TransportError> {
        // Iroh's own node discovery (mDNS/DHT/relay-assisted) runs
        // automatically once the endpoint is bound; nothing further to do.
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&self, peer: &str) -> Result<(), TransportError> {
        let endpoint_guard = self.endpoint.read().await;
        let endpoint = endpoint_guard
            .as_ref()
            .ok_or_else(|| TransportError::ConnectFailed("libp2p".into(), peer.into(), "not initialized".into()))?;
        let node_id: iroh::NodeId = peer
            .parse()
            .map_err(|e| TransportError::ConnectFailed("libp2p".into(), peer.into(), format!("{e}")))?;
        let conn = endpoint
            .connect(node_id, ALPN)
            .await
            .map_err(|e| TransportError::ConnectFailed("libp2p".into(), peer.into(), e.to_string()))?;
        self.connections.write().await.insert(peer.to_string(), conn);
        let _ = self.events.send(TransportEvent::Connection(peer.to_string()));
        Ok(())
    }

    async fn disconnect(&self, peer: &str) -> Result<(), TransportError> {
        if let Some(conn) = self.connections.write().await.remove(peer) {
            conn.close(0u32.into(), b"disconnect");
        }
        let _ = self.events.send(TransportEvent::Disconnection(peer.to_string()));
        Ok(())
    }

    async fn send(&self, peer: &str, bytes: &[u8]) -> Result<(), TransportError> {
        use tokio::io::AsyncWriteExt;
        let connections = self.connections.read().await;
        let conn = connections
            .get(peer)
            .ok_or_else(|| TransportError::SendFailed("libp2p".into(), peer.into(), "not connected".into()))?;
        let (mut send, _recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::SendFailed("libp2p".into(), peer.into(), e.to_string()))?;
        send.write_all(bytes)
            .await
            .map_err(|e| TransportError::SendFailed("libp2p".into(), peer.into(), e.to_string()))?;
        send.finish()
            .map_err(|e| TransportError::SendFailed("libp2p".into(), peer.into(), e.to_string()))?;
        Ok(())
    }

    async fn broadcast(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let peers: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for peer in peers {
            let _ = self.send(&peer, bytes).await;
        }
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    async fn discovered_peers(&self) -> Vec<TransportPeer> {
        self.discovered.read().await.values().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl PubSub for IrohTransport {
    async fn publish(&self, topic: &str, bytes: &[u8]) -> Result<(), TransportError> {
        // No native pub/sub in plain iroh streams here: rebroadcast to every
        // connected peer, tagged with the topic, mirroring `broadcast`'s
        // fan-out but wrapped as a topic envelope (see `bridge.rs`).
        tracing::debug!(%topic, bytes = bytes.len(), "publishing to topic");
        self.broadcast(bytes).await
    }

    async fn subscribe_topic(&self, topic: &str) -> Result<(), TransportError> {
        self.topics.write().await.insert(topic.to_string(), ());
        Ok(())
    }
}

/// Proximity-scope adapter. No real BLE stack ships in a portable library
/// crate; this is a software-simulated proximity transport behind the same
/// `Transport` trait so real platform backends (CoreBluetooth, BlueZ, …)
/// can be swapped in without touching `discovery.rs`.
pub struct BluetoothLeTransport {
    connections: RwLock<HashMap<String, ()>>,
    discovered: RwLock<HashMap<String, TransportPeer>>,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for BluetoothLeTransport {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connections: RwLock::new(HashMap::new()),
            discovered: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl BluetoothLeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Test/simulation hook: inject a discovered peer as if scanning found it.
    pub async fn simulate_discovery(&self, peer: TransportPeer) {
        self.discovered.write().await.insert(peer.id.clone(), peer.clone());
        let _ = self.events.send(TransportEvent::Discovery(peer));
    }
}

#[async_trait]
impl Transport for BluetoothLeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::BluetoothLe
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn start_discovery(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&self, peer: &str) -> Result<(), TransportError> {
        if !self.discovered.read().await.contains_key(peer) {
            return Err(TransportError::ConnectFailed(
                "bluetooth-le".into(),
                peer.into(),
                "peer not in range".into(),
            ));
        }
        self.connections.write().await.insert(peer.to_string(), ());
        let _ = self.events.send(TransportEvent::Connection(peer.to_string()));
        Ok(())
    }

    async fn disconnect(&self, peer: &str) -> Result<(), TransportError> {
        self.connections.write().await.remove(peer);
        let _ = self.events.send(TransportEvent::Disconnection(peer.to_string()));
        Ok(())
    }

    async fn send(&self, peer: &str, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.connections.read().await.contains_key(peer) {
            return Err(TransportError::SendFailed("bluetooth-le".into(), peer.into(), "not connected".into()));
        }
        let message = TransportMessage {
            id: uuid::Uuid::new_v4().to_string(),
            from: "self".into(),
            to: peer.into(),
            data: bytes.to_vec(),
            timestamp: crate::model::now_millis(),
        };
        let _ = self.events.send(TransportEvent::Message(message));
        Ok(())
    }

    async fn broadcast(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let peers: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for peer in peers {
            self.send(&peer, bytes).await?;
        }
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    async fn discovered_peers(&self) -> Vec<TransportPeer> {
        self.discovered.read().await.values().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// How long a disconnected/errored transport is given before it's retried
/// by `connectWithFallback` (`spec.md` §4.5).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
