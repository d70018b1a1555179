//! Node lifecycle (`spec.md` §4.11): the composition root that wires
//! identity, state, storage, transports, and every subsystem into one
//! running peer, in the strict start/stop order the spec mandates.
//!
//! Grounded on `freeq-server/src/main.rs` + `server.rs`'s startup
//! sequencing and logging style — one `info!` per stage, early-return on
//! the first fatal error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use crate::bridge::{Bridge, BridgeCallbacks, BridgeSettings};
use crate::capability::{CapabilityProtocol, CapabilityProvider};
use crate::config::NodeConfig;
use crate::discovery::HybridDiscovery;
use crate::error::EccoError;
use crate::flood::FloodProtection;
use crate::identity::Identity;
use crate::matcher::{match_peers, CapabilityQuery};
use crate::model::{now_millis, Capability, ConstitutionHash, Event, Message, Payload, PeerInfo, SettlementIntent};
use crate::persistence::Store;
use crate::registry::RegistryClient;
use crate::reputation::ReputationTracker;
use crate::settlement::{PaymentGateway, SettlementWorker};
use crate::state::{NodeState, StateRef};
use crate::transport::{BluetoothLeTransport, IrohTransport, PubSub, Transport, TransportEvent, TransportKind};
use crate::PROTOCOL_VERSION;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const TRANSPORT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Evicts the stalest entry from the validated peer registry once
/// `memory_limits.max_peers` is reached, the same oldest-`lastSeen` policy
/// `discovery.rs`'s `evict_oldest` applies to `discoveredPeers`.
fn evict_oldest_peer(map: &mut HashMap<String, PeerInfo>) {
    if let Some(oldest_key) = map.iter().min_by_key(|(_, p)| p.last_seen).map(|(k, _)| k.clone()) {
        map.remove(&oldest_key);
    }
}

fn ecco_dir(node_id: Option<&str>, sub: &str, file_ext: &str) -> std::path::PathBuf {
    let base = dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
    base.join(".ecco").join(sub).join(format!("{}.{file_ext}", node_id.unwrap_or("default")))
}

/// A running node. Holds every subsystem built during `start`; `stop`
/// unwinds them in the order `spec.md` §4.11 prescribes.
pub struct Node {
    config: NodeConfig,
    identity: Arc<Identity>,
    state: StateRef,
    store: Arc<Store>,
    bridge: Arc<Bridge>,
    discovery: Arc<HybridDiscovery>,
    capability: Arc<CapabilityProtocol<IrohTransport>>,
    registry: Option<Arc<RegistryClient>>,
    flood: Arc<FloodProtection>,
    settlement: SettlementWorker,
    settlement_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    reputation: Arc<ReputationTracker>,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    listener_handles: Vec<tokio::task::JoinHandle<()>>,
    events: broadcast::Sender<Event>,
}

impl Node {
    /// Brings up a node end to end: storage → identity → libp2p → bridge +
    /// discovery → event listeners → capability subscriptions → bootstrap
    /// dial → capability announcement (`spec.md` §4.11, strict order).
    pub async fn start(config: NodeConfig, gateway: Arc<dyn PaymentGateway>) -> Result<Arc<Node>, EccoError> {
        let node_id = config.node_id.as_deref();

        // ── storage init ──────────────────────────────────────────────
        let store_path = ecco_dir(node_id, "state", "sqlite3");
        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EccoError::Config(e.to_string()))?;
        }
        let store = Arc::new(Store::open(&store_path).map_err(|e| EccoError::Config(e.to_string()))?);
        tracing::info!(path = %store_path.display(), "storage initialized");

        let state = StateRef::new(NodeState::default());
        let reputation = Arc::new(ReputationTracker::new(state.clone()));
        reputation.load_from(&store).await?;

        let (settlement, settlement_handle) = SettlementWorker::spawn(state.clone(), store.clone(), gateway);
        for intent in store.load_pending_intents().map_err(|e| EccoError::Config(e.to_string()))? {
            settlement.enqueue(intent).await?;
        }

        // ── auth setup ────────────────────────────────────────────────
        let key_path = config.key_path();
        let identity = Arc::new(Identity::load_or_generate(&key_path, config.authentication.generate_keys)?);
        tracing::info!(peer_id = %identity.peer_id(), "identity ready");

        // ── libp2p start ──────────────────────────────────────────────
        let iroh_key_path = ecco_dir(node_id, "iroh", "key");
        let secret_key = IrohTransport::load_or_create_secret_key(&iroh_key_path)
            .map_err(|e| EccoError::Config(e.to_string()))?;
        let iroh = IrohTransport::new(secret_key);
        iroh.initialize().await?;

        let mut transports: HashMap<TransportKind, Arc<dyn Transport>> = HashMap::new();
        transports.insert(TransportKind::Libp2p, iroh.clone() as Arc<dyn Transport>);

        if config.proximity.bluetooth.enabled {
            let ble = BluetoothLeTransport::new();
            ble.initialize().await?;
            transports.insert(TransportKind::BluetoothLe, ble as Arc<dyn Transport>);
        }
        tracing::info!(count = transports.len(), "transports initialized");

        // ── transport bridge + hybrid discovery setup ───────────────────
        let network_id = config.network_id.clone().unwrap_or_else(|| "ecco-default".to_string());
        let protocol_version = config.protocol_version.unwrap_or(PROTOCOL_VERSION);
        let constitution_hash = config
            .constitution
            .as_ref()
            .map(|c| ConstitutionHash { hash: c.hash.clone(), version: c.version.clone() })
            .unwrap_or_else(|| ConstitutionHash { hash: String::new(), version: None });

        let settings = BridgeSettings {
            enforcement_level: config.enforcement_level,
            protocol_version,
            min_remote_version: protocol_version,
            network_id,
            constitution_hash,
            upgrade_url: None,
        };

        let discovery_for_send = Arc::new(std::sync::OnceLock::<Arc<HybridDiscovery>>::new());
        let send_handle = discovery_for_send.clone();
        let send: Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, Result<(), crate::error::BridgeError>> + Send + Sync> =
            Arc::new(move |peer: String, bytes: Vec<u8>| {
                let handle = send_handle.clone();
                Box::pin(async move {
                    match handle.get() {
                        Some(discovery) => discovery.send_with_fallback(&peer, &bytes).await.map(|_| ()).map_err(crate::error::BridgeError::from),
                        None => Ok(()),
                    }
                })
            });

        let discovery_for_disconnect = discovery_for_send.clone();
        let disconnect: Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync> = Arc::new(move |peer: String| {
            let handle = discovery_for_disconnect.clone();
            Box::pin(async move {
                if let Some(discovery) = handle.get() {
                    discovery.disconnect(&peer).await;
                }
            })
        });

        let events_for_validated = broadcast::channel::<Event>(EVENT_CHANNEL_CAPACITY).0;
        let event_tx = events_for_validated;

        let callbacks = BridgeCallbacks {
            on_peer_validated: Some(Arc::new(|peer: String| -> BoxFuture<'static, ()> {
                Box::pin(async move { tracing::info!(%peer, "peer validated") })
            })),
            on_peer_rejected: Some(Arc::new(|peer: String, reason: String| -> BoxFuture<'static, ()> {
                Box::pin(async move { tracing::warn!(%peer, %reason, "peer rejected") })
            })),
            on_upgrade_required: Some(Arc::new(|peer: String, min_version: crate::ProtocolVersion, url: Option<String>| -> BoxFuture<'static, ()> {
                Box::pin(async move { tracing::warn!(%peer, %min_version, ?url, "peer requires upgrade") })
            })),
            on_constitution_mismatch: Some(Arc::new(|peer: String, expected: ConstitutionHash, received: ConstitutionHash| -> BoxFuture<'static, ()> {
                Box::pin(async move { tracing::warn!(%peer, expected = %expected.hash, received = %received.hash, "constitution mismatch") })
            })),
            on_handshake_timeout: Some(Arc::new(|peer: String| -> BoxFuture<'static, ()> {
                Box::pin(async move { tracing::warn!(%peer, "handshake timed out") })
            })),
        };

        let bridge = Bridge::new(state.clone(), identity.clone(), settings, callbacks, send, disconnect);

        let discovery = HybridDiscovery::new(state.clone(), transports.clone(), config.discovery_timing.clone(), config.proximity.prefer_proximity);
        let _ = discovery_for_send.set(discovery.clone());
        discovery.start_discovery().await?;
        tracing::info!("hybrid discovery started");

        // ── event listeners (peer:discovery / connect / disconnect) ────
        let flood = Arc::new(FloodProtection::new(&config.flood_protection));
        let auth_enabled = config.authentication.enabled;
        let mut listener_handles = Vec::new();
        for transport in transports.values() {
            let mut rx = transport.subscribe();
            let bridge = bridge.clone();
            let flood = flood.clone();
            let events = event_tx.clone();
            let handle = tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    match event {
                        TransportEvent::Discovery(peer) => {
                            let _ = events.send(Event::PeerDiscovered { peer_id: peer.id, timestamp: now_millis() });
                        }
                        TransportEvent::Connection(_peer_id) => {}
                        TransportEvent::Disconnection(peer_id) => {
                            let _ = events.send(Event::PeerDisconnected { peer_id, timestamp: now_millis() });
                        }
                        TransportEvent::Message(tm) => {
                            if !flood.admit(&tm.from, &tm.id) {
                                continue;
                            }
                            match bridge.deserialize(&tm.data, &tm.from, auth_enabled) {
                                Ok(message) => {
                                    if let Err(err) = bridge.handle_inbound(message, auth_enabled).await {
                                        tracing::warn!(%err, "failed to handle inbound message");
                                    }
                                }
                                Err(err) => tracing::debug!(%err, "dropping malformed inbound message"),
                            }
                        }
                    }
                }
            });
            listener_handles.push(handle);
        }

        // ── capability tracking subscriptions ───────────────────────────
        let mut local_peer = PeerInfo::new(identity.peer_id().clone());
        local_peer.capabilities = config.capabilities.clone();
        let capability = CapabilityProtocol::new(iroh.clone(), identity.clone(), local_peer.clone());

        iroh.subscribe_topic(crate::capability::TOPIC_ANNOUNCE).await?;
        iroh.subscribe_topic(crate::capability::TOPIC_REQUEST).await?;
        iroh.subscribe_topic(crate::capability::TOPIC_RESPONSE).await?;

        {
            let state = state.clone();
            let capability = capability.clone();
            let events = event_tx.clone();
            let local_peer = local_peer.clone();
            let max_peers = config.memory_limits.max_peers as usize;
            let stale_peer_timeout_ms = config.memory_limits.stale_peer_timeout_ms as i64;
            let handler: Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync> = Arc::new(move |message: Message| {
                let state = state.clone();
                let capability = capability.clone();
                let events = events.clone();
                let local_peer = local_peer.clone();
                Box::pin(async move {
                    match message.typed_payload() {
                        Ok(Payload::CapabilityAnnouncement(ann)) => {
                            let claimed = ann.libp2p_peer_id.as_deref().unwrap_or(ann.peer_id.as_str());
                            if ann.peer_id == local_peer.id || message.from == local_peer.id {
                                // self-announcement, looped back; never overwrite our own entry
                            } else if claimed != message.from {
                                tracing::warn!(claimed = %claimed, from = %message.from, "dropping capability announcement with mismatched peer id");
                            } else {
                                let peer_id = ann.peer_id.clone();
                                let caps = ann.capabilities.clone();
                                let ts = ann.timestamp;
                                let _ = state
                                    .modify_state(move |mut s| {
                                        let cutoff = now_millis() - stale_peer_timeout_ms;
                                        s.peers.retain(|id, peer| id == &peer_id || peer.last_seen >= cutoff);
                                        if s.peers.len() >= max_peers && !s.peers.contains_key(&peer_id) {
                                            evict_oldest_peer(&mut s.peers);
                                        }
                                        let entry = s.peers.entry(peer_id.clone()).or_insert_with(|| PeerInfo::new(peer_id.clone()));
                                        entry.capabilities = caps.clone();
                                        entry.touch(ts);
                                        (s, ())
                                    })
                                    .await;
                                let _ = events.send(Event::CapabilityAnnouncement { peer_id: ann.peer_id, timestamp: now_millis() });
                            }
                        }
                        Ok(Payload::CapabilityRequest(req)) => {
                            if req.from == local_peer.id || message.from == local_peer.id {
                                // ignore our own request looped back
                            } else if req.from != message.from {
                                tracing::warn!(claimed = %req.from, from = %message.from, "dropping capability request with mismatched peer id");
                            } else {
                                let query = CapabilityQuery {
                                    required_capabilities: req.required_capabilities.clone(),
                                    preferred_peers: None,
                                };
                                if !match_peers(std::slice::from_ref(&local_peer), &query).is_empty() {
                                    if let Err(err) = capability.respond(&req.request_id, None).await {
                                        tracing::warn!(%err, "failed to respond to capability request");
                                    }
                                }
                                let _ = events.send(Event::CapabilityRequest { request_id: req.request_id, timestamp: now_millis() });
                            }
                        }
                        Ok(Payload::CapabilityResponse(resp)) => {
                            let request_id = resp.request_id.clone();
                            let peer_id = resp.peer_id.clone();
                            capability.record_response(resp).await;
                            let _ = events.send(Event::CapabilityResponse { request_id, peer_id, timestamp: now_millis() });
                        }
                        _ => {
                            let _ = events.send(Event::Message { message: Box::new(message.clone()), timestamp: now_millis() });
                        }
                    }
                })
            });
            bridge.on_any(handler);
        }
        tracing::info!("capability tracking wired");

        // ── registry (fallback directory; non-fatal) ────────────────────
        let registry = match &config.registry {
            Some(url) => match RegistryClient::connect(url, None).await {
                Ok(client) => Some(Arc::new(client)),
                Err(err) => {
                    tracing::warn!(%err, "registry connection failed, falling back to p2p discovery");
                    None
                }
            },
            None => None,
        };

        // ── bootstrap dial ───────────────────────────────────────────────
        if config.bootstrap.enabled {
            let deadline = Duration::from_millis(config.bootstrap.timeout_ms);
            let peers = config.bootstrap.peers.clone();
            let discovery = discovery.clone();
            let bootstrap = async move {
                for peer in &peers {
                    match discovery.connect_with_fallback(peer).await {
                        Ok(kind) => tracing::info!(peer = %peer, transport = %kind, "bootstrap peer connected"),
                        Err(err) => tracing::warn!(peer = %peer, %err, "bootstrap peer unreachable"),
                    }
                }
            };
            if tokio::time::timeout(deadline, bootstrap).await.is_err() {
                tracing::warn!("bootstrap dial timed out");
            }
        }

        // ── capability announcement ──────────────────────────────────────
        capability.announce(None).await?;
        tracing::info!("capability announced");

        Ok(Arc::new(Node {
            config,
            identity,
            state,
            store,
            bridge,
            discovery,
            capability,
            registry,
            flood,
            settlement,
            settlement_handle: tokio::sync::Mutex::new(Some(settlement_handle)),
            reputation,
            transports,
            listener_handles,
            events: event_tx,
        }))
    }

    /// Strict shutdown order (`spec.md` §4.11): mark shutting down, run
    /// cleanup handlers, clear this node's own subscriptions, stop hybrid
    /// discovery, close the settlement worker, then stop every transport
    /// under a 5 s timeout. Sends attempted after this returns are no-ops
    /// since every subsystem handle is either stopped or rejects new work.
    pub async fn stop(&self) {
        let _ = self.state.modify_state(|mut s| { s.shutting_down = true; (s, ()) }).await;
        self.state.run_cleanup_handlers().await;

        for handle in &self.listener_handles {
            handle.abort();
        }

        self.discovery.stop().await;
        self.settlement.shutdown().await;
        if let Some(handle) = self.settlement_handle.lock().await.take() {
            let _ = handle.await;
        }

        for (kind, transport) in &self.transports {
            if tokio::time::timeout(TRANSPORT_SHUTDOWN_TIMEOUT, transport.shutdown()).await.is_err() {
                tracing::warn!(transport = %kind, "transport shutdown timed out");
            }
        }
        tracing::info!("node stopped");
    }

    pub fn peer_id(&self) -> &str {
        self.identity.peer_id()
    }

    pub fn state(&self) -> StateRef {
        self.state.clone()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn reputation(&self) -> Arc<ReputationTracker> {
        self.reputation.clone()
    }

    pub fn registry(&self) -> Option<Arc<RegistryClient>> {
        self.registry.clone()
    }

    /// Subscribe to this node's public event stream.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Sign and send a direct message to `peer_id`, falling back across
    /// transports (`discovery.send_with_fallback`).
    pub async fn send_message(&self, peer_id: &str, message: Message) -> Result<(), EccoError> {
        let bytes = self.bridge.serialize(message, self.config.authentication.enabled)?;
        self.discovery.send_with_fallback(peer_id, &bytes).await?;
        Ok(())
    }

    /// Publish a `capability-request` and collect whatever responses
    /// arrive within `wait`.
    pub async fn query_capabilities(
        &self,
        required: Vec<Capability>,
        preferred_peers: Option<Vec<String>>,
        wait: Duration,
    ) -> Vec<CapabilityProvider> {
        let request_id = match self.capability.request(required, preferred_peers).await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(%err, "capability request failed");
                return Vec::new();
            }
        };
        tokio::time::sleep(wait).await;
        self.capability.collect_responses(&request_id).await
    }

    /// Enqueue a settlement intent with the background worker.
    pub async fn enqueue_settlement(&self, intent: SettlementIntent) -> Result<(), EccoError> {
        self.settlement.enqueue(intent).await.map_err(EccoError::from)
    }
}
