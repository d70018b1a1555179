//! Message bridge (`spec.md` §4.4 — "hardest subsystem"): serialize/sign
//! outbound messages, validate and deserialize inbound ones, and drive the
//! per-peer handshake state machine that gates dispatch.
//!
//! `Bridge` holds only an `Arc<ArcSwap<NodeState>>` state ref and its own
//! callback/handler registries — never a back-reference to `Node` — the
//! same decoupling `S2sManager` in the teacher achieves via channels
//! instead of holding `SharedState` by owning reference (`s2s.rs`).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::task::AbortHandle;

use crate::config::EnforcementLevel;
use crate::error::BridgeError;
use crate::identity::Identity;
use crate::model::{
    ConstitutionHash, ConstitutionMismatchNotice, Message, Payload, VersionHandshake,
    VersionHandshakeResponse, VersionIncompatibleNotice,
};
use crate::state::{PendingHandshake, StateRef};
use crate::ProtocolVersion;

pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DISCONNECT_DELAY: Duration = Duration::from_secs(2);
pub const MAX_QUEUED_PER_PEER: usize = 100;

/// `{topic, message}` broadcast envelope (`spec.md` §6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TopicEnvelope {
    pub topic: String,
    pub message: Message,
}

type AsyncHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;
type SendFn = Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, Result<(), BridgeError>> + Send + Sync>;
type DisconnectFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
type PeerCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
type RejectCallback = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;
type UpgradeCallback = Arc<dyn Fn(String, ProtocolVersion, Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;
type MismatchCallback = Arc<dyn Fn(String, ConstitutionHash, ConstitutionHash) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
pub struct BridgeCallbacks {
    pub on_peer_validated: Option<PeerCallback>,
    pub on_peer_rejected: Option<RejectCallback>,
    pub on_upgrade_required: Option<UpgradeCallback>,
    pub on_constitution_mismatch: Option<MismatchCallback>,
    pub on_handshake_timeout: Option<PeerCallback>,
}

pub struct BridgeSettings {
    pub enforcement_level: EnforcementLevel,
    pub protocol_version: ProtocolVersion,
    pub min_remote_version: ProtocolVersion,
    pub network_id: String,
    pub constitution_hash: ConstitutionHash,
    pub upgrade_url: Option<String>,
}

/// Handler registries, kept outside the CAS'd `NodeState` (registration is
/// a local wiring concern, not state every subsystem needs a consistent
/// view of).
#[derive(Default)]
struct Handlers {
    per_peer: HashMap<String, Vec<AsyncHandler>>,
    wildcard: Vec<AsyncHandler>,
    topics: HashMap<String, Vec<AsyncHandler>>,
}

pub struct Bridge {
    state: StateRef,
    identity: Arc<Identity>,
    settings: BridgeSettings,
    callbacks: BridgeCallbacks,
    handlers: Mutex<Handlers>,
    send: SendFn,
    disconnect: DisconnectFn,
}

impl Bridge {
    pub fn new(
        state: StateRef,
        identity: Arc<Identity>,
        settings: BridgeSettings,
        callbacks: BridgeCallbacks,
        send: SendFn,
        disconnect: DisconnectFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            identity,
            settings,
            callbacks,
            handlers: Mutex::new(Handlers::default()),
            send,
            disconnect,
        })
    }

    pub fn on_peer(&self, peer: impl Into<String>, handler: AsyncHandler) {
        self.handlers.lock().unwrap().per_peer.entry(peer.into()).or_default().push(handler);
    }

    pub fn on_any(&self, handler: AsyncHandler) {
        self.handlers.lock().unwrap().wildcard.push(handler);
    }

    pub fn on_topic(&self, topic: impl Into<String>, handler: AsyncHandler) {
        self.handlers.lock().unwrap().topics.entry(topic.into()).or_default().push(handler);
    }

    // ── Outbound pipeline ────────────────────────────────────────────

    /// `serialize(message)`: sign (if configured), schema-encode, ready for
    /// a transport's `send`/`broadcast`.
    pub fn serialize(&self, mut message: Message, auth_enabled: bool) -> Result<Vec<u8>, BridgeError> {
        if auth_enabled {
            self.identity.sign(&mut message)?;
        }
        serde_json::to_vec(&message).map_err(|e| BridgeError::Schema(e.to_string()))
    }

    /// `serializeTopicMessage(topic, msg)`: wrap as `{topic, message}`.
    pub fn serialize_topic_message(&self, topic: impl Into<String>, message: Message, auth_enabled: bool) -> Result<Vec<u8>, BridgeError> {
        let mut message = message;
        if auth_enabled {
            self.identity.sign(&mut message)?;
        }
        let envelope = TopicEnvelope { topic: topic.into(), message };
        serde_json::to_vec(&envelope).map_err(|e| BridgeError::Schema(e.to_string()))
    }

    // ── Inbound pipeline ─────────────────────────────────────────────

    /// `deserialize(bytes)`: oversize/schema/auth checks, impersonation
    /// guard. Returns the parsed message; caller proceeds to
    /// `handle_inbound` for handshake-state-machine enforcement.
    pub fn deserialize(&self, bytes: &[u8], attested_peer: &str, auth_enabled: bool) -> Result<Message, BridgeError> {
        if bytes.len() > MAX_PAYLOAD_BYTES {
            return Err(BridgeError::Oversize { max: MAX_PAYLOAD_BYTES, got: bytes.len() });
        }
        let message: Message = serde_json::from_slice(bytes).map_err(|e| BridgeError::Schema(e.to_string()))?;
        if auth_enabled {
            if message.signature.is_none() {
                return Err(BridgeError::MissingSignature);
            }
            self.identity.verify(&message)?;
        }
        if !message.from.eq_ignore_ascii_case(attested_peer) {
            return Err(BridgeError::Impersonation { from: message.from.clone(), attested: attested_peer.to_string() });
        }
        Ok(message)
    }

    /// Full inbound path: schema/auth already done by `deserialize`; this
    /// enforces the handshake state machine and dispatches validated
    /// messages.
    pub async fn handle_inbound(self: &Arc<Self>, message: Message, auth_enabled: bool) -> Result<(), BridgeError> {
        let peer = message.from.clone();

        if self.settings.enforcement_level == EnforcementLevel::None {
            self.ensure_validated(&peer).await;
            self.dispatch(message).await;
            return Ok(());
        }

        let is_validated = self.state.load().validated_peers.contains(&peer);
        if is_validated {
            self.dispatch(message).await;
            return Ok(());
        }

        match message.typed_payload() {
            Ok(Payload::VersionHandshake(handshake)) => {
                self.handle_incoming_handshake(&peer, handshake, auth_enabled).await
            }
            Ok(Payload::VersionHandshakeResponse(response)) => {
                self.handle_handshake_response(&peer, response).await;
                Ok(())
            }
            Err(_) if message.kind == "version-handshake" => {
                self.reject_malformed_handshake(&peer, "version-handshake payload").await
            }
            _ => {
                self.queue_pending(&peer, message).await;
                self.opportunistic_initiate(&peer, auth_enabled).await;
                Ok(())
            }
        }
    }

    /// A `version-handshake` tagged message whose body fails to deserialize
    /// (a required field such as `constitution_hash` missing) is malformed,
    /// not merely unrecognized — the tag committed to `Payload::VersionHandshake`
    /// so the internally-tagged enum never falls through to `Opaque`. Reject
    /// and disconnect the same way an empty `networkId` does.
    async fn reject_malformed_handshake(self: &Arc<Self>, peer: &str, field: &'static str) -> Result<(), BridgeError> {
        if let Some(cb) = &self.callbacks.on_peer_rejected {
            cb(peer.to_string(), "malformed handshake".into()).await;
        }
        let disconnect = self.disconnect.clone();
        let peer_owned = peer.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_DELAY).await;
            disconnect(peer_owned).await;
        });
        Err(BridgeError::HandshakeMalformed(field))
    }

    async fn ensure_validated(&self, peer: &str) {
        let peer = peer.to_string();
        let _ = self
            .state
            .modify_state(move |mut state| {
                state.validated_peers.insert(peer.clone());
                (state, ())
            })
            .await;
    }

    async fn queue_pending(&self, peer: &str, message: Message) {
        let peer = peer.to_string();
        let _ = self
            .state
            .modify_state(move |mut state| {
                let queue = state.queued_messages.entry(peer.clone()).or_default();
                if !queue.iter().any(|m| m.id == message.id) {
                    if queue.len() >= MAX_QUEUED_PER_PEER {
                        queue.pop_front();
                    }
                    queue.push_back(message.clone());
                }
                (state, ())
            })
            .await;
    }

    async fn opportunistic_initiate(self: &Arc<Self>, peer: &str, auth_enabled: bool) {
        let already_pending = self.state.load().pending_handshakes.contains_key(peer);
        if !already_pending {
            let _ = self.initiate_handshake(peer, auth_enabled).await;
        }
    }

    // ── Handshake state machine ──────────────────────────────────────

    /// `initiateHandshake(peer)`: build a signed `version-handshake`,
    /// record a 30s timeout, return the bytes to send.
    pub async fn initiate_handshake(self: &Arc<Self>, peer: &str, auth_enabled: bool) -> Result<Vec<u8>, BridgeError> {
        let handshake = VersionHandshake {
            protocol_version: self.settings.protocol_version,
            network_id: self.settings.network_id.clone(),
            constitution_hash: self.settings.constitution_hash.clone(),
        };
        let message = Message::new(
            self.identity.peer_id().clone(),
            peer,
            "version-handshake",
            serde_json::to_value(&handshake).unwrap_or(Value::Null),
        );
        let bytes = self.serialize(message, auth_enabled)?;

        let this = self.clone();
        let peer_owned = peer.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(HANDSHAKE_TIMEOUT).await;
            this.handle_handshake_timeout(&peer_owned).await;
        });
        let timer_handle: AbortHandle = timer.abort_handle();

        let peer_owned = peer.to_string();
        let _ = self
            .state
            .modify_state(move |mut state| {
                state.pending_handshakes.insert(
                    peer_owned.clone(),
                    PendingHandshake { initiated_at: crate::model::now_millis(), timer: timer_handle.clone() },
                );
                (state, ())
            })
            .await;

        Ok(bytes)
    }

    /// Incoming `version-handshake` from an `unknown` peer.
    async fn handle_incoming_handshake(self: &Arc<Self>, peer: &str, handshake: VersionHandshake, auth_enabled: bool) -> Result<(), BridgeError> {
        if handshake.network_id.is_empty() {
            return self.reject_malformed_handshake(peer, "networkId").await;
        }

        let network_ok = handshake.network_id == self.settings.network_id;
        let version_ok = handshake.protocol_version >= self.settings.min_remote_version;
        let constitution_ok = handshake.constitution_hash == self.settings.constitution_hash;
        let accepted = network_ok && version_ok && constitution_ok;

        let response = VersionHandshakeResponse {
            accepted,
            reason: if accepted {
                None
            } else if !network_ok {
                Some("network id mismatch".into())
            } else if !version_ok {
                Some("version too old".into())
            } else {
                Some("constitution mismatch".into())
            },
            min_protocol_version: self.settings.min_remote_version,
            upgrade_url: self.settings.upgrade_url.clone(),
            constitution_mismatch: Some(!constitution_ok),
        };

        let response_message = Message::new(
            self.identity.peer_id().clone(),
            peer,
            "version-handshake-response",
            serde_json::to_value(&response).unwrap_or(Value::Null),
        );
        let bytes = self.serialize(response_message, auth_enabled)?;
        let _ = (self.send)(peer.to_string(), bytes).await;

        if accepted {
            self.ensure_validated(peer).await;
            if let Some(cb) = &self.callbacks.on_peer_validated {
                cb(peer.to_string()).await;
            }
            return Ok(());
        }

        if !network_ok {
            if let Some(cb) = &self.callbacks.on_peer_rejected {
                cb(peer.to_string(), "network id mismatch".into()).await;
            }
        } else if !version_ok {
            let notice = VersionIncompatibleNotice {
                required_min_version: self.settings.min_remote_version,
                upgrade_url: self.settings.upgrade_url.clone(),
                message: "protocol version incompatible".into(),
            };
            let notice_message = Message::new(
                self.identity.peer_id().clone(),
                peer,
                "version-incompatible-notice",
                serde_json::to_value(&notice).unwrap_or(Value::Null),
            );
            if let Ok(bytes) = self.serialize(notice_message, auth_enabled) {
                let _ = (self.send)(peer.to_string(), bytes).await;
            }
            if let Some(cb) = &self.callbacks.on_upgrade_required {
                cb(peer.to_string(), self.settings.min_remote_version, self.settings.upgrade_url.clone()).await;
            }
        } else {
            let notice = ConstitutionMismatchNotice {
                expected_hash: self.settings.constitution_hash.clone(),
                received_hash: handshake.constitution_hash.clone(),
                message: "constitution mismatch".into(),
            };
            let notice_message = Message::new(
                self.identity.peer_id().clone(),
                peer,
                "constitution-mismatch-notice",
                serde_json::to_value(&notice).unwrap_or(Value::Null),
            );
            if let Ok(bytes) = self.serialize(notice_message, auth_enabled) {
                let _ = (self.send)(peer.to_string(), bytes).await;
            }
            if let Some(cb) = &self.callbacks.on_constitution_mismatch {
                cb(peer.to_string(), self.settings.constitution_hash.clone(), handshake.constitution_hash).await;
            }
        }

        let disconnect = self.disconnect.clone();
        let peer_owned = peer.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_DELAY).await;
            disconnect(peer_owned).await;
        });
        Ok(())
    }

    /// Incoming `version-handshake-response` matching a pending entry.
    async fn handle_handshake_response(self: &Arc<Self>, peer: &str, response: VersionHandshakeResponse) {
        let had_pending = {
            let peer_owned = peer.to_string();
            self.state
                .modify_state(move |mut state| {
                    let had = state.pending_handshakes.remove(&peer_owned).map(|p| p.timer.abort()).is_some();
                    (state, had)
                })
                .await
                .unwrap_or(false)
        };
        if !had_pending {
            return;
        }

        if response.accepted {
            self.ensure_validated(peer).await;
            if let Some(cb) = &self.callbacks.on_peer_validated {
                cb(peer.to_string()).await;
            }
            self.drain_queued(peer).await;
        } else if response.constitution_mismatch == Some(true) {
            // The response only carries a mismatch flag, not the peer's hash
            // (it never sent us its own `constitution-mismatch-notice`'s
            // detail as the responder); route through the reject callback
            // with a specific reason instead of fabricating hash values.
            if let Some(cb) = &self.callbacks.on_peer_rejected {
                cb(peer.to_string(), "constitution mismatch".into()).await;
            }
        } else if let Some(cb) = &self.callbacks.on_upgrade_required {
            cb(peer.to_string(), response.min_protocol_version, response.upgrade_url.clone()).await;
        } else if let Some(cb) = &self.callbacks.on_peer_rejected {
            cb(peer.to_string(), response.reason.clone().unwrap_or_default()).await;
        }
    }

    /// `handleHandshakeTimeout(peer)`: strict rejects + disconnects;
    /// relaxed optimistically promotes to `validated`.
    async fn handle_handshake_timeout(self: &Arc<Self>, peer: &str) {
        let peer_owned = peer.to_string();
        let had_pending = self
            .state
            .modify_state(move |mut state| {
                let had = state.pending_handshakes.remove(&peer_owned).is_some();
                (state, had)
            })
            .await
            .unwrap_or(false);
        if !had_pending {
            return;
        }

        if let Some(cb) = &self.callbacks.on_handshake_timeout {
            cb(peer.to_string()).await;
        }

        match self.settings.enforcement_level {
            EnforcementLevel::Strict => {
                if let Some(cb) = &self.callbacks.on_peer_rejected {
                    cb(peer.to_string(), "handshake timeout".into()).await;
                }
                (self.disconnect)(peer.to_string()).await;
            }
            EnforcementLevel::Relaxed | EnforcementLevel::None => {
                self.ensure_validated(peer).await;
                if let Some(cb) = &self.callbacks.on_peer_validated {
                    cb(peer.to_string()).await;
                }
                self.drain_queued(peer).await;
            }
        }
    }

    /// Drain `queuedMessages[peer]` through the regular dispatch path,
    /// re-verifying each signature; failing messages are discarded.
    async fn drain_queued(self: &Arc<Self>, peer: &str) {
        let peer_owned = peer.to_string();
        let queued: VecDeque<Message> = self
            .state
            .modify_state(move |mut state| {
                let queue = state.queued_messages.remove(&peer_owned).unwrap_or_default();
                (state, queue)
            })
            .await
            .unwrap_or_default();

        for message in queued {
            if self.identity.verify(&message).is_ok() {
                self.dispatch(message).await;
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Dispatch a validated direct message to peer-specific handlers, the
    /// wildcard set, and (for `agent-response`) the `peer:{to}` topic.
    /// Handlers run in insertion order, synchronously.
    pub async fn dispatch(&self, message: Message) {
        let handlers = {
            let guard = self.handlers.lock().unwrap();
            let mut invoke: Vec<AsyncHandler> = Vec::new();
            if let Some(peer_handlers) = guard.per_peer.get(&message.from) {
                invoke.extend(peer_handlers.iter().cloned());
            }
            invoke.extend(guard.wildcard.iter().cloned());
            if message.kind == "agent-response" {
                let topic = format!("peer:{}", message.to);
                if let Some(topic_handlers) = guard.topics.get(&topic) {
                    invoke.extend(topic_handlers.iter().cloned());
                }
            }
            invoke
        };
        for handler in handlers {
            handler(message.clone()).await;
        }
    }

    /// Dispatch a validated broadcast/topic message to handlers registered
    /// on its embedded topic.
    pub async fn dispatch_topic(&self, envelope: TopicEnvelope) {
        let handlers: Vec<AsyncHandler> = {
            let guard = self.handlers.lock().unwrap();
            guard.topics.get(&envelope.topic).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler(envelope.message.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::state::NodeState;
    use std::sync::OnceLock;

    /// Wires two bridges' `send` closures to each other's inbound pipeline,
    /// so handshake traffic flows end to end without a real transport.
    struct Pair {
        a: Arc<Bridge>,
        b: Arc<Bridge>,
    }

    fn wired_bridge(
        identity: Arc<Identity>,
        settings: BridgeSettings,
        callbacks: BridgeCallbacks,
        peer_cell: Arc<OnceLock<Arc<Bridge>>>,
    ) -> Arc<Bridge> {
        let state = StateRef::new(NodeState::default());
        let send_cell = peer_cell.clone();
        let send: SendFn = Arc::new(move |peer: String, bytes: Vec<u8>| {
            let cell = send_cell.clone();
            Box::pin(async move {
                if let Some(target) = cell.get() {
                    if let Ok(message) = target.deserialize(&bytes, &peer, true) {
                        let _ = target.handle_inbound(message, true).await;
                    }
                }
                Ok(())
            })
        });
        let disconnect: DisconnectFn = Arc::new(|_peer: String| Box::pin(async {}));
        Bridge::new(state, identity, settings, callbacks, send, disconnect)
    }

    fn settings(
        enforcement_level: EnforcementLevel,
        protocol_version: ProtocolVersion,
        min_remote_version: ProtocolVersion,
        constitution_hash: ConstitutionHash,
    ) -> BridgeSettings {
        BridgeSettings {
            enforcement_level,
            protocol_version,
            min_remote_version,
            network_id: "ecco-test".into(),
            constitution_hash,
            upgrade_url: Some("https://example.invalid/upgrade".into()),
        }
    }

    fn make_pair(
        settings_a: BridgeSettings,
        settings_b: BridgeSettings,
        callbacks_a: BridgeCallbacks,
        callbacks_b: BridgeCallbacks,
    ) -> Pair {
        let cell_a: Arc<OnceLock<Arc<Bridge>>> = Arc::new(OnceLock::new());
        let cell_b: Arc<OnceLock<Arc<Bridge>>> = Arc::new(OnceLock::new());
        let a = wired_bridge(Arc::new(Identity::generate()), settings_a, callbacks_a, cell_b.clone());
        let b = wired_bridge(Arc::new(Identity::generate()), settings_b, callbacks_b, cell_a.clone());
        let _ = cell_a.set(a.clone());
        let _ = cell_b.set(b.clone());
        Pair { a, b }
    }

    fn v(major: u32) -> ProtocolVersion {
        ProtocolVersion { major, minor: 0, patch: 0 }
    }

    fn hash(h: &str) -> ConstitutionHash {
        ConstitutionHash { hash: h.into(), version: None }
    }

    #[tokio::test]
    async fn handshake_accept_delivers_queued_message() {
        let validated_a: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let delivered_a: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let log = validated_a.clone();
        let callbacks_a = BridgeCallbacks {
            on_peer_validated: Some(Arc::new(move |peer: String| {
                let log = log.clone();
                Box::pin(async move { log.lock().unwrap().push(peer) })
            })),
            ..Default::default()
        };

        let pair = make_pair(
            settings(EnforcementLevel::Strict, v(1), v(1), hash("same")),
            settings(EnforcementLevel::Strict, v(1), v(1), hash("same")),
            callbacks_a,
            BridgeCallbacks::default(),
        );

        let caught = delivered_a.clone();
        pair.a.on_any(Arc::new(move |message: Message| {
            let caught = caught.clone();
            Box::pin(async move { caught.lock().unwrap().push(message) })
        }));

        let b_peer_id = pair.b.identity.peer_id().clone();
        let greet = Message::new(b_peer_id.clone(), pair.a.identity.peer_id().clone(), "greet", serde_json::json!({}));
        let bytes = pair.b.serialize(greet, true).unwrap();
        let message = pair.a.deserialize(&bytes, &b_peer_id, true).unwrap();
        pair.a.handle_inbound(message, true).await.unwrap();

        assert_eq!(validated_a.lock().unwrap().as_slice(), &[b_peer_id.clone()]);
        let delivered = delivered_a.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].kind, "greet");
        assert!(pair.a.state.load().validated_peers.contains(&b_peer_id));
    }

    #[tokio::test(start_paused = true)]
    async fn version_mismatch_is_rejected_and_peer_disconnected() {
        let upgrades: Arc<Mutex<Vec<(String, ProtocolVersion)>>> = Arc::new(Mutex::new(Vec::new()));
        let disconnected: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = upgrades.clone();
        let callbacks_a = BridgeCallbacks {
            on_upgrade_required: Some(Arc::new(move |peer: String, min_version: ProtocolVersion, _url: Option<String>| {
                let log = log.clone();
                Box::pin(async move { log.lock().unwrap().push((peer, min_version)) })
            })),
            ..Default::default()
        };

        let cell_a: Arc<OnceLock<Arc<Bridge>>> = Arc::new(OnceLock::new());
        let cell_b: Arc<OnceLock<Arc<Bridge>>> = Arc::new(OnceLock::new());
        let disc_log = disconnected.clone();
        let a_state = StateRef::new(NodeState::default());
        let identity_a = Arc::new(Identity::generate());
        let send_cell = cell_b.clone();
        let send_a: SendFn = Arc::new(move |peer: String, bytes: Vec<u8>| {
            let cell = send_cell.clone();
            Box::pin(async move {
                if let Some(target) = cell.get() {
                    if let Ok(message) = target.deserialize(&bytes, &peer, true) {
                        let _ = target.handle_inbound(message, true).await;
                    }
                }
                Ok(())
            })
        });
        let disconnect_a: DisconnectFn = Arc::new(move |peer: String| {
            let disc_log = disc_log.clone();
            Box::pin(async move { disc_log.lock().unwrap().push(peer) })
        });
        let a = Bridge::new(
            a_state,
            identity_a,
            settings(EnforcementLevel::Strict, v(2), v(2), hash("same")),
            callbacks_a,
            send_a,
            disconnect_a,
        );
        let b = wired_bridge(
            Arc::new(Identity::generate()),
            settings(EnforcementLevel::Strict, v(1), v(1), hash("same")),
            BridgeCallbacks::default(),
            cell_a.clone(),
        );
        let _ = cell_a.set(a.clone());
        let _ = cell_b.set(b.clone());

        let bytes = b.initiate_handshake(a.identity.peer_id(), true).await.unwrap();
        let b_peer_id = b.identity.peer_id().clone();
        let message = a.deserialize(&bytes, &b_peer_id, true).unwrap();
        a.handle_inbound(message, true).await.unwrap();

        assert_eq!(upgrades.lock().unwrap().as_slice(), &[(b_peer_id.clone(), v(2))]);
        assert!(!a.state.load().validated_peers.contains(&b_peer_id));

        tokio::time::advance(DISCONNECT_DELAY + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(disconnected.lock().unwrap().as_slice(), &[b_peer_id]);
    }

    #[tokio::test]
    async fn constitution_mismatch_rejects_without_validating() {
        let mismatches: Arc<Mutex<Vec<(String, ConstitutionHash, ConstitutionHash)>>> = Arc::new(Mutex::new(Vec::new()));
        let log = mismatches.clone();
        let callbacks_a = BridgeCallbacks {
            on_constitution_mismatch: Some(Arc::new(move |peer: String, expected: ConstitutionHash, received: ConstitutionHash| {
                let log = log.clone();
                Box::pin(async move { log.lock().unwrap().push((peer, expected, received)) })
            })),
            ..Default::default()
        };

        let pair = make_pair(
            settings(EnforcementLevel::Strict, v(1), v(1), hash("hash-a")),
            settings(EnforcementLevel::Strict, v(1), v(1), hash("hash-b")),
            callbacks_a,
            BridgeCallbacks::default(),
        );

        let bytes = pair.b.initiate_handshake(pair.a.identity.peer_id(), true).await.unwrap();
        let b_peer_id = pair.b.identity.peer_id().clone();
        let message = pair.a.deserialize(&bytes, &b_peer_id, true).unwrap();
        pair.a.handle_inbound(message, true).await.unwrap();

        let seen = mismatches.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, b_peer_id);
        assert_eq!(seen[0].1.hash, "hash-a");
        assert_eq!(seen[0].2.hash, "hash-b");
        drop(seen);
        assert!(!pair.a.state.load().validated_peers.contains(&b_peer_id));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_handshake_is_rejected_and_disconnected() {
        let rejected: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let disconnected: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let reject_log = rejected.clone();
        let callbacks_a = BridgeCallbacks {
            on_peer_rejected: Some(Arc::new(move |peer: String, _reason: String| {
                let log = reject_log.clone();
                Box::pin(async move { log.lock().unwrap().push(peer) })
            })),
            ..Default::default()
        };

        let cell_a: Arc<OnceLock<Arc<Bridge>>> = Arc::new(OnceLock::new());
        let cell_b: Arc<OnceLock<Arc<Bridge>>> = Arc::new(OnceLock::new());
        let disc_log = disconnected.clone();
        let a_state = StateRef::new(NodeState::default());
        let identity_a = Arc::new(Identity::generate());
        let send_cell = cell_b.clone();
        let send_a: SendFn = Arc::new(move |peer: String, bytes: Vec<u8>| {
            let cell = send_cell.clone();
            Box::pin(async move {
                if let Some(target) = cell.get() {
                    if let Ok(message) = target.deserialize(&bytes, &peer, true) {
                        let _ = target.handle_inbound(message, true).await;
                    }
                }
                Ok(())
            })
        });
        let disconnect_a: DisconnectFn = Arc::new(move |peer: String| {
            let disc_log = disc_log.clone();
            Box::pin(async move { disc_log.lock().unwrap().push(peer) })
        });
        let a = Bridge::new(
            a_state,
            identity_a,
            settings(EnforcementLevel::Strict, v(1), v(1), hash("same")),
            callbacks_a,
            send_a,
            disconnect_a,
        );
        let b = wired_bridge(
            Arc::new(Identity::generate()),
            settings(EnforcementLevel::Strict, v(1), v(1), hash("same")),
            BridgeCallbacks::default(),
            cell_a.clone(),
        );
        let _ = cell_a.set(a.clone());
        let _ = cell_b.set(b.clone());

        // A tagged `version-handshake` whose body is missing `constitution_hash`
        // entirely (not just empty) — `typed_payload()` commits to the
        // `VersionHandshake` variant and fails to deserialize its content.
        let b_peer_id = b.identity.peer_id().clone();
        let malformed = Message::new(
            b_peer_id.clone(),
            a.identity.peer_id().clone(),
            "version-handshake",
            serde_json::json!({ "protocol_version": v(1), "network_id": "ecco-test" }),
        );
        let bytes = b.serialize(malformed, true).unwrap();
        let message = a.deserialize(&bytes, &b_peer_id, true).unwrap();
        let result = a.handle_inbound(message, true).await;

        assert!(result.is_err());
        assert_eq!(rejected.lock().unwrap().as_slice(), &[b_peer_id.clone()]);
        assert!(!a.state.load().validated_peers.contains(&b_peer_id));

        tokio::time::advance(DISCONNECT_DELAY + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(disconnected.lock().unwrap().as_slice(), &[b_peer_id]);
    }
}
