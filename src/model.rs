//! Wire-level data model (`spec.md` §3).
//!
//! `Capability`, `PeerInfo`, `Message`, `Event`, and `SettlementIntent` as
//! specified. `Message.payload` is a tagged union (`Payload`) per the
//! "Dynamic payload typing" design note — handlers never see raw
//! `serde_json::Value` for a recognized `type`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ProtocolVersion;

/// `{type, name, version, metadata?}`. Equality is by `(type, name)`;
/// `version`/`metadata` only contribute to match score (see `matcher.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    /// SemVer-like `X.Y.Z` string; unparseable versions are tolerated by
    /// the matcher (scored 0.5) rather than rejected here.
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name
    }
}
impl Eq for Capability {}

/// `{id, addresses[], capabilities[], lastSeen, reputation?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Unix millis. Invariant: monotonically non-decreasing per peer id.
    pub last_seen: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reputation: Option<f64>,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addresses: Vec::new(),
            capabilities: Vec::new(),
            last_seen: now_millis(),
            reputation: None,
        }
    }

    /// Merge newer discovery/gossip data in, enforcing the `lastSeen`
    /// monotonicity invariant (never move it backwards).
    pub fn touch(&mut self, last_seen: i64) {
        if last_seen > self.last_seen {
            self.last_seen = last_seen;
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `version-handshake` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionHandshake {
    pub protocol_version: ProtocolVersion,
    pub network_id: String,
    pub constitution_hash: ConstitutionHash,
}

/// Content digest of a shared policy document two peers must agree on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConstitutionHash {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionHandshakeResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub min_protocol_version: ProtocolVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constitution_mismatch: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionIncompatibleNotice {
    pub required_min_version: ProtocolVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_url: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstitutionMismatchNotice {
    pub expected_hash: ConstitutionHash,
    pub received_hash: ConstitutionHash,
    pub message: String,
}

/// `capability-announcement` gossip payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityAnnouncement {
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libp2p_peer_id: Option<String>,
    pub capabilities: Vec<Capability>,
    pub timestamp: i64,
}

/// `capability-request` gossip payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub request_id: String,
    pub from: String,
    pub required_capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_peers: Option<Vec<String>>,
    pub timestamp: i64,
}

/// `capability-response` gossip payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub request_id: String,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libp2p_peer_id: Option<String>,
    pub capabilities: Vec<Capability>,
    pub timestamp: i64,
}

/// A settlement invoice handed to the external `Pay` interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub amount: String,
    pub currency: String,
    #[serde(default)]
    pub memo: Option<String>,
}

/// Tagged union over `Message.payload`. Routed by `Message.type`; handlers
/// never see a raw `serde_json::Value` for a recognized type (Design Notes
/// "Dynamic payload typing").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Payload {
    AgentResponse { body: serde_json::Value },
    VersionHandshake(VersionHandshake),
    VersionHandshakeResponse(VersionHandshakeResponse),
    VersionIncompatibleNotice(VersionIncompatibleNotice),
    ConstitutionMismatchNotice(ConstitutionMismatchNotice),
    CapabilityAnnouncement(CapabilityAnnouncement),
    CapabilityRequest(CapabilityRequest),
    CapabilityResponse(CapabilityResponse),
    Invoice(Invoice),
    /// Anything else — user payloads, never interpreted by the bridge.
    #[serde(untagged)]
    Opaque(serde_json::Value),
}

/// `{id(uuid), from, to, type, payload, timestamp, signature?, publicKey?}`.
///
/// `type` is carried implicitly by `Payload`'s internal tag for the
/// well-known variants; for `Opaque` payloads the wire `type` string is
/// preserved separately in `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Message {
    pub fn new(from: impl Into<String>, to: impl Into<String>, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            kind: kind.into(),
            payload,
            timestamp: now_millis(),
            signature: None,
            public_key: None,
        }
    }

    /// Fields covered by the signature, in canonical form (`spec.md` §4.1:
    /// "canonicalize the message's fields `{id, from, to, type, payload,
    /// timestamp}`").
    pub fn signing_view(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "from": self.from,
            "to": self.to,
            "type": self.kind,
            "payload": self.payload,
            "timestamp": self.timestamp,
        })
    }

    pub fn typed_payload(&self) -> Result<Payload, serde_json::Error> {
        let mut tagged = self.payload.clone();
        if let serde_json::Value::Object(ref mut map) = tagged {
            map.entry("type").or_insert_with(|| serde_json::Value::String(self.kind.clone()));
        }
        serde_json::from_value(tagged)
    }
}

/// Tagged union of the events a node surfaces to its consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    CapabilityAnnouncement { peer_id: String, timestamp: i64 },
    CapabilityRequest { request_id: String, timestamp: i64 },
    CapabilityResponse { request_id: String, peer_id: String, timestamp: i64 },
    PeerDiscovered { peer_id: String, timestamp: i64 },
    PeerDisconnected { peer_id: String, timestamp: i64 },
    Message { message: Box<Message>, timestamp: i64 },
    ReputationFilter { timestamp: i64 },
}

/// `{id, type, invoice, ledgerEntryId, priority, createdAt, retryCount, maxRetries}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementIntent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SettlementKind,
    pub invoice: Invoice,
    pub ledger_entry_id: String,
    pub priority: i32,
    pub created_at: i64,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementKind {
    Standard,
    Streaming,
    Escrow,
    Swarm,
}

/// Sort key for `pendingSettlements`: `(priority desc, createdAt asc)`.
pub fn settlement_order_key(intent: &SettlementIntent) -> (std::cmp::Reverse<i32>, i64) {
    (std::cmp::Reverse(intent.priority), intent.created_at)
}
