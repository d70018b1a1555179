//! Capability protocol (`spec.md` §4.6): signed announce/request/response
//! gossip over pub/sub topics, plus DHT content-addressed rendezvous.

use std::collections::HashMap;
use std::sync::Arc;

use cid::Cid;
use multihash::Multihash;
use multihash_codetable::{Code, MultihashDigest};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::identity::Identity;
use crate::model::{
    now_millis, Capability, CapabilityAnnouncement, CapabilityRequest, CapabilityResponse, Message,
    PeerInfo,
};
use crate::transport::PubSub;

pub const TOPIC_ANNOUNCE: &str = "ecco:capabilities";
pub const TOPIC_REQUEST: &str = "ecco:capability-request";
pub const TOPIC_RESPONSE: &str = "ecco:capability-response";

/// `/ecco/capability/{type}/{name}` rendezvous key, content-addressed with
/// a CIDv1/sha2-256 multihash so unrelated peers converge on the same DHT
/// key without coordinating a naming scheme up front.
pub fn capability_cid(capability: &Capability) -> Cid {
    let key = format!("/ecco/capability/{}/{}", capability.kind, capability.name);
    let digest: Multihash<64> = Code::Sha2_256.digest(key.as_bytes());
    Cid::new_v1(0x55, digest) // 0x55 = raw binary multicodec
}

/// One provider entry gathered from a `capability-response` or DHT lookup.
#[derive(Debug, Clone)]
pub struct CapabilityProvider {
    pub peer_id: String,
    pub capabilities: Vec<Capability>,
    pub seen_at: i64,
}

/// A `capability-request` awaiting responses, tracked so `query_capabilities`
/// can collect them over a bounded window.
struct PendingQuery {
    required: Vec<Capability>,
    providers: Vec<CapabilityProvider>,
}

/// Gossip + rendezvous glue. Sits beside `Bridge`/`HybridDiscovery` rather
/// than inside either — it only needs a `PubSub` handle and the identity
/// used to sign outbound gossip.
pub struct CapabilityProtocol<P: PubSub> {
    pubsub: Arc<P>,
    identity: Arc<Identity>,
    local_peer: PeerInfo,
    pending_queries: Mutex<HashMap<String, PendingQuery>>,
}

impl<P: PubSub> CapabilityProtocol<P> {
    pub fn new(pubsub: Arc<P>, identity: Arc<Identity>, local_peer: PeerInfo) -> Arc<Self> {
        Arc::new(Self {
            pubsub,
            identity,
            local_peer,
            pending_queries: Mutex::new(HashMap::new()),
        })
    }

    fn sign_and_encode(&self, kind: &str, payload: serde_json::Value) -> Result<Vec<u8>, BridgeError> {
        let mut message = Message::new(self.identity.peer_id().clone(), "*", kind, payload);
        self.identity.sign(&mut message)?;
        serde_json::to_vec(&message).map_err(|e| BridgeError::Schema(e.to_string()))
    }

    /// Publish a signed `capability-announcement` for the local peer's
    /// current capability set.
    pub async fn announce(&self, libp2p_peer_id: Option<String>) -> Result<(), BridgeError> {
        let announcement = CapabilityAnnouncement {
            peer_id: self.local_peer.id.clone(),
            libp2p_peer_id,
            capabilities: self.local_peer.capabilities.clone(),
            timestamp: now_millis(),
        };
        let bytes = self.sign_and_encode(
            "capability-announcement",
            serde_json::to_value(&announcement).unwrap_or(serde_json::Value::Null),
        )?;
        self.pubsub
            .publish(TOPIC_ANNOUNCE, &bytes)
            .await
            .map_err(|e| BridgeError::Schema(e.to_string()))
    }

    /// Publish a `capability-request` and register it so `collect_responses`
    /// can assemble what comes back on `ecco:capability-response`.
    pub async fn request(&self, required: Vec<Capability>, preferred_peers: Option<Vec<String>>) -> Result<String, BridgeError> {
        let request_id = Uuid::new_v4().to_string();
        let request = CapabilityRequest {
            request_id: request_id.clone(),
            from: self.local_peer.id.clone(),
            required_capabilities: required.clone(),
            preferred_peers,
            timestamp: now_millis(),
        };
        self.pending_queries.lock().await.insert(
            request_id.clone(),
            PendingQuery { required, providers: Vec::new() },
        );
        let bytes = self.sign_and_encode(
            "capability-request",
            serde_json::to_value(&request).unwrap_or(serde_json::Value::Null),
        )?;
        self.pubsub
            .publish(TOPIC_REQUEST, &bytes)
            .await
            .map_err(|e| BridgeError::Schema(e.to_string()))?;
        Ok(request_id)
    }

    /// Respond to an incoming `capability-request` that matches capabilities
    /// this peer actually has.
    pub async fn respond(&self, request_id: &str, libp2p_peer_id: Option<String>) -> Result<(), BridgeError> {
        let response = CapabilityResponse {
            request_id: request_id.to_string(),
            peer_id: self.local_peer.id.clone(),
            libp2p_peer_id,
            capabilities: self.local_peer.capabilities.clone(),
            timestamp: now_millis(),
        };
        let bytes = self.sign_and_encode(
            "capability-response",
            serde_json::to_value(&response).unwrap_or(serde_json::Value::Null),
        )?;
        self.pubsub
            .publish(TOPIC_RESPONSE, &bytes)
            .await
            .map_err(|e| BridgeError::Schema(e.to_string()))
    }

    /// Record an incoming `capability-response` against its pending query,
    /// if one is still open.
    pub async fn record_response(&self, response: CapabilityResponse) {
        if let Some(query) = self.pending_queries.lock().await.get_mut(&response.request_id) {
            query.providers.push(CapabilityProvider {
                peer_id: response.peer_id,
                capabilities: response.capabilities,
                seen_at: now_millis(),
            });
        }
    }

    /// `queryCapabilities`: drop the pending query and return whatever
    /// providers arrived. Callers typically wait a short window (driven by
    /// `retry.initial_delay_ms` or similar) between `request` and this call.
    pub async fn collect_responses(&self, request_id: &str) -> Vec<CapabilityProvider> {
        self.pending_queries
            .lock()
            .await
            .remove(request_id)
            .map(|q| q.providers)
            .unwrap_or_default()
    }

    pub async fn pending_required(&self, request_id: &str) -> Option<Vec<Capability>> {
        self.pending_queries.lock().await.get(request_id).map(|q| q.required.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_cid_is_stable_for_same_type_and_name() {
        let a = Capability { kind: "storage".into(), name: "ipfs".into(), version: "1.0.0".into(), metadata: None };
        let b = Capability { kind: "storage".into(), name: "ipfs".into(), version: "2.0.0".into(), metadata: None };
        assert_eq!(capability_cid(&a), capability_cid(&b));
    }

    #[test]
    fn capability_cid_differs_across_names() {
        let a = Capability { kind: "storage".into(), name: "ipfs".into(), version: "1.0.0".into(), metadata: None };
        let b = Capability { kind: "storage".into(), name: "s3".into(), version: "1.0.0".into(), metadata: None };
        assert_ne!(capability_cid(&a), capability_cid(&b));
    }
}
