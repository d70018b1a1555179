//! `ecco-node`: the runtime for a single peer in the ecco agent overlay.
//!
//! A node owns one signing identity, a versioned state snapshot, a set of
//! pluggable transports, and the subsystems that turn raw transport bytes
//! into validated, deduplicated, capability-routed messages: the message
//! bridge (signing, handshake, dispatch), hybrid discovery (phased peer
//! finding with escalation and fallback), the capability protocol
//! (announce/request/response gossip), the peer matcher (capability
//! scoring), flood protection (dedup + rate limiting), and a durable
//! settlement worker.
//!
//! See `SPEC_FULL.md` for the full specification and `DESIGN.md` for the
//! grounding ledger.

pub mod canonical;
pub mod capability;
pub mod config;
pub mod discovery;
pub mod error;
pub mod flood;
pub mod identity;
pub mod matcher;
pub mod model;
pub mod node;
pub mod persistence;
pub mod registry;
pub mod reputation;
pub mod settlement;
pub mod state;

pub mod bridge;
pub mod transport;

pub use config::NodeConfig;
pub use error::EccoError;
pub use identity::{Identity, PeerId};
pub use model::{Capability, Event, Message, PeerInfo};
pub use node::Node;

/// Current wire protocol version, used in the version-handshake.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0, patch: 0 };

/// `{major, minor, patch}` as carried in `version-handshake` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
