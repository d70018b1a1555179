//! Crate-wide error taxonomy.
//!
//! One `thiserror` enum per component boundary, per `spec.md` §7. Identity
//! and configuration errors are fatal at startup and bubble as `anyhow`
//! from `Node::start`; everything else is recovered locally or dropped, and
//! is only ever surfaced to callers as a typed value, never a panic.

use thiserror::Error;

/// Identity & auth failures (`spec.md` §4.1, §7 `AuthError`/`VerificationFailure`).
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no identity key file at {0} and key generation is disabled")]
    MissingKeyFile(std::path::PathBuf),
    #[error("failed to generate identity: {0}")]
    Generation(String),
    #[error("identity file io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed identity file: {0}")]
    Malformed(String),
    #[error("cannot sign: no signing key configured")]
    NoSigningKey,
}

/// Signature/decode failure. Never fatal — the offending message is dropped.
#[derive(Debug, Error, Clone)]
pub enum VerificationError {
    #[error("signature missing")]
    MissingSignature,
    #[error("signature has wrong length: expected 64, got {0}")]
    WrongSignatureLength(usize),
    #[error("invalid base64 in {0}")]
    InvalidBase64(&'static str),
    #[error("public key does not decode to a valid Ed25519 key")]
    InvalidPublicKey,
    #[error("derived peer id does not match `from`")]
    PeerIdMismatch,
    #[error("signature does not verify")]
    BadSignature,
    #[error("canonicalization failed: {0}")]
    Canonicalization(String),
}

/// State-store CAS failures (`spec.md` §4.2).
#[derive(Debug, Error)]
pub enum StateError {
    #[error("compare-and-swap did not converge after {0} attempts")]
    CasExhausted(u32),
}

/// Message bridge / handshake failures (`spec.md` §4.4, §7).
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("payload exceeds maximum size of {max} bytes: {got}")]
    Oversize { max: usize, got: usize },
    #[error("message failed schema validation: {0}")]
    Schema(String),
    #[error("message.from ({from}) does not match transport-attested peer {attested}")]
    Impersonation { from: String, attested: String },
    #[error("auth is enabled but message carries no signature")]
    MissingSignature,
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("failed to sign outbound message: {0}")]
    Signing(#[from] IdentityError),
    #[error("handshake payload missing required field: {0}")]
    HandshakeMalformed(&'static str),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("transport send failed: {0}")]
    Transport(#[from] TransportError),
}

/// Transport-level failures (`spec.md` §4.3, §7 `TransportConnectFailure`).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport {0} failed to connect to peer {1}: {2}")]
    ConnectFailed(String, String, String),
    #[error("transport {0} send to {1} failed: {2}")]
    SendFailed(String, String, String),
    #[error("all transports exhausted for peer {0}")]
    AllExhausted(String),
    #[error("circuit breaker open for peer {0}")]
    CircuitOpen(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Registry client failures (`spec.md` §4.8, §7).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry connection failed: {0}")]
    Connection(String),
    #[error("registry query failed: {0}")]
    Query(String),
    #[error("registry returned an error response: {0}")]
    ServerError(String),
    #[error("no registry configured")]
    NotConfigured,
}

/// Settlement worker failures (`spec.md` §4.10, §7).
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Flood protection failures (`spec.md` §4.9).
#[derive(Debug, Error)]
pub enum FloodError {
    #[error("rate limit exceeded for peer {0}")]
    RateLimited(String),
}

/// Reputation tracker failures (`spec.md` §4.12).
#[derive(Debug, Error)]
pub enum ReputationError {
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Aggregated top-level error, used by `Node` for anything that must abort
/// startup (`spec.md` §7: "configuration and identity errors abort startup").
#[derive(Debug, Error)]
pub enum EccoError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error(transparent)]
    Flood(#[from] FloodError),
    #[error(transparent)]
    Reputation(#[from] ReputationError),
    #[error("configuration error: {0}")]
    Config(String),
}
