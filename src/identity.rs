//! Node identity: a long-lived Ed25519 keypair, peer-id derivation, message
//! signing/verification, and freshness checks (`spec.md` §4.1).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{IdentityError, VerificationError};
use crate::model::Message;

/// Stable, printable peer id: `ecco:` + lower-hex SHA-256 of the verifying
/// key's raw bytes.
pub type PeerId = String;

/// Opaque payment-signing key. No wallet semantics live here (Non-goal);
/// it is generated, persisted, and handed to the `Pay` interface as-is.
#[derive(Clone)]
pub struct PaymentKey(pub [u8; 32]);

impl std::fmt::Debug for PaymentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PaymentKey").field(&"<redacted>").finish()
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    signing_key: String,
    payment_key: String,
}

const KEY_CACHE_CAPACITY: usize = 4096;

/// Owns the signing keypair and the bounded decode cache used during
/// verification. Cheap to clone (wrap in `Arc` at the call site); the cache
/// itself is behind a `Mutex` since decodes happen from many tasks.
pub struct Identity {
    signing_key: SigningKey,
    payment_key: PaymentKey,
    peer_id: PeerId,
    key_cache: Mutex<LruCache<PeerId, VerifyingKey>>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("peer_id", &self.peer_id).finish()
    }
}

impl Identity {
    fn from_signing_key(signing_key: SigningKey, payment_key: PaymentKey) -> Self {
        let peer_id = derive_peer_id(&signing_key.verifying_key());
        Self {
            signing_key,
            payment_key,
            peer_id,
            key_cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(KEY_CACHE_CAPACITY).unwrap(),
            )),
        }
    }

    /// Load the identity at `path`, generating a fresh keypair and writing
    /// it there if missing and `allow_generate` is set (`spec.md` §4.1:
    /// "missing files cause generation when configuration permits,
    /// otherwise a fatal error").
    pub fn load_or_generate(path: &Path, allow_generate: bool) -> Result<Self, IdentityError> {
        if path.exists() {
            return Self::load(path);
        }
        if !allow_generate {
            return Err(IdentityError::MissingKeyFile(path.to_path_buf()));
        }
        let identity = Self::generate();
        identity.save(path)?;
        Ok(identity)
    }

    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        let mut payment_bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rng, &mut payment_bytes);
        Self::from_signing_key(signing_key, PaymentKey(payment_bytes))
    }

    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let raw = std::fs::read_to_string(path)?;
        let file: IdentityFile = serde_json::from_str(&raw)
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        let signing_bytes = B64
            .decode(file.signing_key)
            .map_err(|e| IdentityError::Malformed(format!("signing_key: {e}")))?;
        let signing_bytes: [u8; 32] = signing_bytes
            .try_into()
            .map_err(|_| IdentityError::Malformed("signing_key must be 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(&signing_bytes);
        let payment_bytes = B64
            .decode(file.payment_key)
            .map_err(|e| IdentityError::Malformed(format!("payment_key: {e}")))?;
        let payment_bytes: [u8; 32] = payment_bytes
            .try_into()
            .map_err(|_| IdentityError::Malformed("payment_key must be 32 bytes".into()))?;
        Ok(Self::from_signing_key(signing_key, PaymentKey(payment_bytes)))
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = IdentityFile {
            signing_key: B64.encode(self.signing_key.to_bytes()),
            payment_key: B64.encode(self.payment_key.0),
        };
        let contents = serde_json::to_string_pretty(&file)
            .map_err(|e| IdentityError::Generation(e.to_string()))?;
        std::fs::write(path, contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn payment_key(&self) -> &PaymentKey {
        &self.payment_key
    }

    /// Canonicalize `{id, from, to, type, payload, timestamp}` and produce a
    /// detached Ed25519 signature, stamping `signature`/`public_key` on the
    /// message.
    pub fn sign(&self, message: &mut Message) -> Result<(), IdentityError> {
        let view = message.signing_view();
        let bytes = crate::canonical::to_canonical_bytes(&view)
            .map_err(|e| IdentityError::Generation(e.to_string()))?;
        let signature: Signature = self.signing_key.sign(&bytes);
        message.signature = Some(B64.encode(signature.to_bytes()));
        message.public_key = Some(B64.encode(self.signing_key.verifying_key().to_bytes()));
        Ok(())
    }

    /// Verify `message`'s signature, checking signature length, that the
    /// derived peer id matches `from` (case-insensitive), and the Ed25519
    /// signature itself. Memoizes decoded public keys in `keyCache`.
    pub fn verify(&self, message: &Message) -> Result<(), VerificationError> {
        let sig_b64 = message
            .signature
            .as_ref()
            .ok_or(VerificationError::MissingSignature)?;
        let key_b64 = message
            .public_key
            .as_ref()
            .ok_or(VerificationError::MissingSignature)?;

        let sig_bytes = B64
            .decode(sig_b64)
            .map_err(|_| VerificationError::InvalidBase64("signature"))?;
        if sig_bytes.len() != 64 {
            return Err(VerificationError::WrongSignatureLength(sig_bytes.len()));
        }
        let sig_array: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| VerificationError::WrongSignatureLength(64))?;
        let signature = Signature::from_bytes(&sig_array);

        let verifying_key = self.decode_verifying_key(key_b64)?;
        let derived_peer_id = derive_peer_id(&verifying_key);
        if !derived_peer_id.eq_ignore_ascii_case(&message.from) {
            return Err(VerificationError::PeerIdMismatch);
        }

        let view = message.signing_view();
        let bytes = crate::canonical::to_canonical_bytes(&view)
            .map_err(|e| VerificationError::Canonicalization(e.to_string()))?;
        verifying_key
            .verify(&bytes, &signature)
            .map_err(|_| VerificationError::BadSignature)
    }

    fn decode_verifying_key(&self, key_b64: &str) -> Result<VerifyingKey, VerificationError> {
        if let Some(cached) = self.key_cache.lock().unwrap().get(key_b64) {
            return Ok(*cached);
        }
        let key_bytes = B64
            .decode(key_b64)
            .map_err(|_| VerificationError::InvalidBase64("publicKey"))?;
        let key_array: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| VerificationError::InvalidPublicKey)?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_array).map_err(|_| VerificationError::InvalidPublicKey)?;
        self.key_cache
            .lock()
            .unwrap()
            .put(key_b64.to_string(), verifying_key);
        Ok(verifying_key)
    }
}

pub fn derive_peer_id(verifying_key: &VerifyingKey) -> PeerId {
    let hash = Sha256::digest(verifying_key.as_bytes());
    format!("ecco:{}", hex_lower(&hash))
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

pub fn default_key_path(node_id: Option<&str>) -> PathBuf {
    let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join(".ecco")
        .join("identity")
        .join(format!("{}.json", node_id.unwrap_or("default")))
}

/// `isMessageFresh`: true iff `-skew <= now - m.timestamp <= maxAgeMs`.
pub fn is_message_fresh(message: &Message, now_ms: i64, max_age_ms: i64, skew_ms: i64) -> bool {
    let delta = now_ms - message.timestamp;
    delta >= -skew_ms && delta <= max_age_ms
}

pub const DEFAULT_MAX_AGE_MS: i64 = 60_000;
pub const DEFAULT_SKEW_MS: i64 = 5_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let identity = Identity::generate();
        let mut message = Message::new(
            identity.peer_id().clone(),
            "ecco:deadbeef",
            "agent-response",
            serde_json::json!({"body": "hi"}),
        );
        identity.sign(&mut message).unwrap();
        identity.verify(&message).unwrap();
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let identity = Identity::generate();
        let mut message = Message::new(
            identity.peer_id().clone(),
            "ecco:deadbeef",
            "agent-response",
            serde_json::json!({"body": "hi"}),
        );
        identity.sign(&mut message).unwrap();
        message.payload = serde_json::json!({"body": "tampered"});
        assert!(matches!(
            identity.verify(&message),
            Err(VerificationError::BadSignature)
        ));
    }

    #[test]
    fn mismatched_from_is_rejected() {
        let identity = Identity::generate();
        let mut message = Message::new(
            "ecco:not-the-signer",
            "ecco:deadbeef",
            "agent-response",
            serde_json::json!({}),
        );
        identity.sign(&mut message).unwrap();
        assert!(matches!(
            identity.verify(&message),
            Err(VerificationError::PeerIdMismatch)
        ));
    }

    #[test]
    fn freshness_window() {
        let message = Message::new("a", "b", "x", serde_json::json!({}));
        let now = message.timestamp;
        assert!(is_message_fresh(&message, now, DEFAULT_MAX_AGE_MS, DEFAULT_SKEW_MS));
        assert!(is_message_fresh(&message, now + DEFAULT_MAX_AGE_MS, DEFAULT_MAX_AGE_MS, DEFAULT_SKEW_MS));
        assert!(!is_message_fresh(&message, now + DEFAULT_MAX_AGE_MS + 1, DEFAULT_MAX_AGE_MS, DEFAULT_SKEW_MS));
        assert!(!is_message_fresh(&message, now - DEFAULT_SKEW_MS - 1, DEFAULT_MAX_AGE_MS, DEFAULT_SKEW_MS));
    }

    #[test]
    fn round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let identity = Identity::load_or_generate(&path, true).unwrap();
        let peer_id = identity.peer_id().clone();
        let reloaded = Identity::load_or_generate(&path, false).unwrap();
        assert_eq!(&peer_id, reloaded.peer_id());
    }

    #[test]
    fn missing_file_without_generation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        assert!(matches!(
            Identity::load_or_generate(&path, false),
            Err(IdentityError::MissingKeyFile(_))
        ));
    }
}
