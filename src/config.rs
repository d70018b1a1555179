//! `NodeConfig`: the Rust form of `spec.md` §6's configuration object.
//!
//! Loaded from a JSON file (the wire format used everywhere else in this
//! crate) layered under explicit struct fields, the same "explicit >
//! file > defaults" layering `freeq-tui::config::Resolved::merge` applies
//! to CLI/config/session.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    Mdns,
    Dht,
    Gossip,
    Bluetooth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub enabled: bool,
    pub peers: Vec<String>,
    pub timeout_ms: u64,
    pub min_peers: u32,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            peers: Vec::new(),
            timeout_ms: 30_000,
            min_peers: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticationConfig {
    pub enabled: bool,
    pub key_path: Option<PathBuf>,
    pub generate_keys: bool,
    pub wallet_auto_init: bool,
    pub wallet_rpc_urls: Vec<String>,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_path: None,
            generate_keys: true,
            wallet_auto_init: false,
            wallet_rpc_urls: Vec::new(),
        }
    }
}

/// Handshake enforcement, gating how a rejected/timed-out peer is treated
/// (`spec.md` §4.4, §7; Open Question resolved in `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementLevel {
    None,
    Relaxed,
    Strict,
}

impl Default for EnforcementLevel {
    fn default() -> Self {
        EnforcementLevel::Strict
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLimitsConfig {
    pub max_peers: u32,
    pub stale_peer_timeout_ms: u64,
}

impl Default for MemoryLimitsConfig {
    fn default() -> Self {
        Self {
            max_peers: 10_000,
            stale_peer_timeout_ms: 30 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodProtectionConfig {
    pub dedup_max_messages: usize,
    pub dedup_false_positive_rate: f32,
    pub rate_limit_max_tokens: u32,
    pub rate_limit_refill_rate: u32,
    pub rate_limit_refill_interval_ms: u64,
}

impl Default for FloodProtectionConfig {
    fn default() -> Self {
        Self {
            dedup_max_messages: 10_000,
            dedup_false_positive_rate: 0.01,
            rate_limit_max_tokens: 100,
            rate_limit_refill_rate: 10,
            rate_limit_refill_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub enabled: bool,
    pub service_uuid: Option<String>,
    pub advertise: bool,
    pub scan: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_uuid: None,
            advertise: true,
            scan: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    pub bluetooth: BluetoothConfig,
    pub local_context: Option<String>,
    /// Favor proximity transports in `connectWithFallback`'s priority list.
    pub prefer_proximity: bool,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            bluetooth: BluetoothConfig::default(),
            local_context: None,
            prefer_proximity: false,
        }
    }
}

/// Per-phase timing for hybrid discovery (`spec.md` §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryTimingConfig {
    pub phase_timeout_ms: u64,
    pub peer_ttl_ms: u64,
    pub auto_escalate: bool,
    pub connection_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for DiscoveryTimingConfig {
    fn default() -> Self {
        Self {
            phase_timeout_ms: 5_000,
            peer_ttl_ms: 5_000,
            auto_escalate: true,
            connection_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstitutionConfig {
    pub hash: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// The full configuration surface recognized by a node (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: Option<String>,
    pub capabilities: Vec<crate::model::Capability>,
    pub discovery: Vec<DiscoveryMethod>,
    pub bootstrap: BootstrapConfig,
    pub registry: Option<String>,
    pub fallback_to_p2p: bool,
    pub authentication: AuthenticationConfig,
    pub enforcement_level: EnforcementLevel,
    pub memory_limits: MemoryLimitsConfig,
    pub flood_protection: FloodProtectionConfig,
    pub retry: RetryConfig,
    pub proximity: ProximityConfig,
    pub discovery_timing: DiscoveryTimingConfig,
    pub network_id: Option<String>,
    pub protocol_version: Option<crate::ProtocolVersion>,
    pub constitution: Option<ConstitutionConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            capabilities: Vec::new(),
            discovery: vec![DiscoveryMethod::Mdns, DiscoveryMethod::Dht, DiscoveryMethod::Gossip],
            bootstrap: BootstrapConfig::default(),
            registry: None,
            fallback_to_p2p: true,
            authentication: AuthenticationConfig::default(),
            enforcement_level: EnforcementLevel::default(),
            memory_limits: MemoryLimitsConfig::default(),
            flood_protection: FloodProtectionConfig::default(),
            retry: RetryConfig::default(),
            proximity: ProximityConfig::default(),
            discovery_timing: DiscoveryTimingConfig::default(),
            network_id: None,
            protocol_version: None,
            constitution: None,
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file, falling back to defaults if absent;
    /// `explicit` fields (if any were already set by the caller before
    /// calling this) are left untouched — call `load_layered` instead if
    /// you need full explicit > file > default layering.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn key_path(&self) -> PathBuf {
        self.authentication
            .key_path
            .clone()
            .unwrap_or_else(|| crate::identity::default_key_path(self.node_id.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = NodeConfig::default();
        assert_eq!(config.bootstrap.timeout_ms, 30_000);
        assert_eq!(config.memory_limits.max_peers, 10_000);
        assert_eq!(config.flood_protection.dedup_max_messages, 10_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.discovery_timing.phase_timeout_ms, 5_000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(&dir.path().join("missing.json")).unwrap();
        assert!(config.capabilities.is_empty());
    }

    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = NodeConfig::default();
        config.node_id = Some("alice".into());
        config.save(&path).unwrap();
        let reloaded = NodeConfig::load(&path).unwrap();
        assert_eq!(reloaded.node_id.as_deref(), Some("alice"));
    }
}
