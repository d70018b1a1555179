//! Peer matcher (`spec.md` §4.7): score `PeerInfo`s against a capability
//! query and rank them.
//!
//! No direct teacher analog — `freeq` has no capability matcher — so the
//! fuzzy-name metric is grounded on the identifier-similarity idiom seen in
//! `examples/other_examples/manifests/MystenLabs-sui` (`strsim`-based
//! fuzzy matching over package/module names).

use std::cmp::Ordering;

use semver::Version;
use strsim::jaro_winkler;

use crate::model::{Capability, PeerInfo};

const WEIGHT_TYPE: f64 = 0.3;
const WEIGHT_NAME: f64 = 0.3;
const WEIGHT_VERSION: f64 = 0.1;
const WEIGHT_FEATURE: f64 = 0.2;
const WEIGHT_METADATA: f64 = 0.1;

const FUZZY_NAME_THRESHOLD: f64 = 0.7;
const FUZZY_NAME_SCORE: f64 = 0.7;
const MIN_REQUIRED_MATCH: f64 = 0.5;
const PREFERRED_BONUS: f64 = 0.1;
const TIE_EPSILON: f64 = 0.01;

/// What a caller is looking for: peers must offer a reasonable match for
/// every entry in `required_capabilities`.
#[derive(Debug, Clone, Default)]
pub struct CapabilityQuery {
    pub required_capabilities: Vec<Capability>,
    pub preferred_peers: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ScoredPeer {
    pub peer: PeerInfo,
    pub score: f64,
}

fn lowercase_alnum(s: &str) -> String {
    s.chars().filter(|c| c.is_alphanumeric()).flat_map(|c| c.to_lowercase()).collect()
}

/// name: equal → full; fuzzy (lowercase-alnum substring OR Jaro-Winkler
/// similarity > 0.7) → 0.7×; else 0.
fn name_score(required: &str, offered: &str) -> f64 {
    if required == offered {
        return 1.0;
    }
    let a = lowercase_alnum(required);
    let b = lowercase_alnum(offered);
    if !a.is_empty() && !b.is_empty() && (b.contains(&a) || a.contains(&b)) {
        return FUZZY_NAME_SCORE;
    }
    if jaro_winkler(&a, &b) > FUZZY_NAME_THRESHOLD {
        return FUZZY_NAME_SCORE;
    }
    0.0
}

/// Capability versions aren't guaranteed full SemVer (a bare `X.Y` is
/// common); pad a missing patch component before handing off to
/// `semver::Version::parse` so comparison still benefits from its
/// correct precedence rules.
fn parse_semver(version: &str) -> Option<Version> {
    let trimmed = version.trim();
    let mut parts = trimmed.splitn(3, '.');
    let major = parts.next()?;
    let minor = parts.next().unwrap_or("0");
    let patch = parts.next().unwrap_or("0");
    Version::parse(&format!("{major}.{minor}.{patch}")).ok()
}

/// version: parse `X.Y.Z`; equal → 1.0; same major.minor → 0.9; same
/// major, higher minor → 0.7; same major → 0.5; else 0.2; unparseable → 0.5.
fn version_score(required: &str, offered: &str) -> f64 {
    let (Some(r), Some(o)) = (parse_semver(required), parse_semver(offered)) else {
        return 0.5;
    };
    if r.major == o.major && r.minor == o.minor && r.patch == o.patch {
        1.0
    } else if r.major == o.major && r.minor == o.minor {
        0.9
    } else if r.major == o.major && o.minor > r.minor {
        0.7
    } else if r.major == o.major {
        0.5
    } else {
        0.2
    }
}

fn metadata_value_score(required: &serde_json::Value, offered: &serde_json::Value) -> f64 {
    if required == offered {
        return 1.0;
    }
    if let (Some(r), Some(o)) = (required.as_str(), offered.as_str()) {
        let a = lowercase_alnum(r);
        let b = lowercase_alnum(o);
        if !a.is_empty() && jaro_winkler(&a, &b) > FUZZY_NAME_THRESHOLD {
            return FUZZY_NAME_SCORE;
        }
        return 0.0;
    }
    0.0
}

/// metadata: for each requested key, exact match → 1, fuzzy string match →
/// 0.7, `features` arrays → fraction overlapping; averaged.
fn metadata_score(required: &Capability, offered: &Capability) -> f64 {
    let Some(required_meta) = &required.metadata else { return 1.0 };
    if required_meta.is_empty() {
        return 1.0;
    }
    let empty = std::collections::HashMap::new();
    let offered_meta = offered.metadata.as_ref().unwrap_or(&empty);

    let mut total = 0.0;
    for (key, required_value) in required_meta {
        let Some(offered_value) = offered_meta.get(key) else {
            continue;
        };
        if key == "features" {
            if let (Some(req_arr), Some(off_arr)) = (required_value.as_array(), offered_value.as_array()) {
                if req_arr.is_empty() {
                    total += 1.0;
                    continue;
                }
                let overlap = req_arr.iter().filter(|v| off_arr.contains(v)).count();
                total += overlap as f64 / req_arr.len() as f64;
                continue;
            }
        }
        total += metadata_value_score(required_value, offered_value);
    }
    total / required_meta.len() as f64
}

/// Score a single `(required, offered)` capability pairing.
pub fn capability_score(required: &Capability, offered: &Capability) -> f64 {
    if required.kind != offered.kind {
        return 0.0;
    }
    let type_component = WEIGHT_TYPE;
    let name_component = WEIGHT_NAME * name_score(&required.name, &offered.name);
    let version_component = WEIGHT_VERSION * version_score(&required.version, &offered.version);
    // No distinct "feature" capability field beyond metadata's `features`
    // key — the weight folds into the same metadata computation the spec
    // describes, since `Capability` carries no separate feature list.
    let metadata_component = (WEIGHT_FEATURE + WEIGHT_METADATA) * metadata_score(required, offered);
    type_component + name_component + version_component + metadata_component
}

/// Best score this peer offers for one required capability, or `0.0` if it
/// offers nothing of that `type`.
fn best_match_for(peer: &PeerInfo, required: &Capability) -> f64 {
    peer.capabilities
        .iter()
        .map(|offered| capability_score(required, offered))
        .fold(0.0, f64::max)
}

/// Score every peer against `query`, keeping only those whose best match
/// for every required capability is ≥ 0.5 and where at least one required
/// capability scores positively, then sort by score desc (ties within
/// `TIE_EPSILON` broken by reputation desc, stable otherwise).
pub fn match_peers(peers: &[PeerInfo], query: &CapabilityQuery) -> Vec<ScoredPeer> {
    if query.required_capabilities.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<ScoredPeer> = peers
        .iter()
        .filter_map(|peer| {
            let per_required: Vec<f64> = query
                .required_capabilities
                .iter()
                .map(|required| best_match_for(peer, required))
                .collect();

            if per_required.iter().any(|s| *s < MIN_REQUIRED_MATCH) {
                return None;
            }
            if !per_required.iter().any(|s| *s > 0.0) {
                return None;
            }

            let mut score = per_required.iter().sum::<f64>() / per_required.len() as f64;
            if query.preferred_peers.as_ref().is_some_and(|p| p.contains(&peer.id)) {
                score = (score + PREFERRED_BONUS).min(1.0);
            }
            Some(ScoredPeer { peer: peer.clone(), score })
        })
        .collect();

    scored.sort_by(|a, b| {
        let delta = b.score - a.score;
        if delta.abs() <= TIE_EPSILON {
            let rep_a = a.peer.reputation.unwrap_or(0.0);
            let rep_b = b.peer.reputation.unwrap_or(0.0);
            rep_b.partial_cmp(&rep_a).unwrap_or(Ordering::Equal)
        } else {
            b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
        }
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(kind: &str, name: &str, version: &str) -> Capability {
        Capability { kind: kind.into(), name: name.into(), version: version.into(), metadata: None }
    }

    fn peer(id: &str, reputation: Option<f64>, caps: Vec<Capability>) -> PeerInfo {
        PeerInfo { id: id.into(), addresses: vec![], capabilities: caps, last_seen: 0, reputation }
    }

    #[test]
    fn exact_match_scores_one() {
        let required = cap("storage", "ipfs", "1.2.3");
        let offered = cap("storage", "ipfs", "1.2.3");
        assert_eq!(capability_score(&required, &offered), 1.0);
    }

    #[test]
    fn type_mismatch_is_hard_zero() {
        let required = cap("storage", "ipfs", "1.2.3");
        let offered = cap("compute", "ipfs", "1.2.3");
        assert_eq!(capability_score(&required, &offered), 0.0);
    }

    #[test]
    fn tie_break_by_reputation_matches_spec_scenario() {
        let caps = vec![cap("compute", "gpu", "1.0.0")];
        let p1 = peer("p1", Some(10.0), caps.clone());
        let p2 = peer("p2", Some(50.0), caps.clone());
        let query = CapabilityQuery { required_capabilities: vec![cap("compute", "gpu", "1.0.0")], preferred_peers: None };
        let result = match_peers(&[p1, p2], &query);
        assert_eq!(result[0].peer.id, "p2");
        assert_eq!(result[1].peer.id, "p1");
    }

    #[test]
    fn preferred_peer_gets_bonus_within_cap() {
        // A required metadata key the peer doesn't offer drags the metadata
        // component to 0, so the base score sits below 1.0 and the bonus is
        // observable rather than immediately clamped.
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("region".to_string(), serde_json::json!("us"));
        let required = Capability { kind: "compute".into(), name: "gpu".into(), version: "1.0.0".into(), metadata: Some(metadata) };
        let offered = cap("compute", "gpu", "1.0.0");
        let p = peer("p1", None, vec![offered]);

        let base_query = CapabilityQuery { required_capabilities: vec![required], preferred_peers: None };
        let pref_query = CapabilityQuery { preferred_peers: Some(vec!["p1".into()]), ..base_query.clone() };
        let base = match_peers(std::slice::from_ref(&p), &base_query)[0].score;
        let boosted = match_peers(&[p], &pref_query)[0].score;
        assert!(boosted > base);
        assert!(boosted - base <= 0.1 + f64::EPSILON);
    }

    #[test]
    fn low_match_peers_are_excluded() {
        let caps = vec![cap("compute", "totally-unrelated-name-xyz", "9.9.9")];
        let p = peer("p1", None, caps);
        let query = CapabilityQuery { required_capabilities: vec![cap("storage", "ipfs", "1.0.0")], preferred_peers: None };
        assert!(match_peers(&[p], &query).is_empty());
    }
}
