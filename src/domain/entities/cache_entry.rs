//! CacheKey and CacheEntry Value Objects
//!
//! Keys and entries for the two-tier detector result cache (C2). The key is
//! a single `:`-joined string, not a structured tuple, so it can be used
//! directly as a disk filename stem, an in-memory LRU key, and a substring
//! match target for the four invalidation scopes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha256Digest, Sha256};

use crate::domain::value_objects::DetectorConfig;

use super::detection::Detection;

/// Composite cache key: `frame_hash:slug(detector_name):detector_version:config_hash[:scene_context]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// MD5 of raw frame bytes. Speed, not security, matters here.
    pub fn frame_content_hash(frame_bytes: &[u8]) -> String {
        use md5::{Digest, Md5};
        let mut hasher = Md5::new();
        hasher.update(frame_bytes);
        format!("{:x}", hasher.finalize())
    }

    /// First 16 hex chars of SHA-256 over the config, serialized with keys
    /// sorted so equivalent configs hash identically regardless of
    /// insertion order.
    pub fn config_hash(config: &DetectorConfig) -> String {
        let sorted: BTreeMap<&String, &crate::domain::value_objects::ConfigValue> = config.iter().collect();
        let serialized = serde_json::to_string(&sorted).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        let digest = hasher.finalize();
        format!("{digest:x}")[..16].to_string()
    }

    /// Builds the composite key from its already-computed parts.
    pub fn new(
        frame_hash: &str,
        detector_name: &str,
        detector_version: &str,
        config_hash: &str,
        scene_context: Option<&str>,
    ) -> Self {
        let slug = detector_name.replace(' ', "_");
        let mut composite = format!("{frame_hash}:{slug}:{detector_version}:{config_hash}");
        if let Some(scene) = scene_context {
            composite.push(':');
            composite.push_str(scene);
        }
        Self(composite)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shard directory: first two characters of the key (the leading hex
    /// frame-hash chars double as a uniform sharding prefix).
    pub fn shard(&self) -> &str {
        &self.0[..2.min(self.0.len())]
    }

    /// Cache-invalidation substring a matching key must contain: `:slug(name):`.
    pub fn detector_scope(detector_name: &str) -> String {
        format!(":{}:", detector_name.replace(' ', "_"))
    }

    /// Cache-invalidation substring identifying one config hash's segment of
    /// the key, regardless of what scene context (if any) follows it.
    pub fn config_hash_segment(config_hash: &str) -> String {
        format!(":{config_hash}")
    }

    /// Cache-invalidation prefix for a frame's own hash.
    pub fn frame_prefix(frame_hash: &str) -> String {
        format!("{frame_hash}:")
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cached detector result plus the bookkeeping needed for tier management
/// and the cache's TTL/eviction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub detections: Vec<Detection>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn new(key: CacheKey, detections: Vec<Detection>) -> Self {
        let now = Utc::now();
        Self {
            key,
            detections,
            created_at: now,
            last_accessed_at: now,
            hit_count: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
        self.hit_count += 1;
    }

    pub fn is_expired(&self, ttl: chrono::Duration) -> bool {
        Utc::now() - self.created_at > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_identical_keys() {
        let frame_hash = CacheKey::frame_content_hash(b"frame-a");
        let a = CacheKey::new(&frame_hash, "D", "1.0.0", "cfg1", None);
        let b = CacheKey::new(&frame_hash, "D", "1.0.0", "cfg1", None);
        assert_eq!(a, b);
    }

    #[test]
    fn differing_frame_content_produces_differing_keys() {
        let hash_a = CacheKey::frame_content_hash(b"frame-a");
        let hash_b = CacheKey::frame_content_hash(b"frame-a-changed");
        let a = CacheKey::new(&hash_a, "D", "1.0.0", "cfg1", None);
        let b = CacheKey::new(&hash_b, "D", "1.0.0", "cfg1", None);
        assert_ne!(a, b);
    }

    #[test]
    fn detector_name_spaces_become_underscores_in_key() {
        let hash = CacheKey::frame_content_hash(b"x");
        let key = CacheKey::new(&hash, "Red Prop Check", "1.0.0", "cfg1", None);
        assert!(key.as_str().contains(":Red_Prop_Check:"));
    }

    #[test]
    fn scene_context_is_appended_when_present() {
        let hash = CacheKey::frame_content_hash(b"x");
        let key = CacheKey::new(&hash, "D", "1.0.0", "cfg1", Some("scene_2_angle_3"));
        assert!(key.as_str().ends_with(":scene_2_angle_3"));
    }

    #[test]
    fn shard_is_first_two_characters_of_key() {
        let hash = CacheKey::frame_content_hash(b"x");
        let key = CacheKey::new(&hash, "D", "1.0.0", "cfg1", None);
        assert_eq!(key.shard(), &key.as_str()[..2]);
    }

    #[test]
    fn config_hash_is_stable_regardless_of_insertion_order() {
        use crate::domain::value_objects::ConfigValue;
        let mut a = DetectorConfig::new();
        a.insert("b".to_string(), ConfigValue::Number(1.0));
        a.insert("a".to_string(), ConfigValue::Number(2.0));

        let mut b = DetectorConfig::new();
        b.insert("a".to_string(), ConfigValue::Number(2.0));
        b.insert("b".to_string(), ConfigValue::Number(1.0));

        assert_eq!(CacheKey::config_hash(&a), CacheKey::config_hash(&b));
    }

    #[test]
    fn touch_increments_hit_count() {
        let hash = CacheKey::frame_content_hash(b"x");
        let key = CacheKey::new(&hash, "D", "1.0.0", "cfg1", None);
        let mut entry = CacheEntry::new(key, vec![]);
        entry.touch();
        entry.touch();
        assert_eq!(entry.hit_count, 2);
    }
}
