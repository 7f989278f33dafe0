//! Result Cache (C2)
//!
//! Two-tier cache for detector results keyed by frame content, detector
//! identity/version, and config: an in-memory LRU tier for speed, and a
//! sharded on-disk tier so a restarted take does not re-run every
//! detector on every frame it already processed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use tracing::warn;

use crate::domain::entities::{CacheKey, Detection};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(String),
    #[error("cache entry corrupted: {0}")]
    Corruption(String),
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub memory_evictions: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub disk_writes: u64,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub memory_capacity: usize,
    pub disk_entry_capacity: usize,
    pub disk_size_bytes: u64,
    pub ttl: chrono::Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("detector_cache"),
            memory_capacity: 1000,
            disk_entry_capacity: 10_000,
            disk_size_bytes: 1_000 * 1024 * 1024,
            ttl: chrono::Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskIndexEntry {
    size: u64,
    created_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
}

struct MemoryTier {
    cache: LruCache<String, (Vec<Detection>, DateTime<Utc>)>,
    stats: CacheStats,
}

struct DiskTier {
    config: CacheConfig,
    index: HashMap<String, DiskIndexEntry>,
    writes_since_checkpoint: u64,
    stats: CacheStats,
}

/// Two-tier detector result cache. One instance is shared across every
/// detector instance in the engine; keys already scope by detector name
/// and version so there is no cross-detector collision risk.
pub struct ResultCache {
    memory: Mutex<MemoryTier>,
    disk: Mutex<DiskTier>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        fs::create_dir_all(&config.cache_dir).ok();
        let index = Self::load_index(&config.cache_dir).unwrap_or_default();

        let memory_capacity =
            NonZeroUsize::new(config.memory_capacity).unwrap_or(NonZeroUsize::new(1).unwrap());

        Self {
            memory: Mutex::new(MemoryTier {
                cache: LruCache::new(memory_capacity),
                stats: CacheStats::default(),
            }),
            disk: Mutex::new(DiskTier {
                config,
                index,
                writes_since_checkpoint: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    fn index_path(cache_dir: &Path) -> PathBuf {
        cache_dir.join("cache_index.json")
    }

    fn load_index(cache_dir: &Path) -> Option<HashMap<String, DiskIndexEntry>> {
        let path = Self::index_path(cache_dir);
        let bytes = fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn save_index(config: &CacheConfig, index: &HashMap<String, DiskIndexEntry>) {
        let path = Self::index_path(&config.cache_dir);
        let tmp_path = path.with_extension("json.tmp");
        let Ok(bytes) = serde_json::to_vec(index) else { return };
        if fs::write(&tmp_path, bytes).is_ok() {
            let _ = fs::rename(&tmp_path, &path);
        }
    }

    fn shard_path(config: &CacheConfig, key: &CacheKey) -> PathBuf {
        config.cache_dir.join(key.shard()).join(format!("{}.json", key.as_str().replace(':', "_")))
    }

    /// Reads a cached result, checking memory then disk, promoting disk
    /// hits back into memory. Returns `None` on a miss or on a disk entry
    /// that is corrupt (dropped from the index, reported as a miss).
    pub fn get(&self, key: &CacheKey) -> Option<Vec<Detection>> {
        {
            let mut memory = self.memory.lock().unwrap();
            if let Some((detections, created_at)) = memory.cache.get(key.as_str()).cloned() {
                if Utc::now() - created_at <= self.ttl() {
                    memory.stats.memory_hits += 1;
                    return Some(detections);
                }
                memory.cache.pop(key.as_str());
            }
            memory.stats.memory_misses += 1;
        }

        let mut disk = self.disk.lock().unwrap();
        let Some(entry) = disk.index.get(key.as_str()).cloned() else {
            disk.stats.disk_misses += 1;
            return None;
        };

        let path = Self::shard_path(&disk.config, key);
        let read_result = fs::read(&path).map_err(|e| CacheError::Io(e.to_string())).and_then(|bytes| {
            serde_json::from_slice::<Vec<Detection>>(&bytes).map_err(|e| CacheError::Corruption(e.to_string()))
        });

        match read_result {
            Ok(detections) => {
                if Utc::now() - entry.created_at > self.ttl() {
                    disk.index.remove(key.as_str());
                    disk.stats.disk_misses += 1;
                    return None;
                }
                disk.index.get_mut(key.as_str()).unwrap().last_access = Utc::now();
                disk.stats.disk_hits += 1;
                let config = disk.config.clone();
                Self::save_index(&config, &disk.index);

                let mut memory = self.memory.lock().unwrap();
                memory.cache.put(key.as_str().to_string(), (detections.clone(), entry.created_at));
                Some(detections)
            }
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "dropping corrupt disk cache entry");
                disk.index.remove(key.as_str());
                disk.stats.disk_misses += 1;
                let config = disk.config.clone();
                Self::save_index(&config, &disk.index);
                None
            }
        }
    }

    /// Writes a result to both tiers. Disk writes are atomic
    /// (temp-file-then-rename) and trigger eviction when either the entry
    /// count or total byte size cap is breached.
    pub fn put(&self, key: &CacheKey, detections: Vec<Detection>) -> Result<(), CacheError> {
        let now = Utc::now();
        {
            let mut memory = self.memory.lock().unwrap();
            let was_present = memory.cache.contains(key.as_str());
            memory.cache.put(key.as_str().to_string(), (detections.clone(), now));
            if !was_present && memory.cache.len() > memory.cache.cap().get() {
                memory.stats.memory_evictions += 1;
            }
        }

        let mut disk = self.disk.lock().unwrap();
        let path = Self::shard_path(&disk.config, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::Io(e.to_string()))?;
        }

        let bytes = serde_json::to_vec(&detections).map_err(|e| CacheError::Corruption(e.to_string()))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &bytes).map_err(|e| CacheError::Io(e.to_string()))?;
        fs::rename(&tmp_path, &path).map_err(|e| CacheError::Io(e.to_string()))?;

        disk.index.insert(
            key.as_str().to_string(),
            DiskIndexEntry { size: bytes.len() as u64, created_at: now, last_access: now },
        );
        disk.stats.disk_writes += 1;
        disk.writes_since_checkpoint += 1;

        self.evict_if_needed(&mut disk);

        if disk.writes_since_checkpoint >= 100 {
            disk.writes_since_checkpoint = 0;
            let config = disk.config.clone();
            Self::save_index(&config, &disk.index);
        }

        Ok(())
    }

    fn evict_if_needed(&self, disk: &mut DiskTier) {
        let mut evicted = false;

        if disk.index.len() > disk.config.disk_entry_capacity {
            let overage = disk.index.len() - disk.config.disk_entry_capacity;
            self.evict_lru_count(disk, overage);
            evicted = true;
        }

        let total_size: u64 = disk.index.values().map(|e| e.size).sum();
        if total_size > disk.config.disk_size_bytes {
            let target = (disk.config.disk_size_bytes as f64 * 0.9) as u64;
            self.evict_until_size(disk, target);
            evicted = true;
        }

        if evicted {
            let config = disk.config.clone();
            Self::save_index(&config, &disk.index);
        }
    }

    fn sorted_by_last_access(disk: &DiskTier) -> Vec<String> {
        let mut keys: Vec<(String, DateTime<Utc>)> =
            disk.index.iter().map(|(k, v)| (k.clone(), v.last_access)).collect();
        keys.sort_by_key(|(_, last_access)| *last_access);
        keys.into_iter().map(|(k, _)| k).collect()
    }

    fn evict_lru_count(&self, disk: &mut DiskTier, count: usize) {
        for key in Self::sorted_by_last_access(disk).into_iter().take(count) {
            self.remove_disk_entry(disk, &key);
        }
    }

    fn evict_until_size(&self, disk: &mut DiskTier, target_size: u64) {
        let mut total_size: u64 = disk.index.values().map(|e| e.size).sum();
        for key in Self::sorted_by_last_access(disk) {
            if total_size <= target_size {
                break;
            }
            if let Some(entry) = disk.index.get(&key) {
                total_size = total_size.saturating_sub(entry.size);
            }
            self.remove_disk_entry(disk, &key);
        }
    }

    fn remove_disk_entry(&self, disk: &mut DiskTier, key: &str) {
        if let Some(_entry) = disk.index.remove(key) {
            let shard = &key[..2.min(key.len())];
            let path = disk.config.cache_dir.join(shard).join(format!("{}.json", key.replace(':', "_")));
            let _ = fs::remove_file(path);
        }
    }

    fn ttl(&self) -> chrono::Duration {
        self.disk.lock().unwrap().config.ttl
    }

    /// Removes every key scoped to `detector_name`.
    pub fn invalidate_detector(&self, detector_name: &str) -> usize {
        let scope = CacheKey::detector_scope(detector_name);
        self.invalidate_matching(|key| key.contains(&scope))
    }

    /// Removes every key scoped to `detector_name` under the given config's hash.
    pub fn invalidate_config(&self, detector_name: &str, config: &crate::domain::value_objects::DetectorConfig) -> usize {
        let detector_scope = CacheKey::detector_scope(detector_name);
        let config_hash = CacheKey::config_hash(config);
        let config_segment = CacheKey::config_hash_segment(&config_hash);
        self.invalidate_matching(|key| key.contains(&detector_scope) && key.contains(&config_segment))
    }

    /// Removes every key carrying the given scene-context suffix.
    pub fn invalidate_scene(&self, scene_tag: &str) -> usize {
        self.invalidate_matching(|key| key.ends_with(&format!(":{scene_tag}")))
    }

    /// Removes every key derived from the given frame content hash.
    pub fn invalidate_frame(&self, frame_hash: &str) -> usize {
        let prefix = CacheKey::frame_prefix(frame_hash);
        self.invalidate_matching(|key| key.starts_with(&prefix))
    }

    fn invalidate_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut memory = self.memory.lock().unwrap();
        let memory_keys: Vec<String> =
            memory.cache.iter().map(|(k, _)| k.clone()).filter(|k| predicate(k)).collect();
        for key in &memory_keys {
            memory.cache.pop(key);
        }
        drop(memory);

        let mut disk = self.disk.lock().unwrap();
        let disk_keys: Vec<String> = disk.index.keys().filter(|k| predicate(k)).cloned().collect();
        let removed = disk_keys.len();
        for key in disk_keys {
            self.remove_disk_entry(&mut disk, &key);
        }
        if removed > 0 {
            let config = disk.config.clone();
            Self::save_index(&config, &disk.index);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let memory = self.memory.lock().unwrap().stats;
        let disk = self.disk.lock().unwrap().stats;
        CacheStats {
            memory_hits: memory.memory_hits,
            memory_misses: memory.memory_misses,
            memory_evictions: memory.memory_evictions,
            disk_hits: disk.disk_hits,
            disk_misses: disk.disk_misses,
            disk_writes: disk.disk_writes,
        }
    }

    /// Flushes the disk index, for use on a checkpoint timer and on
    /// shutdown.
    pub fn checkpoint(&self) {
        let disk = self.disk.lock().unwrap();
        Self::save_index(&disk.config, &disk.index);
    }
}
