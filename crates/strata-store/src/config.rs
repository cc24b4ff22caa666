use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Tunables of the object store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Lifetime of an object cache entry.
    pub object_cache_age: Duration,
    /// Maximum number of cached object snapshots.
    pub object_cache_size: usize,
    /// Child index coalescing window.
    pub intermediate_cache_age: Duration,
    /// Maximum number of remembered indexed URNs.
    pub intermediate_cache_size: usize,
    /// Default lease of locked opens and creates.
    pub lock_lease: Duration,
    /// Blocking acquisition timeout.
    pub lock_timeout: Duration,
    /// Blocking acquisition poll interval.
    pub lock_poll_interval: Duration,
    /// Default chunk size of new image streams.
    pub image_chunk_size: u64,
    /// Decoded chunks kept in memory per image stream.
    pub image_chunk_cache: usize,
    /// Chunks fetched per object and window by multi-stream reads.
    pub image_read_ahead: usize,
    /// Slice size for single-cell streams in multi-stream reads.
    pub multi_stream_chunk_size: usize,
    /// Ceiling for unbounded reads.
    pub max_unbound_read_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            object_cache_age: Duration::from_secs(5),
            object_cache_size: 10_000,
            intermediate_cache_age: Duration::from_secs(600),
            intermediate_cache_size: 100_000,
            lock_lease: Duration::from_secs(100),
            lock_timeout: Duration::from_secs(60),
            lock_poll_interval: Duration::from_millis(100),
            image_chunk_size: 64 * 1024,
            image_chunk_cache: 100,
            image_read_ahead: 10,
            multi_stream_chunk_size: 1024 * 1024,
            max_unbound_read_size: 10 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Parse a TOML document. Missing keys take their default.
    pub fn from_toml_str(input: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no store can operate with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.image_chunk_size == 0 {
            return Err(StoreError::Config("image_chunk_size must be positive".into()));
        }
        if self.multi_stream_chunk_size == 0 {
            return Err(StoreError::Config(
                "multi_stream_chunk_size must be positive".into(),
            ));
        }
        if self.image_read_ahead == 0 {
            return Err(StoreError::Config("image_read_ahead must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = StoreConfig::default();
        assert_eq!(c.object_cache_age, Duration::from_secs(5));
        assert_eq!(c.intermediate_cache_age, Duration::from_secs(600));
        assert_eq!(c.lock_lease, Duration::from_secs(100));
        assert_eq!(c.image_chunk_size, 65_536);
        assert_eq!(c.image_chunk_cache, 100);
        assert_eq!(c.max_unbound_read_size, 10 * 1024 * 1024);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let c = StoreConfig::from_toml_str(
            r#"
            image_chunk_size = 1024
            image_read_ahead = 2
            lock_lease = { secs = 30, nanos = 0 }
            "#,
        )
        .unwrap();
        assert_eq!(c.image_chunk_size, 1024);
        assert_eq!(c.image_read_ahead, 2);
        assert_eq!(c.lock_lease, Duration::from_secs(30));
        assert_eq!(c.object_cache_size, 10_000);
    }

    #[test]
    fn toml_rejects_zero_chunk_size() {
        let err = StoreConfig::from_toml_str("image_chunk_size = 0").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn toml_rejects_garbage() {
        assert!(StoreConfig::from_toml_str("image_chunk_size = \"big\"").is_err());
    }
}
