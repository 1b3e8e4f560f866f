//! Cache tunables.
//!
//! [`DbufCacheConfig`] is published through [`Tunables`], an
//! [`arc_swap::ArcSwap`] cell. Tier targets and watermarks are recomputed
//! from the current value on every call, so updates take effect on the next
//! insertion or eviction cycle without restarting anything.
//!
//! # Logging
//!
//! - **DEBUG** `dbc::config` `tunables_update`: a new config was published
//! - **WARN**  `dbc::config` `config_env_ignored`: an override did not parse

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Tunable parameters for the dbuf cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbufCacheConfig {
    /// Absolute ceiling for the general tier, in bytes.
    pub cache_max_bytes: u64,
    /// General tier target is `store cache size >> cache_shift`.
    pub cache_shift: u8,
    /// Absolute ceiling for the metadata tier, in bytes.
    pub metadata_cache_max_bytes: u64,
    /// Metadata tier target is `store cache size >> metadata_cache_shift`.
    pub metadata_cache_shift: u8,
    /// Percent above target at which inserting threads evict directly.
    pub cache_hiwater_pct: u32,
    /// Percent below target at which the eviction worker stops.
    pub cache_lowater_pct: u32,
    /// Identity table has `1 << hash_table_shift` buckets.
    pub hash_table_shift: u8,
    /// LRU sublists per tier.
    pub cache_sublists: usize,
    /// Start the background eviction thread.
    pub spawn_evict_worker: bool,
    /// Read redacted blocks as zeros instead of failing.
    pub allow_redacted_reads: bool,
}

impl Default for DbufCacheConfig {
    fn default() -> Self {
        Self {
            cache_max_bytes: u64::MAX,
            cache_shift: 5,
            metadata_cache_max_bytes: u64::MAX,
            metadata_cache_shift: 6,
            cache_hiwater_pct: 10,
            cache_lowater_pct: 10,
            hash_table_shift: 12,
            cache_sublists: 4,
            spawn_evict_worker: true,
            allow_redacted_reads: false,
        }
    }
}

const ENV_CACHE_MAX: &str = "DBUF_CACHE_MAX_BYTES";
const ENV_CACHE_SHIFT: &str = "DBUF_CACHE_SHIFT";
const ENV_METADATA_MAX: &str = "DBUF_METADATA_CACHE_MAX_BYTES";
const ENV_METADATA_SHIFT: &str = "DBUF_METADATA_CACHE_SHIFT";
const ENV_HIWATER: &str = "DBUF_CACHE_HIWATER_PCT";
const ENV_LOWATER: &str = "DBUF_CACHE_LOWATER_PCT";

impl DbufCacheConfig {
    /// Overlay `DBUF_*` environment variables onto `self`.
    #[must_use]
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`; unparsable values are ignored.
    #[must_use]
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) {
            let Some(raw) = lookup(key) else { return };
            match raw.trim().parse::<T>() {
                Ok(value) => *slot = value,
                Err(_) => warn!(target: "dbc::config", key, value = %raw, "config_env_ignored"),
            }
        }

        parse(&lookup, ENV_CACHE_MAX, &mut self.cache_max_bytes);
        parse(&lookup, ENV_CACHE_SHIFT, &mut self.cache_shift);
        parse(&lookup, ENV_METADATA_MAX, &mut self.metadata_cache_max_bytes);
        parse(&lookup, ENV_METADATA_SHIFT, &mut self.metadata_cache_shift);
        parse(&lookup, ENV_HIWATER, &mut self.cache_hiwater_pct);
        parse(&lookup, ENV_LOWATER, &mut self.cache_lowater_pct);
        self
    }

    /// General tier target for a block cache of `store_bytes`.
    #[must_use]
    pub fn general_target(&self, store_bytes: u64) -> u64 {
        shifted(store_bytes, self.cache_shift).min(self.cache_max_bytes)
    }

    /// Metadata tier target for a block cache of `store_bytes`.
    #[must_use]
    pub fn metadata_target(&self, store_bytes: u64) -> u64 {
        shifted(store_bytes, self.metadata_cache_shift).min(self.metadata_cache_max_bytes)
    }

    #[must_use]
    pub fn hiwater(&self, target: u64) -> u64 {
        scale_pct(target, 100 + u64::from(self.cache_hiwater_pct))
    }

    #[must_use]
    pub fn lowater(&self, target: u64) -> u64 {
        scale_pct(target, 100_u64.saturating_sub(u64::from(self.cache_lowater_pct)))
    }
}

fn shifted(bytes: u64, shift: u8) -> u64 {
    bytes.checked_shr(u32::from(shift)).unwrap_or(0)
}

fn scale_pct(value: u64, pct: u64) -> u64 {
    let scaled = u128::from(value) * u128::from(pct) / 100;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Runtime-swappable configuration cell.
#[derive(Debug)]
pub struct Tunables {
    current: ArcSwap<DbufCacheConfig>,
}

impl Tunables {
    #[must_use]
    pub fn new(config: DbufCacheConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
        }
    }

    #[must_use]
    pub fn load(&self) -> Arc<DbufCacheConfig> {
        self.current.load_full()
    }

    pub fn update(&self, config: DbufCacheConfig) {
        debug!(
            target: "dbc::config",
            cache_max_bytes = config.cache_max_bytes,
            cache_shift = config.cache_shift,
            hiwater_pct = config.cache_hiwater_pct,
            lowater_pct = config.cache_lowater_pct,
            "tunables_update"
        );
        self.current.store(Arc::new(config));
    }
}
