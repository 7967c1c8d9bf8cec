//! Cache configuration
//!
//! One tunable matters for correctness: `capacity`. Its ceiling is dictated by
//! the 12-bit membership field on every cached object, where the value equal to
//! the capacity is reserved as the "not a member" sentinel.
//!
//! # Example
//!
//! ```rust
//! use kcb_cache::CacheConfig;
//!
//! let config = CacheConfig::from_toml(
//!     r#"
//!         capacity = 512
//!         rearm_interval_ms = 250
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.capacity, 512);
//! assert_eq!(config.max_entries(), 1024);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest capacity the membership field can represent alongside its sentinel
pub const MAX_CAPACITY: u32 = 4094;

/// Default number of idle objects kept warm
pub const DEFAULT_CAPACITY: u32 = 2048;

/// Default delay before a worker fires, and between follow-up passes
pub const DEFAULT_REARM_INTERVAL_MS: u64 = 5_000;

/// Default bound on queued deferred dereferences
pub const DEFAULT_MAX_PENDING_DEREFS: u32 = 65_536;

/// Default number of lock domains in [`crate::HashedLockDomains`]
pub const DEFAULT_DOMAIN_BUCKETS: u32 = 1024;

/// Environment variable prefix used by [`CacheConfig::from_env`]
pub const ENV_PREFIX: &str = "KCB";

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The source could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// The configuration could not be serialized
    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),

    /// The source could not be read
    #[error("IO error: {0}")]
    Io(String),
}

/// Delayed-close cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Idle objects kept before the close worker starts evicting
    pub capacity: u32,

    /// Entry pool size; `None` means twice the capacity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<u32>,

    /// Worker firing delay in milliseconds
    pub rearm_interval_ms: u64,

    /// Deferred dereferences queued before new ones are leaked
    pub max_pending_derefs: u32,

    /// Number of lock domains for the built-in provider
    pub domain_buckets: u32,

    /// Whether released objects are cached at all
    pub delay_close_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_entries: None,
            rearm_interval_ms: DEFAULT_REARM_INTERVAL_MS,
            max_pending_derefs: DEFAULT_MAX_PENDING_DEREFS,
            domain_buckets: DEFAULT_DOMAIN_BUCKETS,
            delay_close_enabled: true,
        }
    }
}

impl CacheConfig {
    /// Configuration with the given capacity and defaults elsewhere
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Effective entry pool size
    pub fn max_entries(&self) -> u32 {
        self.max_entries
            .unwrap_or_else(|| self.capacity.saturating_mul(2))
    }

    /// Worker firing delay
    pub fn rearm_interval(&self) -> Duration {
        Duration::from_millis(self.rearm_interval_ms)
    }

    /// Eviction attempts allowed per close-worker pass
    pub fn eviction_budget(&self) -> u32 {
        (self.capacity / 4).max(1)
    }

    /// Check every value against its ceiling
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "capacity must be in 1..={MAX_CAPACITY}, got {}",
                self.capacity
            )));
        }
        if self.max_entries() <= self.capacity {
            return Err(ConfigError::Invalid(format!(
                "max_entries ({}) must exceed capacity ({})",
                self.max_entries(),
                self.capacity
            )));
        }
        if self.max_pending_derefs == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_derefs must be at least 1".to_string(),
            ));
        }
        if self.domain_buckets == 0 {
            return Err(ConfigError::Invalid(
                "domain_buckets must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from a TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))
    }

    /// Load from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json)
            .map_err(|e| ConfigError::Parse(format!("JSON parse error: {}", e)))
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("TOML serialize error: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("JSON serialize error: {}", e)))
    }

    /// Layer `layer` on top of `self`
    ///
    /// Every field the layer sets wins, even when it equals the default;
    /// unset fields keep the value from `self`. The result is validated.
    pub fn merge(&self, layer: &CacheConfigLayer) -> Result<Self, ConfigError> {
        let merged = layer.apply_to(self);
        merged.validate()?;
        Ok(merged)
    }

    /// Defaults overridden by `PREFIX_*` environment variables
    ///
    /// See [`CacheConfigLayer::from_env`] for the recognized variables.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Ok(CacheConfigLayer::from_env(prefix)?.apply_to(&Self::default()))
    }

    /// Apply `PREFIX_*` overrides from an arbitrary variable source
    pub fn with_overrides<I, K, V>(self, prefix: &str, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Ok(CacheConfigLayer::default()
            .with_overrides(prefix, vars)?
            .apply_to(&self))
    }
}

/// A partial configuration: one source in a layered load
///
/// Only the fields a source actually names are set, so a layer can pin a
/// value back to its default over a lower layer that changed it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfigLayer {
    /// See [`CacheConfig::capacity`]
    pub capacity: Option<u32>,
    /// See [`CacheConfig::max_entries`]
    pub max_entries: Option<u32>,
    /// See [`CacheConfig::rearm_interval_ms`]
    pub rearm_interval_ms: Option<u64>,
    /// See [`CacheConfig::max_pending_derefs`]
    pub max_pending_derefs: Option<u32>,
    /// See [`CacheConfig::domain_buckets`]
    pub domain_buckets: Option<u32>,
    /// See [`CacheConfig::delay_close_enabled`]
    pub delay_close_enabled: Option<bool>,
}

impl CacheConfigLayer {
    /// Load a layer from a TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))
    }

    /// Load a layer from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// The layer set by `PREFIX_*` environment variables
    ///
    /// Recognized: `CAPACITY`, `MAX_ENTRIES`, `REARM_INTERVAL_MS`,
    /// `MAX_PENDING_DEREFS`, `DOMAIN_BUCKETS`, `DELAY_CLOSE_ENABLED`.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::default().with_overrides(prefix, std::env::vars())
    }

    /// Set fields from `PREFIX_*` variables of an arbitrary source
    pub fn with_overrides<I, K, V>(mut self, prefix: &str, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let head = format!("{}_", prefix.to_ascii_uppercase());
        for (key, value) in vars {
            let Some(field) = key.as_ref().strip_prefix(&head) else {
                continue;
            };
            let value = value.as_ref().trim();
            match field {
                "CAPACITY" => self.capacity = Some(parse_var(field, value)?),
                "MAX_ENTRIES" => self.max_entries = Some(parse_var(field, value)?),
                "REARM_INTERVAL_MS" => self.rearm_interval_ms = Some(parse_var(field, value)?),
                "MAX_PENDING_DEREFS" => self.max_pending_derefs = Some(parse_var(field, value)?),
                "DOMAIN_BUCKETS" => self.domain_buckets = Some(parse_var(field, value)?),
                "DELAY_CLOSE_ENABLED" => self.delay_close_enabled = Some(parse_var(field, value)?),
                other => log::debug!("ignoring unknown cache setting {head}{other}"),
            }
        }
        Ok(self)
    }

    /// `base` with every field this layer sets replaced
    pub fn apply_to(&self, base: &CacheConfig) -> CacheConfig {
        CacheConfig {
            capacity: self.capacity.unwrap_or(base.capacity),
            max_entries: self.max_entries.or(base.max_entries),
            rearm_interval_ms: self.rearm_interval_ms.unwrap_or(base.rearm_interval_ms),
            max_pending_derefs: self.max_pending_derefs.unwrap_or(base.max_pending_derefs),
            domain_buckets: self.domain_buckets.unwrap_or(base.domain_buckets),
            delay_close_enabled: self.delay_close_enabled.unwrap_or(base.delay_close_enabled),
        }
    }
}

fn parse_var<V: std::str::FromStr>(field: &str, value: &str) -> Result<V, ConfigError>
where
    V::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConfigError::Parse(format!("{field}={value}: {e}")))
}
