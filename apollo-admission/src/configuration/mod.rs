//! Logic for loading configuration in to an object model
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use displaydoc::Display;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::cost::CostTable;
use crate::identity::Tier;

mod schema;

pub use self::schema::generate_config_schema;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_MAX_ROOT_FIELDS: usize = 50;
const DEFAULT_REDIS_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not read configuration file: {0}
    CannotReadFile(std::io::Error),
    /// could not deserialize configuration: {0}
    DeserializeConfigError(serde_yaml::Error),
    /// {message}: {error}
    InvalidConfiguration {
        message: &'static str,
        error: String,
    },
}

/// The configuration for admission control.
///
/// Can be created through `serde::Deserialize` from various formats,
/// or from YAML with [`FromStr`].
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Evaluate requests against their quota. When disabled every request is admitted.
    pub(crate) enabled: bool,

    /// The refill period shared by every capacity tier.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub(crate) window: Duration,

    /// Maximum number of root fields priced per operation.
    pub(crate) max_root_fields: usize,

    /// Cost of each root operation.
    pub(crate) costs: CostTable,

    /// Bucket capacity per caller tier.
    pub(crate) tiers: Tiers,

    /// Where bucket state lives.
    pub(crate) limiter: LimiterConfig,

    /// What to do with a request when the bucket store cannot be reached.
    pub(crate) on_backend_error: FailurePolicy,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            enabled: true,
            window: DEFAULT_WINDOW,
            max_root_fields: DEFAULT_MAX_ROOT_FIELDS,
            costs: CostTable::default(),
            tiers: Tiers::default(),
            limiter: LimiterConfig::default(),
            on_backend_error: FailurePolicy::default(),
        }
    }
}

impl Configuration {
    /// Read and validate a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let content =
            std::fs::read_to_string(path).map_err(ConfigurationError::CannotReadFile)?;
        content.parse()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn costs(&self) -> &CostTable {
        &self.costs
    }

    pub fn tiers(&self) -> &Tiers {
        &self.tiers
    }

    pub fn limiter(&self) -> &LimiterConfig {
        &self.limiter
    }

    pub fn on_backend_error(&self) -> FailurePolicy {
        self.on_backend_error
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.window.as_millis() == 0 {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "invalid window",
                error: "the refill window must be at least one millisecond".to_string(),
            });
        }
        if self.max_root_fields == 0 {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "invalid max_root_fields",
                error: "at least one root field must be priced".to_string(),
            });
        }
        for tier in [Tier::Admin, Tier::User, Tier::Anonymous] {
            if self.tiers.capacity_for(tier) == 0 {
                return Err(ConfigurationError::InvalidConfiguration {
                    message: "invalid tier capacity",
                    error: format!("the {tier} tier must have a capacity greater than zero"),
                });
            }
        }
        if let LimiterConfig::Local(LocalLimiterConfig {
            sweep_interval: Some(interval),
        }) = &self.limiter
        {
            if interval.is_zero() {
                return Err(ConfigurationError::InvalidConfiguration {
                    message: "invalid local limiter",
                    error: "the sweep interval must be greater than zero".to_string(),
                });
            }
        }
        if let LimiterConfig::Redis(redis) = &self.limiter {
            if redis.urls.is_empty() {
                return Err(ConfigurationError::InvalidConfiguration {
                    message: "invalid redis limiter",
                    error: "at least one redis url is required".to_string(),
                });
            }
            if redis.pool_size == 0 {
                return Err(ConfigurationError::InvalidConfiguration {
                    message: "invalid redis limiter",
                    error: "the connection pool needs at least one connection".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let configuration: Configuration =
            serde_yaml::from_str(s).map_err(ConfigurationError::DeserializeConfigError)?;
        configuration.validate()?;
        Ok(configuration)
    }
}

/// Bucket capacity, in cost units per window, for each caller tier.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Tiers {
    /// Administrative identities
    admin: u64,
    /// Authenticated identities
    user: u64,
    /// Unauthenticated callers, keyed by address
    anonymous: u64,
}

impl Default for Tiers {
    fn default() -> Self {
        Self {
            admin: 100_000,
            user: 300,
            anonymous: 60,
        }
    }
}

impl Tiers {
    pub fn new(admin: u64, user: u64, anonymous: u64) -> Self {
        Self {
            admin,
            user,
            anonymous,
        }
    }

    pub fn capacity_for(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Admin => self.admin,
            Tier::User => self.user,
            Tier::Anonymous => self.anonymous,
        }
    }
}

/// Bucket storage, chosen by deployment topology.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub enum LimiterConfig {
    /// In-process fixed-window buckets. Only correct for a single instance.
    Local(LocalLimiterConfig),
    /// Continuously refilling buckets shared by every instance through Redis.
    Redis(RedisConfig),
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig::Local(LocalLimiterConfig::default())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct LocalLimiterConfig {
    /// How often expired buckets are dropped from memory. Defaults to the window.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub(crate) sweep_interval: Option<Duration>,
}

/// Redis connection configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// List of URLs to the Redis cluster
    pub(crate) urls: Vec<Url>,

    /// Redis username if not provided in the URLs. This field takes precedence over the username in the URL
    #[serde(default)]
    pub(crate) username: Option<String>,
    /// Redis password if not provided in the URLs. This field takes precedence over the password in the URL
    #[serde(default)]
    pub(crate) password: Option<String>,

    #[serde(with = "humantime_serde", default = "default_redis_timeout")]
    #[schemars(with = "String", default = "default_redis_timeout_string")]
    /// Redis request timeout (default: 500ms)
    pub(crate) timeout: Duration,

    /// Prefix prepended to every bucket key
    #[serde(default = "default_namespace")]
    pub(crate) namespace: Option<String>,

    #[serde(default = "default_pool_size")]
    /// The size of the Redis connection pool
    pub(crate) pool_size: u32,

    #[serde(default)]
    /// Prevents the admission layer from starting if it cannot connect to Redis
    pub(crate) required_to_start: bool,
}

impl RedisConfig {
    pub fn new(urls: Vec<Url>) -> Self {
        Self {
            urls,
            username: None,
            password: None,
            timeout: default_redis_timeout(),
            namespace: default_namespace(),
            pool_size: default_pool_size(),
            required_to_start: false,
        }
    }
}

fn default_redis_timeout() -> Duration {
    DEFAULT_REDIS_TIMEOUT
}

fn default_redis_timeout_string() -> String {
    "500ms".to_string()
}

fn default_namespace() -> Option<String> {
    Some("admission".to_string())
}

fn default_pool_size() -> u32 {
    1
}

/// Policy applied when bucket state cannot be read or written.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request and log a warning.
    #[default]
    FailOpen,
    /// Refuse the request and log an error.
    FailClosed,
}
