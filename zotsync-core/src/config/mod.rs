//! Configuration for the store adapter
//!
//! Values come from defaults, a TOML file, or `ZOTSYNC_*` environment
//! variables. Durations are written in humantime form (`5s`, `250ms`).

use crate::logging::LoggingConfig;
use crate::policy::ErrorPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;

pub use error::ConfigError;

pub const DEFAULT_BUCKET: &str = "zotero";
pub const DEFAULT_USER_LIBRARY_NAME: &str = "User library";
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const ENV_PREFIX: &str = "ZOTSYNC_";

/// Store adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Cluster address
    pub address: String,

    pub username: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,

    /// Bucket holding every library scope
    pub bucket: String,

    /// Upper bound for each provisioning wait
    #[serde(with = "humantime_serde")]
    pub provision_timeout: Duration,

    /// Delay between provisioning polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Whether policy-governed failures propagate or are logged
    pub error_policy: ErrorPolicy,

    /// Name saved for the personal library when the feed reports none
    pub user_library_name: String,

    pub logging: LoggingConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: "couchbase://localhost".to_string(),
            username: "Administrator".to_string(),
            password: String::new(),
            bucket: DEFAULT_BUCKET.to_string(),
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_policy: ErrorPolicy::default(),
            user_library_name: DEFAULT_USER_LIBRARY_NAME.to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Configuration pointing at `address` with every other value defaulted
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_user_library_name(mut self, name: impl Into<String>) -> Self {
        self.user_library_name = name.into();
        self
    }

    /// Load configuration from environment variables
    ///
    /// Variables follow the pattern `ZOTSYNC_<FIELD>`, for example
    /// `ZOTSYNC_BUCKET=zotero` or `ZOTSYNC_PROVISION_TIMEOUT_MS=8000`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Self::default();

        if let Some(address) = var("ADDRESS") {
            config.address = address;
        }
        if let Some(username) = var("USERNAME") {
            config.username = username;
        }
        if let Some(password) = var("PASSWORD") {
            config.password = password;
        }
        if let Some(bucket) = var("BUCKET") {
            config.bucket = bucket;
        }
        if let Some(ms) = var("PROVISION_TIMEOUT_MS") {
            config.provision_timeout = parse_millis("PROVISION_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = var("POLL_INTERVAL_MS") {
            config.poll_interval = parse_millis("POLL_INTERVAL_MS", &ms)?;
        }
        if let Some(policy) = var("ERROR_POLICY") {
            config.error_policy = policy.parse().map_err(|reason| ConfigError::InvalidValue {
                key: format!("{}ERROR_POLICY", ENV_PREFIX),
                reason,
            })?;
        }
        if let Some(name) = var("USER_LIBRARY_NAME") {
            config.user_library_name = name;
        }
        if let Some(level) = var("LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(json) = var("LOG_JSON") {
            config.logging.json_format = json.parse().map_err(|e| ConfigError::InvalidValue {
                key: format!("{}LOG_JSON", ENV_PREFIX),
                reason: format!("{}", e),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "address must not be empty".to_string(),
            ));
        }

        if self.bucket.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "bucket must not be empty".to_string(),
            ));
        }

        if self.provision_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "provision_timeout must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() || self.poll_interval > self.provision_timeout {
            return Err(ConfigError::ValidationFailed(format!(
                "poll_interval must be between 0 and provision_timeout ({:?})",
                self.provision_timeout
            )));
        }

        if self.user_library_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "user_library_name must not be empty".to_string(),
            ));
        }

        self.logging.validate()
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError::InvalidValue {
            key: format!("{}{}", ENV_PREFIX, key),
            reason: e.to_string(),
        })
}
