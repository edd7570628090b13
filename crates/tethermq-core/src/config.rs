//! Client configuration management

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::QoS;

/// Username/password pair presented during the handshake.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create a credential pair
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Keep passwords out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Reconnection backoff policy.
///
/// The delay before the next attempt starts at `initial_interval_secs` and is
/// multiplied by `backoff_multiplier` after each failure, capped at
/// `max_interval_secs`. A successful connect resets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, in seconds
    pub initial_interval_secs: f64,
    /// Upper bound on the delay, in seconds
    pub max_interval_secs: f64,
    /// Growth factor applied after each failure
    pub backoff_multiplier: f64,
    /// Consecutive failed attempts before giving up (0 = unbounded)
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_interval_secs: 1.0,
            max_interval_secs: 60.0,
            backoff_multiplier: 1.5,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with the given intervals (seconds), multiplier and cap
    pub fn new(initial: f64, max: f64, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            initial_interval_secs: initial,
            max_interval_secs: max,
            backoff_multiplier: multiplier,
            max_attempts,
        }
    }

    /// Retry forever
    pub fn unbounded() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Initial delay as a [`Duration`]
    pub fn initial_interval(&self) -> Duration {
        Duration::from_secs_f64(self.initial_interval_secs)
    }

    /// Maximum delay as a [`Duration`]
    pub fn max_interval(&self) -> Duration {
        Duration::from_secs_f64(self.max_interval_secs)
    }

    /// Whether the policy has an attempt cap
    pub const fn is_bounded(&self) -> bool {
        self.max_attempts != 0
    }

    fn validate(&self) -> Result<(), ConfigError> {
        seconds("reconnect.initial_interval_secs", self.initial_interval_secs)?;
        seconds("reconnect.max_interval_secs", self.max_interval_secs)?;
        if self.max_interval_secs < self.initial_interval_secs {
            return Err(invalid(
                "reconnect.max_interval_secs",
                "must not be below the initial interval",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(invalid("reconnect.backoff_multiplier", "must be at least 1.0"));
        }
        // Backoff multiplies the capped delay before clamping it again
        seconds(
            "reconnect.backoff_multiplier",
            self.max_interval_secs * self.backoff_multiplier,
        )?;
        Ok(())
    }
}

/// Bounds on individual network operations, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Reachability probe
    pub probe_secs: f64,
    /// Protocol handshake
    pub handshake_secs: f64,
    /// A single keep-alive operation
    pub keep_alive_secs: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_secs: 5.0,
            handshake_secs: 10.0,
            keep_alive_secs: 5.0,
        }
    }
}

impl TimeoutConfig {
    /// Probe timeout
    pub fn probe(&self) -> Duration {
        Duration::from_secs_f64(self.probe_secs)
    }

    /// Handshake timeout
    pub fn handshake(&self) -> Duration {
        Duration::from_secs_f64(self.handshake_secs)
    }

    /// Keep-alive operation timeout
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs_f64(self.keep_alive_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("timeouts.probe_secs", self.probe_secs),
            ("timeouts.handshake_secs", self.handshake_secs),
            ("timeouts.keep_alive_secs", self.keep_alive_secs),
        ] {
            seconds(field, value)?;
        }
        Ok(())
    }
}

/// Configuration of the connection manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker host name or IP address
    pub broker_address: String,
    /// Broker port
    pub port: u16,
    /// Prefix of the per-attempt client identifier
    pub client_id_prefix: String,
    /// Optional handshake credentials
    pub credentials: Option<Credentials>,
    /// Start connecting as soon as the manager is built
    pub auto_connect: bool,
    /// Ask the broker for a clean session
    pub clean_session: bool,
    /// QoS used for subscribe and publish
    pub default_qos: QoS,
    /// Reconnection backoff policy
    pub reconnect: ReconnectPolicy,
    /// Operation bounds
    pub timeouts: TimeoutConfig,
    /// Liveness Monitor period, in seconds
    pub keep_alive_secs: f64,
    /// Dispatch queue length that triggers a back-pressure warning
    pub queue_warn_threshold: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_address: "127.0.0.1".to_string(),
            port: 1883,
            client_id_prefix: "tethermq-".to_string(),
            credentials: None,
            auto_connect: true,
            clean_session: true,
            default_qos: QoS::AtLeastOnce,
            reconnect: ReconnectPolicy::default(),
            timeouts: TimeoutConfig::default(),
            keep_alive_secs: 30.0,
            queue_warn_threshold: 10_000,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a file (TOML, YAML, or JSON)
    ///
    /// The file format is auto-detected from the file extension. Environment
    /// variables with the `TETHERMQ_` prefix override file settings, with `__`
    /// separating nested keys (e.g. `TETHERMQ_RECONNECT__MAX_ATTEMPTS=0`).
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tethermq_core::ClientConfig;
    ///
    /// let config = ClientConfig::from_file("tethermq.toml").expect("Failed to load config");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file doesn't exist
    /// - The file format is unsupported
    /// - The file contains invalid configuration
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_prefix(path, "TETHERMQ")
    }

    /// Load configuration from a file with a custom environment prefix
    pub fn from_file_with_prefix(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        use config::{Config, File, FileFormat};

        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let config = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or(ConfigError::UnsupportedFormat)?,
                format,
            ))
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Create a configuration builder
    ///
    /// ```rust
    /// use tethermq_core::ClientConfig;
    ///
    /// let config = ClientConfig::builder()
    ///     .broker("broker.local", 1883)
    ///     .max_reconnect_attempts(0)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.port, 1883);
    /// ```
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Liveness Monitor period
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs_f64(self.keep_alive_secs)
    }

    /// `host:port` of the broker
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.broker_address, self.port)
    }

    /// Check ranges and required fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_address.trim().is_empty() {
            return Err(invalid("broker_address", "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("port", "must not be 0"));
        }
        seconds("keep_alive_secs", self.keep_alive_secs)?;
        self.reconnect.validate()?;
        self.timeouts.validate()
    }
}

/// A positive number of seconds that fits in a [`Duration`]
fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if value.is_nan() || value <= 0.0 {
        return Err(invalid(field, "must be positive"));
    }
    Duration::try_from_secs_f64(value).map_err(|_| invalid(field, "is too large"))
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Start from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set broker address and port
    pub fn broker(mut self, address: impl Into<String>, port: u16) -> Self {
        self.config.broker_address = address.into();
        self.config.port = port;
        self
    }

    /// Set the client identifier prefix
    pub fn client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.client_id_prefix = prefix.into();
        self
    }

    /// Set handshake credentials
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.config.credentials = Some(credentials);
        self
    }

    /// Enable or disable auto-connect on build
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.config.auto_connect = enabled;
        self
    }

    /// Set clean-session flag
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.config.clean_session = clean;
        self
    }

    /// Set the default QoS
    pub fn default_qos(mut self, qos: QoS) -> Self {
        self.config.default_qos = qos;
        self
    }

    /// Replace the reconnect policy
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Set initial and maximum backoff intervals
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.reconnect.initial_interval_secs = initial.as_secs_f64();
        self.config.reconnect.max_interval_secs = max.as_secs_f64();
        self
    }

    /// Set the attempt cap (0 = unbounded)
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    /// Replace operation timeouts
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// Set the Liveness Monitor period
    pub fn keep_alive(mut self, period: Duration) -> Self {
        self.config.keep_alive_secs = period.as_secs_f64();
        self
    }

    /// Set the back-pressure warning threshold
    pub fn queue_warn_threshold(mut self, threshold: usize) -> Self {
        self.config.queue_warn_threshold = threshold;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
