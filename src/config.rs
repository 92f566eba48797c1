use crate::error::{ReduceError, Result};
use crate::protocol::ClientRole;
use ahash::AHashMap;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "coord.leanwire.dev";
pub const DEFAULT_LEARNING_FACTOR: u32 = 20;
pub const INTERNAL_TOKEN: &str = "leanwire_internal";

pub const TOKEN_KEY: &str = "leanwire.token";
pub const HOST_KEY: &str = "leanwire.host";
pub const LEARNING_FACTOR_KEY: &str = "leanwire.learning.factor";
pub const REDUCTION_ENABLED_KEY: &str = "leanwire.reduction.enabled";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub token: String,
    pub host: String,
    pub learning_factor: u32,
    pub reduction_enabled: bool,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub bookkeeping_interval: Option<Duration>,
}

impl AgentConfig {
    /// Producer configuration. A coordination token is required.
    pub fn producer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            host: DEFAULT_HOST.to_string(),
            learning_factor: DEFAULT_LEARNING_FACTOR,
            reduction_enabled: true,
            request_timeout: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 3,
            bookkeeping_interval: Some(Duration::from_secs(60)),
        }
    }

    /// Consumer configuration. Reduction defaults to disabled and the
    /// internal token is used unless the host supplies one.
    pub fn consumer() -> Self {
        Self {
            reduction_enabled: false,
            ..Self::producer(INTERNAL_TOKEN)
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_learning_factor(mut self, factor: u32) -> Self {
        self.learning_factor = factor;
        self
    }

    pub fn with_reduction_enabled(mut self, enabled: bool) -> Self {
        self.reduction_enabled = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_bookkeeping_interval(mut self, interval: Option<Duration>) -> Self {
        self.bookkeeping_interval = interval;
        self
    }

    /// Parse the configuration surface from the host's serializer or
    /// deserializer string map.
    ///
    /// Producers require an explicit token; consumers fall back to the
    /// internal token and keep reduction disabled unless the map enables it.
    pub fn from_map(configs: &AHashMap<String, String>, role: ClientRole) -> Result<Self> {
        let token = match configs.get(TOKEN_KEY) {
            Some(token) if !token.is_empty() => token.clone(),
            _ if role == ClientRole::Consumer => INTERNAL_TOKEN.to_string(),
            _ => return Err(ReduceError::Config("token is required".to_string())),
        };

        let mut config = match role {
            ClientRole::Producer => Self::producer(token),
            ClientRole::Consumer => {
                let mut c = Self::consumer();
                c.token = token;
                c
            }
        };

        if let Some(host) = configs.get(HOST_KEY) {
            if host.is_empty() {
                return Err(ReduceError::Config("host must not be empty".to_string()));
            }
            config.host = host.clone();
        }

        if let Some(raw) = configs.get(LEARNING_FACTOR_KEY) {
            config.learning_factor = raw.parse().map_err(|_| {
                ReduceError::Config(format!("invalid learning factor: {}", raw))
            })?;
        }

        if let Some(raw) = configs.get(REDUCTION_ENABLED_KEY) {
            config.reduction_enabled = raw.parse().map_err(|_| {
                ReduceError::Config(format!("invalid reduction flag: {}", raw))
            })?;
        }

        Ok(config)
    }
}
