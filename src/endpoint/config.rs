//! Configuration for [`ConnectionManager`](super::ConnectionManager).

use std::{sync::Arc, time::Duration};

use crate::{
    error::BuildError,
    macros::{ensure_positive, option_setter},
    pending::OverflowHandler,
    sender::{DEFAULT_QUEUE_MAXSIZE, DEFAULT_TIMEOUT},
};

use super::{
    ConnectionManager,
    backoff::BackoffPolicy,
    handshake::Credentials,
    strategy::Strategy,
    url::Endpoint,
};

/// Default interval between endpoint re-resolutions.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(5);

/// Settings for a multi-endpoint connection manager.
#[derive(Clone)]
pub struct ManagerConfig {
    pub tag: String,
    pub endpoints: Vec<String>,
    pub shared_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Name presented in `PING`; defaults to the machine hostname.
    pub hostname: Option<String>,
    pub prefer_ipv6: bool,
    pub strategy: Strategy,
    pub refresh_period: Duration,
    pub timeout: Duration,
    pub require_ack: bool,
    pub nanosecond_precision: bool,
    pub queue_maxsize: usize,
    pub queue_circular: bool,
    pub queue_overflow_handler: Option<OverflowHandler>,
    pub backoff: BackoffPolicy,
}

impl ManagerConfig {
    pub fn new(tag: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            tag: tag.into(),
            endpoints,
            shared_key: None,
            username: None,
            password: None,
            hostname: None,
            prefer_ipv6: false,
            strategy: Strategy::default(),
            refresh_period: DEFAULT_REFRESH_PERIOD,
            timeout: DEFAULT_TIMEOUT,
            require_ack: false,
            nanosecond_precision: false,
            queue_maxsize: DEFAULT_QUEUE_MAXSIZE,
            queue_circular: false,
            queue_overflow_handler: None,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Parse every endpoint URL.
    pub fn parse_endpoints(&self) -> Result<Vec<Endpoint>, BuildError> {
        if self.endpoints.is_empty() {
            return Err(BuildError::InvalidConfig(
                "at least one endpoint is required".into(),
            ));
        }
        self.endpoints
            .iter()
            .map(|url| Endpoint::parse(url, self.prefer_ipv6))
            .collect()
    }

    pub(crate) fn credentials(&self) -> Credentials {
        Credentials {
            hostname: self.hostname.clone().unwrap_or_else(local_hostname),
            shared_key: self.shared_key.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub(crate) fn validate(&self) -> Result<Vec<Endpoint>, BuildError> {
        for (value, field) in [
            (self.timeout, "timeout"),
            (self.refresh_period, "refresh_period"),
            (self.backoff.base, "backoff_base"),
            (self.backoff.cap, "backoff_cap"),
            (self.backoff.deadline, "backoff_deadline"),
        ] {
            if value.is_zero() {
                return Err(BuildError::InvalidConfig(format!(
                    "{field} must be greater than zero"
                )));
            }
        }
        self.parse_endpoints()
    }
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("tag", &self.tag)
            .field("endpoints", &self.endpoints)
            .field("shared_key", &self.shared_key.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("hostname", &self.hostname)
            .field("prefer_ipv6", &self.prefer_ipv6)
            .field("strategy", &self.strategy)
            .field("refresh_period", &self.refresh_period)
            .field("timeout", &self.timeout)
            .field("require_ack", &self.require_ack)
            .field("queue_maxsize", &self.queue_maxsize)
            .field("queue_circular", &self.queue_circular)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Overrides for the reconnection backoff timings.
#[derive(Clone, Debug, Default)]
pub struct BackoffOverrides {
    base_ms: Option<u64>,
    cap_ms: Option<u64>,
    deadline_ms: Option<u64>,
}

impl BackoffOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    option_setter!(with_base_ms, base_ms, u64);
    option_setter!(with_cap_ms, cap_ms, u64);
    option_setter!(with_deadline_ms, deadline_ms, u64);

    fn apply(&self, policy: &mut BackoffPolicy) -> Result<(), BuildError> {
        if let Some(base) = self.base_ms {
            ensure_positive!(base, "backoff_base_ms")?;
            policy.base = Duration::from_millis(base);
        }
        if let Some(cap) = self.cap_ms {
            ensure_positive!(cap, "backoff_cap_ms")?;
            policy.cap = Duration::from_millis(cap);
        }
        if let Some(deadline) = self.deadline_ms {
            ensure_positive!(deadline, "backoff_deadline_ms")?;
            policy.deadline = Duration::from_millis(deadline);
        }
        Ok(())
    }
}

/// Builder for [`ConnectionManager`].
#[derive(Clone, Default)]
pub struct ManagerBuilder {
    tag: String,
    endpoints: Vec<String>,
    shared_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
    hostname: Option<String>,
    prefer_ipv6: Option<bool>,
    strategy: Option<Strategy>,
    refresh_period_ms: Option<u64>,
    timeout_ms: Option<u64>,
    require_ack: Option<bool>,
    nanosecond_precision: Option<bool>,
    queue_maxsize: Option<usize>,
    queue_circular: Option<bool>,
    queue_overflow_handler: Option<OverflowHandler>,
    backoff: BackoffOverrides,
}

impl ManagerBuilder {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Add an endpoint URL such as `tcp://a:24224,b` or `unix:///path`.
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints.push(url.into());
        self
    }

    /// Authenticate with a shared key during the handshake.
    pub fn with_shared_key(mut self, key: impl Into<String>) -> Self {
        self.shared_key = Some(key.into());
        self
    }

    /// Authenticate as `username` during the handshake.
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    option_setter!(with_prefer_ipv6, prefer_ipv6, bool);
    option_setter!(with_strategy, strategy, Strategy);
    option_setter!(with_refresh_period_ms, refresh_period_ms, u64);
    option_setter!(
        #[doc = "Set the connect and write timeout, also the close grace period."]
        with_timeout_ms,
        timeout_ms,
        u64
    );
    option_setter!(
        #[doc = "Keep messages in flight until the collector acknowledges them."]
        with_require_ack,
        require_ack,
        bool
    );
    option_setter!(with_nanosecond_precision, nanosecond_precision, bool);
    option_setter!(with_queue_maxsize, queue_maxsize, usize);
    option_setter!(with_queue_circular, queue_circular, bool);

    /// Receive packets evicted from the queue or abandoned on close.
    pub fn with_queue_overflow_handler(
        mut self,
        handler: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.queue_overflow_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_backoff(mut self, overrides: BackoffOverrides) -> Self {
        self.backoff = overrides;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        if let Some(timeout) = self.timeout_ms {
            ensure_positive!(timeout, "timeout_ms")?;
        }
        if let Some(period) = self.refresh_period_ms {
            ensure_positive!(period, "refresh_period_ms")?;
        }
        if self.password.is_some() && self.username.as_deref().is_none_or(str::is_empty) {
            return Err(BuildError::InvalidConfig(
                "a password requires a username".into(),
            ));
        }
        Ok(())
    }

    /// Validate the settings and produce a [`ManagerConfig`].
    pub fn build_config(&self) -> Result<ManagerConfig, BuildError> {
        self.validate()?;
        let mut config = ManagerConfig::new(self.tag.clone(), self.endpoints.clone());
        config.shared_key = self.shared_key.clone();
        config.username = self.username.clone();
        config.password = self.password.clone();
        config.hostname = self.hostname.clone();
        config.queue_overflow_handler = self.queue_overflow_handler.clone();
        if let Some(prefer) = self.prefer_ipv6 {
            config.prefer_ipv6 = prefer;
        }
        if let Some(strategy) = &self.strategy {
            config.strategy = strategy.clone();
        }
        if let Some(period) = self.refresh_period_ms {
            config.refresh_period = Duration::from_millis(period);
        }
        if let Some(timeout) = self.timeout_ms {
            config.timeout = Duration::from_millis(timeout);
        }
        if let Some(require_ack) = self.require_ack {
            config.require_ack = require_ack;
        }
        if let Some(nanos) = self.nanosecond_precision {
            config.nanosecond_precision = nanos;
        }
        if let Some(maxsize) = self.queue_maxsize {
            config.queue_maxsize = maxsize;
        }
        if let Some(circular) = self.queue_circular {
            config.queue_circular = circular;
        }
        self.backoff.apply(&mut config.backoff)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the manager and start its event loop.
    pub fn build(&self) -> Result<ConnectionManager, BuildError> {
        ConnectionManager::with_config(self.build_config()?)
    }
}

impl std::fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("tag", &self.tag)
            .field("endpoints", &self.endpoints)
            .field("strategy", &self.strategy)
            .field("timeout_ms", &self.timeout_ms)
            .field("require_ack", &self.require_ack)
            .finish_non_exhaustive()
    }
}

/// The machine's hostname, or `localhost` when it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".into())
}
