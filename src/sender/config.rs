//! Configuration consumed by [`FluentSender`](super::FluentSender) and
//! [`AsyncSender`](super::AsyncSender).
//!
//! `SenderBuilder` validates user input before producing a [`SenderConfig`].

use std::{sync::Arc, time::Duration};

use crate::{
    connection::{Address, TlsOptions},
    error::BuildError,
    macros::{ensure_positive, option_setter},
    pending::OverflowHandler,
};

use super::{AsyncSender, FluentSender};

/// Default collector host.
pub const DEFAULT_HOST: &str = "localhost";
/// Default forward protocol port.
pub const DEFAULT_PORT: u16 = 24224;
/// Default bound on unacknowledged bytes.
pub const DEFAULT_BUFMAX: usize = 1 << 20; // 1 MiB
/// Default connect, read and write timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Default capacity of the asynchronous sender's queue.
pub const DEFAULT_QUEUE_MAXSIZE: usize = 100;

/// Settings shared by the synchronous and asynchronous senders.
#[derive(Clone)]
pub struct SenderConfig {
    pub tag: String,
    pub host: String,
    pub port: u16,
    pub bufmax: usize,
    pub timeout: Duration,
    pub verbose: bool,
    pub buffer_overflow_handler: Option<OverflowHandler>,
    pub nanosecond_precision: bool,
    pub forward_packet_error: bool,
    pub half_close_detection: bool,
    pub tls: Option<TlsOptions>,
    /// Async only; `0` means unbounded.
    pub queue_maxsize: usize,
    /// Async only; evict the oldest packet instead of blocking when full.
    pub queue_circular: bool,
    /// Async only; receives packets evicted from the queue.
    pub queue_overflow_handler: Option<OverflowHandler>,
}

impl SenderConfig {
    /// Configuration with default settings for `tag`.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Resolve `host`, `port` and `tls` into a connection address.
    pub fn address(&self) -> Result<Address, BuildError> {
        let address = Address::parse(&self.host, self.port)?;
        match &self.tls {
            Some(options) => address.with_tls(options.clone()),
            None => Ok(address),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), BuildError> {
        ensure_positive!(self.bufmax, "bufmax")?;
        if self.timeout.is_zero() {
            return Err(BuildError::InvalidConfig(
                "timeout must be greater than zero".into(),
            ));
        }
        self.address().map(|_| ())
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            tag: String::new(),
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            bufmax: DEFAULT_BUFMAX,
            timeout: DEFAULT_TIMEOUT,
            verbose: false,
            buffer_overflow_handler: None,
            nanosecond_precision: false,
            forward_packet_error: true,
            half_close_detection: true,
            tls: None,
            queue_maxsize: DEFAULT_QUEUE_MAXSIZE,
            queue_circular: false,
            queue_overflow_handler: None,
        }
    }
}

impl std::fmt::Debug for SenderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderConfig")
            .field("tag", &self.tag)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("bufmax", &self.bufmax)
            .field("timeout", &self.timeout)
            .field("verbose", &self.verbose)
            .field(
                "buffer_overflow_handler",
                &self.buffer_overflow_handler.is_some(),
            )
            .field("nanosecond_precision", &self.nanosecond_precision)
            .field("forward_packet_error", &self.forward_packet_error)
            .field("half_close_detection", &self.half_close_detection)
            .field("tls", &self.tls)
            .field("queue_maxsize", &self.queue_maxsize)
            .field("queue_circular", &self.queue_circular)
            .field(
                "queue_overflow_handler",
                &self.queue_overflow_handler.is_some(),
            )
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
struct TlsConfig {
    domain: Option<String>,
    insecure: bool,
}

/// Builder for [`FluentSender`] and [`AsyncSender`].
#[derive(Clone, Default)]
pub struct SenderBuilder {
    tag: String,
    host: Option<String>,
    port: Option<u16>,
    bufmax: Option<usize>,
    timeout_ms: Option<u64>,
    verbose: Option<bool>,
    nanosecond_precision: Option<bool>,
    forward_packet_error: Option<bool>,
    half_close_detection: Option<bool>,
    tls: Option<TlsConfig>,
    queue_maxsize: Option<usize>,
    queue_circular: Option<bool>,
    buffer_overflow_handler: Option<OverflowHandler>,
    queue_overflow_handler: Option<OverflowHandler>,
}

impl SenderBuilder {
    /// Create a builder for senders using `tag` as the base tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Set the collector host. Accepts `unix://`, `tls://` and `tcp://`
    /// prefixes.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    option_setter!(with_port, port, u16);
    option_setter!(
        #[doc = "Set the maximum number of unacknowledged bytes kept for retry."]
        with_bufmax,
        bufmax,
        usize
    );
    option_setter!(
        #[doc = "Set the connect, read and write timeout in milliseconds."]
        with_timeout_ms,
        timeout_ms,
        u64
    );
    option_setter!(with_verbose, verbose, bool);
    option_setter!(with_nanosecond_precision, nanosecond_precision, bool);
    option_setter!(with_forward_packet_error, forward_packet_error, bool);
    option_setter!(with_half_close_detection, half_close_detection, bool);
    option_setter!(
        #[doc = "Set the asynchronous queue capacity; `0` means unbounded."]
        with_queue_maxsize,
        queue_maxsize,
        usize
    );
    option_setter!(with_queue_circular, queue_circular, bool);

    /// Configure TLS using the provided domain and validation policy.
    pub fn with_tls(mut self, domain: Option<String>, insecure: bool) -> Self {
        self.tls = Some(TlsConfig { domain, insecure });
        self
    }

    /// Receive the bytes discarded when the pending buffer overflows.
    pub fn with_buffer_overflow_handler(
        mut self,
        handler: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.buffer_overflow_handler = Some(Arc::new(handler));
        self
    }

    /// Receive the packets evicted from a full circular queue.
    pub fn with_queue_overflow_handler(
        mut self,
        handler: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.queue_overflow_handler = Some(Arc::new(handler));
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        if let Some(bufmax) = self.bufmax {
            ensure_positive!(bufmax, "bufmax")?;
        }
        if let Some(timeout) = self.timeout_ms {
            ensure_positive!(timeout, "timeout_ms")?;
        }
        if let Some(host) = &self.host
            && host.trim().is_empty()
        {
            return Err(BuildError::InvalidConfig("host must not be empty".into()));
        }
        Ok(())
    }

    /// Validate the settings and produce a [`SenderConfig`].
    pub fn build_config(&self) -> Result<SenderConfig, BuildError> {
        self.validate()?;
        let mut config = SenderConfig::new(self.tag.clone());
        self.apply_optional_fields(&mut config);
        config.tls = self.build_tls_options(&config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_optional_fields(&self, config: &mut SenderConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bufmax) = self.bufmax {
            config.bufmax = bufmax;
        }
        if let Some(timeout) = self.timeout_ms {
            config.timeout = Duration::from_millis(timeout);
        }
        if let Some(verbose) = self.verbose {
            config.verbose = verbose;
        }
        if let Some(nanos) = self.nanosecond_precision {
            config.nanosecond_precision = nanos;
        }
        if let Some(forward) = self.forward_packet_error {
            config.forward_packet_error = forward;
        }
        if let Some(detect) = self.half_close_detection {
            config.half_close_detection = detect;
        }
        if let Some(maxsize) = self.queue_maxsize {
            config.queue_maxsize = maxsize;
        }
        if let Some(circular) = self.queue_circular {
            config.queue_circular = circular;
        }
        config.buffer_overflow_handler = self.buffer_overflow_handler.clone();
        config.queue_overflow_handler = self.queue_overflow_handler.clone();
    }

    fn build_tls_options(&self, config: &SenderConfig) -> Result<Option<TlsOptions>, BuildError> {
        let Some(tls) = &self.tls else {
            return Ok(None);
        };
        let host = match Address::parse(&config.host, config.port)? {
            Address::Tcp { host, .. } => host,
            Address::Unix(_) => {
                return Err(BuildError::InvalidConfig(
                    "tls is only supported for tcp transports".into(),
                ));
            }
        };
        let domain = tls
            .domain
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(host);
        Ok(Some(TlsOptions {
            domain,
            insecure_skip_verify: tls.insecure,
        }))
    }

    /// Build a synchronous sender.
    pub fn build(&self) -> Result<FluentSender, BuildError> {
        FluentSender::with_config(self.build_config()?)
    }

    /// Build an asynchronous sender and start its worker thread.
    pub fn build_async(&self) -> Result<AsyncSender, BuildError> {
        AsyncSender::with_config(self.build_config()?)
    }
}

impl std::fmt::Debug for SenderBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderBuilder")
            .field("tag", &self.tag)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("bufmax", &self.bufmax)
            .field("timeout_ms", &self.timeout_ms)
            .field("tls", &self.tls)
            .field("queue_maxsize", &self.queue_maxsize)
            .field("queue_circular", &self.queue_circular)
            .finish_non_exhaustive()
    }
}
