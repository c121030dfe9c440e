//! Destination addresses understood by [`Connection`](super::Connection).

use std::{fmt, path::PathBuf};

use crate::error::BuildError;

/// TLS connection options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsOptions {
    /// Domain name presented during the TLS handshake.
    pub domain: String,
    /// Skip certificate validation when true (intended for tests).
    pub insecure_skip_verify: bool,
}

/// Where a sender delivers its bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    /// TCP host and port, optionally wrapped in TLS.
    Tcp {
        host: String,
        port: u16,
        tls: Option<TlsOptions>,
    },
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Address {
    /// Interpret a configured `host` string.
    ///
    /// `unix://<path>` selects a Unix socket; `tls://` and `tcp+tls://`
    /// select TCP with TLS (verifying against the host name); `tcp://` or a
    /// bare host select plain TCP. A `:port` suffix inside a URL overrides
    /// `port`.
    pub fn parse(host: &str, port: u16) -> Result<Self, BuildError> {
        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(BuildError::InvalidConfig(
                    "unix socket path must not be empty".into(),
                ));
            }
            return Ok(Address::Unix(PathBuf::from(path)));
        }

        let (rest, tls) = if let Some(rest) = host
            .strip_prefix("tls://")
            .or_else(|| host.strip_prefix("tcp+tls://"))
        {
            (rest, true)
        } else if let Some(rest) = host.strip_prefix("tcp://") {
            (rest, false)
        } else if host.contains("://") {
            return Err(BuildError::InvalidConfig(format!(
                "unsupported transport in host {host:?}"
            )));
        } else {
            return Ok(Address::Tcp {
                host: host.to_string(),
                port,
                tls: None,
            });
        };

        let (name, port) = split_port(rest, port)?;
        if name.is_empty() {
            return Err(BuildError::InvalidConfig(format!(
                "missing host name in {host:?}"
            )));
        }
        Ok(Address::Tcp {
            host: name.to_string(),
            port,
            tls: tls.then(|| TlsOptions {
                domain: name.to_string(),
                insecure_skip_verify: false,
            }),
        })
    }

    /// Replace the TLS options of a TCP address.
    pub fn with_tls(self, options: TlsOptions) -> Result<Self, BuildError> {
        match self {
            Address::Tcp { host, port, .. } => Ok(Address::Tcp {
                host,
                port,
                tls: Some(options),
            }),
            Address::Unix(_) => Err(BuildError::InvalidConfig(
                "tls is not supported for unix sockets".into(),
            )),
        }
    }
}

fn split_port(rest: &str, default: u16) -> Result<(&str, u16), BuildError> {
    let rest = rest.trim_end_matches('/');
    // Bracketed IPv6 literals keep their colons.
    if let Some(stripped) = rest.strip_prefix('[') {
        let Some((literal, tail)) = stripped.split_once(']') else {
            return Err(BuildError::InvalidConfig(format!(
                "unterminated IPv6 literal in {rest:?}"
            )));
        };
        return match tail.strip_prefix(':') {
            Some(port) => Ok((literal, parse_port(port)?)),
            None => Ok((literal, default)),
        };
    }
    match rest.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => Ok((name, parse_port(port)?)),
        _ => Ok((rest, default)),
    }
}

fn parse_port(port: &str) -> Result<u16, BuildError> {
    port.parse()
        .map_err(|_| BuildError::InvalidConfig(format!("invalid port {port:?}")))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp {
                host,
                port,
                tls: None,
            } => write!(f, "tcp://{host}:{port}"),
            Address::Tcp { host, port, .. } => write!(f, "tls://{host}:{port}"),
            Address::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}
