//! Endpoint URLs and the addresses they resolve to.
//!
//! `tcp://host1[:port],host2[:port]` names a cluster of TCP collectors;
//! `unix:///path` names a local socket. The scheme picks a transport through
//! a [`SchemeRegistry`] that matches exact schemes and `scheme+` prefixes.

use std::{
    fmt,
    io,
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
};

use percent_encoding::percent_decode_str;

use crate::error::BuildError;

/// Scheme assumed when a URL has none.
pub const DEFAULT_SCHEME: &str = "tcp";
/// Port used for hosts listed without one.
pub const DEFAULT_FORWARD_PORT: u16 = 24224;

/// Socket family used for an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Unix,
}

/// Maps URL schemes to transports.
///
/// A registration ending in `+` matches the bare scheme and every scheme
/// that starts with it, so `tcp+` covers `tcp` and `tcp+foo`. Exact
/// registrations take precedence.
#[derive(Clone, Debug)]
pub struct SchemeRegistry {
    entries: Vec<(String, TransportKind)>,
}

impl SchemeRegistry {
    /// A registry with no schemes.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register `scheme`; refuses to replace an existing registration
    /// unless `force` is set.
    pub fn register(
        &mut self,
        scheme: &str,
        kind: TransportKind,
        force: bool,
    ) -> Result<(), BuildError> {
        match self.entries.iter_mut().find(|(s, _)| s == scheme) {
            Some(entry) if force => {
                entry.1 = kind;
                Ok(())
            }
            Some(_) => Err(BuildError::InvalidConfig(format!(
                "scheme {scheme:?} is already registered"
            ))),
            None => {
                self.entries.push((scheme.to_owned(), kind));
                Ok(())
            }
        }
    }

    /// Transport registered for `scheme`.
    pub fn find(&self, scheme: &str) -> Option<TransportKind> {
        if let Some((_, kind)) = self.entries.iter().find(|(s, _)| s == scheme) {
            return Some(*kind);
        }
        self.entries
            .iter()
            .find(|(registered, _)| {
                registered
                    .strip_suffix('+')
                    .is_some_and(|bare| scheme == bare || scheme.starts_with(registered.as_str()))
            })
            .map(|(_, kind)| *kind)
    }
}

impl Default for SchemeRegistry {
    fn default() -> Self {
        Self {
            entries: vec![
                ("tcp+".to_owned(), TransportKind::Tcp),
                ("unix".to_owned(), TransportKind::Unix),
            ],
        }
    }
}

/// A concrete socket address owned by the connection manager.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "tcp://{addr}"),
            PeerAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Target {
    Inet(Vec<(String, u16)>),
    Unix(PathBuf),
}

/// A collector or cluster of collectors named by one URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
    target: Target,
    prefer_ipv6: bool,
}

impl Endpoint {
    /// Parse `url` using the default scheme registry.
    pub fn parse(url: &str, prefer_ipv6: bool) -> Result<Self, BuildError> {
        Self::parse_with(url, prefer_ipv6, &SchemeRegistry::default())
    }

    /// Parse `url`, resolving its scheme through `registry`.
    pub fn parse_with(
        url: &str,
        prefer_ipv6: bool,
        registry: &SchemeRegistry,
    ) -> Result<Self, BuildError> {
        let (scheme, rest) = url.split_once("://").unwrap_or((DEFAULT_SCHEME, url));
        let kind = registry.find(scheme).ok_or_else(|| {
            BuildError::InvalidConfig(format!("no endpoint registered for {url:?}"))
        })?;
        let target = match kind {
            TransportKind::Tcp => Target::Inet(parse_hosts(url, rest)?),
            TransportKind::Unix => Target::Unix(parse_unix_path(url, rest)?),
        };
        Ok(Self {
            url: url.to_owned(),
            target,
            prefer_ipv6,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> TransportKind {
        match self.target {
            Target::Inet(_) => TransportKind::Tcp,
            Target::Unix(_) => TransportKind::Unix,
        }
    }

    /// Host and port pairs named by a TCP endpoint.
    pub fn hosts(&self) -> &[(String, u16)] {
        match &self.target {
            Target::Inet(hosts) => hosts,
            Target::Unix(_) => &[],
        }
    }

    pub fn prefer_ipv6(&self) -> bool {
        self.prefer_ipv6
    }

    /// Expand every host into socket addresses using blocking resolution.
    pub fn resolve(&self) -> io::Result<Vec<PeerAddr>> {
        match &self.target {
            Target::Unix(path) => Ok(vec![PeerAddr::Unix(path.clone())]),
            Target::Inet(hosts) => {
                let mut out = Vec::new();
                for host in hosts {
                    let addrs: Vec<SocketAddr> = (host.0.as_str(), host.1).to_socket_addrs()?.collect();
                    out.extend(self.filter_family(addrs));
                }
                Ok(out)
            }
        }
    }

    /// Expand every host into socket addresses without blocking the runtime.
    pub async fn resolve_async(&self) -> io::Result<Vec<PeerAddr>> {
        match &self.target {
            Target::Unix(path) => Ok(vec![PeerAddr::Unix(path.clone())]),
            Target::Inet(hosts) => {
                let mut out = Vec::new();
                for (host, port) in hosts {
                    let addrs: Vec<SocketAddr> =
                        tokio::net::lookup_host((host.as_str(), *port)).await?.collect();
                    out.extend(self.filter_family(addrs));
                }
                Ok(out)
            }
        }
    }

    /// Keep the preferred family when the host has addresses in it.
    fn filter_family(&self, addrs: Vec<SocketAddr>) -> Vec<PeerAddr> {
        let preferred: Vec<SocketAddr> = addrs
            .iter()
            .copied()
            .filter(|addr| addr.is_ipv6() == self.prefer_ipv6)
            .collect();
        let chosen = if preferred.is_empty() { addrs } else { preferred };
        chosen.into_iter().map(PeerAddr::Inet).collect()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

fn parse_hosts(url: &str, rest: &str) -> Result<Vec<(String, u16)>, BuildError> {
    let netloc = rest.split('/').next().unwrap_or_default();
    let hosts = netloc
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| parse_host_port(url, part.trim()))
        .collect::<Result<Vec<_>, _>>()?;
    if hosts.is_empty() {
        return Err(BuildError::InvalidConfig(format!(
            "endpoint {url:?} names no hosts"
        )));
    }
    Ok(hosts)
}

fn parse_host_port(url: &str, part: &str) -> Result<(String, u16), BuildError> {
    let invalid = || BuildError::InvalidConfig(format!("invalid host {part:?} in {url:?}"));
    if let Some(stripped) = part.strip_prefix('[') {
        let (host, tail) = stripped.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if tail.is_empty() => DEFAULT_FORWARD_PORT,
            None => return Err(invalid()),
        };
        return Ok((host.to_owned(), port));
    }
    match part.split_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Ok((host.to_owned(), port.parse().map_err(|_| invalid())?))
        }
        Some(_) => Err(invalid()),
        None => Ok((part.to_owned(), DEFAULT_FORWARD_PORT)),
    }
}

fn parse_unix_path(url: &str, rest: &str) -> Result<PathBuf, BuildError> {
    let decoded = percent_decode_str(rest)
        .decode_utf8()
        .map_err(|_| BuildError::InvalidConfig(format!("socket path in {url:?} is not UTF-8")))?;
    if decoded.is_empty() {
        return Err(BuildError::InvalidConfig(format!(
            "endpoint {url:?} names no socket path"
        )));
    }
    Ok(PathBuf::from(decoded.as_ref()))
}
