//! Port specifications.
//!
//! Accepts the `docker run -p` grammar:
//! `[ip:][hostPort:]containerPort[/protocol]`, where either port may be a
//! `start-end` range and an IPv6 address is written in brackets.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::error::{ContainerError, ContainerResult};

/// Transport protocol of an exposed port.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(format!("unsupported protocol '{}'", other)),
        }
    }
}

/// A container-side port, e.g. `80/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port {
    pub number: u16,
    pub protocol: Protocol,
}

impl Port {
    pub fn new(number: u16, protocol: Protocol) -> Self {
        Self { number, protocol }
    }

    pub fn tcp(number: u16) -> Self {
        Self::new(number, Protocol::Tcp)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol)
    }
}

impl FromStr for Port {
    type Err = ContainerError;

    /// Parses `80` or `80/tcp` (the key format used by `inspect`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, protocol) = split_protocol(s)?;
        Ok(Port::new(parse_port_number(s, number)?, protocol))
    }
}

/// A host-side binding for a port. Empty fields let the runtime choose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

impl PortBinding {
    /// Render as a `--publish` argument for `port`.
    pub fn publish_arg(&self, port: &Port) -> String {
        let host_ip = if self.host_ip.contains(':') {
            format!("[{}]", self.host_ip)
        } else {
            self.host_ip.clone()
        };

        match (host_ip.is_empty(), self.host_port.is_empty()) {
            (true, true) => port.to_string(),
            (true, false) => format!("{}:{}", self.host_port, port),
            (false, _) => format!("{}:{}:{}", host_ip, self.host_port, port),
        }
    }
}

/// Set of exposed container ports.
pub type PortSet = BTreeSet<Port>;

/// Host bindings per exposed port.
pub type PortBindings = BTreeMap<Port, Vec<PortBinding>>;

/// Parse port specifications into the exposed set and host bindings.
///
/// Every spec publishes its port; a spec without a host port binds to a
/// runtime-chosen host port.
pub fn parse_port_specs<S: AsRef<str>>(specs: &[S]) -> ContainerResult<(PortSet, PortBindings)> {
    let mut exposed = PortSet::new();
    let mut bindings = PortBindings::new();

    for spec in specs {
        for (port, binding) in parse_port_spec(spec.as_ref())? {
            exposed.insert(port);
            bindings.entry(port).or_default().push(binding);
        }
    }

    Ok((exposed, bindings))
}

fn parse_port_spec(spec: &str) -> ContainerResult<Vec<(Port, PortBinding)>> {
    let invalid = |reason: &str| ContainerError::InvalidPortSpec {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty specification"));
    }

    let (addr_part, protocol) = split_protocol(trimmed)?;
    let (host_ip, host_port, container_port) = split_address(addr_part).map_err(|r| invalid(&r))?;

    if !host_ip.is_empty() {
        host_ip
            .parse::<IpAddr>()
            .map_err(|_| invalid(&format!("invalid host IP '{}'", host_ip)))?;
    }

    let (container_start, container_end) = parse_range(spec, container_port)?;
    let container_len = container_end - container_start;

    let host_ports: Vec<String> = if host_port.is_empty() {
        vec![String::new(); usize::from(container_len) + 1]
    } else {
        let (host_start, host_end) = parse_range(spec, host_port)?;
        let host_len = host_end - host_start;
        if host_len == container_len {
            (host_start..=host_end).map(|p| p.to_string()).collect()
        } else if container_len == 0 {
            // The runtime picks one host port out of the range.
            vec![host_port.to_string()]
        } else {
            return Err(invalid("host and container port ranges differ in length"));
        }
    };

    Ok((container_start..=container_end)
        .zip(host_ports)
        .map(|(number, host_port)| {
            (
                Port::new(number, protocol),
                PortBinding {
                    host_ip: host_ip.to_string(),
                    host_port,
                },
            )
        })
        .collect())
}

fn split_protocol(spec: &str) -> ContainerResult<(&str, Protocol)> {
    match spec.rsplit_once('/') {
        Some((rest, proto)) => {
            let protocol = proto
                .parse::<Protocol>()
                .map_err(|reason| ContainerError::InvalidPortSpec {
                    spec: spec.to_string(),
                    reason,
                })?;
            Ok((rest, protocol))
        }
        None => Ok((spec, Protocol::Tcp)),
    }
}

/// Split `[ip:][host:]container` into its three parts.
fn split_address(addr: &str) -> Result<(&str, &str, &str), String> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (ip, rest) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated IPv6 address".to_string())?;
        let rest = rest
            .strip_prefix(':')
            .ok_or_else(|| "expected ':' after IPv6 address".to_string())?;
        let (host, container) = rest
            .split_once(':')
            .ok_or_else(|| "missing container port".to_string())?;
        return Ok((ip, host, container));
    }

    let parts: Vec<&str> = addr.split(':').collect();
    match parts.as_slice() {
        [container] => Ok(("", "", container)),
        [host, container] => Ok(("", host, container)),
        [ip, host, container] => Ok((ip, host, container)),
        _ => Err("too many ':' separators".to_string()),
    }
}

fn parse_range(spec: &str, raw: &str) -> ContainerResult<(u16, u16)> {
    match raw.split_once('-') {
        Some((start, end)) => {
            let start = parse_port_number(spec, start)?;
            let end = parse_port_number(spec, end)?;
            if end < start {
                return Err(ContainerError::InvalidPortSpec {
                    spec: spec.to_string(),
                    reason: format!("invalid range {}", raw),
                });
            }
            Ok((start, end))
        }
        None => {
            let port = parse_port_number(spec, raw)?;
            Ok((port, port))
        }
    }
}

fn parse_port_number(spec: &str, raw: &str) -> ContainerResult<u16> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(ContainerError::InvalidPortSpec {
            spec: spec.to_string(),
            reason: format!("invalid port number '{}'", raw),
        }),
        Ok(port) => Ok(port),
    }
}
