//! Port mapping grammar.
//!
//! Parses compose port strings of the form
//! `[hostIP:]hostPort:containerPort[/proto]` into typed mappings. Re-emitting
//! a parsed mapping yields its canonical form (default host IP and `tcp`
//! elided), and parsing the canonical form is a fixed point.

use crate::error::{CompoteError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Network protocol for port forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A single host-to-container port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Host address to listen on (default `0.0.0.0`).
    pub host_ip: IpAddr,

    /// Host port.
    pub host_port: u16,

    /// Container port.
    pub container_port: u16,

    /// Protocol (default tcp).
    pub protocol: Protocol,
}

impl PortSpec {
    /// Default listen address for mappings without an explicit host IP.
    pub const DEFAULT_HOST_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    /// Parse a compose port string.
    ///
    /// # Errors
    ///
    /// `InvalidPortFormat` for a malformed mapping or out-of-range port;
    /// `UnsupportedProtocol` for a protocol other than tcp/udp.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || CompoteError::InvalidPortFormat { spec: spec.to_string() };

        let (addr_part, proto_part) = match spec.rsplit_once('/') {
            Some((addr, proto)) => (addr, Some(proto)),
            None => (spec, None),
        };

        let protocol = match proto_part {
            None | Some("tcp") => Protocol::Tcp,
            Some("udp") => Protocol::Udp,
            Some(other) => {
                return Err(CompoteError::UnsupportedProtocol {
                    spec: spec.to_string(),
                    proto: other.to_string(),
                })
            }
        };

        // Split from the right so an IPv6-ish host address keeps its colons.
        let mut parts = addr_part.rsplitn(3, ':');
        let container_port = parts.next().ok_or_else(invalid)?;
        let host_port = parts.next().ok_or_else(invalid)?;
        let host_ip = match parts.next() {
            Some(ip) => ip.parse::<IpAddr>().map_err(|_| invalid())?,
            None => Self::DEFAULT_HOST_IP,
        };

        Ok(Self {
            host_ip,
            host_port: parse_port(host_port).ok_or_else(invalid)?,
            container_port: parse_port(container_port).ok_or_else(invalid)?,
            protocol,
        })
    }

    /// Parse every port string of a service, attributing errors to the
    /// offending token.
    pub fn parse_all(specs: &[String]) -> Result<Vec<Self>> {
        specs.iter().map(|s| Self::parse(s)).collect()
    }
}

fn parse_port(s: &str) -> Option<u16> {
    match s.parse::<u16>() {
        Ok(0) => None,
        Ok(port) => Some(port),
        Err(_) => None,
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host_ip != Self::DEFAULT_HOST_IP {
            write!(f, "{}:", self.host_ip)?;
        }
        write!(f, "{}:{}", self.host_port, self.container_port)?;
        if self.protocol != Protocol::Tcp {
            write!(f, "/{}", self.protocol)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let spec = PortSpec::parse("8080:80").unwrap();
        assert_eq!(spec.host_ip, PortSpec::DEFAULT_HOST_IP);
        assert_eq!(spec.host_port, 8080);
        assert_eq!(spec.container_port, 80);
        assert_eq!(spec.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_parse_with_host_ip() {
        let spec = PortSpec::parse("127.0.0.1:8443:443").unwrap();
        assert_eq!(spec.host_ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(spec.host_port, 8443);
        assert_eq!(spec.container_port, 443);
    }

    #[test]
    fn test_parse_udp() {
        let spec = PortSpec::parse("53:53/udp").unwrap();
        assert_eq!(spec.protocol, Protocol::Udp);
    }

    #[test]
    fn test_parse_explicit_tcp() {
        let spec = PortSpec::parse("8080:80/tcp").unwrap();
        assert_eq!(spec.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_unknown_protocol() {
        let err = PortSpec::parse("8080:80/sctp").unwrap_err();
        assert!(matches!(err, CompoteError::UnsupportedProtocol { .. }));
    }

    #[test]
    fn test_malformed_specs() {
        for bad in ["", "8080", "a:b", "8080:80:90:100", "0:80", "8080:0", "70000:80"] {
            assert!(
                matches!(PortSpec::parse(bad), Err(CompoteError::InvalidPortFormat { .. })),
                "expected parse failure for {bad:?}"
            );
        }
    }

    #[test]
    fn test_bad_host_ip() {
        let err = PortSpec::parse("nowhere:8080:80").unwrap_err();
        assert!(matches!(err, CompoteError::InvalidPortFormat { .. }));
    }

    #[test]
    fn test_canonical_form_is_fixed_point() {
        for spec in ["8080:80", "127.0.0.1:8443:443", "53:53/udp", "9000:9000/tcp"] {
            let parsed = PortSpec::parse(spec).unwrap();
            let canonical = parsed.to_string();
            let reparsed = PortSpec::parse(&canonical).unwrap();
            assert_eq!(parsed, reparsed);
            assert_eq!(reparsed.to_string(), canonical);
        }
    }
}
