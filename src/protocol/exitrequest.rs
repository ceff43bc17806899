//! Exit requests and exit policies
//!
//! An [`ExitRequest`] describes the destination a local application asked
//! for: either a hostname the exit will resolve, or a literal v4/v6
//! address. Circuits consult the exit hop's published [`ExitPolicy`] to
//! decide whether they can carry a request.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// A destination supplied by the local front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitRequest {
    /// Hostname destination; resolution happens at the exit.
    Host { host: String, port: u16 },
    /// Literal address destination.
    Addr { addr: IpAddr, port: u16 },
}

impl ExitRequest {
    pub fn host(host: impl Into<String>, port: u16) -> Self {
        ExitRequest::Host {
            host: host.into(),
            port,
        }
    }

    pub fn addr(addr: IpAddr, port: u16) -> Self {
        ExitRequest::Addr { addr, port }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, ExitRequest::Host { .. })
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self, ExitRequest::Addr { addr: IpAddr::V4(_), .. })
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, ExitRequest::Addr { addr: IpAddr::V6(_), .. })
    }

    pub fn port(&self) -> u16 {
        match self {
            ExitRequest::Host { port, .. } | ExitRequest::Addr { port, .. } => *port,
        }
    }

    /// The target string for a BEGIN cell.
    pub fn begin_target(&self) -> (String, u16) {
        match self {
            ExitRequest::Host { host, port } => (host.clone(), *port),
            ExitRequest::Addr { addr: IpAddr::V4(a), port } => (a.to_string(), *port),
            // BEGIN targets carry IPv6 literals in brackets.
            ExitRequest::Addr { addr: IpAddr::V6(a), port } => (format!("[{}]", a), *port),
        }
    }
}

/// Address portion of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrPattern {
    /// `*` — any address, v4 or v6.
    Any,
    V4 { net: Ipv4Addr, prefix: u8 },
    V6 { net: Ipv6Addr, prefix: u8 },
}

impl AddrPattern {
    fn matches(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (AddrPattern::Any, _) => true,
            (AddrPattern::V4 { net, prefix }, IpAddr::V4(a)) => {
                if *prefix == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - *prefix as u32);
                (u32::from(*net) & mask) == (u32::from(*a) & mask)
            }
            (AddrPattern::V6 { net, prefix }, IpAddr::V6(a)) => {
                if *prefix == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - *prefix as u32);
                (u128::from(*net) & mask) == (u128::from(*a) & mask)
            }
            _ => false,
        }
    }
}

/// One accept/reject line of an exit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    accept: bool,
    addr: AddrPattern,
    port_min: u16,
    port_max: u16,
}

impl PolicyRule {
    /// Parse a policy line: `accept`/`reject` then `ADDR[/PREFIX]:PORTS`
    /// where ADDR may be `*`, an IPv4 address, or a bracketed IPv6
    /// address, and PORTS is `*`, a port, or `low-high`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (accept, rest) = if let Some(rest) = line.strip_prefix("accept6") {
            (true, rest)
        } else if let Some(rest) = line.strip_prefix("accept") {
            (true, rest)
        } else if let Some(rest) = line.strip_prefix("reject6") {
            (false, rest)
        } else if let Some(rest) = line.strip_prefix("reject") {
            (false, rest)
        } else {
            return Err(Error::BadPayloadData(format!(
                "policy line must start with accept or reject: {:?}",
                line
            )));
        };
        let rest = rest.trim();

        // The port separator is the last ':' so bracketed v6 literals
        // parse cleanly.
        let colon = rest.rfind(':').ok_or_else(|| {
            Error::BadPayloadData(format!("policy line has no port part: {:?}", line))
        })?;
        let (addr_part, port_part) = (&rest[..colon], &rest[colon + 1..]);

        let addr = Self::parse_addr(addr_part)?;
        let (port_min, port_max) = Self::parse_ports(port_part)?;

        Ok(Self {
            accept,
            addr,
            port_min,
            port_max,
        })
    }

    fn parse_addr(part: &str) -> Result<AddrPattern> {
        if part == "*" {
            return Ok(AddrPattern::Any);
        }
        let (addr_str, prefix_str) = match part.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (part, None),
        };
        let addr_str = addr_str.trim_start_matches('[').trim_end_matches(']');

        if let Ok(v4) = addr_str.parse::<Ipv4Addr>() {
            let prefix = match prefix_str {
                Some(p) => p.parse::<u8>().map_err(|_| {
                    Error::BadPayloadData(format!("bad prefix length: {:?}", p))
                })?,
                None => 32,
            };
            if prefix > 32 {
                return Err(Error::BadPayloadData(format!(
                    "IPv4 prefix length {} out of range",
                    prefix
                )));
            }
            return Ok(AddrPattern::V4 { net: v4, prefix });
        }
        if let Ok(v6) = addr_str.parse::<Ipv6Addr>() {
            let prefix = match prefix_str {
                Some(p) => p.parse::<u8>().map_err(|_| {
                    Error::BadPayloadData(format!("bad prefix length: {:?}", p))
                })?,
                None => 128,
            };
            if prefix > 128 {
                return Err(Error::BadPayloadData(format!(
                    "IPv6 prefix length {} out of range",
                    prefix
                )));
            }
            return Ok(AddrPattern::V6 { net: v6, prefix });
        }
        Err(Error::BadPayloadData(format!(
            "unparseable policy address: {:?}",
            part
        )))
    }

    fn parse_ports(part: &str) -> Result<(u16, u16)> {
        if part == "*" {
            return Ok((1, u16::MAX));
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo = lo.parse::<u16>();
            let hi = hi.parse::<u16>();
            if let (Ok(lo), Ok(hi)) = (lo, hi) {
                if lo <= hi {
                    return Ok((lo, hi));
                }
            }
            return Err(Error::BadPayloadData(format!(
                "bad port range: {:?}",
                part
            )));
        }
        let port = part
            .parse::<u16>()
            .map_err(|_| Error::BadPayloadData(format!("bad port: {:?}", part)))?;
        Ok((port, port))
    }

    fn matches_port(&self, port: u16) -> bool {
        self.port_min <= port && port <= self.port_max
    }

    fn addr_is_wildcard(&self) -> bool {
        matches!(self.addr, AddrPattern::Any)
            || matches!(self.addr, AddrPattern::V4 { prefix: 0, .. })
            || matches!(self.addr, AddrPattern::V6 { prefix: 0, .. })
    }
}

/// An ordered first-match exit policy. A request no rule matches is
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExitPolicy {
    rules: Vec<PolicyRule>,
}

impl ExitPolicy {
    /// Parse newline- or comma-separated policy lines.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for line in text.split(|c| c == '\n' || c == ',') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            rules.push(PolicyRule::parse(line)?);
        }
        Ok(Self { rules })
    }

    /// A policy that admits everything. Used when a hop descriptor came
    /// without one and the caller opts in.
    pub fn accept_all() -> Self {
        Self {
            rules: vec![PolicyRule {
                accept: true,
                addr: AddrPattern::Any,
                port_min: 1,
                port_max: u16::MAX,
            }],
        }
    }

    /// First rule matching both address and port decides.
    pub fn can_exit_to(&self, addr: &IpAddr, port: u16) -> bool {
        for rule in &self.rules {
            if rule.matches_port(port) && rule.addr.matches(addr) {
                return rule.accept;
            }
        }
        false
    }

    /// Port-only query for hostname requests: true only when the first
    /// wildcard-address rule covering the port accepts, so acceptance is
    /// guaranteed whatever the name resolves to.
    pub fn can_exit_to_port(&self, port: u16) -> bool {
        for rule in &self.rules {
            if rule.matches_port(port) && rule.addr_is_wildcard() {
                return rule.accept;
            }
        }
        false
    }

    /// Whether a whole request is admitted.
    pub fn allows(&self, request: &ExitRequest) -> bool {
        match request {
            ExitRequest::Host { port, .. } => self.can_exit_to_port(*port),
            ExitRequest::Addr { addr, port } => self.can_exit_to(addr, *port),
        }
    }
}
