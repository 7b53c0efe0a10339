//! Forwarding policy of a domain
//!
//! Rules never hold references to other domains; they name their target
//! domain and the name is resolved against the current domain tree.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::Serialize;
use tracing::warn;

use super::port_allocator::PortQuota;
use crate::config::{ForwardRuleConfig, IpRuleConfig, NatConfig, TransportRuleConfig};
use crate::protocol::L4Protocol;
use crate::protocol::ipv4::Ipv4Cidr;
use crate::{Error, Result};

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        self.first <= port && port <= self.last
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .ok()
                .filter(|&port| port != 0)
                .ok_or_else(|| Error::Parse(format!("invalid port '{p}'")))
        };
        let range = match s.split_once('-') {
            Some((first, last)) => PortRange {
                first: parse(first)?,
                last: parse(last)?,
            },
            None => {
                let port = parse(s)?;
                PortRange {
                    first: port,
                    last: port,
                }
            }
        };
        if range.first > range.last {
            return Err(Error::Parse(format!("empty port range '{s}'")));
        }
        Ok(range)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

/// Anything selected by destination prefix.
pub trait PrefixRule {
    fn dst(&self) -> &Ipv4Cidr;
}

/// Rules indexed for longest-prefix matching: one exact-match map per
/// prefix length, searched from /32 down to /0. Of several rules with the
/// same prefix the first configured one wins.
#[derive(Debug, Clone)]
pub struct PrefixTable<R> {
    rules: Vec<R>,
    /// prefix length -> network -> index into `rules`
    by_len: BTreeMap<u8, HashMap<u32, usize>>,
}

impl<R> Default for PrefixTable<R> {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            by_len: BTreeMap::new(),
        }
    }
}

impl<R: PrefixRule> PrefixTable<R> {
    pub fn new(rules: Vec<R>) -> Self {
        let mut by_len: BTreeMap<u8, HashMap<u32, usize>> = BTreeMap::new();
        for (index, rule) in rules.iter().enumerate() {
            let dst = rule.dst();
            by_len
                .entry(dst.prefix_len())
                .or_default()
                .entry(u32::from(dst.network()))
                .or_insert(index);
        }
        Self { rules, by_len }
    }

    pub fn longest_match(&self, ip: Ipv4Addr) -> Option<&R> {
        let ip = u32::from(ip);
        self.by_len.iter().rev().find_map(|(&len, networks)| {
            let mask = u32::MAX.checked_shl(32 - u32::from(len)).unwrap_or(0);
            networks.get(&(ip & mask)).and_then(|&index| self.rules.get(index))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Pass packets for `dst` to `domain` unchanged
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpRule {
    pub dst: Ipv4Cidr,
    pub domain: String,
}

impl PrefixRule for IpRule {
    fn dst(&self) -> &Ipv4Cidr {
        &self.dst
    }
}

impl From<&IpRuleConfig> for IpRule {
    fn from(config: &IpRuleConfig) -> Self {
        Self {
            dst: config.dst,
            domain: config.domain.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermitRule {
    #[serde(serialize_with = "serialize_display")]
    pub ports: PortRange,
    pub domain: String,
}

/// TCP or UDP policy for a destination prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportRule {
    pub dst: Ipv4Cidr,
    pub permit_any: Option<String>,
    pub permits: Vec<PermitRule>,
}

impl TransportRule {
    pub fn from_config(config: &TransportRuleConfig) -> Self {
        let permits = config
            .permit
            .iter()
            .filter_map(|permit| match permit.ports.parse() {
                Ok(ports) => Some(PermitRule {
                    ports,
                    domain: permit.domain.clone(),
                }),
                Err(e) => {
                    warn!("rule for {} skipped: {}", config.dst, e);
                    None
                }
            })
            .collect();
        Self {
            dst: config.dst,
            permit_any: config.permit_any.clone(),
            permits,
        }
    }

    /// Domain that traffic to `port` may enter.
    pub fn permitted_domain(&self, port: u16) -> Option<&str> {
        self.permit_any.as_deref().or_else(|| {
            self.permits
                .iter()
                .find(|p| p.ports.contains(port))
                .map(|p| p.domain.as_str())
        })
    }
}

impl PrefixRule for TransportRule {
    fn dst(&self) -> &Ipv4Cidr {
        &self.dst
    }
}

/// Redirect traffic for a port of the router address into `domain`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardRule {
    pub port: u16,
    pub domain: String,
    pub to: Ipv4Addr,
    pub to_port: Option<u16>,
}

impl ForwardRule {
    pub fn target_port(&self) -> u16 {
        self.to_port.unwrap_or(self.port)
    }
}

impl From<&ForwardRuleConfig> for ForwardRule {
    fn from(config: &ForwardRuleConfig) -> Self {
        Self {
            port: config.port,
            domain: config.domain.clone(),
            to: config.to,
            to_port: config.to_port,
        }
    }
}

/// Forward rules of one protocol, keyed by port
pub type ForwardRules = BTreeMap<u16, ForwardRule>;

pub fn forward_rules(configs: &[ForwardRuleConfig]) -> ForwardRules {
    configs.iter().map(|c| (c.port, ForwardRule::from(c))).collect()
}

/// Source NAT for traffic that `domain` sends into the owning domain.
///
/// Each quota bounds how many ports the client domain may hold in the
/// owning domain's allocators at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    pub domain: String,
    tcp: PortQuota,
    udp: PortQuota,
    icmp: PortQuota,
}

impl NatRule {
    pub fn quota(&self, protocol: L4Protocol) -> &PortQuota {
        match protocol {
            L4Protocol::Tcp => &self.tcp,
            L4Protocol::Udp => &self.udp,
            L4Protocol::Icmp => &self.icmp,
        }
    }

    pub fn quota_mut(&mut self, protocol: L4Protocol) -> &mut PortQuota {
        match protocol {
            L4Protocol::Tcp => &mut self.tcp,
            L4Protocol::Udp => &mut self.udp,
            L4Protocol::Icmp => &mut self.icmp,
        }
    }
}

impl From<&NatConfig> for NatRule {
    fn from(config: &NatConfig) -> Self {
        Self {
            domain: config.domain.clone(),
            tcp: PortQuota::new(config.tcp_ports),
            udp: PortQuota::new(config.udp_ports),
            icmp: PortQuota::new(config.icmp_ids),
        }
    }
}

/// NAT rules keyed by client domain name
pub type NatRules = BTreeMap<String, NatRule>;

fn serialize_display<T: fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
