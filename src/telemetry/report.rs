//! Periodic state report
//!
//! One document per report interval with an entry per domain. Byte
//! counters, rule summaries and the verbose detail sections are toggled
//! by the `[report]` table.

use std::net::Ipv4Addr;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::Result;
use crate::dataplane::{ArpEntryInfo, Link, LeaseInfo, LinkId};
use crate::protocol::L4Protocol;

#[derive(Debug, Clone, Serialize)]
pub struct RouterReport {
    /// RFC 3339 timestamp
    pub generated_at: String,
    /// Domain tree generation the report describes
    pub generation: u64,
    /// Why the last configuration was rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_error: Option<String>,
    pub domains: Vec<DomainReport>,
}

impl RouterReport {
    pub fn new(generation: u64, config_error: Option<String>, domains: Vec<DomainReport>) -> Self {
        Self {
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            generation,
            config_error,
            domains,
        }
    }

    pub fn domain(&self, name: &str) -> Option<&DomainReport> {
        self.domains.iter().find(|d| d.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DomainReport {
    pub name: String,
    /// Router address with prefix, absent while unconfigured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_server: Option<Ipv4Addr>,
    pub interfaces: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<RuleSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<String>,
    pub links: LinkCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<DomainDetail>,
}

/// Rule counts per table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleSummary {
    pub ip: usize,
    pub icmp: usize,
    pub tcp: usize,
    pub udp: usize,
    pub tcp_forward: usize,
    pub udp_forward: usize,
    pub nat: Vec<NatUsage>,
}

/// Ports a client domain currently holds in this domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NatUsage {
    pub domain: String,
    pub tcp: usize,
    pub udp: usize,
    pub icmp: usize,
}

/// Links owned by the domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkCounts {
    pub tcp: usize,
    pub udp: usize,
    pub icmp: usize,
}

impl LinkCounts {
    pub fn add(&mut self, protocol: L4Protocol) {
        match protocol {
            L4Protocol::Tcp => self.tcp += 1,
            L4Protocol::Udp => self.udp += 1,
            L4Protocol::Icmp => self.icmp += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.tcp + self.udp + self.icmp
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DomainDetail {
    pub links: Vec<LinkDetail>,
    pub arp: Vec<ArpEntryInfo>,
    pub leases: Vec<LeaseInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkDetail {
    pub id: LinkId,
    pub protocol: L4Protocol,
    pub client: String,
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nat_port: Option<u16>,
    pub closing: bool,
    pub idle_sec: u64,
}

impl LinkDetail {
    pub fn new(link: &Link, idle_sec: u64) -> Self {
        Self {
            id: link.id,
            protocol: link.protocol,
            client: format!("{} {}", link.client.domain, link.client.id),
            server: format!("{} {}", link.server.domain, link.server.id),
            nat_port: link.nat_port,
            closing: link.state == crate::dataplane::LinkState::Closing,
            idle_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_skips_empty_sections() {
        let report = RouterReport::new(
            3,
            None,
            vec![DomainReport {
                name: "guest".into(),
                interfaces: 1,
                ..Default::default()
            }],
        );
        let json = report.to_json().unwrap();
        assert!(json.contains("\"generation\": 3"));
        assert!(json.contains("\"guest\""));
        assert!(!json.contains("config_error"));
        assert!(!json.contains("rx_bytes"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_config_error_is_reported() {
        let report = RouterReport::new(1, Some("duplicate domain".into()), Vec::new());
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["config_error"], "duplicate domain");
        assert!(value["generated_at"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_link_counts() {
        let mut counts = LinkCounts::default();
        counts.add(L4Protocol::Tcp);
        counts.add(L4Protocol::Tcp);
        counts.add(L4Protocol::Icmp);
        assert_eq!(counts, LinkCounts { tcp: 2, udp: 0, icmp: 1 });
        assert_eq!(counts.total(), 3);
    }
}
