//! Configuration types

use std::net::Ipv4Addr;

use serde::Deserialize;

use crate::protocol::MacAddr;
use crate::protocol::ipv4::Ipv4Cidr;
use crate::telemetry::LogConfig;

/// Router configuration (one generation of the domain tree)
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// MAC used by the router on every interface
    #[serde(default = "default_mac")]
    pub mac: MacAddr,
    /// Log IP config changes of domains at info level
    #[serde(default)]
    pub verbose_domain_state: bool,
    /// Answer unroutable packets with ICMP destination-unreachable
    #[serde(default = "default_true")]
    pub icmp_unreachable: bool,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default, rename = "domain")]
    pub domains: Vec<DomainConfig>,
    /// Host NICs to attach (binary only)
    #[serde(default, rename = "attach")]
    pub attachments: Vec<AttachConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    #[serde(default = "default_report_interval")]
    pub interval_sec: u64,
    #[serde(default = "default_true")]
    pub bytes: bool,
    #[serde(default = "default_true")]
    pub config: bool,
    /// Include rules, links, ARP entries and leases
    #[serde(default)]
    pub verbose: bool,
    /// Write the report here instead of logging it
    #[serde(default)]
    pub path: Option<String>,
    /// Also report after every configuration reload
    #[serde(default)]
    pub config_triggers: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval_sec: default_report_interval(),
            bytes: true,
            config: true,
            verbose: false,
            path: None,
            config_triggers: false,
        }
    }
}

/// Timeouts in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub tcp_idle_sec: u64,
    pub tcp_closing_sec: u64,
    pub udp_idle_sec: u64,
    pub icmp_idle_sec: u64,
    pub arp_request_sec: u64,
    pub arp_entry_sec: u64,
    pub dhcp_offer_sec: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tcp_idle_sec: 600,
            tcp_closing_sec: 30,
            udp_idle_sec: 60,
            icmp_idle_sec: 30,
            arp_request_sec: 10,
            arp_entry_sec: 300,
            dhcp_offer_sec: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    pub name: String,
    /// Router address and prefix; absent makes the domain dynamic
    #[serde(default)]
    pub interface: Option<Ipv4Cidr>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_server: Option<Ipv4Addr>,
    /// Copy the IP config of another domain (dynamic only)
    #[serde(default)]
    pub ip_config_from: Option<String>,
    #[serde(default)]
    pub dhcp_server: Option<DhcpServerConfig>,
    #[serde(default)]
    pub nat: Vec<NatConfig>,
    #[serde(default)]
    pub ip: Vec<IpRuleConfig>,
    #[serde(default)]
    pub icmp: Vec<IpRuleConfig>,
    #[serde(default)]
    pub tcp: Vec<TransportRuleConfig>,
    #[serde(default)]
    pub udp: Vec<TransportRuleConfig>,
    #[serde(default)]
    pub tcp_forward: Vec<ForwardRuleConfig>,
    #[serde(default)]
    pub udp_forward: Vec<ForwardRuleConfig>,
    /// Log drops and new links of this domain at debug level
    #[serde(default)]
    pub verbose_packets: bool,
}

impl DomainConfig {
    /// Minimal domain, mostly for tests and programmatic setups.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interface: None,
            gateway: None,
            dns_server: None,
            ip_config_from: None,
            dhcp_server: None,
            nat: Vec::new(),
            ip: Vec::new(),
            icmp: Vec::new(),
            tcp: Vec::new(),
            udp: Vec::new(),
            tcp_forward: Vec::new(),
            udp_forward: Vec::new(),
            verbose_packets: false,
        }
    }

    pub fn is_static(&self) -> bool {
        self.interface.is_some()
    }

    /// Every domain name this domain refers to.
    pub fn referenced_domains(&self) -> impl Iterator<Item = &str> {
        let transport = self.tcp.iter().chain(self.udp.iter()).flat_map(|rule| {
            rule.permit_any
                .iter()
                .map(String::as_str)
                .chain(rule.permit.iter().map(|p| p.domain.as_str()))
        });
        self.nat
            .iter()
            .map(|n| n.domain.as_str())
            .chain(self.ip.iter().chain(self.icmp.iter()).map(|r| r.domain.as_str()))
            .chain(transport)
            .chain(
                self.tcp_forward
                    .iter()
                    .chain(self.udp_forward.iter())
                    .map(|f| f.domain.as_str()),
            )
            .chain(self.ip_config_from.as_deref())
            .chain(
                self.dhcp_server
                    .as_ref()
                    .and_then(|d| d.dns_server_from.as_deref()),
            )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DhcpServerConfig {
    pub ip_first: Ipv4Addr,
    pub ip_last: Ipv4Addr,
    #[serde(default = "default_lease_time")]
    pub ip_lease_time_sec: u32,
    #[serde(default)]
    pub dns_server: Option<Ipv4Addr>,
    /// Hand out the DNS server of another domain's IP config
    #[serde(default)]
    pub dns_server_from: Option<String>,
}

/// NAT for traffic that `domain` sends into the owning domain
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NatConfig {
    pub domain: String,
    #[serde(default)]
    pub tcp_ports: usize,
    #[serde(default)]
    pub udp_ports: usize,
    #[serde(default)]
    pub icmp_ids: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpRuleConfig {
    pub dst: Ipv4Cidr,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportRuleConfig {
    pub dst: Ipv4Cidr,
    #[serde(default)]
    pub permit_any: Option<String>,
    #[serde(default)]
    pub permit: Vec<PermitConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermitConfig {
    /// Single port ("443") or inclusive range ("1000-2000")
    pub ports: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardRuleConfig {
    pub port: u16,
    pub domain: String,
    pub to: Ipv4Addr,
    #[serde(default)]
    pub to_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachConfig {
    pub device: String,
    pub domain: String,
}

fn default_mac() -> MacAddr {
    MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
}

fn default_true() -> bool {
    true
}

fn default_report_interval() -> u64 {
    5
}

fn default_lease_time() -> u32 {
    3600
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mac: default_mac(),
            verbose_domain_state: false,
            icmp_unreachable: true,
            log: None,
            report: ReportConfig::default(),
            timeouts: Timeouts::default(),
            domains: Vec::new(),
            attachments: Vec::new(),
        }
    }
}
