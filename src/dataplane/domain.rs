//! Domains and the domain tree
//!
//! A domain is one virtual network segment with its own IPv4 config, rule
//! sets, link tables, ARP cache and optional DHCP server. The tree owns all
//! domains of one configuration generation; domains refer to each other by
//! name only.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::arp_cache::ArpCache;
use super::dhcp_server::{DhcpServer, ServerParams};
use super::interface::InterfaceId;
use super::link::{LinkSideId, LinkTable};
use super::port_allocator::PortAllocator;
use super::rules::{
    ForwardRules, IpRule, NatRule, NatRules, PrefixTable, TransportRule, forward_rules,
};
use crate::config::{DomainConfig, ReportConfig, Timeouts};
use crate::protocol::L4Protocol;
use crate::protocol::ipv4::Ipv4Cidr;
use crate::telemetry::{DomainDetail, DomainReport, LinkCounts, LinkDetail, NatUsage, RuleSummary};
use crate::{Error, Result};

/// IPv4 config of a domain. Present only when complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ipv4Config {
    /// Router address and prefix
    pub interface: Ipv4Cidr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_server: Option<Ipv4Addr>,
}

impl Ipv4Config {
    pub fn from_domain_config(config: &DomainConfig) -> Option<Self> {
        config.interface.map(|interface| Self {
            interface,
            gateway: config.gateway,
            dns_server: config.dns_server,
        })
    }

    pub fn router_ip(&self) -> Ipv4Addr {
        self.interface.addr()
    }
}

/// Where a domain's IPv4 config comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpConfigSource {
    Static,
    /// Copied from the named supplier domain
    Derived(String),
    /// Leased by the DHCP client of the domain's interfaces
    Dhcp,
}

/// Server end chosen for a new link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub domain: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Handle to a domain, valid only for the tree generation that issued it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId {
    generation: u64,
    index: u32,
}

#[derive(Debug)]
pub struct Domain {
    name: String,
    config: DomainConfig,
    source: IpConfigSource,
    ip_config: Option<Ipv4Config>,
    ip_rules: PrefixTable<IpRule>,
    icmp_rules: PrefixTable<IpRule>,
    tcp_rules: PrefixTable<TransportRule>,
    udp_rules: PrefixTable<TransportRule>,
    tcp_forward: ForwardRules,
    udp_forward: ForwardRules,
    nat: NatRules,
    tcp_ports: PortAllocator,
    udp_ports: PortAllocator,
    icmp_ids: PortAllocator,
    pub arp_cache: ArpCache,
    pub links: LinkTable,
    pub dhcp_server: Option<DhcpServer>,
    interfaces: BTreeSet<InterfaceId>,
    /// Configured domains deriving their IP config from this one
    dependents: BTreeSet<String>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl Domain {
    /// Build a domain from its configuration. Static domains come up
    /// configured, dynamic ones unconfigured.
    pub fn new(config: &DomainConfig, timeouts: &Timeouts) -> Self {
        let source = if config.is_static() {
            IpConfigSource::Static
        } else if let Some(supplier) = &config.ip_config_from {
            IpConfigSource::Derived(supplier.clone())
        } else {
            IpConfigSource::Dhcp
        };
        let offer_timeout = Duration::from_secs(timeouts.dhcp_offer_sec);

        Self {
            name: config.name.clone(),
            config: config.clone(),
            source,
            ip_config: Ipv4Config::from_domain_config(config),
            ip_rules: PrefixTable::new(config.ip.iter().map(IpRule::from).collect()),
            icmp_rules: PrefixTable::new(config.icmp.iter().map(IpRule::from).collect()),
            tcp_rules: PrefixTable::new(config.tcp.iter().map(TransportRule::from_config).collect()),
            udp_rules: PrefixTable::new(config.udp.iter().map(TransportRule::from_config).collect()),
            tcp_forward: forward_rules(&config.tcp_forward),
            udp_forward: forward_rules(&config.udp_forward),
            nat: config
                .nat
                .iter()
                .map(|n| (n.domain.clone(), NatRule::from(n)))
                .collect(),
            tcp_ports: PortAllocator::new(),
            udp_ports: PortAllocator::new(),
            icmp_ids: PortAllocator::new(),
            arp_cache: ArpCache::new(),
            links: LinkTable::default(),
            dhcp_server: config
                .dhcp_server
                .as_ref()
                .map(|c| DhcpServer::new(c, offer_timeout)),
            interfaces: BTreeSet::new(),
            dependents: BTreeSet::new(),
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn ip_config_source(&self) -> &IpConfigSource {
        &self.source
    }

    pub fn is_static(&self) -> bool {
        self.source == IpConfigSource::Static
    }

    pub fn verbose_packets(&self) -> bool {
        self.config.verbose_packets
    }

    pub fn ip_config(&self) -> Option<&Ipv4Config> {
        self.ip_config.as_ref()
    }

    pub fn router_ip(&self) -> Option<Ipv4Addr> {
        self.ip_config.map(|c| c.router_ip())
    }

    pub fn is_configured(&self) -> bool {
        self.ip_config.is_some()
    }

    /// Address to resolve for reaching `dst`.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Result<Ipv4Addr> {
        let config = self.ip_config.as_ref().ok_or(Error::NoNextHop(dst))?;
        if config.interface.contains(dst) {
            Ok(dst)
        } else {
            config.gateway.ok_or(Error::NoNextHop(dst))
        }
    }

    pub fn ip_rules(&self) -> &PrefixTable<IpRule> {
        &self.ip_rules
    }

    pub fn icmp_rules(&self) -> &PrefixTable<IpRule> {
        &self.icmp_rules
    }

    pub fn transport_rules(&self, protocol: L4Protocol) -> Option<&PrefixTable<TransportRule>> {
        match protocol {
            L4Protocol::Tcp => Some(&self.tcp_rules),
            L4Protocol::Udp => Some(&self.udp_rules),
            L4Protocol::Icmp => None,
        }
    }

    pub fn forward_rules(&self, protocol: L4Protocol) -> Option<&ForwardRules> {
        match protocol {
            L4Protocol::Tcp => Some(&self.tcp_forward),
            L4Protocol::Udp => Some(&self.udp_forward),
            L4Protocol::Icmp => None,
        }
    }

    /// Port-level rule decision for a flow entering this domain.
    ///
    /// `None` if no forward, transport or ICMP rule covers the flow,
    /// `Some(None)` if one does but denies it.
    pub fn link_target(&self, protocol: L4Protocol, id: &LinkSideId) -> Option<Option<LinkTarget>> {
        let router_ip = self.router_ip()?;
        match protocol {
            L4Protocol::Icmp => self.icmp_rules.longest_match(id.dst_ip).map(|rule| {
                Some(LinkTarget {
                    domain: rule.domain.clone(),
                    ip: id.dst_ip,
                    port: id.dst_port,
                })
            }),
            _ if id.dst_ip == router_ip => {
                let rule = self.forward_rules(protocol)?.get(&id.dst_port);
                Some(rule.map(|rule| LinkTarget {
                    domain: rule.domain.clone(),
                    ip: rule.to,
                    port: rule.target_port(),
                }))
            }
            _ => {
                let rule = self.transport_rules(protocol)?.longest_match(id.dst_ip)?;
                Some(rule.permitted_domain(id.dst_port).map(|domain| LinkTarget {
                    domain: domain.to_string(),
                    ip: id.dst_ip,
                    port: id.dst_port,
                }))
            }
        }
    }

    /// Whether traffic entering from `client` gets source NAT here.
    pub fn nats_for(&self, client: &str) -> bool {
        self.nat.contains_key(client)
    }

    pub fn nat_rule(&self, client: &str) -> Option<&NatRule> {
        self.nat.get(client)
    }

    pub fn allocator(&self, protocol: L4Protocol) -> &PortAllocator {
        match protocol {
            L4Protocol::Tcp => &self.tcp_ports,
            L4Protocol::Udp => &self.udp_ports,
            L4Protocol::Icmp => &self.icmp_ids,
        }
    }

    fn nat_parts(
        &mut self,
        client: &str,
        protocol: L4Protocol,
    ) -> (Option<&mut NatRule>, &mut PortAllocator) {
        let Domain {
            nat,
            tcp_ports,
            udp_ports,
            icmp_ids,
            ..
        } = self;
        let allocator = match protocol {
            L4Protocol::Tcp => tcp_ports,
            L4Protocol::Udp => udp_ports,
            L4Protocol::Icmp => icmp_ids,
        };
        (nat.get_mut(client), allocator)
    }

    /// Draw a port for a flow from `client` within its quota.
    pub fn alloc_nat_port(&mut self, client: &str, protocol: L4Protocol) -> Result<u16> {
        match self.nat_parts(client, protocol) {
            (Some(rule), allocator) => rule.quota_mut(protocol).alloc(allocator),
            (None, _) => Err(Error::UnknownDomain {
                name: client.to_string(),
            }),
        }
    }

    /// Claim a port an inherited link already uses.
    pub fn reserve_nat_port(&mut self, client: &str, protocol: L4Protocol, port: u16) -> Result<()> {
        match self.nat_parts(client, protocol) {
            (Some(rule), allocator) => rule.quota_mut(protocol).alloc_specific(allocator, port),
            (None, _) => Err(Error::UnknownDomain {
                name: client.to_string(),
            }),
        }
    }

    pub fn free_nat_port(&mut self, client: &str, protocol: L4Protocol, port: u16) {
        match self.nat_parts(client, protocol) {
            (Some(rule), allocator) => rule.quota_mut(protocol).free(allocator, port),
            (None, allocator) => allocator.free(port),
        }
    }

    pub fn interfaces(&self) -> impl Iterator<Item = InterfaceId> + '_ {
        self.interfaces.iter().copied()
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    pub(super) fn add_interface(&mut self, id: InterfaceId) {
        self.interfaces.insert(id);
    }

    pub(super) fn remove_interface(&mut self, id: InterfaceId) -> bool {
        self.interfaces.remove(&id)
    }

    pub fn dependents(&self) -> impl Iterator<Item = &str> {
        self.dependents.iter().map(String::as_str)
    }

    /// Parameters for the DHCP server, `None` while unconfigured.
    pub fn dhcp_params(&self, dns_server: Option<Ipv4Addr>) -> Option<ServerParams> {
        self.ip_config.map(|config| ServerParams {
            interface: config.interface,
            dns_server,
        })
    }

    pub fn report(&self, options: &ReportConfig, now: Instant) -> DomainReport {
        let mut links = LinkCounts::default();
        for link in self.links.owned() {
            links.add(link.protocol);
        }

        let rules = options.config.then(|| RuleSummary {
            ip: self.ip_rules.len(),
            icmp: self.icmp_rules.len(),
            tcp: self.tcp_rules.len(),
            udp: self.udp_rules.len(),
            tcp_forward: self.tcp_forward.len(),
            udp_forward: self.udp_forward.len(),
            nat: self
                .nat
                .values()
                .map(|rule| NatUsage {
                    domain: rule.domain.clone(),
                    tcp: rule.quota(L4Protocol::Tcp).used(),
                    udp: rule.quota(L4Protocol::Udp).used(),
                    icmp: rule.quota(L4Protocol::Icmp).used(),
                })
                .collect(),
        });

        let detail = options.verbose.then(|| DomainDetail {
            links: self
                .links
                .owned()
                .map(|l| LinkDetail::new(l, now.saturating_duration_since(l.last_activity).as_secs()))
                .collect(),
            arp: self.arp_cache.entries(),
            leases: self
                .dhcp_server
                .as_ref()
                .map(DhcpServer::leases)
                .unwrap_or_default(),
        });

        DomainReport {
            name: self.name.clone(),
            ipv4: self.ip_config.map(|c| c.interface.to_string()),
            gateway: self.ip_config.and_then(|c| c.gateway),
            dns_server: self.ip_config.and_then(|c| c.dns_server),
            interfaces: self.interfaces.len(),
            rx_bytes: options.bytes.then_some(self.rx_bytes),
            tx_bytes: options.bytes.then_some(self.tx_bytes),
            rules,
            dependents: if options.config {
                self.dependents.iter().cloned().collect()
            } else {
                Vec::new()
            },
            links,
            detail,
        }
    }
}

/// All domains of one configuration generation
#[derive(Debug, Default)]
pub struct DomainTree {
    generation: u64,
    domains: Vec<Domain>,
    names: BTreeMap<String, u32>,
    verbose: bool,
}

impl DomainTree {
    pub fn new(generation: u64, domains: Vec<Domain>, verbose: bool) -> Self {
        let names = domains
            .iter()
            .enumerate()
            .map(|(index, d)| (d.name.clone(), index as u32))
            .collect();
        let mut tree = Self {
            generation,
            domains,
            names,
            verbose,
        };
        tree.derive_initial_configs();
        tree
    }

    /// Derived domains of configured suppliers start out configured.
    fn derive_initial_configs(&mut self) {
        let suppliers: Vec<String> = self
            .domains
            .iter()
            .filter(|d| d.ip_config.is_some())
            .map(|d| d.name.clone())
            .collect();
        for supplier in suppliers {
            let config = self.by_name(&supplier).and_then(|d| d.ip_config);
            self.propagate(&supplier, config);
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn id(&self, name: &str) -> Option<DomainId> {
        self.names.get(name).map(|&index| DomainId {
            generation: self.generation,
            index,
        })
    }

    pub fn get(&self, id: DomainId) -> Option<&Domain> {
        if id.generation != self.generation {
            return None;
        }
        self.domains.get(id.index as usize)
    }

    pub fn get_mut(&mut self, id: DomainId) -> Option<&mut Domain> {
        if id.generation != self.generation {
            return None;
        }
        self.domains.get_mut(id.index as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&Domain> {
        self.names.get(name).map(|&i| &self.domains[i as usize])
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut Domain> {
        self.names.get(name).map(|&i| &mut self.domains[i as usize])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Domain> {
        self.domains.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Domain> {
        self.domains.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Set or clear the IP config of a dynamic domain.
    pub fn set_ip_config(&mut self, id: DomainId, config: Option<Ipv4Config>) -> Result<()> {
        let domain = self.get(id).ok_or_else(|| Error::UnknownDomain {
            name: format!("{id:?}"),
        })?;
        if domain.is_static() {
            return Err(Error::IpConfigStatic {
                name: domain.name.clone(),
            });
        }
        let name = domain.name.clone();
        self.install_ip_config(&name, config);
        Ok(())
    }

    pub fn discard_ip_config(&mut self, id: DomainId) -> Result<()> {
        self.set_ip_config(id, None)
    }

    /// Replace a domain's config and propagate to derived domains.
    pub(super) fn install_ip_config(&mut self, name: &str, config: Option<Ipv4Config>) {
        let Some(current) = self.by_name(name).map(|d| d.ip_config) else {
            return;
        };
        if current == config {
            return;
        }

        if current.is_some() {
            let links = self.dismiss_links_of_domain(name);
            if let Some(domain) = self.by_name_mut(name) {
                let waiters = domain.arp_cache.clear();
                if waiters > 0 {
                    warn!("{}: dropped {} frames awaiting ARP", name, waiters);
                }
            }
            debug!("{}: discarded IP config, {} links dismissed", name, links);
        }

        let verbose = self.verbose;
        if let Some(domain) = self.by_name_mut(name) {
            domain.ip_config = config;
        }
        match config {
            Some(c) if verbose => info!(
                "{}: IP config {} gateway {:?} dns {:?}",
                name, c.interface, c.gateway, c.dns_server
            ),
            Some(c) => debug!("{}: IP config {}", name, c.interface),
            None if verbose => info!("{}: IP config invalid", name),
            None => debug!("{}: IP config invalid", name),
        }

        self.propagate(name, config);
    }

    fn propagate(&mut self, supplier: &str, config: Option<Ipv4Config>) {
        let derived: Vec<String> = self
            .domains
            .iter()
            .filter(|d| matches!(&d.source, IpConfigSource::Derived(s) if s == supplier))
            .map(|d| d.name.clone())
            .collect();

        for name in derived {
            self.install_ip_config(&name, config);
            let configured = self.by_name(&name).is_some_and(|d| d.ip_config.is_some());
            if let Some(domain) = self.by_name_mut(supplier) {
                if configured {
                    domain.dependents.insert(name);
                } else {
                    domain.dependents.remove(&name);
                }
            }
        }
    }

    /// DNS server handed out by the DHCP server of `name`.
    pub fn dhcp_dns_server(&self, name: &str) -> Option<Ipv4Addr> {
        let server = self.by_name(name)?.dhcp_server.as_ref()?;
        match server.dns_server_from() {
            Some(from) => self.by_name(from)?.ip_config?.dns_server,
            None => server.static_dns_server(),
        }
    }

    /// Router address of `name` if it is configured.
    pub fn router_ip(&self, name: &str) -> Option<Ipv4Addr> {
        self.by_name(name)?.router_ip()
    }

    /// Domain that answers ARP for `ip` on behalf of `domain`: the domain
    /// itself, or a peer reached through an IP rule whose router address
    /// is `ip`.
    pub fn answers_arp_for(&self, domain: &Domain, ip: Ipv4Addr) -> bool {
        if domain.router_ip() == Some(ip) {
            return true;
        }
        domain
            .ip_rules
            .iter()
            .filter(|rule| rule.dst.contains(ip))
            .any(|rule| self.router_ip(&rule.domain) == Some(ip))
    }

    pub fn into_domains(self) -> Vec<Domain> {
        self.domains
    }
}
