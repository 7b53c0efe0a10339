//! Building a new domain tree generation from a validated configuration
//!
//! State that survives a reload: links whose rule decision is unchanged,
//! ARP entries inside the new subnet, leases of unchanged DHCP pools and
//! leased IP configs of domains that stay DHCP-configured. Links and ARP
//! entries of a domain that switches between static and dynamic are
//! dropped.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::domain::{Domain, DomainTree, IpConfigSource, Ipv4Config};
use super::link::Link;
use crate::config::RouterConfig;
use crate::protocol::L4Protocol;

pub fn next_generation(previous: DomainTree, config: &RouterConfig, generation: u64) -> DomainTree {
    let mut old: BTreeMap<String, Domain> = previous
        .into_domains()
        .into_iter()
        .map(|d| (d.name().to_string(), d))
        .collect();
    let links: Vec<Link> = old
        .values_mut()
        .flat_map(|d| d.links.take_owned().into_values())
        .collect();

    let mut leased = Vec::new();
    let mut changed_kind = BTreeSet::new();
    let domains = config
        .domains
        .iter()
        .map(|c| {
            let mut domain = Domain::new(c, &config.timeouts);
            if let Some(previous) = old.get_mut(&c.name) {
                if domain.is_static() != previous.is_static() {
                    debug!("{}: switched between static and dynamic", c.name);
                    changed_kind.insert(c.name.clone());
                }
                if let Some(ip_config) = inherit(&mut domain, previous) {
                    leased.push((c.name.clone(), ip_config));
                }
            }
            domain
        })
        .collect();

    let mut tree = DomainTree::new(generation, domains, config.verbose_domain_state);
    for (name, ip_config) in leased {
        tree.install_ip_config(&name, Some(ip_config));
    }
    for domain in tree.iter_mut() {
        let dropped = match domain.ip_config().copied() {
            Some(ip_config) => domain.arp_cache.retain_subnet(&ip_config.interface),
            None => domain.arp_cache.clear(),
        };
        if dropped > 0 {
            debug!("{}: {} queued frames left the subnet", domain.name(), dropped);
        }
    }

    let total = links.len();
    let mut kept = 0;
    for link in links {
        let (id, protocol) = (link.id, link.protocol);
        match readmit(&mut tree, link, &changed_kind) {
            Ok(()) => kept += 1,
            Err(reason) => info!("{} link {} dismissed: {}", protocol, id, reason),
        }
    }
    if total > 0 {
        debug!("generation {}: kept {} of {} links", generation, kept, total);
    }
    tree
}

/// Move reusable state from the previous generation's domain. Returns a
/// leased IP config to reinstall.
fn inherit(domain: &mut Domain, previous: &mut Domain) -> Option<Ipv4Config> {
    if domain.is_static() == previous.is_static() {
        domain.arp_cache = std::mem::take(&mut previous.arp_cache);
    }
    domain.rx_bytes = previous.rx_bytes;
    domain.tx_bytes = previous.tx_bytes;

    if let (Some(server), Some(old)) = (domain.dhcp_server.as_mut(), previous.dhcp_server.as_ref()) {
        if server.same_pool(old) {
            server.inherit_leases(old);
        }
    }

    let stays_leased = *domain.ip_config_source() == IpConfigSource::Dhcp
        && *previous.ip_config_source() == IpConfigSource::Dhcp;
    if stays_leased {
        previous.ip_config().copied()
    } else {
        None
    }
}

/// Re-register a link if the new rules still lead it the same way.
fn readmit(tree: &mut DomainTree, link: Link, changed_kind: &BTreeSet<String>) -> Result<(), &'static str> {
    if changed_kind.contains(&link.client.domain) || changed_kind.contains(&link.server.domain) {
        return Err("domain switched between static and dynamic");
    }
    let client = tree
        .by_name(&link.client.domain)
        .ok_or("client domain removed")?;
    let target = client
        .link_target(link.protocol, &link.client.id)
        .flatten()
        .ok_or("no rule permits it")?;
    let same_port = link.protocol == L4Protocol::Icmp || target.port == link.server.id.src_port;
    if target.domain != link.server.domain || target.ip != link.server.id.src_ip || !same_port {
        return Err("rules select another destination");
    }

    let server = tree
        .by_name(&link.server.domain)
        .ok_or("server domain removed")?;
    let server_ip = server.router_ip().ok_or("server domain unconfigured")?;
    match (server.nats_for(&link.client.domain), link.nat_port) {
        (true, Some(port)) => {
            if link.server.id.dst_ip != server_ip {
                return Err("NAT address changed");
            }
            let server = tree
                .by_name_mut(&link.server.domain)
                .ok_or("server domain removed")?;
            server
                .reserve_nat_port(&link.client.domain, link.protocol, port)
                .map_err(|_| "NAT port no longer available")?;
        }
        (false, None) => {}
        _ => return Err("NAT decision changed"),
    }

    tree.insert_link(link).map(|_| ()).map_err(|link| {
        if let (Some(port), Some(server)) = (link.nat_port, tree.by_name_mut(&link.server.domain)) {
            server.free_nat_port(&link.client.domain, link.protocol, port);
        }
        "side already taken"
    })
}
