//! Link tracking
//!
//! A link is one bidirectional flow crossing two domains. The domain the
//! flow was initiated from (client side) owns the link; both domains index
//! their side of it by the 4-tuple packets carry when they arrive there.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use super::domain::DomainTree;
use super::interface::InterfaceId;
use crate::config::Timeouts;
use crate::protocol::L4Protocol;
use crate::protocol::tcp::TcpFlags;

/// Never reused within one router instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Addresses and ports of a packet as it arrives at one side.
/// ICMP echo uses the identifier as both ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LinkSideId {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl fmt::Display for LinkSideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Open,
    /// RST seen or FIN seen from both sides
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkSide {
    pub domain: String,
    pub id: LinkSideId,
}

#[derive(Debug, Clone, Serialize)]
pub struct Link {
    pub id: LinkId,
    pub protocol: L4Protocol,
    pub client: LinkSide,
    pub server: LinkSide,
    /// Port (or ICMP id) held in the server domain's allocator
    pub nat_port: Option<u16>,
    #[serde(skip)]
    pub origin: InterfaceId,
    pub state: LinkState,
    #[serde(skip)]
    pub created: Instant,
    #[serde(skip)]
    pub last_activity: Instant,
    #[serde(skip)]
    fin_seen: [bool; 2],
}

/// Where a packet matching a side goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Egress {
    pub domain: String,
    /// Addresses and ports to write into the packet
    pub rewrite: LinkSideId,
}

impl Link {
    pub fn new(
        id: LinkId,
        protocol: L4Protocol,
        client: LinkSide,
        server: LinkSide,
        nat_port: Option<u16>,
        origin: InterfaceId,
        now: Instant,
    ) -> Self {
        Self {
            id,
            protocol,
            client,
            server,
            nat_port,
            origin,
            state: LinkState::Open,
            created: now,
            last_activity: now,
            fin_seen: [false; 2],
        }
    }

    pub fn side(&self, side: Side) -> &LinkSide {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    /// A packet that matched `arrived` leaves through the other side with
    /// that side's identity mirrored.
    pub fn egress(&self, arrived: Side) -> Egress {
        let out = self.side(arrived.opposite());
        Egress {
            domain: out.domain.clone(),
            rewrite: LinkSideId {
                src_ip: out.id.dst_ip,
                src_port: out.id.dst_port,
                dst_ip: out.id.src_ip,
                dst_port: out.id.src_port,
            },
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Track TCP teardown.
    pub fn observe_tcp(&mut self, from: Side, flags: TcpFlags) {
        if flags.rst() {
            self.state = LinkState::Closing;
            return;
        }
        if flags.fin() {
            self.fin_seen[from as usize] = true;
            if self.fin_seen.iter().all(|&seen| seen) {
                self.state = LinkState::Closing;
            }
        }
    }

    pub fn expired(&self, now: Instant, timeouts: &LinkTimeouts) -> bool {
        let limit = match (self.protocol, self.state) {
            (L4Protocol::Tcp, LinkState::Closing) => timeouts.tcp_closing,
            (L4Protocol::Tcp, LinkState::Open) => timeouts.tcp_idle,
            (L4Protocol::Udp, _) => timeouts.udp_idle,
            (L4Protocol::Icmp, _) => timeouts.icmp_idle,
        };
        now.saturating_duration_since(self.last_activity) >= limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimeouts {
    pub tcp_idle: Duration,
    pub tcp_closing: Duration,
    pub udp_idle: Duration,
    pub icmp_idle: Duration,
}

impl From<&Timeouts> for LinkTimeouts {
    fn from(t: &Timeouts) -> Self {
        Self {
            tcp_idle: Duration::from_secs(t.tcp_idle_sec),
            tcp_closing: Duration::from_secs(t.tcp_closing_sec),
            udp_idle: Duration::from_secs(t.udp_idle_sec),
            icmp_idle: Duration::from_secs(t.icmp_idle_sec),
        }
    }
}

/// Index entry: which link a side belongs to and who owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRef {
    pub link: LinkId,
    /// Client domain, which owns the link
    pub owner: String,
    pub side: Side,
}

/// Links of one domain: the ones it owns plus an index over every side
/// that lives in it.
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    owned: BTreeMap<LinkId, Link>,
    index: BTreeMap<(L4Protocol, LinkSideId), LinkRef>,
}

impl LinkTable {
    pub fn lookup(&self, protocol: L4Protocol, id: &LinkSideId) -> Option<&LinkRef> {
        self.index.get(&(protocol, *id))
    }

    pub fn get(&self, id: LinkId) -> Option<&Link> {
        self.owned.get(&id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.owned.get_mut(&id)
    }

    pub fn owned(&self) -> impl Iterator<Item = &Link> {
        self.owned.values()
    }

    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    /// Sides of foreign links that live in this domain.
    pub fn foreign_refs(&self) -> impl Iterator<Item = &LinkRef> {
        self.index.values().filter(|r| r.side == Side::Server)
    }

    fn index_side(&mut self, protocol: L4Protocol, id: LinkSideId, link_ref: LinkRef) -> bool {
        use std::collections::btree_map::Entry;
        match self.index.entry((protocol, id)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(link_ref);
                true
            }
        }
    }

    fn unindex_side(&mut self, protocol: L4Protocol, id: &LinkSideId, link: LinkId) {
        if self
            .index
            .get(&(protocol, *id))
            .is_some_and(|r| r.link == link)
        {
            self.index.remove(&(protocol, *id));
        }
    }

    /// Drop everything, e.g. when the table moves to a new generation.
    pub fn take_owned(&mut self) -> BTreeMap<LinkId, Link> {
        self.index.clear();
        std::mem::take(&mut self.owned)
    }
}

impl DomainTree {
    /// Register a link in both of its domains.
    ///
    /// Fails if either side's identity is already taken; the caller then
    /// still holds the link and must release its NAT port.
    pub fn insert_link(&mut self, link: Link) -> Result<LinkId, Link> {
        let id = link.id;
        let owner = link.client.domain.clone();
        let client_ref = LinkRef {
            link: id,
            owner: owner.clone(),
            side: Side::Client,
        };
        let server_ref = LinkRef {
            link: id,
            owner: owner.clone(),
            side: Side::Server,
        };

        let server_free = self
            .by_name(&link.server.domain)
            .is_some_and(|d| d.links.lookup(link.protocol, &link.server.id).is_none());
        let client_free = self
            .by_name(&owner)
            .is_some_and(|d| d.links.lookup(link.protocol, &link.client.id).is_none());
        if !server_free || !client_free {
            return Err(link);
        }

        if let Some(server) = self.by_name_mut(&link.server.domain) {
            server.links.index_side(link.protocol, link.server.id, server_ref);
        }
        if let Some(client) = self.by_name_mut(&owner) {
            client.links.index_side(link.protocol, link.client.id, client_ref);
            client.links.owned.insert(id, link);
        }
        Ok(id)
    }

    /// Remove a link from both domains and return its NAT port.
    pub fn dismiss_link(&mut self, owner: &str, id: LinkId) -> Option<Link> {
        let link = {
            let client = self.by_name_mut(owner)?;
            let link = client.links.owned.remove(&id)?;
            client.links.unindex_side(link.protocol, &link.client.id, id);
            link
        };
        if let Some(server) = self.by_name_mut(&link.server.domain) {
            server.links.unindex_side(link.protocol, &link.server.id, id);
            if let Some(port) = link.nat_port {
                server.free_nat_port(&link.client.domain, link.protocol, port);
            }
        }
        debug!(
            "dismissed {} link {} {} ({})",
            link.protocol, link.id, link.client.id, owner
        );
        Some(link)
    }

    /// Dismiss every link with a side in domain `name`.
    pub fn dismiss_links_of_domain(&mut self, name: &str) -> usize {
        let Some(domain) = self.by_name(name) else {
            return 0;
        };
        let mut victims: Vec<(String, LinkId)> = domain
            .links
            .owned()
            .map(|l| (name.to_string(), l.id))
            .collect();
        victims.extend(domain.links.foreign_refs().map(|r| (r.owner.clone(), r.link)));

        victims
            .into_iter()
            .filter(|(owner, id)| self.dismiss_link(owner, *id).is_some())
            .count()
    }

    /// Dismiss every link that was opened through `interface`.
    pub fn dismiss_links_of_interface(&mut self, interface: InterfaceId) -> usize {
        let victims: Vec<(String, LinkId)> = self
            .iter()
            .flat_map(|d| {
                d.links
                    .owned()
                    .filter(|l| l.origin == interface)
                    .map(|l| (l.client.domain.clone(), l.id))
            })
            .collect();
        victims
            .into_iter()
            .filter(|(owner, id)| self.dismiss_link(owner, *id).is_some())
            .count()
    }

    /// Destroy idle and finished links.
    pub fn age_links(&mut self, now: Instant, timeouts: &LinkTimeouts) -> usize {
        let expired: Vec<(String, LinkId)> = self
            .iter()
            .flat_map(|d| {
                d.links
                    .owned()
                    .filter(|l| l.expired(now, timeouts))
                    .map(|l| (l.client.domain.clone(), l.id))
            })
            .collect();
        expired
            .into_iter()
            .filter(|(owner, id)| self.dismiss_link(owner, *id).is_some())
            .count()
    }
}
