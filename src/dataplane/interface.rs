//! Interfaces and the per-frame pipeline
//!
//! An interface is one attached network client. Frames it delivers are
//! processed against the domain its session policy selected; everything
//! the router sends in response is collected as [`Transmit`]s.

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::arp_cache::{ArpWaiter, Enqueue};
use super::dhcp_client::{DhcpClient, DhcpClientAction};
use super::dhcp_server::{DhcpAction, reply_destination};
use super::domain::{DomainId, DomainTree, IpConfigSource, Ipv4Config, LinkTarget};
use super::link::{Link, LinkId, LinkRef, LinkSide, LinkSideId, Side};
use super::router::Settings;
use crate::protocol::arp::{ArpOp, ArpPacket};
use crate::protocol::dhcp::{self, DhcpMessage};
use crate::protocol::ethernet::{Frame, FrameBuilder};
use crate::protocol::ipv4::{Ipv4Builder, Ipv4Packet};
use crate::protocol::tcp::{self, TcpFlags, TcpHeader};
use crate::protocol::udp::{self, UdpHeader};
use crate::protocol::{EtherType, L4Protocol, MacAddr, icmp};

/// Handle to an attached interface. A detached slot gets a new generation
/// before it is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId {
    index: u32,
    generation: u32,
}

impl InterfaceId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}.{}", self.index, self.generation)
    }
}

/// A frame to send through an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub interface: InterfaceId,
    pub frame: Vec<u8>,
}

#[derive(Debug)]
pub struct Interface {
    id: InterfaceId,
    /// Domain selected by the session policy
    domain_name: String,
    pub(super) domain: Option<DomainId>,
    pub(super) dhcp_client: Option<DhcpClient>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl Interface {
    pub fn id(&self) -> InterfaceId {
        self.id
    }

    pub fn domain_name(&self) -> &str {
        &self.domain_name
    }

    pub fn domain(&self) -> Option<DomainId> {
        self.domain
    }

    pub fn is_attached(&self) -> bool {
        self.domain.is_some()
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    interface: Option<Interface>,
}

/// Arena of interfaces
#[derive(Debug, Default)]
pub struct InterfaceTable {
    slots: Vec<Slot>,
}

impl InterfaceTable {
    pub fn insert(&mut self, domain_name: &str) -> InterfaceId {
        let index = match self.slots.iter().position(|s| s.interface.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    interface: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        let id = InterfaceId::new(index as u32, slot.generation);
        slot.interface = Some(Interface {
            id,
            domain_name: domain_name.to_string(),
            domain: None,
            dhcp_client: None,
            rx_bytes: 0,
            tx_bytes: 0,
        });
        id
    }

    pub fn remove(&mut self, id: InterfaceId) -> Option<Interface> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let interface = slot.interface.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(interface)
    }

    pub fn get(&self, id: InterfaceId) -> Option<&Interface> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.interface.as_ref())
    }

    pub fn get_mut(&mut self, id: InterfaceId) -> Option<&mut Interface> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.interface.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.slots.iter().filter_map(|s| s.interface.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Interface> {
        self.slots.iter_mut().filter_map(|s| s.interface.as_mut())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolved layer 2 destination
#[derive(Debug, Clone, Copy)]
struct NextHop {
    mac: MacAddr,
    /// Interface that resolved the address, all domain interfaces if none
    via: Option<InterfaceId>,
}

/// Transport identity of a packet
#[derive(Debug, Clone, Copy)]
struct Flow {
    protocol: L4Protocol,
    id: LinkSideId,
    tcp_flags: Option<TcpFlags>,
    /// May open a new link (ICMP: echo requests only)
    initiates: bool,
}

/// Processes frames and collects the resulting transmissions.
///
/// Frames whose next hop resolves during processing are replayed after
/// the current frame, in the order they were queued.
pub(super) struct Pipeline<'a> {
    domains: &'a mut DomainTree,
    interfaces: &'a mut InterfaceTable,
    settings: &'a Settings,
    next_link: &'a mut u64,
    now: Instant,
    out: Vec<Transmit>,
    replays: VecDeque<(InterfaceId, Vec<u8>)>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        domains: &'a mut DomainTree,
        interfaces: &'a mut InterfaceTable,
        settings: &'a Settings,
        next_link: &'a mut u64,
        now: Instant,
    ) -> Self {
        Self {
            domains,
            interfaces,
            settings,
            next_link,
            now,
            out: Vec::new(),
            replays: VecDeque::new(),
        }
    }

    pub fn finish(self) -> Vec<Transmit> {
        self.out
    }

    /// Handle a frame received on `src`, then everything it released.
    pub fn handle_frame(&mut self, src: InterfaceId, frame: &[u8]) {
        self.process(src, frame, false);
        self.run_replays();
    }

    /// Drive the DHCP clients of all interfaces.
    pub fn tick_dhcp_clients(&mut self) {
        let clients: Vec<InterfaceId> = self
            .interfaces
            .iter()
            .filter(|i| i.dhcp_client.is_some())
            .map(|i| i.id)
            .collect();
        for id in clients {
            let now = self.now;
            let Some(client) = self.interfaces.get_mut(id).and_then(|i| i.dhcp_client.as_mut()) else {
                continue;
            };
            let action = client.tick(now);
            self.apply_client_action(id, action);
        }
    }

    fn run_replays(&mut self) {
        while let Some((src, frame)) = self.replays.pop_front() {
            self.process(src, &frame, true);
        }
    }

    fn process(&mut self, src: InterfaceId, frame: &[u8], replay: bool) {
        let Some(did) = self.interfaces.get(src).and_then(|i| i.domain) else {
            trace!("{}: frame dropped, interface not attached", src);
            return;
        };
        let Some(domain) = self.domains.get_mut(did) else {
            trace!("{}: frame dropped, domain gone", src);
            return;
        };
        if !replay {
            domain.rx_bytes += frame.len() as u64;
            if let Some(iface) = self.interfaces.get_mut(src) {
                iface.rx_bytes += frame.len() as u64;
            }
        }

        let eth = match Frame::parse(frame) {
            Ok(eth) => eth,
            Err(e) => {
                debug!("{}: {}", src, e);
                return;
            }
        };
        let dst = eth.dst_mac();
        if dst != self.settings.mac && !dst.is_broadcast() {
            trace!("{}: frame for {} ignored", src, dst);
            return;
        }

        match EtherType::from_u16(eth.ethertype()) {
            Some(EtherType::Arp) => self.handle_arp(src, did, eth.payload()),
            Some(EtherType::Ipv4) => self.handle_ipv4(src, did, eth.src_mac(), eth.payload(), frame),
            None => trace!("{}: ethertype {:#06x} ignored", src, eth.ethertype()),
        }
    }

    fn handle_arp(&mut self, src: InterfaceId, did: DomainId, payload: &[u8]) {
        let arp = match ArpPacket::parse(payload) {
            Ok(arp) => arp,
            Err(e) => {
                debug!("{}: {}", src, e);
                return;
            }
        };
        let Some(domain) = self.domains.get(did) else {
            return;
        };
        let Some(config) = domain.ip_config().copied() else {
            trace!("{}: ARP ignored, {} unconfigured", src, domain.name());
            return;
        };
        let answer = arp.operation == ArpOp::Request && self.domains.answers_arp_for(domain, arp.target_ip);

        let sender = arp.sender_ip;
        let learnable = config.interface.contains(sender)
            && sender != config.router_ip()
            && !sender.is_unspecified();
        if learnable {
            let for_us = arp.target_ip == config.router_ip();
            let now = self.now;
            if let Some(domain) = self.domains.get_mut(did) {
                if for_us || arp.operation == ArpOp::Reply {
                    let waiters = domain.arp_cache.resolve(sender, arp.sender_mac, src, now);
                    if !waiters.is_empty() {
                        debug!(
                            "{}: {} resolved, releasing {} frames",
                            domain.name(),
                            sender,
                            waiters.len()
                        );
                    }
                    self.replays
                        .extend(waiters.into_iter().map(|w| (w.src, w.frame)));
                } else {
                    domain.arp_cache.refresh(sender, arp.sender_mac, src, now);
                }
            }
        }

        if answer {
            let reply = arp.reply_to(self.settings.mac, arp.target_ip);
            self.emit(src, reply.to_frame());
        }
    }

    fn handle_ipv4(
        &mut self,
        src: InterfaceId,
        did: DomainId,
        src_mac: MacAddr,
        payload: &[u8],
        frame: &[u8],
    ) {
        let mut packet = match Ipv4Packet::from_bytes(payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("{}: {}", src, e);
                return;
            }
        };
        if !packet.header_checksum_valid() {
            debug!("{}: bad IPv4 header checksum", src);
            return;
        }
        let Some(domain) = self.domains.get(did) else {
            return;
        };
        let name = domain.name().to_string();
        let protocol = packet.l4_protocol();

        if protocol == Some(L4Protocol::Udp) && !packet.is_fragment() {
            let local = addressed_to_domain(domain.ip_config(), packet.dst_addr());
            if let Ok(datagram) = UdpHeader::parse(packet.payload()) {
                if datagram.dst_port() == dhcp::CLIENT_PORT
                    && *domain.ip_config_source() == IpConfigSource::Dhcp
                    && local
                {
                    self.handle_dhcp_client(src, datagram.payload());
                    return;
                }
                if datagram.dst_port() == dhcp::SERVER_PORT
                    && domain.dhcp_server.is_some()
                    && domain.is_configured()
                    && local
                {
                    self.handle_dhcp_server(src, did, datagram.payload());
                    return;
                }
            }
        }

        let Some(router_ip) = domain.router_ip() else {
            trace!("{}: dropped, domain unconfigured", name);
            return;
        };

        if packet.dst_addr() == router_ip && protocol == Some(L4Protocol::Icmp) {
            if let Ok(message) = icmp::IcmpPacket::parse(packet.payload()) {
                if message.is_echo_request() {
                    self.echo_reply(src, src_mac, &packet);
                    return;
                }
            }
        }

        if !packet.decrement_ttl() {
            if self.verbose(&name) {
                debug!("{}: TTL exceeded for {}", name, packet.dst_addr());
            }
            return;
        }

        let flow = if packet.is_fragment() {
            None
        } else {
            protocol.and_then(|p| flow_of(&packet, p))
        };

        if let Some(flow) = flow {
            let hit = self
                .domains
                .get(did)
                .and_then(|d| d.links.lookup(flow.protocol, &flow.id))
                .cloned();
            if let Some(link_ref) = hit {
                self.follow_link(src, link_ref, flow, packet, frame);
                return;
            }
            let decision = self
                .domains
                .get(did)
                .filter(|_| flow.initiates)
                .and_then(|d| d.link_target(flow.protocol, &flow.id));
            if let Some(target) = decision {
                match target {
                    Some(target) => self.open_link(src, &name, flow, target, packet, frame),
                    None => {
                        if self.verbose(&name) {
                            debug!("{}: {} {} denied", name, flow.protocol, flow.id);
                        }
                        self.unreachable(src, src_mac, &packet, router_ip);
                    }
                }
                return;
            }
        }

        let dst = packet.dst_addr();
        let Some(domain) = self.domains.get(did) else {
            return;
        };
        if let Some(rule) = domain.ip_rules().longest_match(dst) {
            let target = rule.domain.clone();
            if let Some(hop) = self.resolve(src, &target, dst, frame) {
                self.transmit(&target, hop, packet);
            }
            return;
        }

        if self.verbose(&name) {
            debug!("{}: no rule for {}", name, dst);
        }
        self.unreachable(src, src_mac, &packet, router_ip);
    }

    fn follow_link(
        &mut self,
        src: InterfaceId,
        link_ref: LinkRef,
        flow: Flow,
        mut packet: Ipv4Packet,
        frame: &[u8],
    ) {
        let Some(egress) = self
            .domains
            .by_name(&link_ref.owner)
            .and_then(|d| d.links.get(link_ref.link))
            .map(|l| l.egress(link_ref.side))
        else {
            return;
        };
        let Some(hop) = self.resolve(src, &egress.domain, egress.rewrite.dst_ip, frame) else {
            return;
        };

        let now = self.now;
        if let Some(link) = self
            .domains
            .by_name_mut(&link_ref.owner)
            .and_then(|d| d.links.get_mut(link_ref.link))
        {
            link.touch(now);
            if let Some(flags) = flow.tcp_flags {
                link.observe_tcp(link_ref.side, flags);
            }
        }
        rewrite(&mut packet, flow.protocol, &egress.rewrite);
        self.transmit(&egress.domain, hop, packet);
    }

    fn open_link(
        &mut self,
        src: InterfaceId,
        client: &str,
        flow: Flow,
        target: LinkTarget,
        mut packet: Ipv4Packet,
        frame: &[u8],
    ) {
        let Some(remote) = self.domains.by_name(&target.domain) else {
            debug!("{}: rule names unknown domain {}", client, target.domain);
            return;
        };
        let Some(remote_ip) = remote.router_ip() else {
            debug!("{}: dropped, {} unconfigured", client, target.domain);
            return;
        };
        let nat = remote.nats_for(client);
        let Some(hop) = self.resolve(src, &target.domain, target.ip, frame) else {
            return;
        };

        let (src_ip, src_port, nat_port) = if nat {
            let Some(remote) = self.domains.by_name_mut(&target.domain) else {
                return;
            };
            match remote.alloc_nat_port(client, flow.protocol) {
                Ok(port) => (remote_ip, port, Some(port)),
                Err(e) => {
                    warn!(
                        "{}: {} NAT towards {} failed: {}",
                        client, flow.protocol, target.domain, e
                    );
                    return;
                }
            }
        } else {
            (flow.id.src_ip, flow.id.src_port, None)
        };
        // echo replies carry the request's identifier back
        let server_port = match flow.protocol {
            L4Protocol::Icmp => src_port,
            _ => target.port,
        };

        let server_id = LinkSideId {
            src_ip: target.ip,
            src_port: server_port,
            dst_ip: src_ip,
            dst_port: src_port,
        };
        let mut link = Link::new(
            LinkId(*self.next_link),
            flow.protocol,
            LinkSide {
                domain: client.to_string(),
                id: flow.id,
            },
            LinkSide {
                domain: target.domain.clone(),
                id: server_id,
            },
            nat_port,
            src,
            self.now,
        );
        if let Some(flags) = flow.tcp_flags {
            link.observe_tcp(Side::Client, flags);
        }
        let egress = link.egress(Side::Client);

        match self.domains.insert_link(link) {
            Ok(id) => {
                *self.next_link += 1;
                if self.verbose(client) {
                    debug!(
                        "{}: new {} link {} {} -> {} {}",
                        client, flow.protocol, id, flow.id, target.domain, egress.rewrite
                    );
                }
            }
            Err(link) => {
                debug!("{}: {} link {} collides, dropped", client, flow.protocol, link.client.id);
                if let (Some(port), Some(remote)) =
                    (link.nat_port, self.domains.by_name_mut(&target.domain))
                {
                    remote.free_nat_port(client, flow.protocol, port);
                }
                return;
            }
        }

        rewrite(&mut packet, flow.protocol, &egress.rewrite);
        self.transmit(&target.domain, hop, packet);
    }

    fn verbose(&self, domain: &str) -> bool {
        self.domains.by_name(domain).is_some_and(|d| d.verbose_packets())
    }

    /// Layer 2 destination for `dst` in `domain`. On a cache miss the frame
    /// is parked and an ARP request goes out.
    fn resolve(
        &mut self,
        src: InterfaceId,
        domain_name: &str,
        dst: Ipv4Addr,
        frame: &[u8],
    ) -> Option<NextHop> {
        let domain = self.domains.by_name(domain_name)?;
        let config = *domain.ip_config()?;
        if dst.is_broadcast() || dst == config.interface.broadcast() {
            return Some(NextHop {
                mac: MacAddr::BROADCAST,
                via: None,
            });
        }
        let hop = match domain.next_hop(dst) {
            Ok(hop) => hop,
            Err(e) => {
                debug!("{}: {}", domain_name, e);
                return None;
            }
        };
        if let Some((mac, via)) = domain.arp_cache.lookup(hop) {
            return Some(NextHop { mac, via: Some(via) });
        }

        let now = self.now;
        let waiter = ArpWaiter {
            src,
            frame: frame.to_vec(),
            queued: now,
        };
        let domain = self.domains.by_name_mut(domain_name)?;
        match domain.arp_cache.enqueue(hop, waiter, now) {
            Enqueue::RequestNeeded => {
                trace!("{}: resolving {}", domain_name, hop);
                let request = ArpPacket::request(self.settings.mac, config.router_ip(), hop).to_frame();
                let interfaces: Vec<InterfaceId> = domain.interfaces().collect();
                for interface in interfaces {
                    self.emit(interface, request.clone());
                }
            }
            Enqueue::Queued => {}
            Enqueue::Dropped => warn!("{}: ARP queue for {} full, frame dropped", domain_name, hop),
        }
        None
    }

    fn transmit(&mut self, domain_name: &str, hop: NextHop, packet: Ipv4Packet) {
        let frame = FrameBuilder::new(hop.mac, self.settings.mac, EtherType::Ipv4 as u16)
            .build(packet.as_bytes());
        let Some(domain) = self.domains.by_name(domain_name) else {
            return;
        };
        let via = hop.via.filter(|id| domain.interfaces().any(|i| i == *id));
        let targets: Vec<InterfaceId> = match via {
            Some(id) => vec![id],
            None => domain.interfaces().collect(),
        };
        if targets.is_empty() {
            debug!("{}: no interface to send through", domain_name);
        }
        for interface in targets {
            self.emit(interface, frame.clone());
        }
    }

    /// Queue a frame and count it against the interface and its domain.
    fn emit(&mut self, interface: InterfaceId, frame: Vec<u8>) {
        let len = frame.len() as u64;
        if let Some(iface) = self.interfaces.get_mut(interface) {
            iface.tx_bytes += len;
            if let Some(domain) = iface.domain.and_then(|d| self.domains.get_mut(d)) {
                domain.tx_bytes += len;
            }
        }
        self.out.push(Transmit { interface, frame });
    }

    /// Send a router-originated packet straight back to the sender.
    fn reply(&mut self, interface: InterfaceId, dst_mac: MacAddr, packet: &[u8]) {
        let frame = FrameBuilder::new(dst_mac, self.settings.mac, EtherType::Ipv4 as u16).build(packet);
        self.emit(interface, frame);
    }

    fn echo_reply(&mut self, src: InterfaceId, src_mac: MacAddr, request: &Ipv4Packet) {
        match icmp::echo_reply(request.payload()) {
            Ok(message) => {
                let packet = Ipv4Builder::new(request.dst_addr(), request.src_addr(), icmp::PROTOCOL_NUMBER)
                    .build(&message);
                self.reply(src, src_mac, &packet);
            }
            Err(e) => debug!("{}: {}", src, e),
        }
    }

    fn unreachable(&mut self, src: InterfaceId, src_mac: MacAddr, packet: &Ipv4Packet, router_ip: Ipv4Addr) {
        if !self.settings.icmp_unreachable {
            return;
        }
        // never answer ICMP errors with errors
        if packet.l4_protocol() == Some(L4Protocol::Icmp)
            && !icmp::IcmpPacket::parse(packet.payload()).is_ok_and(|m| m.is_echo_request())
        {
            return;
        }
        let message = icmp::destination_unreachable(
            icmp::CODE_NET_UNREACHABLE,
            packet.as_bytes(),
            packet.header_len(),
        );
        let reply = Ipv4Builder::new(router_ip, packet.src_addr(), icmp::PROTOCOL_NUMBER).build(&message);
        self.reply(src, src_mac, &reply);
    }

    fn handle_dhcp_server(&mut self, src: InterfaceId, did: DomainId, payload: &[u8]) {
        let request = match DhcpMessage::parse(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("{}: {}", src, e);
                return;
            }
        };
        let Some(name) = self.domains.get(did).map(|d| d.name().to_string()) else {
            return;
        };
        let dns_server = self.domains.dhcp_dns_server(&name);
        let now = self.now;
        let Some(domain) = self.domains.get_mut(did) else {
            return;
        };
        let Some(params) = domain.dhcp_params(dns_server) else {
            return;
        };
        let Some(server) = domain.dhcp_server.as_mut() else {
            return;
        };
        let DhcpAction::Reply(reply) = server.handle(&request, &params, now) else {
            return;
        };

        let router_ip = params.interface.addr();
        let (dst_ip, dst_mac) = reply_destination(&request, &reply);
        let datagram = udp::build(
            router_ip,
            dst_ip,
            dhcp::SERVER_PORT,
            dhcp::CLIENT_PORT,
            &reply.to_bytes(),
        );
        let packet = Ipv4Builder::new(router_ip, dst_ip, udp::PROTOCOL_NUMBER).build(&datagram);
        self.reply(src, dst_mac, &packet);
    }

    fn handle_dhcp_client(&mut self, src: InterfaceId, payload: &[u8]) {
        let msg = match DhcpMessage::parse(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("{}: {}", src, e);
                return;
            }
        };
        let now = self.now;
        let Some(client) = self
            .interfaces
            .get_mut(src)
            .and_then(|i| i.dhcp_client.as_mut())
        else {
            return;
        };
        let action = client.handle(&msg, now);
        self.apply_client_action(src, action);
    }

    /// Carry out what an interface's DHCP client asked for.
    fn apply_client_action(&mut self, src: InterfaceId, action: DhcpClientAction) {
        let Some(did) = self.interfaces.get(src).and_then(|i| i.domain) else {
            return;
        };
        let config = match action {
            DhcpClientAction::None => return,
            DhcpClientAction::Send(msg) => {
                self.send_dhcp_request(src, &msg, Ipv4Addr::BROADCAST, MacAddr::BROADCAST);
                return;
            }
            DhcpClientAction::Unicast(msg, server) => {
                // an unresolved server still gets the frame, link-layer broadcast
                let dst_mac = self
                    .domains
                    .get(did)
                    .and_then(|d| d.next_hop(server).ok().and_then(|hop| d.arp_cache.lookup(hop)))
                    .map_or(MacAddr::BROADCAST, |(mac, _)| mac);
                self.send_dhcp_request(src, &msg, server, dst_mac);
                return;
            }
            DhcpClientAction::Configure(config) => Some(config),
            DhcpClientAction::Deconfigure => None,
        };
        if let Err(e) = self.domains.set_ip_config(did, config) {
            warn!("{}: DHCP client result not applied: {}", src, e);
        }
    }

    fn send_dhcp_request(&mut self, src: InterfaceId, msg: &DhcpMessage, dst: Ipv4Addr, dst_mac: MacAddr) {
        let src_ip = msg.ciaddr;
        let datagram = udp::build(src_ip, dst, dhcp::CLIENT_PORT, dhcp::SERVER_PORT, &msg.to_bytes());
        let packet = Ipv4Builder::new(src_ip, dst, udp::PROTOCOL_NUMBER).build(&datagram);
        self.reply(src, dst_mac, &packet);
    }
}

/// Limited broadcast, the subnet broadcast or the router address.
fn addressed_to_domain(config: Option<&Ipv4Config>, dst: Ipv4Addr) -> bool {
    dst.is_broadcast()
        || config.is_some_and(|c| dst == c.router_ip() || dst == c.interface.broadcast())
}

fn flow_of(packet: &Ipv4Packet, protocol: L4Protocol) -> Option<Flow> {
    let (src_port, dst_port, tcp_flags, initiates) = match protocol {
        L4Protocol::Tcp => {
            let header = TcpHeader::parse(packet.payload()).ok()?;
            (header.src_port(), header.dst_port(), Some(header.flags()), true)
        }
        L4Protocol::Udp => {
            let header = UdpHeader::parse(packet.payload()).ok()?;
            (header.src_port(), header.dst_port(), None, true)
        }
        L4Protocol::Icmp => {
            let message = icmp::IcmpPacket::parse(packet.payload()).ok()?;
            if !message.is_echo() {
                return None;
            }
            let id = message.identifier();
            (id, id, None, message.is_echo_request())
        }
    };
    Some(Flow {
        protocol,
        id: LinkSideId {
            src_ip: packet.src_addr(),
            src_port,
            dst_ip: packet.dst_addr(),
            dst_port,
        },
        tcp_flags,
        initiates,
    })
}

/// Write addresses and ports, then fix the transport checksum.
fn rewrite(packet: &mut Ipv4Packet, protocol: L4Protocol, to: &LinkSideId) {
    packet.set_src_addr(to.src_ip);
    packet.set_dst_addr(to.dst_ip);
    let segment = packet.payload_mut();
    match protocol {
        L4Protocol::Tcp => {
            tcp::set_ports(segment, to.src_port, to.dst_port);
            tcp::update_checksum(segment, to.src_ip, to.dst_ip);
        }
        L4Protocol::Udp => {
            udp::set_ports(segment, to.src_port, to.dst_port);
            udp::update_checksum(segment, to.src_ip, to.dst_ip);
        }
        L4Protocol::Icmp => {
            icmp::set_identifier(segment, to.src_port);
            icmp::update_checksum(segment);
        }
    }
}
