//! DHCPv4 server of one domain (RFC 2131)
//!
//! Leases are kept per client MAC. A lease moves through
//! Offered -> Bound -> Renewing and disappears (is free again) on
//! release, decline, NAK or expiry.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::DhcpServerConfig;
use crate::protocol::MacAddr;
use crate::protocol::dhcp::{BootpOp, DhcpMessage, MessageType, options};
use crate::protocol::ipv4::Ipv4Cidr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    /// Offered, waiting for the client's REQUEST
    Offered,
    /// Committed
    Bound,
    /// Bound and past its renewal time
    Renewing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub state: LeaseState,
    /// Offer timeout while offered, lease end once bound
    pub expires: Instant,
    pub renew_at: Instant,
}

/// Lease as shown in reports
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LeaseInfo {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub state: LeaseState,
}

/// Parameters that depend on the domain's current IP config.
#[derive(Debug, Clone, Copy)]
pub struct ServerParams {
    pub interface: Ipv4Cidr,
    pub dns_server: Option<Ipv4Addr>,
}

#[derive(Debug)]
pub enum DhcpAction {
    Reply(DhcpMessage),
    None,
}

#[derive(Debug, Clone)]
pub struct DhcpServer {
    ip_first: Ipv4Addr,
    ip_last: Ipv4Addr,
    lease_time: Duration,
    offer_timeout: Duration,
    dns_server: Option<Ipv4Addr>,
    dns_server_from: Option<String>,
    leases: BTreeMap<MacAddr, Lease>,
}

impl DhcpServer {
    pub fn new(config: &DhcpServerConfig, offer_timeout: Duration) -> Self {
        Self {
            ip_first: config.ip_first,
            ip_last: config.ip_last,
            lease_time: Duration::from_secs(config.ip_lease_time_sec as u64),
            offer_timeout,
            dns_server: config.dns_server,
            dns_server_from: config.dns_server_from.clone(),
            leases: BTreeMap::new(),
        }
    }

    /// Domain whose DNS server is handed out instead of the static one.
    pub fn dns_server_from(&self) -> Option<&str> {
        self.dns_server_from.as_deref()
    }

    pub fn static_dns_server(&self) -> Option<Ipv4Addr> {
        self.dns_server
    }

    pub fn in_pool(&self, ip: Ipv4Addr) -> bool {
        self.ip_first <= ip && ip <= self.ip_last
    }

    fn holder(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.leases
            .iter()
            .find(|(_, lease)| lease.ip == ip)
            .map(|(mac, _)| *mac)
    }

    fn usable(&self, ip: Ipv4Addr, params: &ServerParams) -> bool {
        self.in_pool(ip) && ip != params.interface.addr() && params.interface.contains(ip)
    }

    fn free_address(&self, preferred: Option<Ipv4Addr>, params: &ServerParams) -> Option<Ipv4Addr> {
        if let Some(ip) = preferred {
            if self.usable(ip, params) && self.holder(ip).is_none() {
                return Some(ip);
            }
        }
        (u32::from(self.ip_first)..=u32::from(self.ip_last))
            .map(Ipv4Addr::from)
            .find(|&ip| self.usable(ip, params) && self.holder(ip).is_none())
    }

    pub fn handle(&mut self, msg: &DhcpMessage, params: &ServerParams, now: Instant) -> DhcpAction {
        if msg.op != BootpOp::Request {
            return DhcpAction::None;
        }
        let Some(message_type) = msg.message_type() else {
            debug!("DHCP message without message type from {}", msg.chaddr);
            return DhcpAction::None;
        };
        debug!("DHCP {:?} from {}", message_type, msg.chaddr);

        match message_type {
            MessageType::Discover => self.handle_discover(msg, params, now),
            MessageType::Request => self.handle_request(msg, params, now),
            MessageType::Release | MessageType::Decline => {
                if let Some(lease) = self.leases.remove(&msg.chaddr) {
                    info!(
                        "DHCP lease {} of {} freed by {:?}",
                        lease.ip, msg.chaddr, message_type
                    );
                }
                DhcpAction::None
            }
            MessageType::Inform => {
                let mut ack = self.reply(msg, MessageType::Ack, params);
                ack.options.remove(&options::LEASE_TIME);
                ack.options.remove(&options::RENEWAL_TIME);
                ack.options.remove(&options::REBINDING_TIME);
                DhcpAction::Reply(ack)
            }
            _ => DhcpAction::None,
        }
    }

    fn handle_discover(
        &mut self,
        msg: &DhcpMessage,
        params: &ServerParams,
        now: Instant,
    ) -> DhcpAction {
        let ip = match self.leases.get_mut(&msg.chaddr) {
            Some(lease) => {
                if lease.state == LeaseState::Offered {
                    lease.expires = now + self.offer_timeout;
                }
                lease.ip
            }
            None => {
                let Some(ip) = self.free_address(msg.requested_ip(), params) else {
                    warn!(
                        "DHCP pool {}-{} exhausted, no offer for {}",
                        self.ip_first, self.ip_last, msg.chaddr
                    );
                    return DhcpAction::None;
                };
                self.leases.insert(
                    msg.chaddr,
                    Lease {
                        ip,
                        state: LeaseState::Offered,
                        expires: now + self.offer_timeout,
                        renew_at: now + self.offer_timeout,
                    },
                );
                ip
            }
        };

        let mut offer = self.reply(msg, MessageType::Offer, params);
        offer.yiaddr = ip;
        DhcpAction::Reply(offer)
    }

    fn handle_request(
        &mut self,
        msg: &DhcpMessage,
        params: &ServerParams,
        now: Instant,
    ) -> DhcpAction {
        let router_ip = params.interface.addr();
        if let Some(server_id) = msg.server_id() {
            if server_id != router_ip {
                // the client accepted another server's offer
                if self
                    .leases
                    .get(&msg.chaddr)
                    .is_some_and(|l| l.state == LeaseState::Offered)
                {
                    self.leases.remove(&msg.chaddr);
                }
                return DhcpAction::None;
            }
        }

        let requested = msg
            .requested_ip()
            .filter(|ip| !ip.is_unspecified())
            .unwrap_or(msg.ciaddr);
        let taken_by_other = self.holder(requested).is_some_and(|mac| mac != msg.chaddr);
        if requested.is_unspecified() || !self.usable(requested, params) || taken_by_other {
            debug!("DHCP NAK {} for {}", requested, msg.chaddr);
            if self.leases.get(&msg.chaddr).is_some_and(|l| l.ip != requested) {
                self.leases.remove(&msg.chaddr);
            }
            return DhcpAction::Reply(self.nak(msg, params));
        }

        let renewing = self
            .leases
            .get(&msg.chaddr)
            .is_some_and(|l| l.ip == requested && l.state != LeaseState::Offered);
        self.leases.insert(
            msg.chaddr,
            Lease {
                ip: requested,
                state: LeaseState::Bound,
                expires: now + self.lease_time,
                renew_at: now + self.lease_time / 2,
            },
        );
        if renewing {
            debug!("DHCP lease {} of {} renewed", requested, msg.chaddr);
        } else {
            info!("DHCP lease {} bound to {}", requested, msg.chaddr);
        }

        let mut ack = self.reply(msg, MessageType::Ack, params);
        ack.yiaddr = requested;
        ack.ciaddr = msg.ciaddr;
        DhcpAction::Reply(ack)
    }

    fn reply(&self, msg: &DhcpMessage, message_type: MessageType, params: &ServerParams) -> DhcpMessage {
        let router_ip = params.interface.addr();
        let lease_secs = self.lease_time.as_secs() as u32;
        let mut reply = DhcpMessage::reply_to(msg, message_type);
        reply.siaddr = router_ip;
        reply.set_ip_option(options::SERVER_ID, router_ip);
        reply.set_ip_option(options::SUBNET_MASK, params.interface.netmask());
        reply.set_ip_option(options::ROUTER, router_ip);
        reply.set_ip_option(options::BROADCAST_ADDR, params.interface.broadcast());
        if let Some(dns) = params.dns_server {
            reply.set_ip_option(options::DNS_SERVER, dns);
        }
        reply.set_u32_option(options::LEASE_TIME, lease_secs);
        reply.set_u32_option(options::RENEWAL_TIME, lease_secs / 2);
        reply.set_u32_option(options::REBINDING_TIME, lease_secs / 8 * 7);
        reply
    }

    fn nak(&self, msg: &DhcpMessage, params: &ServerParams) -> DhcpMessage {
        let mut nak = DhcpMessage::reply_to(msg, MessageType::Nak);
        nak.set_ip_option(options::SERVER_ID, params.interface.addr());
        nak.set_broadcast();
        nak
    }

    /// Expire offers and leases, mark leases past T1 as renewing.
    pub fn maintain(&mut self, now: Instant) -> usize {
        let before = self.leases.len();
        self.leases.retain(|mac, lease| {
            if now >= lease.expires {
                debug!("DHCP lease {} of {} expired", lease.ip, mac);
                return false;
            }
            if lease.state == LeaseState::Bound && now >= lease.renew_at {
                lease.state = LeaseState::Renewing;
            }
            true
        });
        before - self.leases.len()
    }

    pub fn lease(&self, mac: &MacAddr) -> Option<&Lease> {
        self.leases.get(mac)
    }

    pub fn leases(&self) -> Vec<LeaseInfo> {
        self.leases
            .iter()
            .map(|(mac, lease)| LeaseInfo {
                mac: mac.to_string(),
                ip: lease.ip,
                state: lease.state,
            })
            .collect()
    }

    /// Whether an inherited server can keep its leases.
    pub fn same_pool(&self, other: &DhcpServer) -> bool {
        self.ip_first == other.ip_first && self.ip_last == other.ip_last
    }

    /// Take over the leases of the previous generation's server.
    pub fn inherit_leases(&mut self, previous: &DhcpServer) {
        self.leases = previous.leases.clone();
    }
}

/// IP and MAC destination of a server reply (RFC 2131 section 4.1).
pub fn reply_destination(request: &DhcpMessage, reply: &DhcpMessage) -> (Ipv4Addr, MacAddr) {
    if !request.ciaddr.is_unspecified() && reply.message_type() != Some(MessageType::Nak) {
        (request.ciaddr, request.chaddr)
    } else if request.wants_broadcast() || reply.message_type() == Some(MessageType::Nak) {
        (Ipv4Addr::BROADCAST, MacAddr::BROADCAST)
    } else {
        (reply.yiaddr, request.chaddr)
    }
}
