//! DHCPv4 client for dynamic domains (RFC 2131)
//!
//! One client runs per interface of a domain that has neither a static
//! interface address nor an `ip_config_from` supplier. A bound lease
//! becomes the domain's IP config.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::domain::Ipv4Config;
use crate::protocol::MacAddr;
use crate::protocol::dhcp::{BootpOp, DhcpMessage, MessageType, options};
use crate::protocol::ipv4::Ipv4Cidr;

/// Retransmissions before discovery starts over
const MAX_RETRIES: u32 = 10;
/// Base retransmit timeout, doubled per retry
const BASE_TIMEOUT_SECS: u64 = 4;
const MAX_TIMEOUT_SECS: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpClientState {
    Init,
    /// DISCOVER sent
    Selecting,
    /// REQUEST sent
    Requesting,
    Bound,
    /// Past T1, renewal REQUEST sent
    Renewing,
}

#[derive(Debug)]
pub enum DhcpClientAction {
    /// Broadcast this message, from `ciaddr` if set, else 0.0.0.0
    Send(DhcpMessage),
    /// Send a renewal from `ciaddr` to the server that granted the lease
    Unicast(DhcpMessage, Ipv4Addr),
    Configure(Ipv4Config),
    Deconfigure,
    None,
}

#[derive(Debug, Clone)]
struct ClientLease {
    config: Ipv4Config,
    server_id: Ipv4Addr,
    obtained: Instant,
    renew_after: Duration,
    expire_after: Duration,
}

#[derive(Debug, Clone)]
pub struct DhcpClient {
    mac: MacAddr,
    state: DhcpClientState,
    xid: u32,
    last_sent: Option<Instant>,
    retries: u32,
    offer: Option<(Ipv4Addr, Ipv4Addr)>,
    lease: Option<ClientLease>,
}

impl DhcpClient {
    pub fn new(mac: MacAddr) -> Self {
        Self {
            mac,
            state: DhcpClientState::Init,
            xid: generate_xid(mac),
            last_sent: None,
            retries: 0,
            offer: None,
            lease: None,
        }
    }

    pub fn state(&self) -> DhcpClientState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.lease.is_some()
    }

    /// (Re)start discovery, dropping any lease.
    pub fn start(&mut self, now: Instant) -> DhcpClientAction {
        debug!("DHCP client {} starting discovery", self.mac);
        self.xid = generate_xid(self.mac).wrapping_add(self.xid);
        self.retries = 0;
        self.offer = None;
        self.lease = None;
        self.send_discover(now)
    }

    fn send_discover(&mut self, now: Instant) -> DhcpClientAction {
        self.state = DhcpClientState::Selecting;
        self.last_sent = Some(now);
        let mut discover = DhcpMessage::new(BootpOp::Request, MessageType::Discover, self.xid, self.mac);
        discover.set_broadcast();
        discover.set_option(
            options::PARAMETER_REQUEST,
            vec![options::SUBNET_MASK, options::ROUTER, options::DNS_SERVER, options::LEASE_TIME],
        );
        DhcpClientAction::Send(discover)
    }

    fn send_request(&mut self, now: Instant) -> DhcpClientAction {
        self.last_sent = Some(now);
        let mut request = DhcpMessage::new(BootpOp::Request, MessageType::Request, self.xid, self.mac);
        match (self.state, &self.lease, self.offer) {
            (DhcpClientState::Renewing, Some(lease), _) => {
                request.ciaddr = lease.config.interface.addr();
                return DhcpClientAction::Unicast(request, lease.server_id);
            }
            (_, _, Some((ip, server))) => {
                request.set_broadcast();
                request.set_ip_option(options::REQUESTED_IP, ip);
                request.set_ip_option(options::SERVER_ID, server);
            }
            _ => return self.send_discover(now),
        }
        DhcpClientAction::Send(request)
    }

    /// Handle a server message addressed to this client.
    pub fn handle(&mut self, msg: &DhcpMessage, now: Instant) -> DhcpClientAction {
        if msg.op != BootpOp::Reply || msg.xid != self.xid || msg.chaddr != self.mac {
            return DhcpClientAction::None;
        }
        match (msg.message_type(), self.state) {
            (Some(MessageType::Offer), DhcpClientState::Selecting) => {
                let Some(server) = msg.server_id() else {
                    debug!("DHCP offer without server id ignored");
                    return DhcpClientAction::None;
                };
                self.offer = Some((msg.yiaddr, server));
                self.state = DhcpClientState::Requesting;
                self.retries = 0;
                self.send_request(now)
            }
            (Some(MessageType::Ack), DhcpClientState::Requesting | DhcpClientState::Renewing) => {
                match lease_from_ack(msg, now) {
                    Some(lease) => {
                        let config = lease.config;
                        if self.state == DhcpClientState::Renewing
                            && self.lease.as_ref().is_some_and(|l| l.config == config)
                        {
                            debug!("DHCP lease {} renewed", config.interface);
                            self.lease = Some(lease);
                            self.state = DhcpClientState::Bound;
                            return DhcpClientAction::None;
                        }
                        info!("DHCP client bound to {}", config.interface);
                        self.lease = Some(lease);
                        self.state = DhcpClientState::Bound;
                        self.retries = 0;
                        DhcpClientAction::Configure(config)
                    }
                    None => {
                        warn!("DHCP ack without usable address or subnet mask");
                        self.start(now)
                    }
                }
            }
            (Some(MessageType::Nak), DhcpClientState::Requesting | DhcpClientState::Renewing) => {
                warn!("DHCP request rejected by server, restarting discovery");
                let had_lease = self.lease.is_some();
                let discover = self.start(now);
                if had_lease { DhcpClientAction::Deconfigure } else { discover }
            }
            _ => DhcpClientAction::None,
        }
    }

    fn retransmit_timeout(&self) -> Duration {
        let secs = BASE_TIMEOUT_SECS.saturating_mul(1 << self.retries.min(4));
        Duration::from_secs(secs.min(MAX_TIMEOUT_SECS))
    }

    /// Drive retransmissions and lease timers.
    pub fn tick(&mut self, now: Instant) -> DhcpClientAction {
        if let Some(lease) = &self.lease {
            let age = now.saturating_duration_since(lease.obtained);
            if age >= lease.expire_after {
                warn!("DHCP lease {} expired", lease.config.interface);
                self.start(now);
                return DhcpClientAction::Deconfigure;
            }
            if self.state == DhcpClientState::Bound && age >= lease.renew_after {
                debug!("DHCP lease {} due for renewal", lease.config.interface);
                self.state = DhcpClientState::Renewing;
                self.retries = 0;
                return self.send_request(now);
            }
        }

        let waiting = matches!(
            self.state,
            DhcpClientState::Selecting | DhcpClientState::Requesting | DhcpClientState::Renewing
        );
        let due = self
            .last_sent
            .is_none_or(|sent| now.saturating_duration_since(sent) >= self.retransmit_timeout());
        match self.state {
            DhcpClientState::Init => self.start(now),
            _ if !waiting || !due => DhcpClientAction::None,
            DhcpClientState::Selecting => {
                self.retries += 1;
                self.send_discover(now)
            }
            _ if self.retries >= MAX_RETRIES && self.lease.is_none() => self.start(now),
            _ => {
                self.retries += 1;
                self.send_request(now)
            }
        }
    }
}

fn lease_from_ack(msg: &DhcpMessage, now: Instant) -> Option<ClientLease> {
    if msg.yiaddr.is_unspecified() {
        return None;
    }
    let prefix_len = u32::from(msg.subnet_mask()?).leading_ones() as u8;
    let interface = Ipv4Cidr::new(msg.yiaddr, prefix_len).ok()?;
    let lease_secs = msg.lease_time().unwrap_or(3600) as u64;
    let renew_secs = msg
        .u32_option(options::RENEWAL_TIME)
        .map(u64::from)
        .unwrap_or(lease_secs / 2);
    Some(ClientLease {
        config: Ipv4Config {
            interface,
            gateway: msg.router().filter(|gw| interface.contains(*gw)),
            dns_server: msg.dns_server(),
        },
        server_id: msg.server_id().unwrap_or(msg.siaddr),
        obtained: now,
        renew_after: Duration::from_secs(renew_secs),
        expire_after: Duration::from_secs(lease_secs),
    })
}

fn generate_xid(mac: MacAddr) -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u32;
    let salt = u32::from_be_bytes([mac.0[2], mac.0[3], mac.0[4], mac.0[5]]);
    (seed ^ salt).wrapping_mul(1103515245).wrapping_add(12345)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
    const SERVER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);
    const LEASED: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 2);

    fn sent(action: DhcpClientAction) -> DhcpMessage {
        match action {
            DhcpClientAction::Send(msg) => msg,
            other => panic!("Expected Send, got {:?}", other),
        }
    }

    fn renewed(action: DhcpClientAction) -> DhcpMessage {
        match action {
            DhcpClientAction::Unicast(msg, server) => {
                assert_eq!(server, SERVER);
                msg
            }
            other => panic!("Expected Unicast, got {:?}", other),
        }
    }

    fn make_server_reply(request: &DhcpMessage, message_type: MessageType) -> DhcpMessage {
        let mut reply = DhcpMessage::reply_to(request, message_type);
        reply.yiaddr = LEASED;
        reply.set_ip_option(options::SERVER_ID, SERVER);
        reply.set_ip_option(options::SUBNET_MASK, Ipv4Addr::new(255, 255, 255, 0));
        reply.set_ip_option(options::ROUTER, SERVER);
        reply.set_ip_option(options::DNS_SERVER, Ipv4Addr::new(9, 9, 9, 9));
        reply.set_u32_option(options::LEASE_TIME, 100);
        reply
    }

    fn bind(client: &mut DhcpClient, now: Instant) -> Ipv4Config {
        let discover = sent(client.start(now));
        let request = sent(client.handle(&make_server_reply(&discover, MessageType::Offer), now));
        match client.handle(&make_server_reply(&request, MessageType::Ack), now) {
            DhcpClientAction::Configure(config) => config,
            other => panic!("Expected Configure, got {:?}", other),
        }
    }

    #[test]
    fn test_full_exchange() {
        let mut client = DhcpClient::new(MAC);
        let now = Instant::now();
        let discover = sent(client.start(now));
        assert_eq!(discover.message_type(), Some(MessageType::Discover));
        assert_eq!(client.state(), DhcpClientState::Selecting);

        let request = sent(client.handle(&make_server_reply(&discover, MessageType::Offer), now));
        assert_eq!(request.message_type(), Some(MessageType::Request));
        assert_eq!(request.requested_ip(), Some(LEASED));
        assert_eq!(request.server_id(), Some(SERVER));

        match client.handle(&make_server_reply(&request, MessageType::Ack), now) {
            DhcpClientAction::Configure(config) => {
                assert_eq!(config.interface.to_string(), "203.0.113.2/24");
                assert_eq!(config.gateway, Some(SERVER));
                assert_eq!(config.dns_server, Some(Ipv4Addr::new(9, 9, 9, 9)));
            }
            other => panic!("Expected Configure, got {:?}", other),
        }
        assert_eq!(client.state(), DhcpClientState::Bound);
    }

    #[test]
    fn test_wrong_xid_ignored() {
        let mut client = DhcpClient::new(MAC);
        let now = Instant::now();
        let mut discover = sent(client.start(now));
        discover.xid = discover.xid.wrapping_add(1);
        let offer = make_server_reply(&discover, MessageType::Offer);
        assert!(matches!(client.handle(&offer, now), DhcpClientAction::None));
        assert_eq!(client.state(), DhcpClientState::Selecting);
    }

    #[test]
    fn test_retransmit_discover() {
        let mut client = DhcpClient::new(MAC);
        let now = Instant::now();
        client.start(now);
        assert!(matches!(client.tick(now + Duration::from_secs(1)), DhcpClientAction::None));
        let resent = sent(client.tick(now + Duration::from_secs(4)));
        assert_eq!(resent.message_type(), Some(MessageType::Discover));
    }

    #[test]
    fn test_renewal_and_expiry() {
        let mut client = DhcpClient::new(MAC);
        let now = Instant::now();
        bind(&mut client, now);

        let renew = renewed(client.tick(now + Duration::from_secs(50)));
        assert_eq!(renew.ciaddr, LEASED);
        assert_eq!(client.state(), DhcpClientState::Renewing);

        assert!(matches!(
            client.tick(now + Duration::from_secs(100)),
            DhcpClientAction::Deconfigure
        ));
        assert!(!client.is_bound());
        assert_eq!(client.state(), DhcpClientState::Selecting);
    }

    #[test]
    fn test_renew_ack_keeps_config() {
        let mut client = DhcpClient::new(MAC);
        let now = Instant::now();
        bind(&mut client, now);
        let renew = renewed(client.tick(now + Duration::from_secs(50)));
        let ack = make_server_reply(&renew, MessageType::Ack);
        assert!(matches!(
            client.handle(&ack, now + Duration::from_secs(51)),
            DhcpClientAction::None
        ));
        assert_eq!(client.state(), DhcpClientState::Bound);
        assert!(matches!(
            client.tick(now + Duration::from_secs(80)),
            DhcpClientAction::None
        ));
    }

    #[test]
    fn test_nak_while_renewing_deconfigures() {
        let mut client = DhcpClient::new(MAC);
        let now = Instant::now();
        bind(&mut client, now);
        let renew = renewed(client.tick(now + Duration::from_secs(50)));
        let nak = DhcpMessage::reply_to(&renew, MessageType::Nak);
        assert!(matches!(
            client.handle(&nak, now + Duration::from_secs(51)),
            DhcpClientAction::Deconfigure
        ));
        assert!(!client.is_bound());
    }

    #[test]
    fn test_renewal_goes_to_granting_server() {
        let mut client = DhcpClient::new(MAC);
        let now = Instant::now();
        bind(&mut client, now);

        let renew = renewed(client.tick(now + Duration::from_secs(50)));
        assert_eq!(renew.message_type(), Some(MessageType::Request));
        assert_eq!(renew.ciaddr, LEASED);
        assert!(!renew.wants_broadcast());
        assert!(renew.server_id().is_none());

        // retransmissions stay unicast
        renewed(client.tick(now + Duration::from_secs(54)));
    }
}
