//! Frame builders and a small harness around `Router`

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use domain_router::config;
use domain_router::dataplane::{Dispatch, Event, InterfaceId, Router, TimerKind, Transmit};
use domain_router::protocol::arp::{ArpOp, ArpPacket};
use domain_router::protocol::dhcp::{self, BootpOp, DhcpMessage, MessageType};
use domain_router::protocol::ethernet::{Frame, FrameBuilder};
use domain_router::protocol::ipv4::{Ipv4Builder, Ipv4Packet};
use domain_router::protocol::tcp::{self, TcpBuilder, TcpHeader};
use domain_router::protocol::udp::{self, UdpHeader};
use domain_router::protocol::{EtherType, MacAddr, icmp};
use domain_router::telemetry::RouterReport;

pub const ROUTER_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
pub const CLIENT_MAC: MacAddr = MacAddr([0x02, 0x10, 0, 0, 0, 0x50]);
pub const GATEWAY_MAC: MacAddr = MacAddr([0x02, 0x20, 0, 0, 0, 0x01]);

pub const INTERN_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 50);
pub const UPLINK_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 2);
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);
pub const REMOTE_IP: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// intern (10.0.1.0/24, DHCP pool of two) reaches uplink through NAT;
/// guest only has a port 80 rule.
pub const TOPOLOGY: &str = r#"
mac = "02:00:00:00:00:01"

[[domain]]
name = "uplink"
interface = "203.0.113.2/24"
gateway = "203.0.113.1"

[[domain.nat]]
domain = "intern"
tcp_ports = 2
udp_ports = 100
icmp_ids = 10

[[domain.nat]]
domain = "guest"
tcp_ports = 10

[[domain]]
name = "intern"
interface = "10.0.1.1/24"

[domain.dhcp_server]
ip_first = "10.0.1.100"
ip_last = "10.0.1.101"

[[domain.tcp]]
dst = "0.0.0.0/0"
[[domain.tcp.permit]]
ports = "443"
domain = "uplink"

[[domain.udp]]
dst = "0.0.0.0/0"
permit_any = "uplink"

[[domain.icmp]]
dst = "0.0.0.0/0"
domain = "uplink"

[[domain]]
name = "guest"
interface = "10.0.2.1/24"

[[domain.tcp]]
dst = "0.0.0.0/0"
[[domain.tcp.permit]]
ports = "80"
domain = "uplink"
"#;

pub struct Lab {
    pub router: Router,
    pub now: Instant,
    pub intern: InterfaceId,
    pub uplink: InterfaceId,
}

impl Lab {
    pub fn new(toml: &str) -> Self {
        let mut router = Router::new(config::parse(toml).unwrap()).unwrap();
        let intern = router.attach_interface("intern");
        let uplink = router.attach_interface("uplink");
        Self {
            router,
            now: Instant::now(),
            intern,
            uplink,
        }
    }

    pub fn send(&mut self, interface: InterfaceId, frame: Vec<u8>) -> Vec<Transmit> {
        self.router
            .handle_event(Event::FrameArrived { interface, frame }, self.now)
            .transmits
    }

    pub fn tick(&mut self, kind: TimerKind) -> Dispatch {
        self.router.handle_event(Event::Timeout(kind), self.now)
    }

    pub fn reload(&mut self, toml: &str) {
        let cfg = config::parse(toml).unwrap();
        self.router.handle_event(Event::ConfigReloaded(cfg), self.now);
    }

    pub fn advance(&mut self, secs: u64) {
        self.now += Duration::from_secs(secs);
    }

    pub fn report(&self) -> RouterReport {
        self.router.report(self.now)
    }

    /// Let the router learn a neighbor through an ARP request for `router_ip`.
    pub fn learn(&mut self, interface: InterfaceId, mac: MacAddr, ip: Ipv4Addr, router_ip: Ipv4Addr) {
        let replies = self.send(interface, arp_request(mac, ip, router_ip));
        assert_eq!(replies.len(), 1);
    }

    /// Open an HTTPS link from `client` through NAT. The gateway must
    /// already be resolved. Returns the NAT port.
    pub fn open_https(&mut self, client: Ipv4Addr, port: u16) -> u16 {
        let out = self.send(self.intern, tcp_frame(CLIENT_MAC, client, port, REMOTE_IP, 443, tcp::TcpFlags::SYN));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].interface, self.uplink);
        let packet = ipv4_of(&out[0].frame);
        TcpHeader::parse(packet.payload()).unwrap().src_port()
    }
}

pub fn arp_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    ArpPacket::request(sender_mac, sender_ip, target_ip).to_frame()
}

pub fn arp_reply(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    ArpPacket {
        operation: ArpOp::Reply,
        sender_mac,
        sender_ip,
        target_mac: ROUTER_MAC,
        target_ip,
    }
    .to_frame()
}

fn ipv4_frame(dst_mac: MacAddr, src_mac: MacAddr, packet: &[u8]) -> Vec<u8> {
    FrameBuilder::new(dst_mac, src_mac, EtherType::Ipv4 as u16).build(packet)
}

pub fn tcp_frame(
    src_mac: MacAddr,
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    flags: u8,
) -> Vec<u8> {
    let segment = TcpBuilder::new(src_port, dst_port).flags(flags).build(src, dst, b"");
    let packet = Ipv4Builder::new(src, dst, tcp::PROTOCOL_NUMBER).build(&segment);
    ipv4_frame(ROUTER_MAC, src_mac, &packet)
}

pub fn udp_frame(
    src_mac: MacAddr,
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let datagram = udp::build(src, dst, src_port, dst_port, payload);
    let packet = Ipv4Builder::new(src, dst, udp::PROTOCOL_NUMBER).build(&datagram);
    ipv4_frame(ROUTER_MAC, src_mac, &packet)
}

pub fn echo_frame(src_mac: MacAddr, src: Ipv4Addr, dst: Ipv4Addr, identifier: u16) -> Vec<u8> {
    let message = icmp::echo_request(identifier, 1, b"ping");
    let packet = Ipv4Builder::new(src, dst, icmp::PROTOCOL_NUMBER).build(&message);
    ipv4_frame(ROUTER_MAC, src_mac, &packet)
}

/// Client to server DHCP message, broadcast unless `from` is set.
pub fn dhcp_frame(msg: &DhcpMessage, from: Option<Ipv4Addr>) -> Vec<u8> {
    let (src, dst, dst_mac) = match from {
        Some(ip) => (ip, INTERN_IP, ROUTER_MAC),
        None => (Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST, MacAddr::BROADCAST),
    };
    let datagram = udp::build(src, dst, dhcp::CLIENT_PORT, dhcp::SERVER_PORT, &msg.to_bytes());
    let packet = Ipv4Builder::new(src, dst, udp::PROTOCOL_NUMBER).build(&datagram);
    ipv4_frame(dst_mac, msg.chaddr, &packet)
}

/// Server to client DHCP message from an upstream server.
pub fn dhcp_server_frame(msg: &DhcpMessage, server_mac: MacAddr, server_ip: Ipv4Addr) -> Vec<u8> {
    let datagram = udp::build(
        server_ip,
        Ipv4Addr::BROADCAST,
        dhcp::SERVER_PORT,
        dhcp::CLIENT_PORT,
        &msg.to_bytes(),
    );
    let packet = Ipv4Builder::new(server_ip, Ipv4Addr::BROADCAST, udp::PROTOCOL_NUMBER).build(&datagram);
    ipv4_frame(MacAddr::BROADCAST, server_mac, &packet)
}

pub fn dhcp_request(message_type: MessageType, xid: u32, mac: MacAddr) -> DhcpMessage {
    DhcpMessage::new(BootpOp::Request, message_type, xid, mac)
}

pub fn ipv4_of(frame: &[u8]) -> Ipv4Packet {
    let eth = Frame::parse(frame).unwrap();
    assert_eq!(eth.ethertype(), EtherType::Ipv4 as u16);
    Ipv4Packet::from_bytes(eth.payload()).unwrap()
}

pub fn arp_of(frame: &[u8]) -> ArpPacket {
    let eth = Frame::parse(frame).unwrap();
    assert_eq!(eth.ethertype(), EtherType::Arp as u16);
    ArpPacket::parse(eth.payload()).unwrap()
}

pub fn dst_mac_of(frame: &[u8]) -> MacAddr {
    Frame::parse(frame).unwrap().dst_mac()
}

pub fn dhcp_of(frame: &[u8]) -> DhcpMessage {
    let packet = ipv4_of(frame);
    let datagram = UdpHeader::parse(packet.payload()).unwrap();
    DhcpMessage::parse(datagram.payload()).unwrap()
}
