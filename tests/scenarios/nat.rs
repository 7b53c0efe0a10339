use std::net::Ipv4Addr;

use domain_router::dataplane::FIRST_PORT;
use domain_router::protocol::dhcp::MessageType;
use domain_router::protocol::tcp::{self, TcpFlags, TcpHeader};
use domain_router::protocol::udp::UdpHeader;
use domain_router::protocol::icmp;

use crate::frames::*;

fn make_lab() -> Lab {
    let mut lab = Lab::new(TOPOLOGY);
    let intern = lab.intern;
    lab.learn(intern, CLIENT_MAC, CLIENT_IP, INTERN_IP);
    lab
}

fn resolve_gateway(lab: &mut Lab) {
    let uplink = lab.uplink;
    lab.learn(uplink, GATEWAY_MAC, GATEWAY_IP, UPLINK_IP);
}

#[test]
fn test_https_round_trip_through_nat() {
    let mut lab = make_lab();

    // first packet waits for the gateway's MAC
    let out = lab.send(lab.intern, tcp_frame(CLIENT_MAC, CLIENT_IP, 40000, REMOTE_IP, 443, TcpFlags::SYN));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, lab.uplink);
    let request = arp_of(&out[0].frame);
    assert_eq!(request.target_ip, GATEWAY_IP);
    assert_eq!(request.sender_ip, UPLINK_IP);
    assert_eq!(request.sender_mac, ROUTER_MAC);

    let out = lab.send(lab.uplink, arp_reply(GATEWAY_MAC, GATEWAY_IP, UPLINK_IP));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, lab.uplink);
    assert_eq!(dst_mac_of(&out[0].frame), GATEWAY_MAC);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!(packet.src_addr(), UPLINK_IP);
    assert_eq!(packet.dst_addr(), REMOTE_IP);
    assert_eq!(packet.ttl(), 63);
    assert!(packet.header_checksum_valid());
    let header = TcpHeader::parse(packet.payload()).unwrap();
    let nat_port = header.src_port();
    assert!(nat_port >= FIRST_PORT);
    assert_eq!(header.dst_port(), 443);
    assert!(tcp::checksum_valid(packet.payload(), UPLINK_IP, REMOTE_IP));

    let reply = tcp_frame(
        GATEWAY_MAC,
        REMOTE_IP,
        443,
        UPLINK_IP,
        nat_port,
        TcpFlags::SYN | TcpFlags::ACK,
    );
    let out = lab.send(lab.uplink, reply);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, lab.intern);
    assert_eq!(dst_mac_of(&out[0].frame), CLIENT_MAC);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!(packet.src_addr(), REMOTE_IP);
    assert_eq!(packet.dst_addr(), CLIENT_IP);
    let header = TcpHeader::parse(packet.payload()).unwrap();
    assert_eq!(header.src_port(), 443);
    assert_eq!(header.dst_port(), 40000);
    assert!(tcp::checksum_valid(packet.payload(), REMOTE_IP, CLIENT_IP));

    let report = lab.report();
    assert_eq!(report.domain("intern").unwrap().links.tcp, 1);
    let nat = &report.domain("uplink").unwrap().rules.as_ref().unwrap().nat;
    let intern_usage = nat.iter().find(|n| n.domain == "intern").unwrap();
    assert_eq!(intern_usage.tcp, 1);
}

#[test]
fn test_nat_ports_are_unique_and_bounded() {
    let mut lab = make_lab();
    resolve_gateway(&mut lab);

    let first = lab.open_https(CLIENT_IP, 40000);
    let second = lab.open_https(Ipv4Addr::new(10, 0, 1, 51), 40000);
    assert_ne!(first, second);

    // tcp_ports = 2 for intern
    let out = lab.send(
        lab.intern,
        tcp_frame(CLIENT_MAC, Ipv4Addr::new(10, 0, 1, 52), 40000, REMOTE_IP, 443, TcpFlags::SYN),
    );
    assert!(out.is_empty());
    assert_eq!(lab.report().domain("intern").unwrap().links.tcp, 2);
}

#[test]
fn test_existing_link_is_reused() {
    let mut lab = make_lab();
    resolve_gateway(&mut lab);

    let port = lab.open_https(CLIENT_IP, 40000);
    let out = lab.send(lab.intern, tcp_frame(CLIENT_MAC, CLIENT_IP, 40000, REMOTE_IP, 443, TcpFlags::ACK));
    assert_eq!(out.len(), 1);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!(TcpHeader::parse(packet.payload()).unwrap().src_port(), port);
    assert_eq!(lab.report().domain("intern").unwrap().links.tcp, 1);
}

#[test]
fn test_denied_port_answers_unreachable() {
    let mut lab = make_lab();

    let out = lab.send(lab.intern, tcp_frame(CLIENT_MAC, CLIENT_IP, 40000, REMOTE_IP, 22, TcpFlags::SYN));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, lab.intern);
    assert_eq!(dst_mac_of(&out[0].frame), CLIENT_MAC);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!(packet.src_addr(), INTERN_IP);
    assert_eq!(packet.dst_addr(), CLIENT_IP);
    let message = icmp::IcmpPacket::parse(packet.payload()).unwrap();
    assert_eq!(message.icmp_type(), icmp::TYPE_DEST_UNREACHABLE);
    assert_eq!(lab.report().domain("intern").unwrap().links.total(), 0);
}

#[test]
fn test_echo_to_router_is_answered() {
    let mut lab = make_lab();

    let out = lab.send(lab.intern, echo_frame(CLIENT_MAC, CLIENT_IP, INTERN_IP, 7));
    assert_eq!(out.len(), 1);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!(packet.src_addr(), INTERN_IP);
    assert_eq!(packet.dst_addr(), CLIENT_IP);
    let message = icmp::IcmpPacket::parse(packet.payload()).unwrap();
    assert_eq!(message.icmp_type(), icmp::TYPE_ECHO_REPLY);
    assert_eq!(message.identifier(), 7);
}

#[test]
fn test_udp_and_icmp_links_get_nat() {
    let mut lab = make_lab();
    resolve_gateway(&mut lab);

    let out = lab.send(lab.intern, udp_frame(CLIENT_MAC, CLIENT_IP, 5353, REMOTE_IP, 53, b"query"));
    assert_eq!(out.len(), 1);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!(packet.src_addr(), UPLINK_IP);
    let port = UdpHeader::parse(packet.payload()).unwrap().src_port();
    assert!(port >= FIRST_PORT);

    let out = lab.send(lab.intern, echo_frame(CLIENT_MAC, CLIENT_IP, REMOTE_IP, 0x4242));
    assert_eq!(out.len(), 1);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!(packet.src_addr(), UPLINK_IP);
    let message = icmp::IcmpPacket::parse(packet.payload()).unwrap();
    assert!(message.checksum_valid());
    assert!(message.identifier() >= FIRST_PORT);

    let links = lab.report().domain("intern").unwrap().links;
    assert_eq!((links.udp, links.icmp), (1, 1));
}

#[test]
fn test_port_forward_reaches_internal_host() {
    let config = TOPOLOGY.replace(
        "[[domain.nat]]\ndomain = \"guest\"",
        "[[domain.tcp_forward]]\nport = 8080\ndomain = \"intern\"\nto = \"10.0.1.50\"\nto_port = 80\n\n[[domain.nat]]\ndomain = \"guest\"",
    );
    let mut lab = Lab::new(&config);
    let intern = lab.intern;
    lab.learn(intern, CLIENT_MAC, CLIENT_IP, INTERN_IP);
    resolve_gateway(&mut lab);

    let outside = Ipv4Addr::new(198, 51, 100, 7);
    let out = lab.send(lab.uplink, tcp_frame(GATEWAY_MAC, outside, 5555, UPLINK_IP, 8080, TcpFlags::SYN));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, lab.intern);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!(packet.src_addr(), outside);
    assert_eq!(packet.dst_addr(), CLIENT_IP);
    let header = TcpHeader::parse(packet.payload()).unwrap();
    assert_eq!((header.src_port(), header.dst_port()), (5555, 80));

    let out = lab.send(
        lab.intern,
        tcp_frame(CLIENT_MAC, CLIENT_IP, 80, outside, 5555, TcpFlags::SYN | TcpFlags::ACK),
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, lab.uplink);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!(packet.src_addr(), UPLINK_IP);
    let header = TcpHeader::parse(packet.payload()).unwrap();
    assert_eq!((header.src_port(), header.dst_port()), (8080, 5555));
}

#[test]
fn test_remote_dhcp_port_is_forwarded() {
    let mut lab = make_lab();
    resolve_gateway(&mut lab);

    let out = lab.send(lab.intern, udp_frame(CLIENT_MAC, CLIENT_IP, 5000, REMOTE_IP, 67, b"not for us"));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, lab.uplink);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!((packet.src_addr(), packet.dst_addr()), (UPLINK_IP, REMOTE_IP));
    assert_eq!(UdpHeader::parse(packet.payload()).unwrap().dst_port(), 67);
    assert_eq!(lab.report().domain("intern").unwrap().links.udp, 1);

    // the router's own server still answers broadcasts
    let discover = dhcp_request(MessageType::Discover, 9, CLIENT_MAC);
    let out = lab.send(lab.intern, dhcp_frame(&discover, None));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, lab.intern);
}
