use std::net::Ipv4Addr;

use domain_router::dataplane::TimerKind;
use domain_router::protocol::arp::ArpOp;
use domain_router::protocol::tcp::TcpFlags;

use crate::frames::*;

#[test]
fn test_queued_frames_leave_in_arrival_order() {
    let mut lab = Lab::new(TOPOLOGY);
    let other = Ipv4Addr::new(1, 1, 1, 1);

    let out = lab.send(lab.intern, tcp_frame(CLIENT_MAC, CLIENT_IP, 40000, REMOTE_IP, 443, TcpFlags::SYN));
    assert_eq!(out.len(), 1);
    // the gateway is already being resolved
    let out = lab.send(lab.intern, tcp_frame(CLIENT_MAC, CLIENT_IP, 40001, other, 443, TcpFlags::SYN));
    assert!(out.is_empty());

    let out = lab.send(lab.uplink, arp_reply(GATEWAY_MAC, GATEWAY_IP, UPLINK_IP));
    let destinations: Vec<Ipv4Addr> = out.iter().map(|t| ipv4_of(&t.frame).dst_addr()).collect();
    assert_eq!(destinations, vec![REMOTE_IP, other]);
    assert!(out.iter().all(|t| t.interface == lab.uplink));
}

#[test]
fn test_unanswered_request_drops_queued_frames() {
    let mut lab = Lab::new(TOPOLOGY);

    lab.send(lab.intern, tcp_frame(CLIENT_MAC, CLIENT_IP, 40000, REMOTE_IP, 443, TcpFlags::SYN));
    lab.advance(11);
    lab.tick(TimerKind::ArpExpiry);

    let out = lab.send(lab.uplink, arp_reply(GATEWAY_MAC, GATEWAY_IP, UPLINK_IP));
    assert!(out.is_empty());
    assert_eq!(lab.report().domain("intern").unwrap().links.total(), 0);
}

#[test]
fn test_router_answers_only_for_its_addresses() {
    let mut lab = Lab::new(TOPOLOGY);

    let out = lab.send(lab.intern, arp_request(CLIENT_MAC, CLIENT_IP, INTERN_IP));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, lab.intern);
    let reply = arp_of(&out[0].frame);
    assert_eq!(reply.operation, ArpOp::Reply);
    assert_eq!(reply.sender_mac, ROUTER_MAC);
    assert_eq!(reply.sender_ip, INTERN_IP);
    assert_eq!(reply.target_mac, CLIENT_MAC);

    let out = lab.send(lab.intern, arp_request(CLIENT_MAC, CLIENT_IP, Ipv4Addr::new(10, 0, 1, 77)));
    assert!(out.is_empty());

    // the uplink address is not answered inside intern
    let out = lab.send(lab.intern, arp_request(CLIENT_MAC, CLIENT_IP, UPLINK_IP));
    assert!(out.is_empty());
}

#[test]
fn test_learned_entries_expire() {
    let mut lab = Lab::new(TOPOLOGY);
    let intern = lab.intern;
    lab.learn(intern, CLIENT_MAC, CLIENT_IP, INTERN_IP);
    assert_eq!(lab.router.domains().by_name("intern").unwrap().arp_cache.len(), 1);

    lab.advance(301);
    lab.tick(TimerKind::ArpExpiry);
    assert!(lab.router.domains().by_name("intern").unwrap().arp_cache.is_empty());
}
