use domain_router::dataplane::TimerKind;
use domain_router::protocol::L4Protocol;
use domain_router::protocol::tcp::TcpFlags;
use domain_router::protocol::udp::UdpHeader;

use crate::frames::*;

fn make_lab() -> Lab {
    let mut lab = Lab::new(TOPOLOGY);
    let (intern, uplink) = (lab.intern, lab.uplink);
    lab.learn(intern, CLIENT_MAC, CLIENT_IP, INTERN_IP);
    lab.learn(uplink, GATEWAY_MAC, GATEWAY_IP, UPLINK_IP);
    lab
}

fn nat_in_use(lab: &Lab, protocol: L4Protocol) -> (usize, usize) {
    let uplink = lab.router.domains().by_name("uplink").unwrap();
    (
        uplink.nat_rule("intern").unwrap().quota(protocol).used(),
        uplink.allocator(protocol).in_use(),
    )
}

#[test]
fn test_idle_udp_link_expires_and_frees_port() {
    let mut lab = make_lab();
    let out = lab.send(lab.intern, udp_frame(CLIENT_MAC, CLIENT_IP, 5353, REMOTE_IP, 53, b"query"));
    let port = UdpHeader::parse(ipv4_of(&out[0].frame).payload()).unwrap().src_port();
    assert_eq!(nat_in_use(&lab, L4Protocol::Udp), (1, 1));

    lab.advance(59);
    lab.tick(TimerKind::LinkAging);
    assert_eq!(lab.report().domain("intern").unwrap().links.udp, 1);

    lab.advance(2);
    lab.tick(TimerKind::LinkAging);
    assert_eq!(lab.report().domain("intern").unwrap().links.total(), 0);
    assert_eq!(nat_in_use(&lab, L4Protocol::Udp), (0, 0));

    let out = lab.send(lab.uplink, udp_frame(GATEWAY_MAC, REMOTE_IP, 53, UPLINK_IP, port, b"answer"));
    assert!(out.iter().all(|t| t.interface != lab.intern));
}

#[test]
fn test_closed_tcp_link_expires_before_open_one() {
    let mut lab = make_lab();
    let closing = lab.open_https(CLIENT_IP, 40000);
    let open = lab.open_https(CLIENT_IP, 40001);

    let out = lab.send(
        lab.intern,
        tcp_frame(CLIENT_MAC, CLIENT_IP, 40000, REMOTE_IP, 443, TcpFlags::FIN | TcpFlags::ACK),
    );
    assert_eq!(out.len(), 1);
    let out = lab.send(
        lab.uplink,
        tcp_frame(GATEWAY_MAC, REMOTE_IP, 443, UPLINK_IP, closing, TcpFlags::FIN | TcpFlags::ACK),
    );
    assert_eq!(out[0].interface, lab.intern);

    lab.advance(31);
    lab.tick(TimerKind::LinkAging);
    assert_eq!(lab.report().domain("intern").unwrap().links.tcp, 1);
    assert_eq!(nat_in_use(&lab, L4Protocol::Tcp), (1, 1));

    let out = lab.send(
        lab.uplink,
        tcp_frame(GATEWAY_MAC, REMOTE_IP, 443, UPLINK_IP, closing, TcpFlags::ACK),
    );
    assert!(out.iter().all(|t| t.interface != lab.intern));
    let out = lab.send(lab.uplink, tcp_frame(GATEWAY_MAC, REMOTE_IP, 443, UPLINK_IP, open, TcpFlags::ACK));
    assert_eq!(out[0].interface, lab.intern);
}

#[test]
fn test_reset_closes_link() {
    let mut lab = make_lab();
    let port = lab.open_https(CLIENT_IP, 40000);
    lab.send(lab.uplink, tcp_frame(GATEWAY_MAC, REMOTE_IP, 443, UPLINK_IP, port, TcpFlags::RST));

    lab.advance(30);
    lab.tick(TimerKind::LinkAging);
    assert_eq!(lab.report().domain("intern").unwrap().links.total(), 0);
    assert_eq!(nat_in_use(&lab, L4Protocol::Tcp), (0, 0));
}
