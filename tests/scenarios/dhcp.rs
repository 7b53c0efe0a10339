use std::net::Ipv4Addr;

use domain_router::dataplane::TimerKind;
use domain_router::protocol::MacAddr;
use domain_router::protocol::dhcp::{BootpOp, DhcpMessage, MessageType, options};

use crate::frames::*;

fn host(n: u8) -> MacAddr {
    MacAddr([0x02, 0x30, 0, 0, 0, n])
}

/// DISCOVER then REQUEST; returns the acknowledged address.
fn obtain(lab: &mut Lab, mac: MacAddr, xid: u32) -> Option<Ipv4Addr> {
    let intern = lab.intern;
    let out = lab.send(intern, dhcp_frame(&dhcp_request(MessageType::Discover, xid, mac), None));
    let offer = dhcp_of(&out.first()?.frame);
    assert_eq!(offer.message_type(), Some(MessageType::Offer));
    assert_eq!(offer.xid, xid);

    let mut request = dhcp_request(MessageType::Request, xid, mac);
    request.set_ip_option(options::REQUESTED_IP, offer.yiaddr);
    request.set_ip_option(options::SERVER_ID, INTERN_IP);
    let out = lab.send(intern, dhcp_frame(&request, None));
    assert_eq!(out.len(), 1);
    let ack = dhcp_of(&out[0].frame);
    assert_eq!(ack.message_type(), Some(MessageType::Ack));
    assert_eq!(ack.router(), Some(INTERN_IP));
    assert_eq!(ack.subnet_mask(), Some(Ipv4Addr::new(255, 255, 255, 0)));
    Some(ack.yiaddr)
}

#[test]
fn test_pool_exhaustion_and_release() {
    let mut lab = Lab::new(TOPOLOGY);

    let first = obtain(&mut lab, host(1), 1).unwrap();
    let second = obtain(&mut lab, host(2), 2).unwrap();
    assert_eq!(first, Ipv4Addr::new(10, 0, 1, 100));
    assert_eq!(second, Ipv4Addr::new(10, 0, 1, 101));

    // two addresses, both bound
    assert!(obtain(&mut lab, host(3), 3).is_none());

    let mut release = dhcp_request(MessageType::Release, 4, host(1));
    release.ciaddr = first;
    let intern = lab.intern;
    assert!(lab.send(intern, dhcp_frame(&release, Some(first))).is_empty());

    assert_eq!(obtain(&mut lab, host(3), 5), Some(first));
}

#[test]
fn test_returning_client_keeps_its_address() {
    let mut lab = Lab::new(TOPOLOGY);

    let ip = obtain(&mut lab, host(1), 1).unwrap();
    obtain(&mut lab, host(2), 2).unwrap();
    assert_eq!(obtain(&mut lab, host(1), 3), Some(ip));
}

#[test]
fn test_leases_survive_reload_and_appear_in_report() {
    let verbose = TOPOLOGY.replace(
        "mac = \"02:00:00:00:00:01\"",
        "mac = \"02:00:00:00:00:01\"\n\n[report]\nverbose = true",
    );
    let mut lab = Lab::new(&verbose);
    let ip = obtain(&mut lab, host(1), 1).unwrap();

    lab.reload(&verbose);
    let report = lab.report();
    let detail = report.domain("intern").unwrap().detail.as_ref().unwrap();
    assert_eq!(detail.leases.len(), 1);
    assert_eq!(detail.leases[0].ip, ip);

    // another host cannot take the address after the reload
    assert_eq!(obtain(&mut lab, host(2), 2), Some(Ipv4Addr::new(10, 0, 1, 101)));
}

const DYNAMIC_UPLINK: &str = r#"
mac = "02:00:00:00:00:01"

[[domain]]
name = "uplink"

[[domain.nat]]
domain = "intern"
tcp_ports = 10

[[domain]]
name = "intern"
interface = "10.0.1.1/24"

[[domain.tcp]]
dst = "0.0.0.0/0"
permit_any = "uplink"
"#;

fn server_reply(request: &DhcpMessage, message_type: MessageType) -> Vec<u8> {
    let server = Ipv4Addr::new(198, 51, 100, 1);
    let mut reply = DhcpMessage::new(BootpOp::Reply, message_type, request.xid, request.chaddr);
    reply.yiaddr = Ipv4Addr::new(198, 51, 100, 7);
    reply.set_ip_option(options::SERVER_ID, server);
    reply.set_ip_option(options::SUBNET_MASK, Ipv4Addr::new(255, 255, 255, 0));
    reply.set_ip_option(options::ROUTER, server);
    reply.set_u32_option(options::LEASE_TIME, 3600);
    dhcp_server_frame(&reply, GATEWAY_MAC, server)
}

#[test]
fn test_dhcp_client_configures_dynamic_domain() {
    let mut lab = Lab::new(DYNAMIC_UPLINK);
    assert!(lab.report().domain("uplink").unwrap().ipv4.is_none());

    let out = lab.tick(TimerKind::DhcpMaintenance).transmits;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, lab.uplink);
    let discover = dhcp_of(&out[0].frame);
    assert_eq!(discover.message_type(), Some(MessageType::Discover));
    assert_eq!(discover.chaddr, ROUTER_MAC);

    let uplink = lab.uplink;
    let out = lab.send(uplink, server_reply(&discover, MessageType::Offer));
    assert_eq!(out.len(), 1);
    let request = dhcp_of(&out[0].frame);
    assert_eq!(request.message_type(), Some(MessageType::Request));
    assert_eq!(request.requested_ip(), Some(Ipv4Addr::new(198, 51, 100, 7)));

    let out = lab.send(uplink, server_reply(&request, MessageType::Ack));
    assert!(out.is_empty());

    let report = lab.report();
    let uplink_report = report.domain("uplink").unwrap();
    assert_eq!(uplink_report.ipv4.as_deref(), Some("198.51.100.7/24"));
    assert_eq!(uplink_report.gateway, Some(Ipv4Addr::new(198, 51, 100, 1)));
}

#[test]
fn test_detaching_last_interface_discards_lease() {
    let mut lab = Lab::new(DYNAMIC_UPLINK);
    let discover = dhcp_of(&lab.tick(TimerKind::DhcpMaintenance).transmits[0].frame);
    let uplink = lab.uplink;
    let request = dhcp_of(&lab.send(uplink, server_reply(&discover, MessageType::Offer))[0].frame);
    lab.send(uplink, server_reply(&request, MessageType::Ack));
    assert!(lab.report().domain("uplink").unwrap().ipv4.is_some());

    lab.router.detach_interface(uplink).unwrap();
    assert!(lab.report().domain("uplink").unwrap().ipv4.is_none());
    assert!(lab.router.detach_interface(uplink).is_err());
}

#[test]
fn test_renewal_is_unicast_to_lease_server() {
    let mut lab = Lab::new(DYNAMIC_UPLINK);
    let server = Ipv4Addr::new(198, 51, 100, 1);
    let leased = Ipv4Addr::new(198, 51, 100, 7);
    let discover = dhcp_of(&lab.tick(TimerKind::DhcpMaintenance).transmits[0].frame);
    let uplink = lab.uplink;
    let request = dhcp_of(&lab.send(uplink, server_reply(&discover, MessageType::Offer))[0].frame);
    lab.send(uplink, server_reply(&request, MessageType::Ack));
    lab.learn(uplink, GATEWAY_MAC, server, leased);

    lab.advance(1800);
    let out = lab.tick(TimerKind::DhcpMaintenance).transmits;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, uplink);
    assert_eq!(dst_mac_of(&out[0].frame), GATEWAY_MAC);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!(packet.src_addr(), leased);
    assert_eq!(packet.dst_addr(), server);
    let renew = dhcp_of(&out[0].frame);
    assert_eq!(renew.message_type(), Some(MessageType::Request));
    assert_eq!(renew.ciaddr, leased);

    assert!(lab.send(uplink, server_reply(&renew, MessageType::Ack)).is_empty());
    assert_eq!(lab.report().domain("uplink").unwrap().ipv4.as_deref(), Some("198.51.100.7/24"));
}
