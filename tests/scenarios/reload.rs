use domain_router::protocol::tcp::{TcpFlags, TcpHeader};

use crate::frames::*;

fn make_lab_with_link() -> (Lab, u16) {
    let mut lab = Lab::new(TOPOLOGY);
    let (intern, uplink) = (lab.intern, lab.uplink);
    lab.learn(intern, CLIENT_MAC, CLIENT_IP, INTERN_IP);
    lab.learn(uplink, GATEWAY_MAC, GATEWAY_IP, UPLINK_IP);
    let port = lab.open_https(CLIENT_IP, 40000);
    (lab, port)
}

/// Send the server's answer to `port` and return where it went.
fn answer(lab: &mut Lab, port: u16) -> Vec<domain_router::dataplane::Transmit> {
    let uplink = lab.uplink;
    lab.send(
        uplink,
        tcp_frame(GATEWAY_MAC, REMOTE_IP, 443, UPLINK_IP, port, TcpFlags::ACK),
    )
}

#[test]
fn test_editing_other_domain_keeps_link() {
    let (mut lab, port) = make_lab_with_link();

    let edited = TOPOLOGY.replace("ports = \"80\"", "ports = \"80-81\"");
    lab.reload(&edited);
    assert_eq!(lab.router.generation(), 2);
    assert!(lab.router.config_error().is_none());

    let out = answer(&mut lab, port);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].interface, lab.intern);
    let packet = ipv4_of(&out[0].frame);
    assert_eq!(packet.dst_addr(), CLIENT_IP);
    assert_eq!(TcpHeader::parse(packet.payload()).unwrap().dst_port(), 40000);
}

#[test]
fn test_identical_reload_is_idempotent() {
    let (mut lab, port) = make_lab_with_link();
    let before = lab.report();

    lab.reload(TOPOLOGY);
    lab.reload(TOPOLOGY);
    let after = lab.report();

    assert_eq!(after.generation, before.generation + 2);
    for name in ["intern", "uplink", "guest"] {
        let (b, a) = (before.domain(name).unwrap(), after.domain(name).unwrap());
        assert_eq!(a.links, b.links, "{name}");
        assert_eq!(a.rules, b.rules, "{name}");
        assert_eq!(a.interfaces, b.interfaces, "{name}");
    }

    // the NAT port stays taken, a new flow gets the other one
    let other = lab.open_https(CLIENT_IP, 40001);
    assert_ne!(other, port);
    assert_eq!(answer(&mut lab, port)[0].interface, lab.intern);
}

#[test]
fn test_withdrawn_permit_dismisses_link() {
    let (mut lab, port) = make_lab_with_link();

    lab.reload(&TOPOLOGY.replace("ports = \"443\"", "ports = \"8443\""));
    assert_eq!(lab.report().domain("intern").unwrap().links.total(), 0);

    let out = answer(&mut lab, port);
    assert!(out.iter().all(|t| t.interface != lab.intern));
}

#[test]
fn test_invalid_config_keeps_current_generation() {
    let (mut lab, port) = make_lab_with_link();

    lab.reload(&TOPOLOGY.replace("permit_any = \"uplink\"", "permit_any = \"nowhere\""));
    assert_eq!(lab.router.generation(), 1);
    let error = lab.router.config_error().unwrap();
    assert!(error.contains("nowhere"), "{error}");

    let report = lab.report();
    assert!(report.config_error.is_some());
    assert!(report.to_json().unwrap().contains("config_error"));

    assert_eq!(answer(&mut lab, port)[0].interface, lab.intern);

    // a valid document clears the error
    lab.reload(TOPOLOGY);
    assert_eq!(lab.router.generation(), 2);
    assert!(lab.router.config_error().is_none());
}

#[test]
fn test_removed_domain_detaches_interfaces() {
    let mut lab = Lab::new(TOPOLOGY);

    let without_intern = TOPOLOGY
        .replace(
            "[[domain.nat]]\ndomain = \"intern\"\ntcp_ports = 2\nudp_ports = 100\nicmp_ids = 10\n",
            "",
        )
        .replace("name = \"intern\"", "name = \"lab\"");
    lab.reload(&without_intern);
    assert!(lab.router.domains().by_name("intern").is_none());
    assert!(!lab.router.interfaces().get(lab.intern).unwrap().is_attached());

    let out = lab.send(lab.intern, echo_frame(CLIENT_MAC, CLIENT_IP, INTERN_IP, 1));
    assert!(out.is_empty());

    lab.reload(TOPOLOGY);
    assert!(lab.router.interfaces().get(lab.intern).unwrap().is_attached());
    assert_eq!(lab.send(lab.intern, echo_frame(CLIENT_MAC, CLIENT_IP, INTERN_IP, 1)).len(), 1);
}
