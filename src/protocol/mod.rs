//! Wire formats handled by the router
//!
//! Everything from Ethernet up to DHCP is parsed and built by hand.

pub mod arp;
pub mod dhcp;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod tcp;
pub mod types;
pub mod udp;

pub use types::*;
