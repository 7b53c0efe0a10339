//! domain-router - multi-domain IPv4 software router
//!
//! Forwards Ethernet/IPv4 traffic between independently configured
//! network segments (domains) with NAT, link tracking, ARP resolution
//! and embedded DHCP. The library is event driven: callers feed frames
//! and timer ticks into [`dataplane::Router`] and transmit what it returns.

pub mod capture;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};
