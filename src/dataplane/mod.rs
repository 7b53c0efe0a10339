//! Data plane components
//!
//! Domains, their rules and link tables, and the per-interface packet
//! pipeline that ties them together.

mod arp_cache;
mod configuration;
mod dhcp_client;
mod dhcp_server;
mod domain;
mod interface;
mod link;
mod port_allocator;
mod router;
mod rules;

pub use arp_cache::{ArpCache, ArpEntryInfo, ArpWaiter, Enqueue, MAX_WAITERS};
pub use dhcp_client::{DhcpClient, DhcpClientAction, DhcpClientState};
pub use dhcp_server::{DhcpAction, DhcpServer, Lease, LeaseInfo, LeaseState, ServerParams};
pub use domain::{Domain, DomainId, DomainTree, IpConfigSource, Ipv4Config, LinkTarget};
pub use interface::{Interface, InterfaceId, InterfaceTable, Transmit};
pub use link::{Link, LinkId, LinkRef, LinkSide, LinkSideId, LinkState, LinkTable, LinkTimeouts, Side};
pub use port_allocator::{FIRST_PORT, PORT_COUNT, PortAllocator, PortQuota};
pub use router::{Dispatch, Event, Router, Settings, TimerKind};
pub use rules::{
    ForwardRule, IpRule, NatRule, PermitRule, PortRange, PrefixRule, PrefixTable, TransportRule,
};
