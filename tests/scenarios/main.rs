//! Router scenarios driven through the event API
//!
//! Run with: cargo test --test scenarios

mod aging;
mod arp;
mod dhcp;
mod frames;
mod nat;
mod reload;
