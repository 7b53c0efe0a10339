//! Per-domain ARP cache with queues of frames awaiting resolution

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::interface::InterfaceId;
use crate::protocol::MacAddr;
use crate::protocol::ipv4::Ipv4Cidr;

/// Frames queued per unresolved address before new ones are dropped
pub const MAX_WAITERS: usize = 32;

/// A frame that will be handled again once its next hop resolves.
#[derive(Debug, Clone)]
pub struct ArpWaiter {
    /// Interface the frame originally arrived on
    pub src: InterfaceId,
    pub frame: Vec<u8>,
    pub queued: Instant,
}

#[derive(Debug, Clone)]
enum ArpEntry {
    Resolved {
        mac: MacAddr,
        interface: InterfaceId,
        refreshed: Instant,
    },
    Unresolved {
        requested: Instant,
        waiters: VecDeque<ArpWaiter>,
    },
}

/// Outcome of queueing a frame on an unresolved address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// First waiter: the caller must send an ARP request
    RequestNeeded,
    /// Request already outstanding
    Queued,
    /// Queue full, frame discarded
    Dropped,
}

/// Resolved entry as shown in reports
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ArpEntryInfo {
    pub ip: Ipv4Addr,
    pub mac: Option<String>,
    pub waiters: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ArpCache {
    entries: BTreeMap<Ipv4Addr, ArpEntry>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<(MacAddr, InterfaceId)> {
        match self.entries.get(&ip) {
            Some(ArpEntry::Resolved { mac, interface, .. }) => Some((*mac, *interface)),
            _ => None,
        }
    }

    pub fn is_pending(&self, ip: Ipv4Addr) -> bool {
        matches!(self.entries.get(&ip), Some(ArpEntry::Unresolved { .. }))
    }

    /// Park a frame until `ip` resolves.
    pub fn enqueue(&mut self, ip: Ipv4Addr, waiter: ArpWaiter, now: Instant) -> Enqueue {
        match self.entries.get_mut(&ip) {
            Some(ArpEntry::Unresolved { waiters, .. }) => {
                if waiters.len() >= MAX_WAITERS {
                    return Enqueue::Dropped;
                }
                waiters.push_back(waiter);
                Enqueue::Queued
            }
            // a resolved entry means the caller raced a reply; restart resolution
            _ => {
                self.entries.insert(
                    ip,
                    ArpEntry::Unresolved {
                        requested: now,
                        waiters: VecDeque::from([waiter]),
                    },
                );
                Enqueue::RequestNeeded
            }
        }
    }

    /// Learn a binding. Returns the frames waiting for it in arrival order.
    pub fn resolve(
        &mut self,
        ip: Ipv4Addr,
        mac: MacAddr,
        interface: InterfaceId,
        now: Instant,
    ) -> VecDeque<ArpWaiter> {
        let previous = self.entries.insert(
            ip,
            ArpEntry::Resolved {
                mac,
                interface,
                refreshed: now,
            },
        );
        match previous {
            Some(ArpEntry::Unresolved { waiters, .. }) => waiters,
            _ => VecDeque::new(),
        }
    }

    /// Refresh an existing resolved entry without creating one.
    pub fn refresh(&mut self, ip: Ipv4Addr, mac: MacAddr, interface: InterfaceId, now: Instant) {
        if let Some(ArpEntry::Resolved {
            mac: old_mac,
            interface: old_interface,
            refreshed,
        }) = self.entries.get_mut(&ip)
        {
            *old_mac = mac;
            *old_interface = interface;
            *refreshed = now;
        }
    }

    /// Drop unanswered requests and outdated bindings.
    ///
    /// Returns the waiters of timed out requests per address.
    pub fn expire(
        &mut self,
        now: Instant,
        request_timeout: Duration,
        entry_lifetime: Duration,
    ) -> Vec<(Ipv4Addr, VecDeque<ArpWaiter>)> {
        let expired: Vec<Ipv4Addr> = self
            .entries
            .iter()
            .filter(|(_, entry)| match entry {
                ArpEntry::Resolved { refreshed, .. } => {
                    now.saturating_duration_since(*refreshed) >= entry_lifetime
                }
                ArpEntry::Unresolved { requested, .. } => {
                    now.saturating_duration_since(*requested) >= request_timeout
                }
            })
            .map(|(ip, _)| *ip)
            .collect();

        let mut dropped = Vec::new();
        for ip in expired {
            if let Some(ArpEntry::Unresolved { waiters, .. }) = self.entries.remove(&ip) {
                dropped.push((ip, waiters));
            }
        }
        dropped
    }

    /// Forget everything learned via `interface` and all frames it queued.
    pub fn cancel_interface(&mut self, interface: InterfaceId) -> usize {
        let mut cancelled = 0;
        self.entries.retain(|_, entry| match entry {
            ArpEntry::Resolved { interface: via, .. } => *via != interface,
            ArpEntry::Unresolved { waiters, .. } => {
                let before = waiters.len();
                waiters.retain(|w| w.src != interface);
                cancelled += before - waiters.len();
                // the request stays pending so a late reply is still learned
                true
            }
        });
        cancelled
    }

    /// Keep only addresses inside `subnet`. Returns the number of dropped waiters.
    pub fn retain_subnet(&mut self, subnet: &Ipv4Cidr) -> usize {
        let mut dropped = 0;
        self.entries.retain(|ip, entry| {
            let keep = subnet.contains(*ip);
            if !keep {
                if let ArpEntry::Unresolved { waiters, .. } = entry {
                    dropped += waiters.len();
                }
            }
            keep
        });
        dropped
    }

    /// Drop all entries. Returns the number of dropped waiters.
    pub fn clear(&mut self) -> usize {
        let dropped = self
            .entries
            .values()
            .map(|entry| match entry {
                ArpEntry::Unresolved { waiters, .. } => waiters.len(),
                ArpEntry::Resolved { .. } => 0,
            })
            .sum();
        self.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Vec<ArpEntryInfo> {
        self.entries
            .iter()
            .map(|(ip, entry)| match entry {
                ArpEntry::Resolved { mac, .. } => ArpEntryInfo {
                    ip: *ip,
                    mac: Some(mac.to_string()),
                    waiters: 0,
                },
                ArpEntry::Unresolved { waiters, .. } => ArpEntryInfo {
                    ip: *ip,
                    mac: None,
                    waiters: waiters.len(),
                },
            })
            .collect()
    }
}
