//! Port pools for NAT
//!
//! Each domain owns one pool per protocol (ICMP identifiers count as
//! ports). Allocation rotates through the dynamic range so a freed port
//! is not handed out again immediately.

use crate::{Error, Result};

/// First port of the dynamic range (RFC 6335)
pub const FIRST_PORT: u16 = 49152;
/// Number of ports in the range
pub const PORT_COUNT: usize = 65536 - FIRST_PORT as usize;

const WORDS: usize = PORT_COUNT / 64;

#[derive(Debug, Clone)]
pub struct PortAllocator {
    used: Box<[u64; WORDS]>,
    next: usize,
    in_use: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            used: Box::new([0; WORDS]),
            next: 0,
            in_use: 0,
        }
    }

    fn index(port: u16) -> Option<usize> {
        port.checked_sub(FIRST_PORT).map(usize::from)
    }

    fn test(&self, idx: usize) -> bool {
        self.used[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn mark(&mut self, idx: usize, used: bool) {
        let bit = 1u64 << (idx % 64);
        if used {
            self.used[idx / 64] |= bit;
        } else {
            self.used[idx / 64] &= !bit;
        }
    }

    /// Hand out the next free port.
    pub fn alloc(&mut self) -> Result<u16> {
        if self.in_use == PORT_COUNT {
            return Err(Error::PortExhausted);
        }
        for step in 0..PORT_COUNT {
            let idx = (self.next + step) % PORT_COUNT;
            if !self.test(idx) {
                self.mark(idx, true);
                self.in_use += 1;
                self.next = (idx + 1) % PORT_COUNT;
                return Ok(FIRST_PORT + idx as u16);
            }
        }
        Err(Error::PortExhausted)
    }

    /// Reserve a specific port, e.g. for a link carried over a reload.
    pub fn alloc_specific(&mut self, port: u16) -> Result<()> {
        let idx = Self::index(port).ok_or(Error::PortExhausted)?;
        if self.test(idx) {
            return Err(Error::PortExhausted);
        }
        self.mark(idx, true);
        self.in_use += 1;
        Ok(())
    }

    /// Return a port. Freeing a port that is not allocated is a no-op.
    pub fn free(&mut self, port: u16) {
        if let Some(idx) = Self::index(port) {
            if self.test(idx) {
                self.mark(idx, false);
                self.in_use -= 1;
            }
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        Self::index(port).is_some_and(|idx| self.test(idx))
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }
}

/// Bounded share of a [`PortAllocator`] granted to one client domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortQuota {
    max: usize,
    used: usize,
}

impl PortQuota {
    pub fn new(max: usize) -> Self {
        Self { max, used: 0 }
    }

    pub fn alloc(&mut self, allocator: &mut PortAllocator) -> Result<u16> {
        if self.used >= self.max {
            return Err(Error::PortExhausted);
        }
        let port = allocator.alloc()?;
        self.used += 1;
        Ok(port)
    }

    pub fn alloc_specific(&mut self, allocator: &mut PortAllocator, port: u16) -> Result<()> {
        if self.used >= self.max {
            return Err(Error::PortExhausted);
        }
        allocator.alloc_specific(port)?;
        self.used += 1;
        Ok(())
    }

    pub fn free(&mut self, allocator: &mut PortAllocator, port: u16) {
        if allocator.is_allocated(port) {
            allocator.free(port);
            self.used = self.used.saturating_sub(1);
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
