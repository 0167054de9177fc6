use std::{
    collections::BTreeSet,
    ops::Range,
    sync::{PoisonError, RwLock},
};

use crate::error::SupervisorError;

/// First-fit allocator over `[base, base + max_ports)`.
///
/// Reservation is bookkeeping only; nothing is bound here. The worker that
/// gets the port is expected to bind it.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    end: u32,
    reserved: RwLock<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(base: u16, max_ports: u16) -> Self {
        // Clamp so the range never runs past u16::MAX.
        let end = (u32::from(base) + u32::from(max_ports)).min(u32::from(u16::MAX) + 1);
        Self {
            base,
            end,
            reserved: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> Range<u32> {
        u32::from(self.base)..self.end
    }

    pub fn acquire(&self) -> Result<u16, SupervisorError> {
        let mut reserved = self.reserved.write().unwrap_or_else(PoisonError::into_inner);
        for port in self.range() {
            let port = port as u16;
            if reserved.insert(port) {
                return Ok(port);
            }
        }
        Err(SupervisorError::PortsExhausted {
            base: self.base,
            end: self.end,
        })
    }

    /// Releasing a port that is not reserved is a no-op.
    pub fn release(&self, port: u16) {
        self.reserved
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
