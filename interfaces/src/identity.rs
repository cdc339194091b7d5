//! Temporary identifier pool
//!
//! Hands out TC-RNTIs from a configured range in round-robin order.

use crate::sap::IdentityAllocator;
use crate::InterfaceError;
use common::types::Rnti;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Sequential RNTI pool over an inclusive range
#[derive(Debug, Clone)]
pub struct RntiPool {
    first: u16,
    last: u16,
    next: u16,
    in_use: BTreeSet<u16>,
}

impl RntiPool {
    /// Create a pool over `first..=last`
    pub fn new(first: u16, last: u16) -> Result<Self, InterfaceError> {
        if first < Rnti::MIN_TEMPORARY || last > Rnti::MAX_TEMPORARY || first > last {
            return Err(InterfaceError::InvalidConfig(format!(
                "RNTI range 0x{:04x}..=0x{:04x} outside the temporary range",
                first, last
            )));
        }
        Ok(Self { first, last, next: first, in_use: BTreeSet::new() })
    }

    /// Identifiers currently allocated
    pub fn allocated(&self) -> usize {
        self.in_use.len()
    }

    fn capacity(&self) -> usize {
        usize::from(self.last - self.first) + 1
    }
}

impl Default for RntiPool {
    fn default() -> Self {
        Self {
            first: 0x4601,
            last: Rnti::MAX_TEMPORARY,
            next: 0x4601,
            in_use: BTreeSet::new(),
        }
    }
}

impl IdentityAllocator for RntiPool {
    fn allocate_temporary_rnti(&mut self) -> Option<Rnti> {
        if self.in_use.len() >= self.capacity() {
            warn!("RNTI pool exhausted ({} in use)", self.in_use.len());
            return None;
        }
        // Round-robin from the last allocation so released values are not reused at once
        loop {
            let candidate = self.next;
            self.next = if self.next == self.last { self.first } else { self.next + 1 };
            if self.in_use.insert(candidate) {
                debug!("Allocated TC-RNTI 0x{:04x}", candidate);
                return Some(Rnti(candidate));
            }
        }
    }

    fn release(&mut self, rnti: Rnti) {
        if self.in_use.remove(&rnti.0) {
            debug!("Released TC-RNTI {}", rnti);
        }
    }
}
