//! Service Access Points
//!
//! Capability sets the random access core needs from its collaborators.
//! Implementations are injected at construction.

use crate::message_types::{PreambleTransmission, RaFailure, RaSuccess, RaTimer, TimerId};
use common::types::{Rnti, UeId};

/// Terminal-side physical layer
pub trait RaPhySap {
    /// Transmit a preamble in its PRACH occasion
    fn send_preamble(&mut self, transmission: PreambleTransmission);
}

/// Base-station identity allocation
pub trait IdentityAllocator {
    /// Reserve a fresh temporary C-RNTI, `None` when the pool is exhausted
    fn allocate_temporary_rnti(&mut self) -> Option<Rnti>;

    /// Return an identifier to the pool
    fn release(&mut self, rnti: Rnti);
}

/// Terminal-side connection manager, the consumer of random access outcomes
pub trait RaConnectionSap {
    fn random_access_succeeded(&mut self, ue: UeId, success: RaSuccess);

    fn random_access_failed(&mut self, ue: UeId, failure: RaFailure);
}

/// Virtual-time timer service bound to one terminal
pub trait RaTimerSap {
    /// Fire `timer` at the given absolute slot
    fn schedule(&mut self, at_slot: u64, timer: RaTimer) -> TimerId;

    /// Cancel a timer. Cancelling a fired or cancelled timer returns false.
    fn cancel(&mut self, id: TimerId) -> bool;
}
