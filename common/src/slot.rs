//! Slot Coordinates
//!
//! Frame/subframe/slot addressing according to 3GPP TS 38.211 Section 4.3.
//! The absolute slot number is the virtual time unit of the simulator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Subframes per 10 ms radio frame
pub const SUBFRAMES_PER_FRAME: u32 = 10;
/// OFDM symbols per slot with normal cyclic prefix
pub const SYMBOLS_PER_SLOT: u8 = 14;
/// Highest numerology defined for NR
pub const MAX_NUMEROLOGY: u8 = 5;

/// Position of a slot in time: frame, subframe, slot within subframe and numerology
///
/// Ordering follows time for coordinates of the same numerology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotCoordinate {
    /// Frame number (not wrapped at 1024)
    pub frame: u32,
    /// Subframe within the frame (0-9)
    pub subframe: u8,
    /// Slot within the subframe (0..2^µ)
    pub slot: u8,
    /// Numerology µ
    pub numerology: u8,
}

impl SlotCoordinate {
    /// Create a validated coordinate
    pub fn new(frame: u32, subframe: u8, slot: u8, numerology: u8) -> Option<Self> {
        if numerology > MAX_NUMEROLOGY
            || u32::from(subframe) >= SUBFRAMES_PER_FRAME
            || slot >= slots_per_subframe(numerology)
        {
            return None;
        }
        Some(Self { frame, subframe, slot, numerology })
    }

    /// Coordinate of an absolute slot number
    pub fn from_absolute(absolute: u64, numerology: u8) -> Self {
        let per_subframe = u64::from(slots_per_subframe(numerology));
        let per_frame = per_subframe * u64::from(SUBFRAMES_PER_FRAME);
        Self {
            frame: (absolute / per_frame) as u32,
            subframe: ((absolute % per_frame) / per_subframe) as u8,
            slot: (absolute % per_subframe) as u8,
            numerology,
        }
    }

    /// Absolute slot number counted from frame 0
    pub fn absolute(&self) -> u64 {
        u64::from(self.frame) * u64::from(self.slots_per_frame()) + u64::from(self.slot_in_frame())
    }

    /// Coordinate `n` slots later
    pub fn add_slots(&self, n: u64) -> Self {
        Self::from_absolute(self.absolute() + n, self.numerology)
    }

    /// Slot index within the frame (the `t_id` of the RA-RNTI derivation)
    pub fn slot_in_frame(&self) -> u16 {
        u16::from(self.subframe) * u16::from(self.slots_per_subframe()) + u16::from(self.slot)
    }

    /// System frame number as broadcast over the air
    pub fn sfn(&self) -> u16 {
        (self.frame % 1024) as u16
    }

    pub fn slots_per_subframe(&self) -> u8 {
        slots_per_subframe(self.numerology)
    }

    pub fn slots_per_frame(&self) -> u16 {
        slots_per_frame(self.numerology)
    }
}

impl fmt::Display for SlotCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.frame, self.subframe, self.slot)
    }
}

/// Slots in one subframe for numerology µ
pub fn slots_per_subframe(numerology: u8) -> u8 {
    1 << numerology.min(MAX_NUMEROLOGY)
}

/// Slots in one frame for numerology µ
pub fn slots_per_frame(numerology: u8) -> u16 {
    u16::from(slots_per_subframe(numerology)) * SUBFRAMES_PER_FRAME as u16
}
