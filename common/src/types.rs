//! Common Types for the 5G NR random access simulator
//!
//! Defines fundamental types shared by the base station and terminal sides

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// First value of the C-RNTI/TC-RNTI range (TS 38.321 Table 7.1-1)
    pub const MIN_TEMPORARY: u16 = 0x0001;
    /// Last value of the C-RNTI/TC-RNTI range
    pub const MAX_TEMPORARY: u16 = 0xFFEF;

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u16);

/// Terminal identity, stable for the lifetime of a simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UeId(pub u64);

impl fmt::Display for UeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ue{}", self.0)
    }
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Numerology index µ (SCS = 15 kHz · 2^µ)
    pub fn numerology(&self) -> u8 {
        match self {
            Self::Scs15 => 0,
            Self::Scs30 => 1,
            Self::Scs60 => 2,
            Self::Scs120 => 3,
            Self::Scs240 => 4,
        }
    }

    /// Number of slots in one 1 ms subframe
    pub fn slots_per_subframe(&self) -> u8 {
        1 << self.numerology()
    }
}

/// Uplink carrier a preamble was sent on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UlCarrier {
    /// Normal uplink carrier
    #[default]
    Normal,
    /// Supplementary uplink carrier
    Supplementary,
}

impl UlCarrier {
    /// Carrier id used in the RA-RNTI derivation (TS 38.321 5.1.3)
    pub fn id(&self) -> u16 {
        match self {
            Self::Normal => 0,
            Self::Supplementary => 1,
        }
    }
}

/// Slot direction in a TDD pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotType {
    /// Downlink only
    Dl,
    /// Uplink only
    Ul,
    /// Flexible, both directions
    Flexible,
    /// Special (guard) slot with a downlink part
    Special,
}

impl SlotType {
    /// Whether the slot starts with a downlink control region
    pub fn has_downlink_control(&self) -> bool {
        matches!(self, Self::Dl | Self::Flexible | Self::Special)
    }

    /// Whether the slot can carry uplink transmissions
    pub fn has_uplink(&self) -> bool {
        matches!(self, Self::Ul | Self::Flexible)
    }
}

/// TDD pattern parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("Empty TDD pattern")]
    Empty,

    #[error("Unknown slot type '{0}' in TDD pattern")]
    UnknownSlotType(String),
}

/// Repeating TDD slot pattern, e.g. `DL|DL|DL|S|UL`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TddPattern {
    slots: Vec<SlotType>,
}

impl TddPattern {
    /// Create a pattern from explicit slot types
    pub fn new(slots: Vec<SlotType>) -> Result<Self, PatternError> {
        if slots.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(Self { slots })
    }

    /// Pattern where every slot is flexible (FDD-like behaviour)
    pub fn all_flexible() -> Self {
        Self { slots: vec![SlotType::Flexible] }
    }

    /// Pattern period in slots
    pub fn period(&self) -> usize {
        self.slots.len()
    }

    /// Slot type for an absolute slot number
    pub fn slot_type(&self, absolute_slot: u64) -> SlotType {
        self.slots[(absolute_slot % self.slots.len() as u64) as usize]
    }
}

impl FromStr for TddPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let slots = s
            .split('|')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| match token.to_ascii_uppercase().as_str() {
                "DL" | "D" => Ok(SlotType::Dl),
                "UL" | "U" => Ok(SlotType::Ul),
                "F" => Ok(SlotType::Flexible),
                "S" => Ok(SlotType::Special),
                _ => Err(PatternError::UnknownSlotType(token.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(slots)
    }
}

impl fmt::Display for TddPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<&str> = self
            .slots
            .iter()
            .map(|slot| match slot {
                SlotType::Dl => "DL",
                SlotType::Ul => "UL",
                SlotType::Flexible => "F",
                SlotType::Special => "S",
            })
            .collect();
        write!(f, "{}", tokens.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_scs_numerology() {
        assert_eq!(SubcarrierSpacing::from_u32(30), Some(SubcarrierSpacing::Scs30));
        assert_eq!(SubcarrierSpacing::Scs30.numerology(), 1);
        assert_eq!(SubcarrierSpacing::Scs120.slots_per_subframe(), 8);
        assert!(SubcarrierSpacing::from_u32(45).is_none());
    }

    #[test]
    fn test_tdd_pattern_parsing() {
        let pattern: TddPattern = "DL|DL|DL|S|UL".parse().unwrap();
        assert_eq!(pattern.period(), 5);
        assert_eq!(pattern.slot_type(0), SlotType::Dl);
        assert_eq!(pattern.slot_type(3), SlotType::Special);
        assert_eq!(pattern.slot_type(9), SlotType::Ul);
        assert_eq!(pattern.to_string(), "DL|DL|DL|S|UL");
    }

    #[test]
    fn test_tdd_pattern_rejects_garbage() {
        assert_eq!("".parse::<TddPattern>(), Err(PatternError::Empty));
        assert!(matches!(
            "DL|X".parse::<TddPattern>(),
            Err(PatternError::UnknownSlotType(_))
        ));
    }

    #[test]
    fn test_slot_type_directions() {
        assert!(SlotType::Special.has_downlink_control());
        assert!(!SlotType::Special.has_uplink());
        assert!(SlotType::Flexible.has_uplink() && SlotType::Flexible.has_downlink_control());
        assert!(!SlotType::Ul.has_downlink_control());
    }
}
