//! PRACH / RACH Configuration
//!
//! PRACH configuration index tables and RACH-ConfigCommon parameters
//! according to 3GPP TS 38.211 Section 6.3.3.2 and TS 38.331

use crate::LayerError;
use common::slot::{slots_per_subframe, SYMBOLS_PER_SLOT};
use common::types::UlCarrier;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// PRACH constants according to 3GPP
pub mod constants {
    /// Maximum number of preambles per occasion
    pub const MAX_NUM_PREAMBLES: u8 = 64;
    /// Highest numerology for which the RA-RNTI slot index stays below 80
    pub const MAX_RA_NUMEROLOGY: u8 = 3;
    /// Allowed msg1-FDM values
    pub const MSG1_FDM_VALUES: [u8; 4] = [1, 2, 4, 8];
}

/// PRACH format type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrachFormat {
    /// Format 0: 839 sequence length, 1ms duration
    Format0,
    /// Format 1: 839 sequence length, 2ms duration
    Format1,
    /// Format 2: 839 sequence length, 4ms duration
    Format2,
    /// Format 3: 839 sequence length, 4ms duration
    Format3,
    /// Format A1: 139 sequence length (short)
    FormatA1,
    /// Format A2: 139 sequence length (short)
    FormatA2,
    /// Format A3: 139 sequence length (short)
    FormatA3,
    /// Format B1: 139 sequence length (short)
    FormatB1,
    /// Format B4: 139 sequence length (short)
    FormatB4,
    /// Format C0: 139 sequence length (short)
    FormatC0,
    /// Format C2: 139 sequence length (short)
    FormatC2,
}

impl PrachFormat {
    /// Check if this is a long preamble format
    pub fn is_long(&self) -> bool {
        matches!(self, Self::Format0 | Self::Format1 | Self::Format2 | Self::Format3)
    }

    /// Resource blocks one frequency occasion occupies in the uplink grid
    /// (PRACH SCS equal to the PUSCH SCS)
    pub fn rbs_per_occasion(&self) -> u16 {
        if self.is_long() {
            6
        } else {
            12
        }
    }
}

/// PRACH configuration index entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrachConfigurationIndex {
    /// PRACH format
    pub format: PrachFormat,
    /// System frame period (x)
    pub x: u32,
    /// System frame offset (y)
    pub y: u32,
    /// Subframe numbers within a radio frame
    pub subframe_numbers: Vec<u8>,
    /// Starting symbol
    pub starting_symbol: u8,
    /// Number of PRACH slots within a subframe
    pub num_prach_slots_within_subframe: u8,
    /// Number of time-domain PRACH occasions within a PRACH slot
    pub num_occasions_within_slot: u8,
    /// PRACH duration in symbols
    pub duration: u8,
}

/// Built-in short-format PRACH configurations keyed by prach-ConfigurationIndex
pub fn get_prach_config(index: u8) -> Option<PrachConfigurationIndex> {
    match index {
        87 => Some(PrachConfigurationIndex {
            format: PrachFormat::FormatA1,
            x: 1,
            y: 0,
            subframe_numbers: vec![4, 9],
            starting_symbol: 0,
            num_prach_slots_within_subframe: 1,
            num_occasions_within_slot: 6,
            duration: 2,
        }),
        98 => Some(PrachConfigurationIndex {
            format: PrachFormat::FormatA2,
            x: 1,
            y: 0,
            subframe_numbers: vec![9],
            starting_symbol: 0,
            num_prach_slots_within_subframe: 1,
            num_occasions_within_slot: 3,
            duration: 4,
        }),
        110 => Some(PrachConfigurationIndex {
            format: PrachFormat::FormatA3,
            x: 2,
            y: 1,
            subframe_numbers: vec![9],
            starting_symbol: 2,
            num_prach_slots_within_subframe: 2,
            num_occasions_within_slot: 1,
            duration: 6,
        }),
        144 => Some(PrachConfigurationIndex {
            format: PrachFormat::FormatB1,
            x: 1,
            y: 0,
            subframe_numbers: vec![4, 9],
            starting_symbol: 2,
            num_prach_slots_within_subframe: 1,
            num_occasions_within_slot: 5,
            duration: 2,
        }),
        158 => Some(PrachConfigurationIndex {
            format: PrachFormat::FormatC0,
            x: 2,
            y: 0,
            subframe_numbers: vec![9],
            starting_symbol: 0,
            num_prach_slots_within_subframe: 1,
            num_occasions_within_slot: 7,
            duration: 1,
        }),
        199 => Some(PrachConfigurationIndex {
            format: PrachFormat::FormatB4,
            x: 1,
            y: 0,
            subframe_numbers: vec![4, 9],
            starting_symbol: 0,
            num_prach_slots_within_subframe: 1,
            num_occasions_within_slot: 1,
            duration: 12,
        }),
        _ => None,
    }
}

/// RACH configuration common
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RachConfigCommon {
    /// PRACH configuration index (0-255)
    pub prach_config_index: u8,
    /// Message 2 window length in slots
    pub ra_response_window: u32,
    /// Slots between the end of the preamble slot and the window start
    pub ra_response_window_offset: u32,
    /// Number of FDMed PRACH occasions
    pub msg1_fdm: u8,
    /// PRACH frequency start offset in RBs from the BWP start
    pub msg1_frequency_start: u16,
    /// Max preamble transmission attempts
    pub preamble_trans_max: u8,
    /// Total number of RA preambles
    pub total_num_ra_preambles: u8,
    /// Preambles available for contention-based access; the rest are dedicated
    pub cb_preambles_per_occasion: u8,
    /// Upper bound of the random retry backoff in slots, when no backoff indicator was received
    pub backoff_window_slots: u32,
    /// Uplink carrier used for Msg1
    pub ul_carrier: UlCarrier,
}

impl Default for RachConfigCommon {
    fn default() -> Self {
        Self {
            prach_config_index: 87,
            ra_response_window: 10,  // 10 slots
            ra_response_window_offset: 2,
            msg1_fdm: 2,
            msg1_frequency_start: 0,  // Start from PRB 0
            preamble_trans_max: 8,
            total_num_ra_preambles: 64,  // All 64 preambles
            cb_preambles_per_occasion: 64,
            backoff_window_slots: 0,
            ul_carrier: UlCarrier::Normal,
        }
    }
}

/// Validated random access configuration shared by both protocol endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaConfiguration {
    rach: RachConfigCommon,
    prach: PrachConfigurationIndex,
    numerology: u8,
}

impl RaConfiguration {
    /// Resolve the PRACH configuration index through the built-in table
    pub fn from_index(rach: RachConfigCommon, numerology: u8) -> Result<Self, LayerError> {
        let prach = get_prach_config(rach.prach_config_index).ok_or_else(|| {
            LayerError::InvalidConfiguration(format!(
                "Unknown PRACH configuration index {}",
                rach.prach_config_index
            ))
        })?;
        Self::new(rach, prach, numerology)
    }

    /// Build from an explicit table row
    pub fn new(
        rach: RachConfigCommon,
        prach: PrachConfigurationIndex,
        numerology: u8,
    ) -> Result<Self, LayerError> {
        let invalid = |msg: String| Err(LayerError::InvalidConfiguration(msg));

        if prach.format.is_long() {
            return invalid(format!("Long preamble format {:?} is not supported", prach.format));
        }
        if numerology > constants::MAX_RA_NUMEROLOGY {
            return invalid(format!("Numerology {} too high for random access", numerology));
        }
        if prach.x == 0 || prach.y >= prach.x {
            return invalid(format!("Invalid frame period x={} offset y={}", prach.x, prach.y));
        }
        if prach.subframe_numbers.is_empty()
            || prach.subframe_numbers.windows(2).any(|w| w[0] >= w[1])
            || prach.subframe_numbers.iter().any(|&sf| sf >= 10)
        {
            return invalid(format!(
                "Subframe list {:?} must be strictly increasing within 0..10",
                prach.subframe_numbers
            ));
        }
        let prach_slots = prach.num_prach_slots_within_subframe;
        if !(1..=2).contains(&prach_slots) || prach_slots > slots_per_subframe(numerology) {
            return invalid(format!(
                "{} PRACH slots per subframe not possible with numerology {}",
                prach_slots, numerology
            ));
        }
        if prach.num_occasions_within_slot == 0 || prach.duration == 0 {
            return invalid("PRACH occasions and duration must be non-zero".into());
        }
        let last_symbol = u16::from(prach.starting_symbol)
            + u16::from(prach.num_occasions_within_slot) * u16::from(prach.duration);
        if last_symbol > u16::from(SYMBOLS_PER_SLOT) {
            return invalid(format!("PRACH occasions end at symbol {} beyond the slot", last_symbol));
        }
        if !constants::MSG1_FDM_VALUES.contains(&rach.msg1_fdm) {
            return invalid(format!("msg1-FDM {} not in {:?}", rach.msg1_fdm, constants::MSG1_FDM_VALUES));
        }
        if rach.total_num_ra_preambles == 0 || rach.total_num_ra_preambles > constants::MAX_NUM_PREAMBLES {
            return invalid(format!("Invalid preamble count {}", rach.total_num_ra_preambles));
        }
        if rach.cb_preambles_per_occasion == 0 || rach.cb_preambles_per_occasion > rach.total_num_ra_preambles {
            return invalid(format!(
                "Contention-based preambles {} exceed total {}",
                rach.cb_preambles_per_occasion, rach.total_num_ra_preambles
            ));
        }
        if rach.preamble_trans_max == 0 {
            return invalid("preambleTransMax must be at least 1".into());
        }
        if rach.ra_response_window == 0 {
            return invalid("RA response window must be at least one slot".into());
        }

        debug!(
            "RA configuration: index={}, format={:?}, x={}, y={}, subframes={:?}, occasions/slot={}, fdm={}",
            rach.prach_config_index,
            prach.format,
            prach.x,
            prach.y,
            prach.subframe_numbers,
            prach.num_occasions_within_slot,
            rach.msg1_fdm
        );

        Ok(Self { rach, prach, numerology })
    }

    pub fn rach(&self) -> &RachConfigCommon {
        &self.rach
    }

    pub fn prach(&self) -> &PrachConfigurationIndex {
        &self.prach
    }

    pub fn numerology(&self) -> u8 {
        self.numerology
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_entries_validate() {
        for index in [87u8, 98, 110, 144, 158, 199] {
            let rach = RachConfigCommon { prach_config_index: index, ..Default::default() };
            assert!(RaConfiguration::from_index(rach, 1).is_ok(), "index {}", index);
        }
    }

    #[test]
    fn test_unknown_index_rejected() {
        let rach = RachConfigCommon { prach_config_index: 3, ..Default::default() };
        assert!(matches!(
            RaConfiguration::from_index(rach, 1),
            Err(LayerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_long_format_rejected() {
        let prach = PrachConfigurationIndex {
            format: PrachFormat::Format0,
            x: 16,
            y: 1,
            subframe_numbers: vec![9],
            starting_symbol: 0,
            num_prach_slots_within_subframe: 1,
            num_occasions_within_slot: 1,
            duration: 1,
        };
        assert!(RaConfiguration::new(RachConfigCommon::default(), prach, 0).is_err());
    }

    #[test]
    fn test_two_prach_slots_need_numerology_one() {
        let rach = RachConfigCommon { prach_config_index: 110, ..Default::default() };
        assert!(RaConfiguration::from_index(rach.clone(), 0).is_err());
        assert!(RaConfiguration::from_index(rach, 1).is_ok());
    }

    #[test]
    fn test_occasions_must_fit_in_slot() {
        let mut prach = get_prach_config(87).unwrap();
        prach.starting_symbol = 4;
        assert!(RaConfiguration::new(RachConfigCommon::default(), prach, 1).is_err());
    }

    #[test]
    fn test_invalid_fdm_rejected() {
        let rach = RachConfigCommon { msg1_fdm: 3, ..Default::default() };
        assert!(RaConfiguration::from_index(rach, 1).is_err());
    }
}
