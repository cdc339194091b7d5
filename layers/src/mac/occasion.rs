//! PRACH Occasion Indexing
//!
//! Maps PRACH occasion indices to time/frequency positions and derives the
//! RA-RNTI according to 3GPP TS 38.211 Section 6.3.3.2 and TS 38.321 Section 5.1.3.
//!
//! Occasions of one PRACH period are numbered frequency-major:
//! `index = f · T + subframe_pos · (S · O) + slot_pos · O + occasion_in_slot`
//! with `T = O · |subframes| · S`, `S` PRACH slots per subframe and `O`
//! occasions per slot.

use super::prach_config::RaConfiguration;
use common::types::UlCarrier;
use common::SlotCoordinate;
use thiserror::Error;

/// Occasion indexing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OccasionError {
    #[error("Occasion index {index} outside 0..{total}")]
    IndexOutOfRange { index: u16, total: u16 },

    #[error("Invalid occasion position: {0}")]
    InvalidPosition(String),
}

/// Time/frequency position of one PRACH occasion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OccasionPosition {
    /// Frequency-multiplexed occasion (f_id)
    pub frequency_index: u8,
    /// Subframe number within the frame
    pub subframe: u8,
    /// Slot within the subframe
    pub slot_in_subframe: u8,
    /// Time occasion within the PRACH slot
    pub occasion_in_slot: u8,
    /// First symbol of the occasion (s_id)
    pub symbol_start: u8,
}

/// RA-RNTI = 1 + s_id + 14·t_id + 14·80·f_id + 14·80·8·ul_carrier_id
pub fn compute_access_identifier(
    symbol_start: u8,
    slot_in_frame: u16,
    frequency_index: u8,
    carrier_id: u16,
) -> u16 {
    1 + u16::from(symbol_start)
        + 14 * slot_in_frame
        + 14 * 80 * u16::from(frequency_index)
        + 14 * 80 * 8 * carrier_id
}

/// Stateless occasion arithmetic for one RA configuration
#[derive(Debug, Clone)]
pub struct OccasionIndexer {
    config: RaConfiguration,
}

impl OccasionIndexer {
    pub fn new(config: RaConfiguration) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RaConfiguration {
        &self.config
    }

    fn prach_slots(&self) -> u16 {
        u16::from(self.config.prach().num_prach_slots_within_subframe)
    }

    fn occasions_per_slot(&self) -> u16 {
        u16::from(self.config.prach().num_occasions_within_slot)
    }

    /// Time occasions per frequency occasion within one PRACH period
    pub fn time_occasions(&self) -> u16 {
        self.occasions_per_slot()
            * self.config.prach().subframe_numbers.len() as u16
            * self.prach_slots()
    }

    /// Occasions in one PRACH period across all frequency occasions
    pub fn total_occasions(&self) -> u16 {
        u16::from(self.config.rach().msg1_fdm) * self.time_occasions()
    }

    /// Slot within the subframe used by the given PRACH slot position.
    /// A single PRACH slot sits at the end of the subframe.
    fn slot_for_position(&self, slot_pos: u8) -> u8 {
        if self.prach_slots() == 1 {
            common::slot::slots_per_subframe(self.config.numerology()) - 1
        } else {
            slot_pos
        }
    }

    fn position_for_slot(&self, slot_in_subframe: u8) -> Option<u8> {
        (0..self.prach_slots() as u8).find(|&pos| self.slot_for_position(pos) == slot_in_subframe)
    }

    /// Split an index into (frequency occasion, time occasion)
    pub fn split(&self, index: u16) -> Result<(u8, u16), OccasionError> {
        let total = self.total_occasions();
        if index >= total {
            return Err(OccasionError::IndexOutOfRange { index, total });
        }
        let per_frequency = self.time_occasions();
        Ok(((index / per_frequency) as u8, index % per_frequency))
    }

    /// Combine (frequency occasion, time occasion) into an index
    pub fn join(&self, frequency_index: u8, time_occasion: u16) -> Result<u16, OccasionError> {
        if frequency_index >= self.config.rach().msg1_fdm || time_occasion >= self.time_occasions() {
            return Err(OccasionError::InvalidPosition(format!(
                "frequency occasion {} / time occasion {}",
                frequency_index, time_occasion
            )));
        }
        Ok(u16::from(frequency_index) * self.time_occasions() + time_occasion)
    }

    /// Decompose an occasion index into its time/frequency position
    pub fn decompose(&self, index: u16) -> Result<OccasionPosition, OccasionError> {
        let (frequency_index, time) = self.split(index)?;
        let per_slot = self.occasions_per_slot();
        let per_subframe = self.prach_slots() * per_slot;

        let subframe_pos = (time / per_subframe) as usize;
        let within_subframe = time % per_subframe;
        let slot_pos = (within_subframe / per_slot) as u8;
        let occasion_in_slot = (within_subframe % per_slot) as u8;

        let prach = self.config.prach();
        Ok(OccasionPosition {
            frequency_index,
            subframe: prach.subframe_numbers[subframe_pos],
            slot_in_subframe: self.slot_for_position(slot_pos),
            occasion_in_slot,
            symbol_start: prach.starting_symbol + occasion_in_slot * prach.duration,
        })
    }

    /// Inverse of [`decompose`](Self::decompose)
    pub fn encode(&self, position: &OccasionPosition) -> Result<u16, OccasionError> {
        let prach = self.config.prach();
        let subframe_pos = prach
            .subframe_numbers
            .iter()
            .position(|&sf| sf == position.subframe)
            .ok_or_else(|| {
                OccasionError::InvalidPosition(format!("subframe {} has no PRACH", position.subframe))
            })?;
        let slot_pos = self.position_for_slot(position.slot_in_subframe).ok_or_else(|| {
            OccasionError::InvalidPosition(format!("slot {} has no PRACH", position.slot_in_subframe))
        })?;
        if position.occasion_in_slot >= prach.num_occasions_within_slot {
            return Err(OccasionError::InvalidPosition(format!(
                "occasion {} in slot",
                position.occasion_in_slot
            )));
        }

        let per_slot = self.occasions_per_slot();
        let time = subframe_pos as u16 * self.prach_slots() * per_slot
            + u16::from(slot_pos) * per_slot
            + u16::from(position.occasion_in_slot);
        self.join(position.frequency_index, time)
    }

    /// Whether the slot contains PRACH occasions
    pub fn has_prach(&self, slot: &SlotCoordinate) -> bool {
        let prach = self.config.prach();
        slot.numerology == self.config.numerology()
            && slot.frame % prach.x == prach.y
            && prach.subframe_numbers.contains(&slot.subframe)
            && self.position_for_slot(slot.slot).is_some()
    }

    /// All occasion indices (every frequency occasion) located in the slot
    pub fn occasions_in_slot(&self, slot: &SlotCoordinate) -> Vec<u16> {
        if !self.has_prach(slot) {
            return Vec::new();
        }
        let prach = self.config.prach();
        let mut occasions = Vec::new();
        for frequency_index in 0..self.config.rach().msg1_fdm {
            for occasion_in_slot in 0..prach.num_occasions_within_slot {
                let position = OccasionPosition {
                    frequency_index,
                    subframe: slot.subframe,
                    slot_in_subframe: slot.slot,
                    occasion_in_slot,
                    symbol_start: prach.starting_symbol + occasion_in_slot * prach.duration,
                };
                if let Ok(index) = self.encode(&position) {
                    occasions.push(index);
                }
            }
        }
        occasions
    }

    /// Slot index within the frame of an occasion (t_id)
    pub fn slot_in_frame(&self, position: &OccasionPosition) -> u16 {
        u16::from(position.subframe) * u16::from(common::slot::slots_per_subframe(self.config.numerology()))
            + u16::from(position.slot_in_subframe)
    }

    /// RA-RNTI of an occasion; the single derivation used by both endpoints
    pub fn access_identifier_for(&self, index: u16, carrier: UlCarrier) -> Result<u16, OccasionError> {
        let position = self.decompose(index)?;
        Ok(compute_access_identifier(
            position.symbol_start,
            self.slot_in_frame(&position),
            position.frequency_index,
            carrier.id(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::prach_config::RachConfigCommon;

    fn indexer(index: u8, fdm: u8, numerology: u8) -> OccasionIndexer {
        let rach = RachConfigCommon { prach_config_index: index, msg1_fdm: fdm, ..Default::default() };
        OccasionIndexer::new(RaConfiguration::from_index(rach, numerology).unwrap())
    }

    #[test]
    fn test_bijection_for_all_builtin_configs() {
        for index in [87u8, 98, 110, 144, 158, 199] {
            for fdm in [1u8, 2, 4, 8] {
                let idx = indexer(index, fdm, 1);
                let total = idx.total_occasions();
                let mut seen = std::collections::HashSet::new();
                for occasion in 0..total {
                    let position = idx.decompose(occasion).unwrap();
                    assert_eq!(idx.encode(&position).unwrap(), occasion);
                    assert!(seen.insert((position.frequency_index, position.subframe, position.slot_in_subframe, position.symbol_start)));
                }
                assert!(idx.decompose(total).is_err());
            }
        }
    }

    #[test]
    fn test_decompose_layout() {
        // A1: 6 occasions of 2 symbols, subframes 4 and 9, one slot, fdm 2
        let idx = indexer(87, 2, 1);
        assert_eq!(idx.time_occasions(), 12);
        assert_eq!(idx.total_occasions(), 24);

        let position = idx.decompose(15).unwrap();
        assert_eq!(position.frequency_index, 1);
        assert_eq!(position.subframe, 4);
        assert_eq!(position.slot_in_subframe, 1);
        assert_eq!(position.occasion_in_slot, 3);
        assert_eq!(position.symbol_start, 6);

        let position = idx.decompose(6).unwrap();
        assert_eq!(position.subframe, 9);
        assert_eq!(position.occasion_in_slot, 0);
    }

    #[test]
    fn test_two_prach_slots_layout() {
        let idx = indexer(110, 1, 1);
        assert_eq!(idx.time_occasions(), 2);
        assert_eq!(idx.decompose(0).unwrap().slot_in_subframe, 0);
        assert_eq!(idx.decompose(1).unwrap().slot_in_subframe, 1);
    }

    #[test]
    fn test_access_identifier_formula() {
        assert_eq!(compute_access_identifier(0, 0, 0, 0), 1);
        assert_eq!(compute_access_identifier(2, 19, 1, 0), 1 + 2 + 14 * 19 + 1120);
        assert_eq!(compute_access_identifier(13, 79, 7, 1), 1 + 13 + 14 * 79 + 14 * 80 * 7 + 14 * 80 * 8);
    }

    #[test]
    fn test_access_identifier_matches_slot_view() {
        let idx = indexer(87, 4, 1);
        for occasion in 0..idx.total_occasions() {
            let position = idx.decompose(occasion).unwrap();
            let slot = SlotCoordinate::new(7, position.subframe, position.slot_in_subframe, 1).unwrap();
            let expected = compute_access_identifier(
                position.symbol_start,
                slot.slot_in_frame(),
                position.frequency_index,
                0,
            );
            assert_eq!(idx.access_identifier_for(occasion, UlCarrier::Normal).unwrap(), expected);
            assert!(idx.occasions_in_slot(&slot).contains(&occasion));
        }
    }

    #[test]
    fn test_has_prach() {
        let idx = indexer(87, 1, 1);
        assert!(idx.has_prach(&SlotCoordinate::new(3, 9, 1, 1).unwrap()));
        assert!(!idx.has_prach(&SlotCoordinate::new(3, 9, 0, 1).unwrap()));
        assert!(!idx.has_prach(&SlotCoordinate::new(3, 8, 1, 1).unwrap()));

        // Frame period 2, offset 1
        let idx = indexer(110, 1, 1);
        assert!(idx.has_prach(&SlotCoordinate::new(1, 9, 0, 1).unwrap()));
        assert!(!idx.has_prach(&SlotCoordinate::new(2, 9, 0, 1).unwrap()));
    }

    #[test]
    fn test_occasions_in_slot() {
        let idx = indexer(87, 2, 1);
        let slot = SlotCoordinate::new(0, 4, 1, 1).unwrap();
        let occasions = idx.occasions_in_slot(&slot);
        assert_eq!(occasions, vec![0, 1, 2, 3, 4, 5, 12, 13, 14, 15, 16, 17]);
        assert!(idx.occasions_in_slot(&SlotCoordinate::new(0, 5, 1, 1).unwrap()).is_empty());
    }

    #[test]
    fn test_split_join() {
        let idx = indexer(87, 2, 1);
        assert_eq!(idx.split(15).unwrap(), (1, 3));
        assert_eq!(idx.join(1, 3).unwrap(), 15);
        assert!(idx.join(2, 0).is_err());
        assert!(idx.join(0, 12).is_err());
    }
}
