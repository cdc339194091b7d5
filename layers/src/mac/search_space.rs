//! PDCCH Search Space Scheduling
//!
//! Monitoring occasions per 3GPP TS 38.213 Section 10.1 and CCE placement
//! inside the CORESET of a bandwidth part

use super::resource_grid::{AllocationError, ResourceGridAllocator, ResourceStatus};
use crate::LayerError;
use common::types::Rnti;
use common::SlotCoordinate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use thiserror::Error;
use tracing::{debug, trace};

/// REGs per CCE (TS 38.211 Section 7.3.2.2)
pub const REGS_PER_CCE: u16 = 6;

/// Supported aggregation levels, largest first
const AGGREGATION_LEVELS: [u8; 5] = [16, 8, 4, 2, 1];

/// Search space monitoring pattern of one terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSpaceSet {
    /// Monitoring slot periodicity in slots
    pub slot_periodicity: u16,
    /// Slot offset within the period
    pub slot_offset: u16,
    /// Consecutive monitoring slots per period
    pub duration: u16,
}

impl SearchSpaceSet {
    pub fn new(slot_periodicity: u16, slot_offset: u16, duration: u16) -> Result<Self, LayerError> {
        if slot_periodicity == 0 || slot_offset >= slot_periodicity || duration == 0 || duration > slot_periodicity {
            return Err(LayerError::InvalidConfiguration(format!(
                "Search space periodicity={} offset={} duration={}",
                slot_periodicity, slot_offset, duration
            )));
        }
        Ok(Self { slot_periodicity, slot_offset, duration })
    }

    /// (slot − offset) mod periodicity < duration
    pub fn is_monitoring_slot(&self, slot: &SlotCoordinate) -> bool {
        let period = u64::from(self.slot_periodicity);
        let shifted = (slot.absolute() + period - u64::from(self.slot_offset)) % period;
        shifted < u64::from(self.duration)
    }
}

/// PDCCH placed in a CORESET
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlAllocation {
    pub rnti: Rnti,
    pub slot: SlotCoordinate,
    pub bwp_id: u8,
    pub symbols: Range<u8>,
    /// BWP-relative resource blocks
    pub rbs: Range<u16>,
    pub aggregation_level: u8,
}

/// Reasons a PDCCH could not be placed this cycle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlScheduleError {
    #[error("Slot {0} is not a monitoring slot")]
    NotMonitoring(SlotCoordinate),

    #[error("Slot {0} has no downlink control region")]
    NoDownlinkControl(SlotCoordinate),

    #[error("No free CCEs in slot {0}")]
    NoControlResource(SlotCoordinate),

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// Per-terminal search spaces and CCE placement
#[derive(Debug, Default)]
pub struct SearchSpaceScheduler {
    sets: BTreeMap<Rnti, SearchSpaceSet>,
}

impl SearchSpaceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the search space of an admitted terminal
    pub fn create(&mut self, rnti: Rnti, set: SearchSpaceSet) {
        debug!("Search space for {}: {:?}", rnti, set);
        self.sets.insert(rnti, set);
    }

    pub fn remove(&mut self, rnti: Rnti) -> Option<SearchSpaceSet> {
        self.sets.remove(&rnti)
    }

    pub fn get(&self, rnti: Rnti) -> Option<&SearchSpaceSet> {
        self.sets.get(&rnti)
    }

    /// Terminals without a dedicated set monitor the common search space in every slot
    pub fn is_monitoring(&self, rnti: Rnti, slot: &SlotCoordinate) -> bool {
        self.sets
            .get(&rnti)
            .map_or(true, |set| set.is_monitoring_slot(slot))
    }

    /// Place a PDCCH for `rnti` in `slot`, falling back to smaller aggregation levels
    pub fn schedule_control(
        &self,
        rnti: Rnti,
        bwp_id: u8,
        slot: &SlotCoordinate,
        aggregation_level: u8,
        grid: &mut ResourceGridAllocator,
    ) -> Result<ControlAllocation, ControlScheduleError> {
        if !self.is_monitoring(rnti, slot) {
            return Err(ControlScheduleError::NotMonitoring(*slot));
        }
        if !grid.slot_type(slot).has_downlink_control() {
            return Err(ControlScheduleError::NoDownlinkControl(*slot));
        }
        let coreset_symbols = grid
            .coreset_symbols(bwp_id)
            .ok_or(AllocationError::UnknownBwp(bwp_id))?;
        let bwp_width = grid
            .bwp_bounds(bwp_id)
            .ok_or(AllocationError::UnknownBwp(bwp_id))?
            .width();

        for level in AGGREGATION_LEVELS.iter().copied().filter(|&l| l <= aggregation_level) {
            // One CCE = 6 REGs spread over the CORESET symbols
            let num_rbs = u16::from(level) * REGS_PER_CCE / u16::from(coreset_symbols);
            if num_rbs == 0 || num_rbs > bwp_width {
                continue;
            }
            let mut start = 0;
            while start + num_rbs <= bwp_width {
                let rbs = start..start + num_rbs;
                match grid.is_region_available(
                    bwp_id,
                    slot,
                    0..coreset_symbols,
                    rbs.clone(),
                    ResourceStatus::ScheduledControl,
                ) {
                    Ok(()) => {
                        grid.mark_control_resource(
                            bwp_id,
                            slot,
                            0..coreset_symbols,
                            rbs.clone(),
                            ResourceStatus::ScheduledControl,
                        )?;
                        trace!("PDCCH for {} in slot {}: AL{} RBs {:?}", rnti, slot, level, rbs);
                        return Ok(ControlAllocation {
                            rnti,
                            slot: *slot,
                            bwp_id,
                            symbols: 0..coreset_symbols,
                            rbs,
                            aggregation_level: level,
                        });
                    }
                    Err(AllocationError::Conflict { .. }) => start += num_rbs,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Err(ControlScheduleError::NoControlResource(*slot))
    }

    /// Walk back from `deadline` to `earliest` and place the PDCCH in the latest slot that works
    pub fn schedule_before(
        &self,
        rnti: Rnti,
        bwp_id: u8,
        deadline: &SlotCoordinate,
        earliest: &SlotCoordinate,
        aggregation_level: u8,
        grid: &mut ResourceGridAllocator,
    ) -> Result<ControlAllocation, ControlScheduleError> {
        let mut last_error = ControlScheduleError::NoControlResource(*deadline);
        let (first_held, last_held) = grid.window_span();
        let lower = earliest.absolute().max(first_held);
        let upper = deadline.absolute().min(last_held);
        for absolute in (lower..=upper).rev() {
            let slot = SlotCoordinate::from_absolute(absolute, deadline.numerology);
            match self.schedule_control(rnti, bwp_id, &slot, aggregation_level, grid) {
                Ok(allocation) => return Ok(allocation),
                Err(ControlScheduleError::Allocation(e)) => return Err(e.into()),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::bwp::BwpSpan;
    use crate::mac::resource_grid::{BroadcastConfig, GridConfig};

    fn grid() -> ResourceGridAllocator {
        let config = GridConfig {
            numerology: 1,
            carrier_rbs: 24,
            window_slots: 20,
            tdd_pattern: "DL|DL|S|UL|UL".parse().unwrap(),
            broadcast: BroadcastConfig::default(),
            uplink_control_symbols: 1,
        };
        let mut grid = ResourceGridAllocator::new(config, SlotCoordinate::new(0, 0, 0, 1).unwrap()).unwrap();
        grid.configure_bwp(0, BwpSpan::Cumulative { num_rbs: 24 }, 2).unwrap();
        grid
    }

    fn slot(absolute: u64) -> SlotCoordinate {
        SlotCoordinate::from_absolute(absolute, 1)
    }

    #[test]
    fn test_monitoring_slots() {
        let set = SearchSpaceSet::new(4, 1, 2).unwrap();
        let monitored: Vec<u64> = (0..12).filter(|&s| set.is_monitoring_slot(&slot(s))).collect();
        assert_eq!(monitored, vec![1, 2, 5, 6, 9, 10]);
    }

    #[test]
    fn test_invalid_sets() {
        assert!(SearchSpaceSet::new(0, 0, 1).is_err());
        assert!(SearchSpaceSet::new(4, 4, 1).is_err());
        assert!(SearchSpaceSet::new(4, 0, 5).is_err());
    }

    #[test]
    fn test_create_and_remove() {
        let mut scheduler = SearchSpaceScheduler::new();
        let rnti = Rnti(0x4601);
        scheduler.create(rnti, SearchSpaceSet::new(2, 0, 1).unwrap());
        assert!(!scheduler.is_monitoring(rnti, &slot(1)));
        assert!(scheduler.remove(rnti).is_some());
        // Common search space afterwards
        assert!(scheduler.is_monitoring(rnti, &slot(1)));
        assert!(scheduler.get(rnti).is_none());
    }

    #[test]
    fn test_cce_placement_and_exhaustion() {
        let mut grid = grid();
        let scheduler = SearchSpaceScheduler::new();
        let dl = slot(0);

        // AL4 over 2 CORESET symbols = 12 RBs; the 24 RB BWP fits two
        let first = scheduler.schedule_control(Rnti(1), 0, &dl, 4, &mut grid).unwrap();
        assert_eq!(first.rbs, 0..12);
        let second = scheduler.schedule_control(Rnti(2), 0, &dl, 4, &mut grid).unwrap();
        assert_eq!(second.rbs, 12..24);
        assert_eq!(second.aggregation_level, 4);

        assert_eq!(
            scheduler.schedule_control(Rnti(3), 0, &dl, 4, &mut grid),
            Err(ControlScheduleError::NoControlResource(dl))
        );
    }

    #[test]
    fn test_aggregation_level_fallback() {
        let mut grid = grid();
        let scheduler = SearchSpaceScheduler::new();
        let dl = slot(1);
        grid.mark_control_resource(0, &dl, 0..2, 0..20, ResourceStatus::ScheduledControl).unwrap();

        let allocation = scheduler.schedule_control(Rnti(9), 0, &dl, 8, &mut grid).unwrap();
        assert_eq!(allocation.aggregation_level, 1);
        assert_eq!(allocation.rbs, 21..24);
    }

    #[test]
    fn test_uplink_slot_and_non_monitoring_rejected() {
        let mut grid = grid();
        let mut scheduler = SearchSpaceScheduler::new();
        assert_eq!(
            scheduler.schedule_control(Rnti(1), 0, &slot(3), 1, &mut grid),
            Err(ControlScheduleError::NoDownlinkControl(slot(3)))
        );

        scheduler.create(Rnti(5), SearchSpaceSet::new(5, 2, 1).unwrap());
        assert_eq!(
            scheduler.schedule_control(Rnti(5), 0, &slot(0), 1, &mut grid),
            Err(ControlScheduleError::NotMonitoring(slot(0)))
        );
        assert!(scheduler.schedule_control(Rnti(5), 0, &slot(2), 1, &mut grid).is_ok());
    }

    #[test]
    fn test_schedule_before_walks_back() {
        let mut grid = grid();
        let scheduler = SearchSpaceScheduler::new();
        // slot 7 is special, slots 8 and 9 are uplink
        let allocation = scheduler
            .schedule_before(Rnti(3), 0, &slot(9), &slot(5), 1, &mut grid)
            .unwrap();
        assert_eq!(allocation.slot, slot(7));

        assert!(matches!(
            scheduler.schedule_before(Rnti(3), 0, &slot(9), &slot(8), 1, &mut grid),
            Err(ControlScheduleError::NoDownlinkControl(_))
        ));
    }
}
