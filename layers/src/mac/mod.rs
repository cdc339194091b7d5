//! Medium Access Control (MAC) Layer Implementation
//!
//! Random access and control-resource scheduling of the NR MAC according to
//! 3GPP TS 38.321 and TS 38.213

pub mod bwp;
pub mod occasion;
pub mod prach_config;
pub mod ra_arbiter;
pub mod ra_procedure;
pub mod rar;
pub mod resource_grid;
pub mod search_space;

use crate::LayerError;
use common::types::{CellId, Rnti, SubcarrierSpacing, TddPattern};
use common::SlotCoordinate;
use interfaces::{IdentityAllocator, PreambleReception};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use bwp::{BwpBounds, BwpSpan};
pub use occasion::{compute_access_identifier, OccasionError, OccasionIndexer, OccasionPosition};
pub use prach_config::{get_prach_config, PrachConfigurationIndex, PrachFormat, RaConfiguration, RachConfigCommon};
pub use ra_arbiter::{
    ArbiterConfig, BaseStationRandomAccessArbiter, ExhaustionReason, PrachUsageStats, PreambleKey, RaEvent,
    SlotResolution,
};
pub use ra_procedure::{RaInput, RaMode, RaState, TerminalRandomAccessProcedure};
pub use rar::{RarEntry, RarError, RarPdu, RarUlGrant};
pub use resource_grid::{
    AllocationError, BroadcastConfig, GridConfig, ResourceGridAllocator, ResourceStatus, ResourceUsageStats,
};
pub use search_space::{ControlAllocation, ControlScheduleError, SearchSpaceScheduler, SearchSpaceSet};

/// Bandwidth part of the cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BwpConfig {
    pub id: u8,
    pub span: BwpSpan,
    /// CORESET duration in symbols
    #[serde(default = "default_coreset_symbols")]
    pub coreset_symbols: u8,
}

fn default_coreset_symbols() -> u8 {
    2
}

/// MAC layer configuration
#[derive(Debug, Clone)]
pub struct MacConfig {
    /// Cell ID
    pub cell_id: CellId,
    /// Subcarrier spacing
    pub scs: SubcarrierSpacing,
    /// Carrier width in resource blocks
    pub carrier_rbs: u16,
    pub tdd_pattern: TddPattern,
    /// Look-ahead window of the resource grid in slots
    pub window_slots: usize,
    pub broadcast: BroadcastConfig,
    /// PUCCH symbols at the end of uplink slots
    pub uplink_control_symbols: u8,
    pub bwps: Vec<BwpConfig>,
    pub rach: RachConfigCommon,
    /// PRACH row replacing the built-in table entry
    pub prach: Option<PrachConfigurationIndex>,
    pub arbiter: ArbiterConfig,
}

/// Cell-level MAC: one resource grid shared by the random access arbiter
/// and the PDCCH scheduling of admitted terminals
pub struct GnbMac {
    config: MacConfig,
    indexer: OccasionIndexer,
    grid: ResourceGridAllocator,
    search_spaces: SearchSpaceScheduler,
    arbiter: BaseStationRandomAccessArbiter,
}

impl GnbMac {
    pub fn new(config: MacConfig, identities: Box<dyn IdentityAllocator>) -> Result<Self, LayerError> {
        let numerology = config.scs.numerology();
        let ra = match &config.prach {
            Some(row) => RaConfiguration::new(config.rach.clone(), row.clone(), numerology)?,
            None => RaConfiguration::from_index(config.rach.clone(), numerology)?,
        };
        let indexer = OccasionIndexer::new(ra);

        let grid_config = GridConfig {
            numerology,
            carrier_rbs: config.carrier_rbs,
            window_slots: config.window_slots,
            tdd_pattern: config.tdd_pattern.clone(),
            broadcast: config.broadcast,
            uplink_control_symbols: config.uplink_control_symbols,
        };
        let mut grid = ResourceGridAllocator::new(grid_config, SlotCoordinate::from_absolute(0, numerology))?;
        for bwp in &config.bwps {
            grid.configure_bwp(bwp.id, bwp.span, bwp.coreset_symbols)?;
        }

        let ra_bwp = config.arbiter.bwp_id;
        let coreset_symbols = grid.coreset_symbols(ra_bwp).ok_or_else(|| {
            LayerError::InvalidConfiguration(format!("Random access BWP {} is not configured", ra_bwp))
        })?;
        config.arbiter.validate(coreset_symbols)?;
        grid.reserve_broadcast_and_random_access_resources(ra_bwp, &indexer)?;

        let arbiter = BaseStationRandomAccessArbiter::new(config.arbiter, indexer.clone(), identities);
        info!(
            "MAC for cell {}: {:?}, {} RBs, {} BWP(s), PRACH index {}",
            config.cell_id.0,
            config.scs,
            config.carrier_rbs,
            config.bwps.len(),
            config.rach.prach_config_index
        );

        Ok(Self {
            config,
            indexer,
            grid,
            search_spaces: SearchSpaceScheduler::new(),
            arbiter,
        })
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    /// Occasion arithmetic shared with the terminals of this cell
    pub fn indexer(&self) -> &OccasionIndexer {
        &self.indexer
    }

    pub fn grid(&self) -> &ResourceGridAllocator {
        &self.grid
    }

    pub fn search_spaces(&self) -> &SearchSpaceScheduler {
        &self.search_spaces
    }

    /// Width of the random access bandwidth part
    pub fn ra_bwp_size(&self) -> u16 {
        self.grid
            .bwp_bounds(self.config.arbiter.bwp_id)
            .map_or(0, |bounds| bounds.width())
    }

    /// Slot being processed
    pub fn current_slot(&self) -> SlotCoordinate {
        self.grid.current_slot()
    }

    pub fn receive_preamble(&mut self, reception: PreambleReception) {
        self.arbiter.receive_preamble(reception);
    }

    /// Resolve the preambles of the current slot, then move the grid one slot on
    pub fn end_of_slot(&mut self) -> SlotResolution {
        let slot = self.grid.current_slot();
        let resolution = self.arbiter.resolve_slot(&slot, &mut self.grid, &self.search_spaces);
        self.grid.advance_window();
        resolution
    }

    /// Start PDCCH monitoring for a terminal that completed random access
    pub fn admit_terminal(&mut self, rnti: Rnti, set: SearchSpaceSet) {
        debug!("Admitting terminal {}", rnti);
        self.search_spaces.create(rnti, set);
    }

    /// Stop monitoring and return the identifier to the pool
    pub fn release_terminal(&mut self, rnti: Rnti) {
        debug!("Releasing terminal {}", rnti);
        self.search_spaces.remove(rnti);
        self.arbiter.release_temporary_rnti(rnti);
    }

    /// Place a PDCCH for an admitted terminal in the latest slot from now up to `deadline`
    pub fn schedule_pdcch(
        &mut self,
        rnti: Rnti,
        deadline: &SlotCoordinate,
        aggregation_level: u8,
    ) -> Result<ControlAllocation, ControlScheduleError> {
        let now = self.grid.current_slot();
        let bwp_id = self.config.arbiter.bwp_id;
        self.search_spaces
            .schedule_before(rnti, bwp_id, deadline, &now, aggregation_level, &mut self.grid)
    }

    /// Cell counts of every slot that left the window
    pub fn usage(&self) -> &ResourceUsageStats {
        self.grid.usage()
    }

    pub fn prach_usage(&self) -> PrachUsageStats {
        self.arbiter.usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::UeId;
    use interfaces::RntiPool;

    fn config() -> MacConfig {
        MacConfig {
            cell_id: CellId(1),
            scs: SubcarrierSpacing::Scs30,
            carrier_rbs: 106,
            tdd_pattern: "DL|DL|S|UL|UL".parse().unwrap(),
            window_slots: 80,
            broadcast: BroadcastConfig::default(),
            uplink_control_symbols: 1,
            bwps: vec![
                BwpConfig { id: 0, span: BwpSpan::Cumulative { num_rbs: 51 }, coreset_symbols: 2 },
                BwpConfig { id: 1, span: BwpSpan::Cumulative { num_rbs: 55 }, coreset_symbols: 1 },
                BwpConfig { id: 2, span: BwpSpan::FullCarrier, coreset_symbols: 2 },
            ],
            rach: RachConfigCommon::default(),
            prach: None,
            arbiter: ArbiterConfig::default(),
        }
    }

    #[test]
    fn test_mac_setup() {
        let mac = GnbMac::new(config(), Box::new(RntiPool::default())).unwrap();
        assert_eq!(mac.ra_bwp_size(), 51);
        assert_eq!(mac.current_slot(), SlotCoordinate::from_absolute(0, 1));
        assert_eq!(mac.grid().held_slots(), 80);
        assert_eq!(mac.indexer().total_occasions(), 24);
    }

    #[test]
    fn test_invalid_setups_rejected() {
        let mut bad = config();
        bad.arbiter.bwp_id = 7;
        assert!(GnbMac::new(bad, Box::new(RntiPool::default())).is_err());

        let mut bad = config();
        bad.rach.prach_config_index = 3;
        assert!(GnbMac::new(bad, Box::new(RntiPool::default())).is_err());

        let mut bad = config();
        bad.bwps[2].coreset_symbols = 4;
        assert!(GnbMac::new(bad, Box::new(RntiPool::default())).is_err());
    }

    #[test]
    fn test_preamble_answered_over_slots() {
        let mut mac = GnbMac::new(config(), Box::new(RntiPool::default())).unwrap();
        let prach_slot = SlotCoordinate::new(0, 4, 1, 1).unwrap();
        while mac.current_slot() < prach_slot {
            assert!(mac.end_of_slot().events.is_empty());
        }

        let index = mac.indexer().occasions_in_slot(&prach_slot)[0];
        let (frequency_occasion, time_occasion) = mac.indexer().split(index).unwrap();
        mac.receive_preamble(PreambleReception { frequency_occasion, time_occasion, preamble_id: 9, sender: UeId(1) });
        let resolution = mac.end_of_slot();
        let Some(RaEvent::Success { tc_rnti, .. }) = resolution.events.first().cloned() else {
            panic!("expected success, got {:?}", resolution.events);
        };

        // The admitted terminal gets a PDCCH once its search space comes up
        mac.admit_terminal(tc_rnti, SearchSpaceSet::new(1, 0, 1).unwrap());
        let now = mac.current_slot();
        assert_eq!(mac.schedule_pdcch(tc_rnti, &now, 2).map(|pdcch| pdcch.slot), Ok(now));
        // Slots 13 and 14 are uplink, so the latest PDCCH up to 14 lands in the special slot 12
        let deadline = now.add_slots(4);
        assert_eq!(mac.schedule_pdcch(tc_rnti, &deadline, 2).map(|pdcch| pdcch.slot), Ok(now.add_slots(2)));
        mac.release_terminal(tc_rnti);
        assert!(mac.search_spaces().get(tc_rnti).is_none());

        for _ in 0..100 {
            mac.end_of_slot();
        }
        let usage = mac.usage();
        assert_eq!(usage.slots_folded, 110);
        assert!(usage.msg3 > 0 && usage.response_channel > 0);
        assert_eq!(mac.prach_usage().successes, 1);
    }
}
