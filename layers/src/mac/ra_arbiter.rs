//! Random Access Arbiter
//!
//! Base-station side of contention-based random access. Preambles detected
//! during one uplink slot are grouped per PRACH occasion and preamble index;
//! a group with a single sender is answered with a Random Access Response,
//! larger groups are collisions and are left to time out.

use super::occasion::OccasionIndexer;
use super::rar::{
    msg3_slot_offset, RarEntry, RarPdu, RarUlGrant, DEFAULT_PUSCH_TIME_ALLOCATIONS, MSG3_TB_SIZE_BITS,
};
use super::resource_grid::{ResourceGridAllocator, ResourceStatus};
use super::search_space::SearchSpaceScheduler;
use crate::LayerError;
use common::bytes_to_hex;
use common::slot::SYMBOLS_PER_SLOT;
use common::types::{Rnti, UeId};
use common::SlotCoordinate;
use interfaces::{DownlinkRar, IdentityAllocator, PreambleReception, UplinkGrant};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace, warn};

/// Resources spent on each response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Bandwidth part carrying PRACH, RAR and Msg3
    pub bwp_id: u8,
    /// PDSCH resource blocks per RAR PDU
    pub rar_rbs: u16,
    /// PDSCH symbols following the CORESET
    pub rar_symbols: u8,
    /// Msg3 PUSCH resource blocks
    pub msg3_rbs: u16,
    /// Aggregation level of the RA-RNTI PDCCH
    pub aggregation_level: u8,
    /// Backoff Indicator added to every RAR PDU
    pub backoff_indicator: Option<u8>,
    /// Timing advance command sent to every terminal
    pub timing_advance: u16,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            bwp_id: 0,
            rar_rbs: 8,
            rar_symbols: 4,
            msg3_rbs: 3,
            aggregation_level: 4,
            backoff_indicator: None,
            timing_advance: 0,
        }
    }
}

impl ArbiterConfig {
    pub fn validate(&self, coreset_symbols: u8) -> Result<(), LayerError> {
        if self.rar_rbs == 0 || self.msg3_rbs == 0 || self.rar_symbols == 0 {
            return Err(LayerError::InvalidConfiguration(
                "RAR and Msg3 allocations must not be empty".into(),
            ));
        }
        if u16::from(coreset_symbols) + u16::from(self.rar_symbols) > u16::from(SYMBOLS_PER_SLOT) {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} RAR symbols after a {} symbol CORESET exceed the slot",
                self.rar_symbols, coreset_symbols
            )));
        }
        if ![1, 2, 4, 8, 16].contains(&self.aggregation_level) {
            return Err(LayerError::InvalidConfiguration(format!(
                "Aggregation level {}",
                self.aggregation_level
            )));
        }
        if self.backoff_indicator.map_or(false, |bi| bi > 13) || self.timing_advance > 0x0FFF {
            return Err(LayerError::InvalidConfiguration(format!(
                "Backoff indicator {:?} / timing advance {}",
                self.backoff_indicator, self.timing_advance
            )));
        }
        Ok(())
    }
}

/// Grouping key of detected preambles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PreambleKey {
    pub frequency_occasion: u8,
    pub time_occasion: u16,
    pub preamble_id: u8,
}

impl From<&PreambleReception> for PreambleKey {
    fn from(reception: &PreambleReception) -> Self {
        Self {
            frequency_occasion: reception.frequency_occasion,
            time_occasion: reception.time_occasion,
            preamble_id: reception.preamble_id,
        }
    }
}

/// Why a lone preamble went unanswered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExhaustionReason {
    NoIdentifier,
    NoResources,
}

/// Outcome of one preamble group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaEvent {
    Success {
        key: PreambleKey,
        ra_rnti: u16,
        tc_rnti: Rnti,
        rar_slot: SlotCoordinate,
        grant: UplinkGrant,
    },
    Collision {
        key: PreambleKey,
        ra_rnti: u16,
        contenders: usize,
    },
    Exhausted {
        key: PreambleKey,
        reason: ExhaustionReason,
    },
}

/// Everything decided for one uplink slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotResolution {
    pub slot: SlotCoordinate,
    /// One PDU per (response slot, RA-RNTI)
    pub responses: Vec<DownlinkRar>,
    pub events: Vec<RaEvent>,
}

/// PRACH usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrachUsageStats {
    pub preambles_received: u64,
    /// Distinct occasions with at least one detected preamble
    pub occasions_used: u64,
    pub successes: u64,
    pub collisions: u64,
    pub exhausted: u64,
    /// PRACH periods with activity
    pub periods: u64,
}

impl PrachUsageStats {
    fn fold(&mut self, other: &Self) {
        self.preambles_received += other.preambles_received;
        self.occasions_used += other.occasions_used;
        self.successes += other.successes;
        self.collisions += other.collisions;
        self.exhausted += other.exhausted;
        self.periods += other.periods;
    }
}

/// Where a response and its Msg3 were placed
struct Placement {
    rar_slot: SlotCoordinate,
    ul_grant: RarUlGrant,
    grant: UplinkGrant,
}

/// Base-station random access resolution
pub struct BaseStationRandomAccessArbiter {
    config: ArbiterConfig,
    indexer: OccasionIndexer,
    identities: Box<dyn IdentityAllocator>,
    pending: BTreeMap<PreambleKey, Vec<UeId>>,
    total: PrachUsageStats,
    period: Option<(u32, PrachUsageStats)>,
}

impl BaseStationRandomAccessArbiter {
    pub fn new(config: ArbiterConfig, indexer: OccasionIndexer, identities: Box<dyn IdentityAllocator>) -> Self {
        info!(
            "RA arbiter on BWP {}: {} occasions per PRACH period, RAR {} RBs x {} symbols, Msg3 {} RBs",
            config.bwp_id,
            indexer.total_occasions(),
            config.rar_rbs,
            config.rar_symbols,
            config.msg3_rbs
        );
        Self {
            config,
            indexer,
            identities,
            pending: BTreeMap::new(),
            total: PrachUsageStats::default(),
            period: None,
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// Store a preamble detected in the current uplink slot
    pub fn receive_preamble(&mut self, reception: PreambleReception) {
        trace!(
            "Preamble {} on occasion f={} t={}",
            reception.preamble_id,
            reception.frequency_occasion,
            reception.time_occasion
        );
        self.pending
            .entry(PreambleKey::from(&reception))
            .or_default()
            .push(reception.sender);
    }

    pub fn pending_preambles(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Give a temporary C-RNTI back to the allocator
    pub fn release_temporary_rnti(&mut self, rnti: Rnti) {
        self.identities.release(rnti);
    }

    /// Counters of all completed PRACH periods plus the current one
    pub fn usage(&self) -> PrachUsageStats {
        let mut usage = self.total;
        if let Some((_, current)) = &self.period {
            usage.fold(current);
        }
        usage
    }

    /// Resolve every preamble received in `slot`.
    ///
    /// The pending receptions are consumed whatever the outcome.
    pub fn resolve_slot(
        &mut self,
        slot: &SlotCoordinate,
        grid: &mut ResourceGridAllocator,
        search_spaces: &SearchSpaceScheduler,
    ) -> SlotResolution {
        let pending = std::mem::take(&mut self.pending);
        let mut resolution = SlotResolution { slot: *slot, responses: Vec::new(), events: Vec::new() };
        if pending.is_empty() {
            return resolution;
        }

        let mut usage = PrachUsageStats::default();
        let mut occasions = BTreeSet::new();
        let mut bundles: BTreeMap<(u64, u16), RarPdu> = BTreeMap::new();

        for (key, senders) in pending {
            usage.preambles_received += senders.len() as u64;
            let ra_rnti = match self.access_identifier(&key, slot) {
                Ok(ra_rnti) => ra_rnti,
                Err(e) => {
                    warn!("Dropping {} preamble(s) with key {:?}: {}", senders.len(), key, e);
                    continue;
                }
            };
            occasions.insert((key.frequency_occasion, key.time_occasion));

            if senders.len() > 1 {
                debug!(
                    "Collision in slot {}: {} terminals sent preamble {} on RA-RNTI {}",
                    slot,
                    senders.len(),
                    key.preamble_id,
                    ra_rnti
                );
                usage.collisions += 1;
                resolution.events.push(RaEvent::Collision { key, ra_rnti, contenders: senders.len() });
                continue;
            }

            let Some(tc_rnti) = self.identities.allocate_temporary_rnti() else {
                warn!("No temporary C-RNTI left for preamble {} in slot {}", key.preamble_id, slot);
                usage.exhausted += 1;
                resolution.events.push(RaEvent::Exhausted { key, reason: ExhaustionReason::NoIdentifier });
                continue;
            };

            match self.place_response(ra_rnti, slot, grid, search_spaces, &bundles) {
                Some(placement) => {
                    debug!(
                        "RAR for preamble {} (RA-RNTI {}) in slot {}, {} Msg3 in slot {}",
                        key.preamble_id, ra_rnti, placement.rar_slot, tc_rnti, placement.grant.slot
                    );
                    let backoff_indicator = self.config.backoff_indicator;
                    bundles
                        .entry((placement.rar_slot.absolute(), ra_rnti))
                        .or_insert_with(|| RarPdu { backoff_indicator, entries: Vec::new() })
                        .entries
                        .push(RarEntry {
                            preamble_id: key.preamble_id,
                            timing_advance: self.config.timing_advance,
                            ul_grant: placement.ul_grant,
                            tc_rnti,
                        });
                    usage.successes += 1;
                    resolution.events.push(RaEvent::Success {
                        key,
                        ra_rnti,
                        tc_rnti,
                        rar_slot: placement.rar_slot,
                        grant: placement.grant,
                    });
                }
                None => {
                    debug!("No response resources for preamble {} in slot {}", key.preamble_id, slot);
                    self.identities.release(tc_rnti);
                    usage.exhausted += 1;
                    resolution.events.push(RaEvent::Exhausted { key, reason: ExhaustionReason::NoResources });
                }
            }
        }

        for ((absolute, ra_rnti), pdu) in bundles {
            let rar_slot = SlotCoordinate::from_absolute(absolute, slot.numerology);
            match pdu.encode() {
                Ok(payload) => {
                    trace!("RAR PDU for RA-RNTI {} in slot {}: {}", ra_rnti, rar_slot, bytes_to_hex(&payload));
                    resolution.responses.push(DownlinkRar { slot: rar_slot, ra_rnti, payload });
                }
                Err(e) => warn!("Failed to encode RAR for RA-RNTI {}: {}", ra_rnti, e),
            }
        }

        usage.occasions_used = occasions.len() as u64;
        self.record_usage(slot, usage);
        resolution
    }

    /// RA-RNTI of a group, after checking its occasion lies in `slot`
    fn access_identifier(&self, key: &PreambleKey, slot: &SlotCoordinate) -> Result<u16, LayerError> {
        let index = self
            .indexer
            .join(key.frequency_occasion, key.time_occasion)
            .map_err(|e| LayerError::InvalidPdu(e.to_string()))?;
        let position = self
            .indexer
            .decompose(index)
            .map_err(|e| LayerError::InvalidPdu(e.to_string()))?;
        if !self.indexer.has_prach(slot)
            || position.subframe != slot.subframe
            || position.slot_in_subframe != slot.slot
        {
            return Err(LayerError::InvalidPdu(format!("occasion {} not in slot {}", index, slot)));
        }
        self.indexer
            .access_identifier_for(index, self.indexer.config().rach().ul_carrier)
            .map_err(|e| LayerError::InvalidPdu(e.to_string()))
    }

    /// Find and claim PDCCH, PDSCH and Msg3 resources inside the response window
    fn place_response(
        &self,
        ra_rnti: u16,
        slot: &SlotCoordinate,
        grid: &mut ResourceGridAllocator,
        search_spaces: &SearchSpaceScheduler,
        bundles: &BTreeMap<(u64, u16), RarPdu>,
    ) -> Option<Placement> {
        let bwp_id = self.config.bwp_id;
        let coreset = grid.coreset_symbols(bwp_id)?;
        let bwp_size = grid.bwp_bounds(bwp_id)?.width();
        let rach = self.indexer.config().rach();
        let first = slot.absolute() + u64::from(rach.ra_response_window_offset);
        let last = first + u64::from(rach.ra_response_window) - 1;
        let (_, held_last) = grid.window_span();
        let pdsch_symbols = coreset..coreset + self.config.rar_symbols;

        for absolute in first..=last.min(held_last) {
            let rar_slot = SlotCoordinate::from_absolute(absolute, slot.numerology);
            if !grid.slot_type(&rar_slot).has_downlink_control() {
                continue;
            }
            let Some((time_resource, msg3_slot, msg3_start)) = self.find_msg3(&rar_slot, grid, bwp_size) else {
                continue;
            };
            let Ok(ul_grant) = RarUlGrant::for_msg3(msg3_start, self.config.msg3_rbs, bwp_size, time_resource)
            else {
                continue;
            };

            // A PDU already going out for this RA-RNTI carries one more entry
            if !bundles.contains_key(&(absolute, ra_rnti)) {
                let Some(pdsch_start) = grid.find_free_rb_range(
                    bwp_id,
                    &rar_slot,
                    pdsch_symbols.clone(),
                    self.config.rar_rbs,
                    ResourceStatus::ResponseChannel,
                ) else {
                    continue;
                };
                if let Err(e) = search_spaces.schedule_control(
                    Rnti(ra_rnti),
                    bwp_id,
                    &rar_slot,
                    self.config.aggregation_level,
                    grid,
                ) {
                    trace!("No PDCCH for RA-RNTI {} in slot {}: {}", ra_rnti, rar_slot, e);
                    continue;
                }
                if let Err(e) = grid.mark_control_resource(
                    bwp_id,
                    &rar_slot,
                    pdsch_symbols.clone(),
                    pdsch_start..pdsch_start + self.config.rar_rbs,
                    ResourceStatus::ResponseChannel,
                ) {
                    warn!("RAR PDSCH lost in slot {}: {}", rar_slot, e);
                    continue;
                }
            }

            let allocation = DEFAULT_PUSCH_TIME_ALLOCATIONS[usize::from(time_resource)];
            let symbols = allocation.start_symbol..allocation.start_symbol + allocation.length;
            if let Err(e) = grid.mark_control_resource(
                bwp_id,
                &msg3_slot,
                symbols,
                msg3_start..msg3_start + self.config.msg3_rbs,
                ResourceStatus::Msg3,
            ) {
                warn!("Msg3 region lost in slot {}: {}", msg3_slot, e);
                continue;
            }

            return Some(Placement {
                rar_slot,
                ul_grant,
                grant: UplinkGrant {
                    slot: msg3_slot,
                    start_symbol: allocation.start_symbol,
                    num_symbols: allocation.length,
                    start_rb: msg3_start,
                    num_rbs: self.config.msg3_rbs,
                    tb_size_bits: MSG3_TB_SIZE_BITS,
                },
            });
        }
        None
    }

    /// First time-domain row whose Msg3 slot is uplink, held and has room
    fn find_msg3(
        &self,
        rar_slot: &SlotCoordinate,
        grid: &ResourceGridAllocator,
        bwp_size: u16,
    ) -> Option<(u8, SlotCoordinate, u16)> {
        if self.config.msg3_rbs > bwp_size {
            return None;
        }
        let (_, held_last) = grid.window_span();
        for (row, allocation) in DEFAULT_PUSCH_TIME_ALLOCATIONS.iter().enumerate() {
            let time_resource = row as u8;
            let offset = msg3_slot_offset(time_resource, rar_slot.numerology)?;
            let msg3_slot = rar_slot.add_slots(offset);
            if msg3_slot.absolute() > held_last || !grid.slot_type(&msg3_slot).has_uplink() {
                continue;
            }
            let symbols = allocation.start_symbol..allocation.start_symbol + allocation.length;
            if let Some(start) = grid.find_free_rb_range(
                self.config.bwp_id,
                &msg3_slot,
                symbols,
                self.config.msg3_rbs,
                ResourceStatus::Msg3,
            ) {
                return Some((time_resource, msg3_slot, start));
            }
        }
        None
    }

    fn record_usage(&mut self, slot: &SlotCoordinate, mut usage: PrachUsageStats) {
        let period = slot.frame / self.indexer.config().prach().x;
        match &mut self.period {
            Some((current, stats)) if *current == period => stats.fold(&usage),
            _ => {
                if let Some((previous, stats)) = self.period.take() {
                    debug!(
                        "PRACH period {}: {} preambles, {} occasions, {} successes, {} collisions",
                        previous, stats.preambles_received, stats.occasions_used, stats.successes, stats.collisions
                    );
                    self.total.fold(&stats);
                }
                usage.periods = 1;
                self.period = Some((period, usage));
            }
        }
    }
}
