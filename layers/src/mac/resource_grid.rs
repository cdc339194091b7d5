//! Control Resource Grid
//!
//! Tracks the status of every (resource block, symbol) cell of the carrier
//! over a rolling look-ahead window of slots. Periodic reservations
//! (SSB, PRACH, CORESET, PUCCH) are applied to each slot as it enters the
//! window; dynamic claims go through [`ResourceGridAllocator::mark_control_resource`].

use super::bwp::{BwpBounds, BwpRegistry, BwpSpan};
use super::occasion::OccasionIndexer;
use crate::LayerError;
use common::slot::{slots_per_frame, SYMBOLS_PER_SLOT};
use common::types::{SlotType, TddPattern};
use common::SlotCoordinate;
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Range;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Status of one resource cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStatus {
    /// Unallocated
    Free,
    /// Uplink control (PUCCH) region
    Reserved,
    /// PRACH occasion
    Prach,
    /// SS/PBCH block
    Broadcast,
    /// Msg3 PUSCH granted in a random access response
    Msg3,
    /// PDSCH carrying a random access response
    ResponseChannel,
    /// Unused CORESET capacity
    ControlRegion,
    /// CORESET cells carrying a scheduled PDCCH
    ScheduledControl,
}

impl ResourceStatus {
    /// Whether a cell in this status may be claimed with `code`
    pub fn accepts(self, code: ResourceStatus) -> bool {
        match (self, code) {
            (_, ResourceStatus::Free) => false,
            (ResourceStatus::Free, _) => true,
            (ResourceStatus::ControlRegion, ResourceStatus::ScheduledControl) => true,
            _ => false,
        }
    }
}

/// Allocation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("Cell rb={rb} symbol={symbol} already {found:?}")]
    Conflict { symbol: u8, rb: u16, found: ResourceStatus },

    #[error("Slot {slot} outside window {first}..={last}")]
    OutsideWindow { slot: u64, first: u64, last: u64 },

    #[error("Unknown BWP {0}")]
    UnknownBwp(u8),

    #[error("Region out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Cannot allocate with status {0:?}")]
    InvalidCode(ResourceStatus),
}

/// SS/PBCH block placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// SSB periodicity in milliseconds
    pub ssb_period_ms: u32,
    /// First OFDM symbol of the block
    pub first_symbol: u8,
    /// Number of OFDM symbols
    pub num_symbols: u8,
    /// Number of resource blocks from the BWP start
    pub num_rbs: u16,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            ssb_period_ms: 10,
            first_symbol: 2,
            num_symbols: 4,
            num_rbs: 20,
        }
    }
}

/// Grid dimensions and slot structure
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Numerology µ of the carrier
    pub numerology: u8,
    /// Carrier width in resource blocks
    pub carrier_rbs: u16,
    /// Number of slots held in the look-ahead window
    pub window_slots: usize,
    /// TDD slot pattern
    pub tdd_pattern: TddPattern,
    /// SS/PBCH block placement
    pub broadcast: BroadcastConfig,
    /// Symbols at the end of UL/F slots kept for PUCCH
    pub uplink_control_symbols: u8,
}

/// Cell counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsageStats {
    pub broadcast: u64,
    pub prach: u64,
    pub response_channel: u64,
    pub scheduled_control: u64,
    pub control_region: u64,
    pub reserved: u64,
    pub msg3: u64,
    /// Non-free cells in slots without uplink
    pub used_dl: u64,
    /// Non-free cells in UL and flexible slots
    pub used_ul: u64,
    /// Free cells in slots without uplink
    pub free_dl: u64,
    /// Free cells in UL and flexible slots
    pub free_ul: u64,
    /// Slots accumulated into these counts
    pub slots_folded: u64,
}

impl ResourceUsageStats {
    /// Cells claimed dynamically
    pub fn claimed(&self) -> u64 {
        self.msg3 + self.response_channel + self.scheduled_control
    }

    pub fn used(&self) -> u64 {
        self.used_dl + self.used_ul
    }

    pub fn free(&self) -> u64 {
        self.free_dl + self.free_ul
    }

    /// Share of downlink-slot cells not free, 0 before any slot was folded
    pub fn capacity_usage_dl(&self) -> f64 {
        ratio(self.used_dl, self.used_dl + self.free_dl)
    }

    /// Share of uplink-slot cells not free
    pub fn capacity_usage_ul(&self) -> f64 {
        ratio(self.used_ul, self.used_ul + self.free_ul)
    }

    fn count_slot(grid: &SlotGrid) -> Self {
        let mut usage = Self { slots_folded: 1, ..Default::default() };
        let uplink = grid.slot_type.has_uplink();
        for status in grid.cells.iter() {
            match (status, uplink) {
                (ResourceStatus::Free, true) => usage.free_ul += 1,
                (ResourceStatus::Free, false) => usage.free_dl += 1,
                (_, true) => usage.used_ul += 1,
                (_, false) => usage.used_dl += 1,
            }
            match status {
                ResourceStatus::Free => {}
                ResourceStatus::Reserved => usage.reserved += 1,
                ResourceStatus::Prach => usage.prach += 1,
                ResourceStatus::Broadcast => usage.broadcast += 1,
                ResourceStatus::Msg3 => usage.msg3 += 1,
                ResourceStatus::ResponseChannel => usage.response_channel += 1,
                ResourceStatus::ControlRegion => usage.control_region += 1,
                ResourceStatus::ScheduledControl => usage.scheduled_control += 1,
            }
        }
        usage
    }

    fn fold(&mut self, other: &Self) {
        self.broadcast += other.broadcast;
        self.prach += other.prach;
        self.response_channel += other.response_channel;
        self.scheduled_control += other.scheduled_control;
        self.control_region += other.control_region;
        self.reserved += other.reserved;
        self.msg3 += other.msg3;
        self.used_dl += other.used_dl;
        self.used_ul += other.used_ul;
        self.free_dl += other.free_dl;
        self.free_ul += other.free_ul;
        self.slots_folded += other.slots_folded;
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Status matrix of one slot: [resource block, symbol]
#[derive(Debug, Clone)]
struct SlotGrid {
    coordinate: SlotCoordinate,
    slot_type: SlotType,
    cells: Array2<ResourceStatus>,
}

/// Reservation re-applied to every slot entering the window
#[derive(Debug, Clone)]
enum Recurrence {
    ControlRegion { bwp: u8, symbols: u8 },
    UplinkControl { bwp: u8, symbols: u8 },
    Broadcast { bwp: u8 },
    Prach { bwp: u8, indexer: OccasionIndexer },
}

/// Rectangle in carrier coordinates
#[derive(Debug, Clone)]
struct Region {
    symbols: Range<u8>,
    rbs: Range<u16>,
    status: ResourceStatus,
}

/// Owner of the rolling per-slot resource grid
pub struct ResourceGridAllocator {
    config: GridConfig,
    bwps: BwpRegistry,
    coreset_symbols: BTreeMap<u8, u8>,
    window: VecDeque<SlotGrid>,
    recurring: Vec<Recurrence>,
    reserved_bwps: BTreeSet<u8>,
    stats: ResourceUsageStats,
}

impl ResourceGridAllocator {
    /// Create a window of `config.window_slots` free slots starting at `start`
    pub fn new(config: GridConfig, start: SlotCoordinate) -> Result<Self, LayerError> {
        if config.window_slots == 0 || config.carrier_rbs == 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "Grid needs a non-empty window and carrier (window={}, rbs={})",
                config.window_slots, config.carrier_rbs
            )));
        }
        if start.numerology != config.numerology {
            return Err(LayerError::InvalidConfiguration(format!(
                "Start slot numerology {} differs from carrier numerology {}",
                start.numerology, config.numerology
            )));
        }
        if config.uplink_control_symbols >= SYMBOLS_PER_SLOT {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} uplink control symbols leave no room for data",
                config.uplink_control_symbols
            )));
        }

        let base = start.absolute();
        let mut allocator = Self {
            bwps: BwpRegistry::new(config.carrier_rbs),
            coreset_symbols: BTreeMap::new(),
            window: VecDeque::with_capacity(config.window_slots),
            recurring: Vec::new(),
            reserved_bwps: BTreeSet::new(),
            stats: ResourceUsageStats::default(),
            config,
        };
        for offset in 0..allocator.config.window_slots as u64 {
            let grid = allocator.fresh_slot(base + offset);
            allocator.window.push_back(grid);
        }

        info!(
            "Resource grid: {} RBs x {} symbols, window {} slots from {}, pattern {}",
            allocator.config.carrier_rbs,
            SYMBOLS_PER_SLOT,
            allocator.config.window_slots,
            start,
            allocator.config.tdd_pattern
        );
        Ok(allocator)
    }

    fn fresh_slot(&self, absolute: u64) -> SlotGrid {
        SlotGrid {
            coordinate: SlotCoordinate::from_absolute(absolute, self.config.numerology),
            slot_type: self.config.tdd_pattern.slot_type(absolute),
            cells: Array2::from_elem(
                (self.config.carrier_rbs as usize, SYMBOLS_PER_SLOT as usize),
                ResourceStatus::Free,
            ),
        }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Oldest slot held, i.e. the slot currently being processed
    pub fn current_slot(&self) -> SlotCoordinate {
        // window is never empty
        self.window
            .front()
            .map(|grid| grid.coordinate)
            .unwrap_or_else(|| SlotCoordinate::from_absolute(0, self.config.numerology))
    }

    /// Absolute slot range held: (first, last)
    pub fn window_span(&self) -> (u64, u64) {
        let first = self.current_slot().absolute();
        (first, first + self.window.len() as u64 - 1)
    }

    pub fn held_slots(&self) -> usize {
        self.window.len()
    }

    pub fn slot_type(&self, slot: &SlotCoordinate) -> SlotType {
        self.config.tdd_pattern.slot_type(slot.absolute())
    }

    pub fn bwp_bounds(&self, bwp_id: u8) -> Option<BwpBounds> {
        self.bwps.get(bwp_id)
    }

    pub fn coreset_symbols(&self, bwp_id: u8) -> Option<u8> {
        self.coreset_symbols.get(&bwp_id).copied()
    }

    /// Aggregated counts of every slot evicted so far
    pub fn usage(&self) -> &ResourceUsageStats {
        &self.stats
    }

    /// Status of one cell, `None` outside the window or carrier
    pub fn status(&self, slot: &SlotCoordinate, symbol: u8, carrier_rb: u16) -> Option<ResourceStatus> {
        let index = self.slot_index(slot.absolute()).ok()?;
        self.window[index]
            .cells
            .get((carrier_rb as usize, symbol as usize))
            .copied()
    }

    fn slot_index(&self, absolute: u64) -> Result<usize, AllocationError> {
        let (first, last) = self.window_span();
        if absolute < first || absolute > last {
            return Err(AllocationError::OutsideWindow { slot: absolute, first, last });
        }
        Ok((absolute - first) as usize)
    }

    /// Register a bandwidth part with its CORESET and PUCCH regions
    pub fn configure_bwp(
        &mut self,
        bwp_id: u8,
        span: BwpSpan,
        coreset_symbols: u8,
    ) -> Result<BwpBounds, LayerError> {
        if !(1..=3).contains(&coreset_symbols) {
            return Err(LayerError::InvalidConfiguration(format!(
                "CORESET duration {} not in 1..=3 symbols",
                coreset_symbols
            )));
        }
        let bounds = self.bwps.register(bwp_id, span)?;
        self.coreset_symbols.insert(bwp_id, coreset_symbols);

        let mut added = vec![Recurrence::ControlRegion { bwp: bwp_id, symbols: coreset_symbols }];
        if self.config.uplink_control_symbols > 0 {
            added.push(Recurrence::UplinkControl {
                bwp: bwp_id,
                symbols: self.config.uplink_control_symbols,
            });
        }
        self.install_recurring(added)?;
        debug!("BWP {} CORESET {} symbols", bwp_id, coreset_symbols);
        Ok(bounds)
    }

    /// Reserve SS/PBCH blocks and every PRACH occasion of `bwp_id`.
    /// Calling it again for the same bandwidth part has no effect.
    pub fn reserve_broadcast_and_random_access_resources(
        &mut self,
        bwp_id: u8,
        indexer: &OccasionIndexer,
    ) -> Result<(), LayerError> {
        if self.reserved_bwps.contains(&bwp_id) {
            debug!("Broadcast and PRACH already reserved on BWP {}", bwp_id);
            return Ok(());
        }
        let bounds = self
            .bwps
            .get(bwp_id)
            .ok_or_else(|| LayerError::InvalidConfiguration(format!("Unknown BWP {}", bwp_id)))?;

        let broadcast = self.config.broadcast;
        if broadcast.ssb_period_ms == 0
            || broadcast.num_rbs > bounds.width()
            || broadcast.num_symbols == 0
            || u16::from(broadcast.first_symbol) + u16::from(broadcast.num_symbols) > u16::from(SYMBOLS_PER_SLOT)
        {
            return Err(LayerError::InvalidConfiguration(format!(
                "SSB placement {:?} does not fit BWP {}",
                broadcast, bwp_id
            )));
        }

        let ra = indexer.config();
        if ra.numerology() != self.config.numerology {
            return Err(LayerError::InvalidConfiguration(format!(
                "PRACH numerology {} differs from carrier numerology {}",
                ra.numerology(),
                self.config.numerology
            )));
        }
        if let Some(slot) = self.prach_slot_without_uplink(indexer) {
            return Err(LayerError::InvalidConfiguration(format!(
                "PRACH occasion in slot {} which is {:?} in pattern {}",
                slot,
                self.slot_type(&slot),
                self.config.tdd_pattern
            )));
        }
        let prach_rbs = u32::from(ra.rach().msg1_frequency_start)
            + u32::from(ra.rach().msg1_fdm) * u32::from(ra.prach().format.rbs_per_occasion());
        if prach_rbs > u32::from(bounds.width()) {
            return Err(LayerError::InvalidConfiguration(format!(
                "PRACH occasions need {} RBs, BWP {} has {}",
                prach_rbs,
                bwp_id,
                bounds.width()
            )));
        }

        self.install_recurring(vec![
            Recurrence::Broadcast { bwp: bwp_id },
            Recurrence::Prach { bwp: bwp_id, indexer: indexer.clone() },
        ])?;
        self.reserved_bwps.insert(bwp_id);
        info!(
            "Reserved SSB every {} ms and {} PRACH occasions per period on BWP {}",
            broadcast.ssb_period_ms,
            indexer.total_occasions(),
            bwp_id
        );
        Ok(())
    }

    /// First PRACH slot of the combined PRACH and TDD period that carries no uplink
    fn prach_slot_without_uplink(&self, indexer: &OccasionIndexer) -> Option<SlotCoordinate> {
        let numerology = self.config.numerology;
        let prach_period = u64::from(indexer.config().prach().x) * u64::from(slots_per_frame(numerology));
        let pattern_period = self.config.tdd_pattern.period() as u64;
        let span = prach_period / gcd(prach_period, pattern_period) * pattern_period;
        (0..span)
            .map(|absolute| SlotCoordinate::from_absolute(absolute, numerology))
            .find(|slot| indexer.has_prach(slot) && !self.slot_type(slot).has_uplink())
    }

    fn install_recurring(&mut self, added: Vec<Recurrence>) -> Result<(), LayerError> {
        for recurrence in &added {
            for index in 0..self.window.len() {
                let regions = self.recurring_regions(recurrence, &self.window[index])?;
                let coordinate = self.window[index].coordinate;
                for region in regions {
                    apply_recurring(&mut self.window[index], &region).map_err(|e| {
                        LayerError::InvalidConfiguration(format!(
                            "Periodic reservations overlap in slot {}: {}",
                            coordinate, e
                        ))
                    })?;
                }
            }
        }
        self.recurring.extend(added);
        Ok(())
    }

    fn recurring_regions(&self, recurrence: &Recurrence, grid: &SlotGrid) -> Result<Vec<Region>, LayerError> {
        let bounds_of = |bwp: u8| {
            self.bwps
                .get(bwp)
                .ok_or_else(|| LayerError::InvalidConfiguration(format!("Unknown BWP {}", bwp)))
        };
        let mut regions = Vec::new();

        match recurrence {
            Recurrence::ControlRegion { bwp, symbols } => {
                if grid.slot_type.has_downlink_control() {
                    let bounds = bounds_of(*bwp)?;
                    regions.push(Region {
                        symbols: 0..*symbols,
                        rbs: bounds.lower..bounds.upper + 1,
                        status: ResourceStatus::ControlRegion,
                    });
                }
            }
            Recurrence::UplinkControl { bwp, symbols } => {
                if grid.slot_type.has_uplink() {
                    let bounds = bounds_of(*bwp)?;
                    regions.push(Region {
                        symbols: SYMBOLS_PER_SLOT - *symbols..SYMBOLS_PER_SLOT,
                        rbs: bounds.lower..bounds.upper + 1,
                        status: ResourceStatus::Reserved,
                    });
                }
            }
            Recurrence::Broadcast { bwp } => {
                let broadcast = self.config.broadcast;
                let period = common::time::slots_for_ms(u64::from(broadcast.ssb_period_ms), self.config.numerology);
                if grid.coordinate.absolute() % period == 0 {
                    let bounds = bounds_of(*bwp)?;
                    regions.push(Region {
                        symbols: broadcast.first_symbol..broadcast.first_symbol + broadcast.num_symbols,
                        rbs: bounds.lower..bounds.lower + broadcast.num_rbs,
                        status: ResourceStatus::Broadcast,
                    });
                }
            }
            Recurrence::Prach { bwp, indexer } => {
                let occasions = indexer.occasions_in_slot(&grid.coordinate);
                if !occasions.is_empty() {
                    let bounds = bounds_of(*bwp)?;
                    let ra = indexer.config();
                    let width = ra.prach().format.rbs_per_occasion();
                    for occasion in occasions {
                        let position = indexer
                            .decompose(occasion)
                            .map_err(|e| LayerError::InvalidConfiguration(e.to_string()))?;
                        let first_rb = bounds.lower
                            + ra.rach().msg1_frequency_start
                            + u16::from(position.frequency_index) * width;
                        regions.push(Region {
                            symbols: position.symbol_start..position.symbol_start + ra.prach().duration,
                            rbs: first_rb..first_rb + width,
                            status: ResourceStatus::Prach,
                        });
                    }
                }
            }
        }
        Ok(regions)
    }

    /// Claim a rectangular region of a bandwidth part.
    ///
    /// Nothing is marked unless every target cell accepts `code`.
    pub fn mark_control_resource(
        &mut self,
        bwp_id: u8,
        slot: &SlotCoordinate,
        symbols: Range<u8>,
        rbs: Range<u16>,
        code: ResourceStatus,
    ) -> Result<(), AllocationError> {
        let (index, carrier_rbs) = self.check_region(bwp_id, slot, symbols.clone(), rbs, code)?;
        self.window[index]
            .cells
            .slice_mut(s![
                carrier_rbs.start as usize..carrier_rbs.end as usize,
                symbols.start as usize..symbols.end as usize
            ])
            .fill(code);
        trace!(
            "Marked {:?} in slot {}: symbols {:?}, carrier RBs {:?}",
            code,
            slot,
            symbols,
            carrier_rbs
        );
        Ok(())
    }

    /// Whether [`mark_control_resource`](Self::mark_control_resource) would succeed
    pub fn is_region_available(
        &self,
        bwp_id: u8,
        slot: &SlotCoordinate,
        symbols: Range<u8>,
        rbs: Range<u16>,
        code: ResourceStatus,
    ) -> Result<(), AllocationError> {
        self.check_region(bwp_id, slot, symbols, rbs, code).map(|_| ())
    }

    /// Lowest BWP-relative start RB of `num_rbs` consecutive blocks claimable with `code`
    pub fn find_free_rb_range(
        &self,
        bwp_id: u8,
        slot: &SlotCoordinate,
        symbols: Range<u8>,
        num_rbs: u16,
        code: ResourceStatus,
    ) -> Option<u16> {
        let width = self.bwps.get(bwp_id)?.width();
        if num_rbs == 0 || num_rbs > width {
            return None;
        }
        (0..=width - num_rbs).find(|&start| {
            self.check_region(bwp_id, slot, symbols.clone(), start..start + num_rbs, code)
                .is_ok()
        })
    }

    fn check_region(
        &self,
        bwp_id: u8,
        slot: &SlotCoordinate,
        symbols: Range<u8>,
        rbs: Range<u16>,
        code: ResourceStatus,
    ) -> Result<(usize, Range<u16>), AllocationError> {
        if code == ResourceStatus::Free {
            return Err(AllocationError::InvalidCode(code));
        }
        if symbols.start >= symbols.end || symbols.end > SYMBOLS_PER_SLOT {
            return Err(AllocationError::OutOfBounds(format!("symbols {:?}", symbols)));
        }
        let carrier_rbs = self.bwps.to_carrier(bwp_id, rbs)?;
        let index = self.slot_index(slot.absolute())?;
        let cells = &self.window[index].cells;

        for rb in carrier_rbs.clone() {
            for symbol in symbols.clone() {
                let found = cells[(rb as usize, symbol as usize)];
                if !found.accepts(code) {
                    return Err(AllocationError::Conflict { symbol, rb, found });
                }
            }
        }
        Ok((index, carrier_rbs))
    }

    /// Retire the current slot: fold its counts into the aggregates and
    /// bring the next future slot into the window
    pub fn advance_window(&mut self) -> ResourceUsageStats {
        let (first, last) = self.window_span();
        let departing = self.window.pop_front().map(|grid| ResourceUsageStats::count_slot(&grid));
        let usage = departing.unwrap_or_default();
        self.stats.fold(&usage);

        let mut grid = self.fresh_slot(last + 1);
        for recurrence in &self.recurring {
            let regions = match self.recurring_regions(recurrence, &grid) {
                Ok(regions) => regions,
                Err(e) => {
                    warn!("Skipping periodic reservation in slot {}: {}", grid.coordinate, e);
                    continue;
                }
            };
            for region in regions {
                if let Err(e) = apply_recurring(&mut grid, &region) {
                    warn!("Periodic {:?} not applied in slot {}: {}", region.status, grid.coordinate, e);
                }
            }
        }
        self.window.push_back(grid);

        trace!("Window advanced past slot {}: claimed={}, free={}", first, usage.claimed(), usage.free());
        usage
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Mark a periodic region; cells already carrying the same status are left as they are
fn apply_recurring(grid: &mut SlotGrid, region: &Region) -> Result<(), AllocationError> {
    let mut view = grid.cells.slice_mut(s![
        region.rbs.start as usize..region.rbs.end as usize,
        region.symbols.start as usize..region.symbols.end as usize
    ]);
    for ((rb, symbol), found) in view.indexed_iter() {
        if *found != ResourceStatus::Free && *found != region.status {
            return Err(AllocationError::Conflict {
                symbol: region.symbols.start + symbol as u8,
                rb: region.rbs.start + rb as u16,
                found: *found,
            });
        }
    }
    view.fill(region.status);
    Ok(())
}
