//! Random Access Simulation
//!
//! Drives one cell and its terminals on the virtual-time event queue. Each
//! slot event runs the terminals' slot handlers, hands the detected
//! preambles to the MAC, schedules PDCCHs of admitted terminals and resolves
//! the slot before the grid moves on.

use crate::config::SimConfig;
use common::types::{Rnti, UeId};
use common::{EventId, EventQueue, SlotCoordinate};
use interfaces::{
    DownlinkRar, PreambleReception, PreambleTransmission, RaConnectionSap, RaFailure, RaPhySap, RaSuccess, RaTimer,
    RaTimerSap, RntiPool, TimerId,
};
use layers::mac::{
    ControlScheduleError, GnbMac, PrachUsageStats, RaEvent, RaInput, RaMode, RaState, ResourceUsageStats,
    TerminalRandomAccessProcedure,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};

/// Simulation events
#[derive(Debug, Clone)]
enum SimEvent {
    Slot,
    UeStart(usize),
    UeTimer { ue: usize, timer: RaTimer },
    Rar(DownlinkRar),
    Release(Rnti),
}

type Queue = Rc<RefCell<EventQueue<SimEvent>>>;

/// Shared uplink: preambles sent this slot, minus the ones the base station misses
struct Air {
    rng: ChaCha8Rng,
    loss_probability: f64,
    detected: Vec<PreambleReception>,
    sent: u64,
    lost: u64,
}

/// Terminal PHY handle on the shared uplink
struct LossyPhy(Rc<RefCell<Air>>);

impl RaPhySap for LossyPhy {
    fn send_preamble(&mut self, transmission: PreambleTransmission) {
        let mut air = self.0.borrow_mut();
        air.sent += 1;
        let loss_probability = air.loss_probability;
        if loss_probability > 0.0 && air.rng.gen_bool(loss_probability) {
            trace!("Preamble of {} lost in slot {}", transmission.ue, transmission.slot);
            air.lost += 1;
            return;
        }
        air.detected.push(transmission.to_reception());
    }
}

/// Terminal timers on the simulation queue
struct QueueTimers {
    ue: usize,
    queue: Queue,
}

impl RaTimerSap for QueueTimers {
    fn schedule(&mut self, at_slot: u64, timer: RaTimer) -> TimerId {
        let id = self.queue.borrow_mut().schedule_at(at_slot, SimEvent::UeTimer { ue: self.ue, timer });
        TimerId(id.0)
    }

    fn cancel(&mut self, id: TimerId) -> bool {
        self.queue.borrow_mut().cancel(EventId(id.0))
    }
}

/// Final outcome of one terminal
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Success { tc_rnti: u16, preamble_transmissions: u8, slot: u64 },
    Failure { preamble_transmissions: u8, slot: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OutcomeRecord {
    pub ue: u64,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Connection manager collecting outcomes
#[derive(Default)]
struct Ledger {
    outcomes: Vec<OutcomeRecord>,
    admissions: Vec<Rnti>,
}

struct LedgerHandle(Rc<RefCell<Ledger>>);

impl RaConnectionSap for LedgerHandle {
    fn random_access_succeeded(&mut self, ue: UeId, success: RaSuccess) {
        let mut ledger = self.0.borrow_mut();
        ledger.outcomes.push(OutcomeRecord {
            ue: ue.0,
            outcome: Outcome::Success {
                tc_rnti: success.tc_rnti.value(),
                preamble_transmissions: success.preamble_transmissions,
                slot: success.completed_at.absolute(),
            },
        });
        ledger.admissions.push(success.tc_rnti);
    }

    fn random_access_failed(&mut self, ue: UeId, failure: RaFailure) {
        self.0.borrow_mut().outcomes.push(OutcomeRecord {
            ue: ue.0,
            outcome: Outcome::Failure {
                preamble_transmissions: failure.preamble_transmissions,
                slot: failure.failed_at.absolute(),
            },
        });
    }
}

/// Statistics of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub slots: u64,
    pub terminals: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub unfinished: usize,
    pub preambles_sent: u64,
    pub preambles_lost: u64,
    /// Mean preamble transmissions of successful terminals
    pub mean_transmissions: f64,
    /// Mean time from arrival to the RAR in milliseconds, successful terminals only
    pub mean_access_delay_ms: f64,
    /// Share of non-free cells in downlink slots
    pub capacity_usage_dl: f64,
    /// Share of non-free cells in uplink slots
    pub capacity_usage_ul: f64,
    pub pdcch_allocated: u64,
    pub pdcch_blocked: u64,
    pub prach: PrachUsageStats,
    pub resources: ResourceUsageStats,
    pub outcomes: Vec<OutcomeRecord>,
}

/// One cell with its terminals
pub struct Simulation {
    config: SimConfig,
    numerology: u8,
    mac: GnbMac,
    ues: Vec<TerminalRandomAccessProcedure>,
    arrivals: Vec<u64>,
    queue: Queue,
    air: Rc<RefCell<Air>>,
    ledger: Rc<RefCell<Ledger>>,
    /// Admitted terminals and their admission slot
    connected: BTreeMap<Rnti, u64>,
    end_slot: u64,
    pdcch_allocated: u64,
    pdcch_blocked: u64,
}

impl Simulation {
    pub fn new(config: SimConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let numerology = config.numerology()?;
        let mac = GnbMac::new(config.mac_config()?, Box::new(RntiPool::default()))?;
        let sim = &config.simulation;

        let mut rng = ChaCha8Rng::seed_from_u64(sim.seed);
        let queue: Queue = Rc::new(RefCell::new(EventQueue::new()));
        let air = Rc::new(RefCell::new(Air {
            rng: ChaCha8Rng::seed_from_u64(rng.gen()),
            loss_probability: sim.preamble_loss_probability,
            detected: Vec::new(),
            sent: 0,
            lost: 0,
        }));
        let ledger = Rc::new(RefCell::new(Ledger::default()));

        let end_slot = common::time::slots_for_ms(sim.duration_ms, numerology);
        let spread = common::time::slots_for_ms(sim.arrival_spread_ms, numerology).max(1);
        let rach = mac.indexer().config().rach();
        let dedicated = rach.total_num_ra_preambles - rach.cb_preambles_per_occasion;
        let total_occasions = mac.indexer().total_occasions();

        let mut ues = Vec::with_capacity(sim.num_ues);
        let mut arrivals = Vec::with_capacity(sim.num_ues);
        for i in 0..sim.num_ues {
            let procedure = TerminalRandomAccessProcedure::new(
                UeId(i as u64),
                mac.indexer().clone(),
                mac.ra_bwp_size(),
                rng.gen(),
                Box::new(LossyPhy(air.clone())),
                Box::new(QueueTimers { ue: i, queue: queue.clone() }),
                Box::new(LedgerHandle(ledger.clone())),
            );
            ues.push(procedure);

            let arrival = rng.gen_range(0..spread);
            arrivals.push(arrival);
            queue.borrow_mut().schedule_at(arrival, SimEvent::UeStart(i));
        }
        queue.borrow_mut().schedule_at(0, SimEvent::Slot);

        info!(
            "Simulating {} terminals ({} contention-free) for {} slots of {} us, {} dedicated preambles, {} occasions per PRACH period",
            sim.num_ues,
            sim.contention_free_ues,
            end_slot,
            common::time::slot_duration_us(numerology),
            dedicated,
            total_occasions
        );

        Ok(Self {
            numerology,
            mac,
            ues,
            arrivals,
            queue,
            air,
            ledger,
            connected: BTreeMap::new(),
            end_slot,
            pdcch_allocated: 0,
            pdcch_blocked: 0,
            config,
        })
    }

    /// Run to the configured end or until `stop` is raised
    pub fn run(mut self, stop: &AtomicBool) -> SimulationReport {
        loop {
            let next_time = self.queue.borrow_mut().peek_time();
            match next_time {
                Some(at) if at < self.end_slot => {}
                _ => break,
            }
            let next = self.queue.borrow_mut().pop();
            let Some((now, event)) = next else {
                break;
            };
            if stop.load(Ordering::Relaxed) {
                warn!("Simulation stopped at slot {}", now);
                break;
            }
            self.dispatch(now, event);
            self.admit_new_terminals(now);
        }
        debug!("{} events left in the queue", self.queue.borrow().len());
        self.report()
    }

    fn slot(&self, absolute: u64) -> SlotCoordinate {
        SlotCoordinate::from_absolute(absolute, self.numerology)
    }

    fn dispatch(&mut self, now: u64, event: SimEvent) {
        match event {
            SimEvent::Slot => self.on_slot(now),
            SimEvent::UeStart(ue) => {
                let mode = self.mode_for(ue);
                self.ues[ue].handle(RaInput::Start(mode));
            }
            SimEvent::UeTimer { ue, timer } => {
                let slot = self.slot(now);
                self.ues[ue].handle(RaInput::Timer { timer, now: slot });
            }
            SimEvent::Rar(rar) => {
                for ue in self.ues.iter_mut() {
                    if matches!(ue.state(), RaState::PreambleSent(pending) if pending.ra_rnti == rar.ra_rnti) {
                        ue.handle(RaInput::RarReceived(rar.clone()));
                    }
                }
            }
            SimEvent::Release(rnti) => {
                self.connected.remove(&rnti);
                self.mac.release_terminal(rnti);
            }
        }
    }

    /// Dedicated preambles go to the first terminals, one per dedicated index
    fn mode_for(&self, ue: usize) -> RaMode {
        if ue >= self.config.simulation.contention_free_ues {
            return RaMode::ContentionBased;
        }
        let rach = self.mac.indexer().config().rach();
        let dedicated = usize::from(rach.total_num_ra_preambles - rach.cb_preambles_per_occasion);
        let total_occasions = usize::from(self.mac.indexer().total_occasions());
        RaMode::ContentionFree {
            preamble_id: rach.cb_preambles_per_occasion + (ue % dedicated) as u8,
            occasion_index: ((ue / dedicated) % total_occasions) as u16,
        }
    }

    fn on_slot(&mut self, now: u64) {
        let slot = self.slot(now);
        if self.mac.current_slot() != slot {
            warn!("MAC at slot {} while simulating {}", self.mac.current_slot(), slot);
        }

        for ue in self.ues.iter_mut() {
            ue.handle(RaInput::Slot(slot));
        }
        let detected = std::mem::take(&mut self.air.borrow_mut().detected);
        for reception in detected {
            self.mac.receive_preamble(reception);
        }

        // One PDCCH per admitted terminal and monitoring period, as late in the period as possible
        let aggregation_level = self.config.simulation.aggregation_level;
        let period = u64::from(self.config.simulation.search_space.slot_periodicity);
        let deadline = slot.add_slots(period - 1);
        for (&rnti, &admitted) in self.connected.iter() {
            if !matches!(now.checked_sub(admitted), Some(elapsed) if elapsed % period == 0) {
                continue;
            }
            match self.mac.schedule_pdcch(rnti, &deadline, aggregation_level) {
                Ok(_) => self.pdcch_allocated += 1,
                Err(ControlScheduleError::NoControlResource(_)) => self.pdcch_blocked += 1,
                Err(e) => trace!("No PDCCH for {} up to slot {}: {}", rnti, deadline, e),
            }
        }

        let resolution = self.mac.end_of_slot();
        for event in &resolution.events {
            match event {
                RaEvent::Collision { key, contenders, .. } => {
                    debug!("Slot {}: {} terminals collided on {:?}", slot, contenders, key)
                }
                RaEvent::Exhausted { key, reason } => debug!("Slot {}: {:?} for {:?}", slot, reason, key),
                RaEvent::Success { .. } => {}
            }
        }
        let mut queue = self.queue.borrow_mut();
        for rar in resolution.responses {
            queue.schedule_at(rar.slot.absolute(), SimEvent::Rar(rar));
        }
        if now + 1 < self.end_slot {
            queue.schedule_in(1, SimEvent::Slot);
        }
    }

    fn admit_new_terminals(&mut self, now: u64) {
        let admissions = std::mem::take(&mut self.ledger.borrow_mut().admissions);
        let hold = common::time::slots_for_ms(self.config.simulation.connected_hold_ms, self.numerology);
        for rnti in admissions {
            self.mac.admit_terminal(rnti, self.config.simulation.search_space);
            // PDCCH placement starts with the next slot
            self.connected.insert(rnti, now + 1);
            self.queue.borrow_mut().schedule_in(hold.max(1), SimEvent::Release(rnti));
        }
    }

    fn report(self) -> SimulationReport {
        let ledger = self.ledger.borrow();
        let air = self.air.borrow();
        let mut succeeded = 0;
        let mut failed = 0;
        let mut transmissions = 0u64;
        let mut delay_slots = 0u64;
        for record in &ledger.outcomes {
            match record.outcome {
                Outcome::Success { preamble_transmissions, slot, .. } => {
                    succeeded += 1;
                    transmissions += u64::from(preamble_transmissions);
                    delay_slots += slot.saturating_sub(self.arrivals[record.ue as usize]);
                }
                Outcome::Failure { .. } => failed += 1,
            }
        }
        let mean = |total: f64| if succeeded == 0 { 0.0 } else { total / succeeded as f64 };

        let report = SimulationReport {
            seed: self.config.simulation.seed,
            slots: self.mac.usage().slots_folded,
            terminals: self.ues.len(),
            succeeded,
            failed,
            unfinished: self.ues.len() - succeeded - failed,
            preambles_sent: air.sent,
            preambles_lost: air.lost,
            mean_transmissions: mean(transmissions as f64),
            mean_access_delay_ms: mean(common::time::ms_for_slots(delay_slots, self.numerology)),
            capacity_usage_dl: self.mac.usage().capacity_usage_dl(),
            capacity_usage_ul: self.mac.usage().capacity_usage_ul(),
            pdcch_allocated: self.pdcch_allocated,
            pdcch_blocked: self.pdcch_blocked,
            prach: self.mac.prach_usage(),
            resources: *self.mac.usage(),
            outcomes: ledger.outcomes.clone(),
        };
        info!(
            "{} of {} terminals succeeded, {} failed, {} collisions, {} preambles lost",
            report.succeeded, report.terminals, report.failed, report.prach.collisions, report.preambles_lost
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(num_ues: usize, seed: u64) -> SimConfig {
        let mut config = SimConfig::default();
        config.simulation.num_ues = num_ues;
        config.simulation.seed = seed;
        config.simulation.duration_ms = 400;
        config
    }

    fn run(config: SimConfig) -> SimulationReport {
        Simulation::new(config).unwrap().run(&AtomicBool::new(false))
    }

    #[test]
    fn test_single_terminal_succeeds_first_time() {
        let report = run(config(1, 3));
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.mean_transmissions, 1.0);
        assert_eq!(report.prach.collisions, 0);
        assert_eq!(report.slots, 800);
        assert!(report.resources.msg3 > 0);
        assert!(report.pdcch_allocated > 0);
        assert!(report.capacity_usage_dl > 0.0 && report.capacity_usage_dl < 1.0);
        assert!(report.capacity_usage_ul > 0.0 && report.capacity_usage_ul < 1.0);
        assert_eq!(report.capacity_usage_ul, report.resources.capacity_usage_ul());
    }

    #[test]
    fn test_same_seed_same_report() {
        let first = run(config(30, 9));
        let second = run(config(30, 9));
        assert_eq!(first, second);
        assert_eq!(first.succeeded + first.failed + first.unfinished, 30);
    }

    #[test]
    fn test_crowd_collides_and_recovers() {
        let mut config = config(40, 5);
        config.simulation.arrival_spread_ms = 1;
        config.prach.rach.cb_preambles_per_occasion = 4;
        config.prach.rach.total_num_ra_preambles = 4;
        config.prach.rach.backoff_window_slots = 40;
        let report = run(config);
        assert!(report.prach.collisions > 0);
        assert!(report.succeeded > 0);
        assert!(report.mean_transmissions >= 1.0);
    }

    #[test]
    fn test_lossy_uplink_fails_terminals() {
        let mut config = config(5, 2);
        config.simulation.preamble_loss_probability = 1.0;
        config.prach.rach.preamble_trans_max = 2;
        let report = run(config);
        assert_eq!(report.failed, 5);
        assert_eq!(report.preambles_lost, 10);
        assert_eq!(report.prach.preambles_received, 0);
    }

    #[test]
    fn test_contention_free_terminals_never_collide() {
        let mut config = config(8, 4);
        config.simulation.contention_free_ues = 8;
        config.prach.rach.cb_preambles_per_occasion = 48;
        let report = run(config);
        assert_eq!(report.succeeded, 8);
        assert_eq!(report.prach.collisions, 0);
        assert!(report.outcomes.iter().all(|record| matches!(
            record.outcome,
            Outcome::Success { preamble_transmissions: 1, .. }
        )));
    }

    #[test]
    fn test_stop_flag_ends_run() {
        let report = Simulation::new(config(3, 1)).unwrap().run(&AtomicBool::new(true));
        assert_eq!(report.slots, 0);
        assert_eq!(report.unfinished, 3);
    }
}
