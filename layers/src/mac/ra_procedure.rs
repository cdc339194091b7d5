//! Terminal Random Access Procedure
//!
//! UE side of 3GPP TS 38.321 Section 5.1: occasion and preamble selection,
//! the RAR window, retransmission with backoff and the transmission limit.
//! All inputs go through [`TerminalRandomAccessProcedure::handle`].

use super::occasion::OccasionIndexer;
use super::rar::{backoff_ms, RarPdu};
use common::types::UeId;
use common::SlotCoordinate;
use interfaces::{
    DownlinkRar, PreambleTransmission, RaConnectionSap, RaFailure, RaFailureCause, RaPhySap, RaSuccess, RaTimer,
    RaTimerSap, TimerId,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, trace, warn};

/// How the terminal picks preamble and occasion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaMode {
    /// Random preamble and occasion on every attempt
    ContentionBased,
    /// Dedicated preamble and occasion assigned by the network
    ContentionFree { preamble_id: u8, occasion_index: u16 },
}

/// Preamble waiting for its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAttempt {
    /// Transmission number, starting at 1
    pub attempt: u8,
    pub occasion_index: u16,
    pub preamble_id: u8,
    pub ra_rnti: u16,
    pub sent_at: SlotCoordinate,
    pub window_open: bool,
    window_timer: TimerId,
    timeout_timer: TimerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaState {
    Idle,
    /// Waiting for an eligible PRACH occasion
    OccasionPending,
    PreambleSent(PendingAttempt),
    /// Backing off until the given absolute slot
    TimedOut { retry_at: u64 },
    /// Contention-free retransmission on the assigned occasion
    FixedRetry,
    Succeeded(RaSuccess),
    Failed(RaFailure),
}

/// Everything that drives the procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaInput {
    Start(RaMode),
    /// Beginning of a slot
    Slot(SlotCoordinate),
    Timer { timer: RaTimer, now: SlotCoordinate },
    RarReceived(DownlinkRar),
}

/// Per-terminal random access state machine
pub struct TerminalRandomAccessProcedure {
    ue: UeId,
    indexer: OccasionIndexer,
    bwp_size: u16,
    mode: RaMode,
    state: RaState,
    transmissions: u8,
    /// Backoff from the latest Backoff Indicator received
    backoff_ms: Option<u32>,
    rng: ChaCha8Rng,
    phy: Box<dyn RaPhySap>,
    timers: Box<dyn RaTimerSap>,
    upper: Box<dyn RaConnectionSap>,
}

impl TerminalRandomAccessProcedure {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ue: UeId,
        indexer: OccasionIndexer,
        bwp_size: u16,
        seed: u64,
        phy: Box<dyn RaPhySap>,
        timers: Box<dyn RaTimerSap>,
        upper: Box<dyn RaConnectionSap>,
    ) -> Self {
        Self {
            ue,
            indexer,
            bwp_size,
            mode: RaMode::ContentionBased,
            state: RaState::Idle,
            transmissions: 0,
            backoff_ms: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
            phy,
            timers,
            upper,
        }
    }

    pub fn ue(&self) -> UeId {
        self.ue
    }

    pub fn state(&self) -> &RaState {
        &self.state
    }

    pub fn mode(&self) -> RaMode {
        self.mode
    }

    /// Preamble transmissions of the current procedure
    pub fn transmissions(&self) -> u8 {
        self.transmissions
    }

    pub fn handle(&mut self, input: RaInput) {
        match input {
            RaInput::Start(mode) => self.start(mode),
            RaInput::Slot(slot) => self.on_slot(&slot),
            RaInput::Timer { timer: RaTimer::WindowOpen { attempt }, .. } => self.on_window_open(attempt),
            RaInput::Timer { timer: RaTimer::ResponseTimeout { attempt }, now } => {
                self.on_response_timeout(attempt, &now)
            }
            RaInput::RarReceived(rar) => self.on_rar(&rar),
        }
    }

    fn start(&mut self, mode: RaMode) {
        if !matches!(self.state, RaState::Idle | RaState::Succeeded(_) | RaState::Failed(_)) {
            warn!("{}: random access already running in {:?}", self.ue, self.state);
            return;
        }
        if let RaMode::ContentionFree { preamble_id, occasion_index } = mode {
            if preamble_id >= self.indexer.config().rach().total_num_ra_preambles
                || occasion_index >= self.indexer.total_occasions()
            {
                warn!(
                    "{}: invalid dedicated preamble {} / occasion {}",
                    self.ue, preamble_id, occasion_index
                );
                return;
            }
        }
        debug!("{}: starting {:?} random access", self.ue, mode);
        self.mode = mode;
        self.transmissions = 0;
        self.backoff_ms = None;
        self.state = RaState::OccasionPending;
    }

    fn on_slot(&mut self, slot: &SlotCoordinate) {
        match self.state {
            RaState::TimedOut { retry_at } if slot.absolute() >= retry_at => {
                self.state = RaState::OccasionPending;
                self.try_transmit(slot);
            }
            RaState::OccasionPending | RaState::FixedRetry => self.try_transmit(slot),
            _ => {}
        }
    }

    /// Send a preamble if the slot has an eligible occasion, otherwise wait
    fn try_transmit(&mut self, slot: &SlotCoordinate) {
        let occasions = self.indexer.occasions_in_slot(slot);
        let (occasion_index, preamble_id) = match self.mode {
            RaMode::ContentionBased => {
                if occasions.is_empty() {
                    return;
                }
                let occasion = occasions[self.rng.gen_range(0..occasions.len())];
                let preambles = self.indexer.config().rach().cb_preambles_per_occasion;
                (occasion, self.rng.gen_range(0..preambles))
            }
            RaMode::ContentionFree { preamble_id, occasion_index } => {
                if !occasions.contains(&occasion_index) {
                    return;
                }
                (occasion_index, preamble_id)
            }
        };

        let carrier = self.indexer.config().rach().ul_carrier;
        let (ra_rnti, (frequency_occasion, time_occasion)) = match self
            .indexer
            .access_identifier_for(occasion_index, carrier)
            .and_then(|ra_rnti| Ok((ra_rnti, self.indexer.split(occasion_index)?)))
        {
            Ok(values) => values,
            Err(e) => {
                warn!("{}: occasion {} unusable: {}", self.ue, occasion_index, e);
                return;
            }
        };

        self.transmissions += 1;
        let attempt = self.transmissions;
        self.phy.send_preamble(PreambleTransmission {
            ue: self.ue,
            slot: *slot,
            occasion_index,
            frequency_occasion,
            time_occasion,
            preamble_id,
            ra_rnti,
            carrier,
        });

        let rach = self.indexer.config().rach();
        let open_at = slot.absolute() + u64::from(rach.ra_response_window_offset);
        let close_at = open_at + u64::from(rach.ra_response_window);
        let window_timer = self.timers.schedule(open_at, RaTimer::WindowOpen { attempt });
        let timeout_timer = self.timers.schedule(close_at, RaTimer::ResponseTimeout { attempt });

        trace!(
            "{}: preamble {} on occasion {} (RA-RNTI {}) in slot {}, attempt {}",
            self.ue,
            preamble_id,
            occasion_index,
            ra_rnti,
            slot,
            attempt
        );
        self.state = RaState::PreambleSent(PendingAttempt {
            attempt,
            occasion_index,
            preamble_id,
            ra_rnti,
            sent_at: *slot,
            window_open: false,
            window_timer,
            timeout_timer,
        });
    }

    fn on_window_open(&mut self, attempt: u8) {
        match &mut self.state {
            RaState::PreambleSent(pending) if pending.attempt == attempt => pending.window_open = true,
            _ => trace!("{}: stale window timer for attempt {}", self.ue, attempt),
        }
    }

    fn on_response_timeout(&mut self, attempt: u8, now: &SlotCoordinate) {
        let pending = match self.state {
            RaState::PreambleSent(pending) if pending.attempt == attempt => pending,
            _ => {
                trace!("{}: stale response timer for attempt {}", self.ue, attempt);
                return;
            }
        };
        self.timers.cancel(pending.window_timer);

        let rach = self.indexer.config().rach();
        let (trans_max, backoff_window_slots) = (rach.preamble_trans_max, rach.backoff_window_slots);
        if self.transmissions >= trans_max {
            let failure = RaFailure {
                cause: RaFailureCause::MaxTransmissionsReached,
                preamble_transmissions: self.transmissions,
                failed_at: *now,
            };
            info!("{}: random access failed after {} preambles", self.ue, self.transmissions);
            self.state = RaState::Failed(failure);
            self.upper.random_access_failed(self.ue, failure);
            return;
        }

        self.state = match self.mode {
            RaMode::ContentionBased => {
                let window = match self.backoff_ms {
                    Some(ms) => u64::from(ms) * u64::from(now.slots_per_subframe()),
                    None => u64::from(backoff_window_slots),
                };
                let delay = if window == 0 { 0 } else { self.rng.gen_range(0..=window) };
                debug!("{}: no response to attempt {}, backoff {} slots", self.ue, attempt, delay);
                if delay == 0 {
                    RaState::OccasionPending
                } else {
                    RaState::TimedOut { retry_at: now.absolute() + delay }
                }
            }
            RaMode::ContentionFree { .. } => {
                debug!("{}: no response to attempt {}, retrying on the same occasion", self.ue, attempt);
                RaState::FixedRetry
            }
        };
    }

    fn on_rar(&mut self, rar: &DownlinkRar) {
        let RaState::PreambleSent(pending) = self.state else {
            return;
        };
        if !pending.window_open || rar.ra_rnti != pending.ra_rnti {
            trace!("{}: ignoring RAR for RA-RNTI {} in slot {}", self.ue, rar.ra_rnti, rar.slot);
            return;
        }
        let pdu = match RarPdu::decode(&rar.payload) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("{}: undecodable RAR in slot {}: {}", self.ue, rar.slot, e);
                return;
            }
        };
        if let Some(indicator) = pdu.backoff_indicator {
            self.backoff_ms = backoff_ms(indicator);
        }
        let Some(entry) = pdu.find(pending.preamble_id) else {
            trace!("{}: RAR without preamble {}", self.ue, pending.preamble_id);
            return;
        };
        let grant = match entry.uplink_grant(&rar.slot, self.bwp_size) {
            Ok(grant) => grant,
            Err(e) => {
                warn!("{}: unusable RAR grant: {}", self.ue, e);
                return;
            }
        };

        self.timers.cancel(pending.window_timer);
        self.timers.cancel(pending.timeout_timer);
        let success = RaSuccess {
            tc_rnti: entry.tc_rnti,
            grant,
            timing_advance: entry.timing_advance,
            preamble_transmissions: self.transmissions,
            completed_at: rar.slot,
        };
        info!(
            "{}: random access succeeded after {} preamble(s), TC-RNTI {}, Msg3 in slot {}",
            self.ue, self.transmissions, entry.tc_rnti, grant.slot
        );
        self.state = RaState::Succeeded(success);
        self.upper.random_access_succeeded(self.ue, success);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::prach_config::{RaConfiguration, RachConfigCommon};
    use crate::mac::rar::{RarEntry, RarUlGrant};
    use common::types::Rnti;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<PreambleTransmission>,
        timers: Vec<(u64, RaTimer, TimerId)>,
        cancelled: BTreeSet<TimerId>,
        successes: Vec<RaSuccess>,
        failures: Vec<RaFailure>,
    }

    type Shared = Rc<RefCell<Recorder>>;

    struct Phy(Shared);
    struct Timers(Shared);
    struct Upper(Shared);

    impl RaPhySap for Phy {
        fn send_preamble(&mut self, transmission: PreambleTransmission) {
            self.0.borrow_mut().sent.push(transmission);
        }
    }

    impl RaTimerSap for Timers {
        fn schedule(&mut self, at_slot: u64, timer: RaTimer) -> TimerId {
            let mut recorder = self.0.borrow_mut();
            let id = TimerId(recorder.timers.len() as u64);
            recorder.timers.push((at_slot, timer, id));
            id
        }

        fn cancel(&mut self, id: TimerId) -> bool {
            self.0.borrow_mut().cancelled.insert(id)
        }
    }

    impl RaConnectionSap for Upper {
        fn random_access_succeeded(&mut self, _ue: UeId, success: RaSuccess) {
            self.0.borrow_mut().successes.push(success);
        }

        fn random_access_failed(&mut self, _ue: UeId, failure: RaFailure) {
            self.0.borrow_mut().failures.push(failure);
        }
    }

    fn procedure(rach: RachConfigCommon, seed: u64) -> (TerminalRandomAccessProcedure, Shared) {
        let indexer = OccasionIndexer::new(RaConfiguration::from_index(rach, 1).unwrap());
        let shared = Shared::default();
        let procedure = TerminalRandomAccessProcedure::new(
            UeId(1),
            indexer,
            51,
            seed,
            Box::new(Phy(shared.clone())),
            Box::new(Timers(shared.clone())),
            Box::new(Upper(shared.clone())),
        );
        (procedure, shared)
    }

    fn slot(absolute: u64) -> SlotCoordinate {
        SlotCoordinate::from_absolute(absolute, 1)
    }

    /// Feed slots `from..to` and every uncancelled timer due in them
    fn run(procedure: &mut TerminalRandomAccessProcedure, shared: &Shared, from: u64, to: u64) {
        for absolute in from..to {
            procedure.handle(RaInput::Slot(slot(absolute)));
            let recorder = shared.borrow();
            let due: Vec<RaTimer> = recorder
                .timers
                .iter()
                .filter(|(at, _, id)| *at == absolute && !recorder.cancelled.contains(id))
                .map(|(_, timer, _)| *timer)
                .collect();
            drop(recorder);
            for timer in due {
                procedure.handle(RaInput::Timer { timer, now: slot(absolute) });
            }
        }
    }

    fn rar_for(tx: &PreambleTransmission, at: u64, preamble_id: u8, backoff_indicator: Option<u8>) -> DownlinkRar {
        let pdu = RarPdu {
            backoff_indicator,
            entries: vec![RarEntry {
                preamble_id,
                timing_advance: 12,
                ul_grant: RarUlGrant::for_msg3(0, 3, 51, 15).unwrap(),
                tc_rnti: Rnti(0x4601),
            }],
        };
        DownlinkRar { slot: slot(at), ra_rnti: tx.ra_rnti, payload: pdu.encode().unwrap() }
    }

    #[test]
    fn test_defers_until_prach_slot() {
        let (mut procedure, shared) = procedure(RachConfigCommon::default(), 1);
        procedure.handle(RaInput::Start(RaMode::ContentionBased));
        run(&mut procedure, &shared, 0, 9);
        assert_eq!(procedure.state(), &RaState::OccasionPending);
        assert_eq!(procedure.transmissions(), 0);

        run(&mut procedure, &shared, 9, 10);
        let recorder = shared.borrow();
        assert_eq!(recorder.sent.len(), 1);
        let tx = &recorder.sent[0];
        assert_eq!(tx.slot, slot(9));
        assert!(tx.preamble_id < 64);
        assert!(matches!(procedure.state(), RaState::PreambleSent(p) if p.attempt == 1));
    }

    #[test]
    fn test_bounded_retries() {
        let rach = RachConfigCommon { preamble_trans_max: 3, ..Default::default() };
        let (mut procedure, shared) = procedure(rach, 7);
        procedure.handle(RaInput::Start(RaMode::ContentionBased));
        run(&mut procedure, &shared, 0, 200);

        let recorder = shared.borrow();
        assert_eq!(recorder.sent.len(), 3);
        assert_eq!(recorder.failures.len(), 1);
        assert_eq!(recorder.failures[0].preamble_transmissions, 3);
        assert!(matches!(procedure.state(), RaState::Failed(_)));
        // Successive attempts land in successive PRACH slots after each timeout
        let slots: Vec<u64> = recorder.sent.iter().map(|tx| tx.slot.absolute()).collect();
        assert_eq!(slots, vec![9, 29, 49]);
    }

    #[test]
    fn test_success_on_matching_rar() {
        let (mut procedure, shared) = procedure(RachConfigCommon::default(), 3);
        procedure.handle(RaInput::Start(RaMode::ContentionBased));
        run(&mut procedure, &shared, 0, 10);
        let tx = shared.borrow().sent[0].clone();

        // Window not yet open
        procedure.handle(RaInput::RarReceived(rar_for(&tx, 10, tx.preamble_id, None)));
        assert!(matches!(procedure.state(), RaState::PreambleSent(_)));

        run(&mut procedure, &shared, 10, 12);
        let mut foreign = rar_for(&tx, 12, tx.preamble_id, None);
        foreign.ra_rnti += 1;
        procedure.handle(RaInput::RarReceived(foreign));
        procedure.handle(RaInput::RarReceived(rar_for(&tx, 12, (tx.preamble_id + 1) % 64, None)));
        assert!(matches!(procedure.state(), RaState::PreambleSent(_)));

        procedure.handle(RaInput::RarReceived(rar_for(&tx, 12, tx.preamble_id, None)));
        let RaState::Succeeded(success) = *procedure.state() else {
            panic!("expected success, got {:?}", procedure.state());
        };
        assert_eq!(success.tc_rnti, Rnti(0x4601));
        assert_eq!(success.timing_advance, 12);
        assert_eq!(success.grant.slot, slot(19));
        assert_eq!((success.grant.start_rb, success.grant.num_rbs), (0, 3));

        {
            let recorder = shared.borrow();
            assert_eq!(recorder.successes, vec![success]);
            assert_eq!(recorder.cancelled.len(), 2);
        }

        // A stale timeout does not move a finished procedure
        procedure.handle(RaInput::Timer { timer: RaTimer::ResponseTimeout { attempt: 1 }, now: slot(21) });
        assert_eq!(procedure.state(), &RaState::Succeeded(success));
        assert!(shared.borrow().failures.is_empty());
    }

    #[test]
    fn test_contention_free_retries_same_occasion() {
        let rach = RachConfigCommon { preamble_trans_max: 2, ..Default::default() };
        let (mut procedure, shared) = procedure(rach, 5);
        let occasion_index = procedure.indexer.occasions_in_slot(&slot(19))[3];
        procedure.handle(RaInput::Start(RaMode::ContentionFree { preamble_id: 63, occasion_index }));

        run(&mut procedure, &shared, 0, 19);
        assert!(shared.borrow().sent.is_empty());

        run(&mut procedure, &shared, 19, 40);
        let recorder = shared.borrow();
        assert_eq!(recorder.sent.len(), 2);
        for tx in &recorder.sent {
            assert_eq!((tx.preamble_id, tx.occasion_index), (63, occasion_index));
        }
        assert_eq!(recorder.sent[1].slot, slot(39));
    }

    #[test]
    fn test_fixed_retry_state_after_timeout() {
        let (mut procedure, shared) = procedure(RachConfigCommon::default(), 5);
        let occasion_index = procedure.indexer.occasions_in_slot(&slot(9))[0];
        procedure.handle(RaInput::Start(RaMode::ContentionFree { preamble_id: 60, occasion_index }));
        run(&mut procedure, &shared, 0, 22);
        assert_eq!(procedure.state(), &RaState::FixedRetry);
    }

    #[test]
    fn test_backoff_indicator_delays_retry() {
        let (mut procedure, shared) = procedure(RachConfigCommon::default(), 11);
        procedure.handle(RaInput::Start(RaMode::ContentionBased));
        run(&mut procedure, &shared, 0, 12);
        let tx = shared.borrow().sent[0].clone();

        // Response for someone else, carrying BI 3 = 30 ms
        procedure.handle(RaInput::RarReceived(rar_for(&tx, 12, (tx.preamble_id + 1) % 64, Some(3))));
        run(&mut procedure, &shared, 12, 22);
        match *procedure.state() {
            RaState::TimedOut { retry_at } => assert!(retry_at > 21 && retry_at <= 21 + 60),
            RaState::OccasionPending | RaState::PreambleSent(_) => {}
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_restart_after_failure() {
        let rach = RachConfigCommon { preamble_trans_max: 1, ..Default::default() };
        let (mut procedure, shared) = procedure(rach, 2);
        procedure.handle(RaInput::Start(RaMode::ContentionBased));

        // Ignored while running
        procedure.handle(RaInput::Start(RaMode::ContentionBased));
        run(&mut procedure, &shared, 0, 25);
        assert!(matches!(procedure.state(), RaState::Failed(_)));

        procedure.handle(RaInput::Start(RaMode::ContentionBased));
        assert_eq!(procedure.state(), &RaState::OccasionPending);
        assert_eq!(procedure.transmissions(), 0);
        run(&mut procedure, &shared, 25, 30);
        assert_eq!(shared.borrow().sent.len(), 2);
    }

    #[test]
    fn test_invalid_dedicated_preamble_rejected() {
        let (mut full, _shared) = procedure(RachConfigCommon::default(), 2);
        full.handle(RaInput::Start(RaMode::ContentionFree { preamble_id: 64, occasion_index: 0 }));
        assert_eq!(full.state(), &RaState::Idle);

        let rach = RachConfigCommon { total_num_ra_preambles: 56, cb_preambles_per_occasion: 48, ..Default::default() };
        let (mut restricted, _shared) = procedure(rach, 2);
        restricted.handle(RaInput::Start(RaMode::ContentionFree { preamble_id: 60, occasion_index: 0 }));
        assert_eq!(restricted.state(), &RaState::Idle);
        restricted.handle(RaInput::Start(RaMode::ContentionFree { preamble_id: 55, occasion_index: 0 }));
        assert_eq!(restricted.state(), &RaState::OccasionPending);
    }

    #[test]
    fn test_same_seed_same_choices() {
        let picks = |seed| {
            let (mut procedure, shared) = procedure(RachConfigCommon::default(), seed);
            procedure.handle(RaInput::Start(RaMode::ContentionBased));
            run(&mut procedure, &shared, 0, 200);
            let picks: Vec<_> = shared
                .borrow()
                .sent
                .iter()
                .map(|tx| (tx.slot, tx.occasion_index, tx.preamble_id))
                .collect();
            picks
        };
        assert_eq!(picks(42), picks(42));
        assert!(!picks(42).is_empty());
    }
}
