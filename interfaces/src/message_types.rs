//! Message Types exchanged across the random access boundary
//!
//! Defines the records passed between terminals, the physical layer
//! collaborator, the base station MAC and the connection manager

use bytes::Bytes;
use common::types::{Rnti, UeId, UlCarrier};
use common::SlotCoordinate;
use serde::{Deserialize, Serialize};

/// Preamble as handed by a terminal to its physical layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreambleTransmission {
    /// Sending terminal
    pub ue: UeId,
    /// Slot the preamble is transmitted in
    pub slot: SlotCoordinate,
    /// Occasion index within the PRACH period
    pub occasion_index: u16,
    /// Frequency-multiplexed occasion number
    pub frequency_occasion: u8,
    /// Time occasion number within the PRACH period
    pub time_occasion: u16,
    /// Preamble index (RAPID)
    pub preamble_id: u8,
    /// RA-RNTI the terminal will monitor for the response
    pub ra_rnti: u16,
    /// Uplink carrier used
    pub carrier: UlCarrier,
}

impl PreambleTransmission {
    /// Record observed by the base station when this preamble is detected
    pub fn to_reception(&self) -> PreambleReception {
        PreambleReception {
            frequency_occasion: self.frequency_occasion,
            time_occasion: self.time_occasion,
            preamble_id: self.preamble_id,
            sender: self.ue,
        }
    }
}

/// Preamble detected by the base station physical layer during one uplink slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreambleReception {
    /// Frequency-multiplexed occasion number
    pub frequency_occasion: u8,
    /// Time occasion number within the PRACH period
    pub time_occasion: u16,
    /// Detected preamble index
    pub preamble_id: u8,
    /// Sender, known only to the simulator; never used for arbitration
    pub sender: UeId,
}

/// Uplink grant for the first scheduled transmission (Msg3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkGrant {
    /// Slot of the Msg3 transmission
    pub slot: SlotCoordinate,
    /// First OFDM symbol
    pub start_symbol: u8,
    /// Number of OFDM symbols
    pub num_symbols: u8,
    /// First resource block, relative to the bandwidth part
    pub start_rb: u16,
    /// Number of resource blocks
    pub num_rbs: u16,
    /// Transport block size in bits
    pub tb_size_bits: u32,
}

/// Random access response PDU sent on the downlink, addressed by RA-RNTI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkRar {
    /// Slot the response is transmitted in
    pub slot: SlotCoordinate,
    /// RA-RNTI scrambling the scheduling DCI
    pub ra_rnti: u16,
    /// Encoded MAC PDU
    pub payload: Bytes,
}

/// Successful random access outcome handed to the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaSuccess {
    /// Temporary C-RNTI assigned by the base station
    pub tc_rnti: Rnti,
    /// Msg3 grant
    pub grant: UplinkGrant,
    /// Timing advance command from the response
    pub timing_advance: u16,
    /// Preamble transmissions used, including the successful one
    pub preamble_transmissions: u8,
    /// Slot the response was received in
    pub completed_at: SlotCoordinate,
}

/// Reason for abandoning a random access procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaFailureCause {
    /// preambleTransMax attempts all timed out
    MaxTransmissionsReached,
}

/// Failed random access outcome handed to the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaFailure {
    pub cause: RaFailureCause,
    pub preamble_transmissions: u8,
    pub failed_at: SlotCoordinate,
}

/// Timers owned by a terminal random access procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaTimer {
    /// Response window opens for the given attempt
    WindowOpen { attempt: u8 },
    /// Response window closes for the given attempt
    ResponseTimeout { attempt: u8 },
}

/// Handle returned by the timer service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reception_from_transmission() {
        let tx = PreambleTransmission {
            ue: UeId(7),
            slot: SlotCoordinate::new(0, 9, 1, 1).unwrap(),
            occasion_index: 14,
            frequency_occasion: 1,
            time_occasion: 2,
            preamble_id: 33,
            ra_rnti: 300,
            carrier: UlCarrier::Normal,
        };
        let rx = tx.to_reception();
        assert_eq!(rx.frequency_occasion, 1);
        assert_eq!(rx.time_occasion, 2);
        assert_eq!(rx.preamble_id, 33);
        assert_eq!(rx.sender, UeId(7));
    }
}
