//! Random Access Response PDU
//!
//! MAC RAR encoding and parsing according to 3GPP TS 38.321 Sections 6.1.5
//! and 6.2.3, with the RAR UL grant of TS 38.213 Section 8.2 and Msg3 timing
//! of TS 38.214 Section 6.1.2.1

use bytes::{BufMut, Bytes, BytesMut};
use common::types::Rnti;
use common::SlotCoordinate;
use interfaces::UplinkGrant;
use nom::bits::bits;
use nom::bits::complete::take;
use nom::sequence::tuple;
use nom::IResult;
use thiserror::Error;

/// Estimated Msg3 transport block size in bits
pub const MSG3_TB_SIZE_BITS: u32 = 144;

/// Size of one MAC RAR without its subheader
const MAC_RAR_LEN: usize = 7;

/// RAR parsing and encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RarError {
    #[error("RAR PDU truncated")]
    Truncated,

    #[error("Invalid RAR field: {0}")]
    InvalidField(String),
}

/// Row of the default PUSCH time-domain allocation list (TS 38.214 Table 6.1.2.1.1-2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PuschTimeAllocation {
    /// Slots added to the numerology-dependent j
    pub k2_extra: u8,
    pub start_symbol: u8,
    pub length: u8,
}

const fn row(k2_extra: u8, start_symbol: u8, length: u8) -> PuschTimeAllocation {
    PuschTimeAllocation { k2_extra, start_symbol, length }
}

/// Default table A for normal cyclic prefix
pub const DEFAULT_PUSCH_TIME_ALLOCATIONS: [PuschTimeAllocation; 16] = [
    row(0, 0, 14),
    row(0, 0, 12),
    row(0, 0, 10),
    row(0, 2, 10),
    row(0, 4, 10),
    row(0, 4, 8),
    row(0, 4, 6),
    row(1, 0, 14),
    row(1, 0, 12),
    row(1, 0, 10),
    row(2, 0, 14),
    row(2, 0, 12),
    row(2, 0, 10),
    row(0, 8, 6),
    row(3, 0, 14),
    row(3, 0, 10),
];

/// j of TS 38.214 Table 6.1.2.1.1-4
pub fn k2_base(numerology: u8) -> u8 {
    match numerology {
        0 | 1 => 1,
        2 => 2,
        _ => 3,
    }
}

/// Msg3 additional delay Δ of TS 38.214 Table 6.1.2.1.1-5
pub fn msg3_delta(numerology: u8) -> u8 {
    match numerology {
        0 => 2,
        1 => 3,
        2 => 4,
        _ => 6,
    }
}

/// Slots from the RAR slot to the Msg3 slot for a time-domain allocation row
pub fn msg3_slot_offset(time_resource: u8, numerology: u8) -> Option<u64> {
    let allocation = DEFAULT_PUSCH_TIME_ALLOCATIONS.get(usize::from(time_resource))?;
    Some(u64::from(k2_base(numerology) + allocation.k2_extra + msg3_delta(numerology)))
}

/// Backoff Indicator to milliseconds (TS 38.321 Table 7.2-1)
pub fn backoff_ms(indicator: u8) -> Option<u32> {
    const VALUES: [u32; 14] = [5, 10, 20, 30, 40, 60, 80, 120, 160, 240, 320, 480, 960, 1920];
    VALUES.get(usize::from(indicator)).copied()
}

/// Resource indication value for contiguous allocations (TS 38.214 Section 6.1.2.2.2)
pub fn encode_riv(start: u16, length: u16, bwp_size: u16) -> Option<u16> {
    if length == 0 || bwp_size == 0 || u32::from(start) + u32::from(length) > u32::from(bwp_size) {
        return None;
    }
    let n = u32::from(bwp_size);
    let (s, l) = (u32::from(start), u32::from(length));
    let riv = if l - 1 <= n / 2 {
        n * (l - 1) + s
    } else {
        n * (n - l + 1) + (n - 1 - s)
    };
    u16::try_from(riv).ok().filter(|&riv| riv < 1 << 14)
}

/// Inverse of [`encode_riv`]: (start, length)
pub fn decode_riv(riv: u16, bwp_size: u16) -> Option<(u16, u16)> {
    if bwp_size == 0 {
        return None;
    }
    let n = u32::from(bwp_size);
    let (a, b) = (u32::from(riv) / n, u32::from(riv) % n);
    let (start, length) = if a + b < n { (b, a + 1) } else { (n - 1 - b, n + 1 - a) };
    if length == 0 || start + length > n {
        return None;
    }
    Some((start as u16, length as u16))
}

/// 27-bit RAR UL grant (TS 38.213 Table 8.2-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RarUlGrant {
    pub frequency_hopping: bool,
    /// 14-bit PUSCH frequency resource allocation (RIV)
    pub frequency_resource: u16,
    /// 4-bit PUSCH time resource allocation row
    pub time_resource: u8,
    pub mcs: u8,
    pub tpc_command: u8,
    pub csi_request: bool,
}

impl RarUlGrant {
    /// Grant for a Msg3 at BWP-relative RBs `start_rb..start_rb + num_rbs`
    pub fn for_msg3(start_rb: u16, num_rbs: u16, bwp_size: u16, time_resource: u8) -> Result<Self, RarError> {
        let frequency_resource = encode_riv(start_rb, num_rbs, bwp_size).ok_or_else(|| {
            RarError::InvalidField(format!("RBs {}+{} in BWP of {}", start_rb, num_rbs, bwp_size))
        })?;
        if usize::from(time_resource) >= DEFAULT_PUSCH_TIME_ALLOCATIONS.len() {
            return Err(RarError::InvalidField(format!("time resource {}", time_resource)));
        }
        Ok(Self {
            frequency_resource,
            time_resource,
            // TPC index 3 is 0 dB for Msg3
            tpc_command: 3,
            ..Default::default()
        })
    }

    pub fn pack(&self) -> u32 {
        (u32::from(self.frequency_hopping) << 26)
            | (u32::from(self.frequency_resource & 0x3FFF) << 12)
            | (u32::from(self.time_resource & 0x0F) << 8)
            | (u32::from(self.mcs & 0x0F) << 4)
            | (u32::from(self.tpc_command & 0x07) << 1)
            | u32::from(self.csi_request)
    }

    pub fn unpack(value: u32) -> Self {
        Self {
            frequency_hopping: (value >> 26) & 0x1 == 1,
            frequency_resource: ((value >> 12) & 0x3FFF) as u16,
            time_resource: ((value >> 8) & 0x0F) as u8,
            mcs: ((value >> 4) & 0x0F) as u8,
            tpc_command: ((value >> 1) & 0x07) as u8,
            csi_request: value & 0x1 == 1,
        }
    }
}

/// One MAC RAR with its RAPID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RarEntry {
    pub preamble_id: u8,
    /// 12-bit timing advance command
    pub timing_advance: u16,
    pub ul_grant: RarUlGrant,
    pub tc_rnti: Rnti,
}

impl RarEntry {
    /// Msg3 grant as seen by the terminal that received this entry in `rar_slot`
    pub fn uplink_grant(&self, rar_slot: &SlotCoordinate, bwp_size: u16) -> Result<UplinkGrant, RarError> {
        let time_resource = self.ul_grant.time_resource;
        let allocation = DEFAULT_PUSCH_TIME_ALLOCATIONS
            .get(usize::from(time_resource))
            .ok_or_else(|| RarError::InvalidField(format!("time resource {}", time_resource)))?;
        let offset = msg3_slot_offset(time_resource, rar_slot.numerology)
            .ok_or_else(|| RarError::InvalidField(format!("time resource {}", time_resource)))?;
        let (start_rb, num_rbs) = decode_riv(self.ul_grant.frequency_resource, bwp_size)
            .ok_or_else(|| RarError::InvalidField(format!("RIV {}", self.ul_grant.frequency_resource)))?;

        Ok(UplinkGrant {
            slot: rar_slot.add_slots(offset),
            start_symbol: allocation.start_symbol,
            num_symbols: allocation.length,
            start_rb,
            num_rbs,
            tb_size_bits: MSG3_TB_SIZE_BITS,
        })
    }
}

/// MAC PDU carried on the PDSCH scheduled with an RA-RNTI
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RarPdu {
    pub backoff_indicator: Option<u8>,
    pub entries: Vec<RarEntry>,
}

impl RarPdu {
    pub fn encode(&self) -> Result<Bytes, RarError> {
        let mut buf = BytesMut::with_capacity(1 + self.entries.len() * (1 + MAC_RAR_LEN));

        if let Some(indicator) = self.backoff_indicator {
            if indicator > 0x0F {
                return Err(RarError::InvalidField(format!("backoff indicator {}", indicator)));
            }
            let extension = u8::from(!self.entries.is_empty());
            buf.put_u8((extension << 7) | indicator);
        }

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.preamble_id > 0x3F {
                return Err(RarError::InvalidField(format!("RAPID {}", entry.preamble_id)));
            }
            if entry.timing_advance > 0x0FFF {
                return Err(RarError::InvalidField(format!("timing advance {}", entry.timing_advance)));
            }
            let extension = u8::from(i + 1 < self.entries.len());
            buf.put_u8((extension << 7) | (1 << 6) | entry.preamble_id);

            let value = (u64::from(entry.timing_advance) << 43)
                | (u64::from(entry.ul_grant.pack()) << 16)
                | u64::from(entry.tc_rnti.value());
            buf.put_slice(&value.to_be_bytes()[1..]);
        }

        if buf.is_empty() {
            return Err(RarError::InvalidField("empty RAR PDU".into()));
        }
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, RarError> {
        let mut pdu = RarPdu::default();
        let mut input = data;

        loop {
            let (rest, (extension, type_bit, payload)) = subheader(input).map_err(|_| RarError::Truncated)?;
            input = rest;

            if type_bit == 0 {
                pdu.backoff_indicator = Some(payload & 0x0F);
            } else {
                let (rest, (_reserved, timing_advance, grant, tc_rnti)) =
                    mac_rar(input).map_err(|_| RarError::Truncated)?;
                input = rest;
                pdu.entries.push(RarEntry {
                    preamble_id: payload,
                    timing_advance,
                    ul_grant: RarUlGrant::unpack(grant),
                    tc_rnti: Rnti(tc_rnti),
                });
            }

            if extension == 0 {
                break;
            }
        }
        Ok(pdu)
    }

    /// Entry answering the given preamble
    pub fn find(&self, preamble_id: u8) -> Option<&RarEntry> {
        self.entries.iter().find(|entry| entry.preamble_id == preamble_id)
    }
}

type BitError<'a> = nom::error::Error<(&'a [u8], usize)>;

/// E/T/RAPID or E/T/R/R/BI subheader
fn subheader(input: &[u8]) -> IResult<&[u8], (u8, u8, u8)> {
    bits::<_, _, BitError, _, _>(tuple((take(1usize), take(1usize), take(6usize))))(input)
}

/// R / Timing Advance / UL grant / TC-RNTI
fn mac_rar(input: &[u8]) -> IResult<&[u8], (u8, u16, u32, u16)> {
    if input.len() < MAC_RAR_LEN {
        return Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Eof)));
    }
    bits::<_, _, BitError, _, _>(tuple((
        take(1usize),
        take(12usize),
        take(27usize),
        take(16usize),
    )))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(preamble_id: u8, tc_rnti: u16) -> RarEntry {
        RarEntry {
            preamble_id,
            timing_advance: 0x5A5,
            ul_grant: RarUlGrant::for_msg3(4, 2, 51, 8).unwrap(),
            tc_rnti: Rnti(tc_rnti),
        }
    }

    #[test]
    fn test_single_rar_layout() {
        let pdu = RarPdu { backoff_indicator: None, entries: vec![entry(17, 0x4601)] };
        let bytes = pdu.encode().unwrap();
        assert_eq!(bytes.len(), 8);
        // E=0, T=1, RAPID=17
        assert_eq!(bytes[0], 0x40 | 17);
        // R=0 then the 7 most significant TA bits
        assert_eq!(bytes[1], (0x5A5 >> 5) as u8);
        assert_eq!(&bytes[6..8], &[0x46, 0x01]);
        assert_eq!(RarPdu::decode(&bytes).unwrap(), pdu);
    }

    #[test]
    fn test_multiple_entries_with_backoff() {
        let pdu = RarPdu {
            backoff_indicator: Some(5),
            entries: vec![entry(3, 0x4601), entry(40, 0x4602), entry(63, 0x4603)],
        };
        let bytes = pdu.encode().unwrap();
        assert_eq!(bytes.len(), 1 + 3 * 8);
        assert_eq!(bytes[0], 0x80 | 5);
        let decoded = RarPdu::decode(&bytes).unwrap();
        assert_eq!(decoded, pdu);
        assert_eq!(decoded.find(40).map(|e| e.tc_rnti), Some(Rnti(0x4602)));
        assert!(decoded.find(41).is_none());
    }

    #[test]
    fn test_truncated_pdu_rejected() {
        let bytes = RarPdu { backoff_indicator: None, entries: vec![entry(1, 0x4601)] }
            .encode()
            .unwrap();
        assert_eq!(RarPdu::decode(&bytes[..5]), Err(RarError::Truncated));
        assert_eq!(RarPdu::decode(&[]), Err(RarError::Truncated));
        // Extension bit set but nothing follows
        assert_eq!(RarPdu::decode(&[0x80 | 2]), Err(RarError::Truncated));
    }

    #[test]
    fn test_invalid_fields_rejected_on_encode() {
        let mut bad = entry(64, 1);
        assert!(RarPdu { backoff_indicator: None, entries: vec![bad] }.encode().is_err());
        bad.preamble_id = 1;
        bad.timing_advance = 0x1000;
        assert!(RarPdu { backoff_indicator: None, entries: vec![bad] }.encode().is_err());
        assert!(RarPdu::default().encode().is_err());
    }

    #[test]
    fn test_riv() {
        for bwp_size in [24u16, 51, 106] {
            for start in 0..bwp_size {
                for length in 1..=(bwp_size - start) {
                    let riv = encode_riv(start, length, bwp_size).unwrap();
                    assert_eq!(decode_riv(riv, bwp_size), Some((start, length)));
                }
            }
        }
        assert_eq!(encode_riv(50, 2, 51), None);
        assert_eq!(encode_riv(0, 0, 51), None);
    }

    #[test]
    fn test_grant_pack_unpack() {
        let grant = RarUlGrant {
            frequency_hopping: true,
            frequency_resource: 0x2ABC,
            time_resource: 9,
            mcs: 7,
            tpc_command: 5,
            csi_request: true,
        };
        assert!(grant.pack() < 1 << 27);
        assert_eq!(RarUlGrant::unpack(grant.pack()), grant);
    }

    #[test]
    fn test_uplink_grant_reconstruction() {
        let rar_slot = SlotCoordinate::new(2, 6, 0, 1).unwrap();
        let grant = entry(1, 0x4601).uplink_grant(&rar_slot, 51).unwrap();
        // Row 8: K2 = j + 1 = 2, delta = 3 at 30 kHz
        assert_eq!(grant.slot, rar_slot.add_slots(5));
        assert_eq!((grant.start_symbol, grant.num_symbols), (0, 12));
        assert_eq!((grant.start_rb, grant.num_rbs), (4, 2));
        assert_eq!(grant.tb_size_bits, MSG3_TB_SIZE_BITS);
    }

    #[test]
    fn test_msg3_timing_tables() {
        assert_eq!(msg3_slot_offset(0, 0), Some(3));
        assert_eq!(msg3_slot_offset(15, 1), Some(1 + 3 + 3));
        assert_eq!(msg3_slot_offset(0, 3), Some(9));
        assert_eq!(msg3_slot_offset(16, 1), None);
        assert_eq!(backoff_ms(0), Some(5));
        assert_eq!(backoff_ms(13), Some(1920));
        assert_eq!(backoff_ms(14), None);
    }
}
