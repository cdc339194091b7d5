//! Common Utilities
//!
//! Provides utility functions used across the simulator

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Time utilities for slot/frame calculations
pub mod time {
    use crate::slot::slots_per_subframe;

    /// Slot duration in microseconds for numerology µ
    pub fn slot_duration_us(numerology: u8) -> u32 {
        1000 / u32::from(slots_per_subframe(numerology))
    }

    /// Number of whole slots covering `ms` milliseconds
    pub fn slots_for_ms(ms: u64, numerology: u8) -> u64 {
        ms * u64::from(slots_per_subframe(numerology))
    }

    /// Milliseconds elapsed after `slots` slots
    pub fn ms_for_slots(slots: u64, numerology: u8) -> f64 {
        slots as f64 / f64::from(slots_per_subframe(numerology))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_hex() {
        let data = vec![0x12, 0x34, 0xAB, 0xCD];
        assert_eq!(bytes_to_hex(&data), "12 34 ab cd");
    }

    #[test]
    fn test_slot_duration() {
        assert_eq!(time::slot_duration_us(0), 1000);
        assert_eq!(time::slot_duration_us(1), 500);
        assert_eq!(time::slot_duration_us(3), 125);
    }

    #[test]
    fn test_ms_slot_conversion() {
        assert_eq!(time::slots_for_ms(10, 1), 20);
        assert_eq!(time::ms_for_slots(20, 1), 10.0);
    }
}
