//! Bandwidth Part Registry
//!
//! Resource-block bounds of the bandwidth parts sharing one carrier.
//! Bandwidth parts registered cumulatively are laid out side by side;
//! overlapping parts must be registered with an explicit range.

use super::resource_grid::AllocationError;
use crate::LayerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::info;

/// Inclusive resource-block range of a bandwidth part within the carrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BwpBounds {
    pub lower: u16,
    pub upper: u16,
}

impl BwpBounds {
    /// Number of resource blocks
    pub fn width(&self) -> u16 {
        self.upper - self.lower + 1
    }
}

/// How a bandwidth part is placed on the carrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BwpSpan {
    /// Next `num_rbs` blocks after the previously registered cumulative part
    Cumulative { num_rbs: u16 },
    /// Explicit inclusive range, may overlap other parts
    Explicit { lower: u16, upper: u16 },
    /// The whole carrier, overlapping every other part
    FullCarrier,
}

/// Bounds of every registered bandwidth part
#[derive(Debug, Clone)]
pub struct BwpRegistry {
    carrier_rbs: u16,
    next_rb: u16,
    bounds: BTreeMap<u8, BwpBounds>,
}

impl BwpRegistry {
    pub fn new(carrier_rbs: u16) -> Self {
        Self { carrier_rbs, next_rb: 0, bounds: BTreeMap::new() }
    }

    /// Register a bandwidth part and return its bounds
    pub fn register(&mut self, bwp_id: u8, span: BwpSpan) -> Result<BwpBounds, LayerError> {
        if self.bounds.contains_key(&bwp_id) {
            return Err(LayerError::InvalidConfiguration(format!("BWP {} already registered", bwp_id)));
        }

        let bounds = match span {
            BwpSpan::Cumulative { num_rbs } => {
                if num_rbs == 0 || u32::from(self.next_rb) + u32::from(num_rbs) > u32::from(self.carrier_rbs) {
                    return Err(LayerError::InvalidConfiguration(format!(
                        "BWP {} with {} RBs does not fit after RB {} on a {} RB carrier",
                        bwp_id, num_rbs, self.next_rb, self.carrier_rbs
                    )));
                }
                let bounds = BwpBounds { lower: self.next_rb, upper: self.next_rb + num_rbs - 1 };
                self.next_rb += num_rbs;
                bounds
            }
            BwpSpan::Explicit { lower, upper } => {
                if lower > upper || upper >= self.carrier_rbs {
                    return Err(LayerError::InvalidConfiguration(format!(
                        "BWP {} range {}..={} invalid on a {} RB carrier",
                        bwp_id, lower, upper, self.carrier_rbs
                    )));
                }
                BwpBounds { lower, upper }
            }
            BwpSpan::FullCarrier => BwpBounds { lower: 0, upper: self.carrier_rbs - 1 },
        };

        info!("Registered BWP {}: RBs {}..={}", bwp_id, bounds.lower, bounds.upper);
        self.bounds.insert(bwp_id, bounds);
        Ok(bounds)
    }

    pub fn get(&self, bwp_id: u8) -> Option<BwpBounds> {
        self.bounds.get(&bwp_id).copied()
    }

    /// Translate a BWP-relative RB range into carrier RBs
    pub fn to_carrier(&self, bwp_id: u8, rbs: Range<u16>) -> Result<Range<u16>, AllocationError> {
        let bounds = self.get(bwp_id).ok_or(AllocationError::UnknownBwp(bwp_id))?;
        if rbs.start >= rbs.end || rbs.end > bounds.width() {
            return Err(AllocationError::OutOfBounds(format!(
                "RBs {:?} outside BWP {} of width {}",
                rbs,
                bwp_id,
                bounds.width()
            )));
        }
        Ok(bounds.lower + rbs.start..bounds.lower + rbs.end)
    }

    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.bounds.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cumulative_bounds() {
        let mut registry = BwpRegistry::new(153);
        assert_eq!(registry.register(0, BwpSpan::Cumulative { num_rbs: 51 }).unwrap(), BwpBounds { lower: 0, upper: 50 });
        assert_eq!(registry.register(1, BwpSpan::Cumulative { num_rbs: 51 }).unwrap(), BwpBounds { lower: 51, upper: 101 });
        assert_eq!(registry.get(1).unwrap().width(), 51);
    }

    #[test]
    fn test_overlap_only_when_explicit() {
        let mut registry = BwpRegistry::new(102);
        registry.register(0, BwpSpan::Cumulative { num_rbs: 51 }).unwrap();
        registry.register(1, BwpSpan::Cumulative { num_rbs: 51 }).unwrap();
        assert!(registry.register(2, BwpSpan::Cumulative { num_rbs: 1 }).is_err());
        assert_eq!(registry.register(2, BwpSpan::FullCarrier).unwrap(), BwpBounds { lower: 0, upper: 101 });
        assert_eq!(registry.register(3, BwpSpan::Explicit { lower: 40, upper: 60 }).unwrap().width(), 21);
        assert!(registry.register(3, BwpSpan::FullCarrier).is_err());
    }

    #[test]
    fn test_to_carrier() {
        let mut registry = BwpRegistry::new(102);
        registry.register(0, BwpSpan::Cumulative { num_rbs: 51 }).unwrap();
        registry.register(1, BwpSpan::Cumulative { num_rbs: 51 }).unwrap();
        assert_eq!(registry.to_carrier(1, 0..4).unwrap(), 51..55);
        assert!(registry.to_carrier(1, 50..52).is_err());
        assert_eq!(registry.to_carrier(7, 0..1), Err(AllocationError::UnknownBwp(7)));
    }
}
