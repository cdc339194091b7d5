//! Common Utilities and Types Library
//! 
//! This crate provides shared types and utilities used across the random access
//! simulator: radio identifiers, slot timing and the virtual-time event queue.

pub mod event_queue;
pub mod slot;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use event_queue::{EventId, EventQueue};
pub use slot::SlotCoordinate;
pub use types::*;
pub use utils::*;
