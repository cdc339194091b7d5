//! Collaborator Interfaces Library
//! 
//! This crate defines the boundary between the random access core and the
//! components around it: the physical layer, the identity allocator, the
//! connection manager and the virtual-time timer service.

pub mod identity;
pub mod message_types;
pub mod sap;

pub use identity::RntiPool;
pub use message_types::*;
pub use sap::*;

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
