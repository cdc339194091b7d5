//! Protocol Stack Layers Library
//! 
//! This crate implements the NR MAC random access procedure and the control
//! resource allocator that backs it, according to 3GPP TS 38.321 and TS 38.213.

pub mod mac;

use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayerError {
    #[error("Invalid protocol data unit: {0}")]
    InvalidPdu(String),
    
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
