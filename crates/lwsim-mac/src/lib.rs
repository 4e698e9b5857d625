//! # lwsim-mac
//!
//! LoRaWAN MAC layer for lwsim.
//!
//! This crate provides:
//! - Frame types and wire sizing ([`frames`])
//! - The LinkADRReq MAC command codec
//! - OTAA session-key derivation, payload encryption and frame MIC
//!   ([`crypto`], standard AES-128 / AES-CMAC)
//! - Region presets with channel plans, data-rate maps and RX2
//!   parameters ([`region`])
//! - Class A/B receive-window and beacon timing ([`timing`])

pub mod crypto;
pub mod frames;
pub mod region;
pub mod timing;

use thiserror::Error;

/// MAC-layer errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacError {
    /// Malformed frame or MAC command.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame integrity check failed.
    #[error("message integrity check failed")]
    BadMic,
}
