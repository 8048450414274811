//! Core types for the CapTP capability protocol.
//!
//! This crate defines the data shared by every CapTP connection: slot
//! identifiers, marshalled payloads, the error taxonomy and configuration.
//! It contains no protocol logic.

pub mod capdata;
pub mod config;
pub mod error;
pub mod slot;

pub use capdata::CapData;
pub use config::CapTpConfig;
pub use error::{CapTpError, CapTpResult};
pub use slot::{Direction, Slot, SlotKind};
