//! Shared definitions for the cascade aggregation engine.
//!
//! This crate provides the record type and merge operator, the engine
//! configuration, the error taxonomy, and the fixed binary wire layout
//! used by the transport shell.

pub mod config;
pub mod error;
pub mod record;

pub use config::TreeConfig;
pub use error::{CascadeError, Result};
pub use record::{Record, KEY_SIZE, RECORD_WIRE_SIZE};
