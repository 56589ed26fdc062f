//! MetaFS Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, configuration, and
//! the versioned wire framing used by all MetaFS components.

pub mod clock;
pub mod config;
pub mod encoding;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MdsConfig;
pub use error::{Error, Result};
pub use types::*;
