//! Core types, constants, and errors for the ContextVM protocol.

pub mod constants;
pub mod error;
pub mod types;

pub use constants::*;
pub use error::{Error, Result};
pub use types::*;
