//! Unilink Shared Library
//!
//! Wire protocol, envelope types and errors common to the agent and relay.

pub mod envelope;
pub mod error;
pub mod frame;

pub use error::{Error, Result};
