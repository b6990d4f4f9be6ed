//! Keel CI Core
//!
//! Core domain types, traits, and error handling for Keel CI.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the master, the agents and the scheduling crates.

pub mod agent;
pub mod error;
pub mod events;
pub mod ids;
pub mod ports;
pub mod project;
pub mod protocol;
pub mod resource;
pub mod result;
pub mod revision;
pub mod trigger;
pub mod variables;

pub use error::{Error, Result, ScmError};
pub use ids::*;
pub use revision::Revision;
