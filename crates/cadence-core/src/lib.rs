//! Cadence CI Core
//!
//! Core domain types, traits, and error handling for Cadence CI.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler, tracing and CLI crates.

pub mod agent;
pub mod build;
pub mod error;
pub mod events;
pub mod ids;
pub mod ports;
pub mod project;
pub mod recipe;
pub mod revision;

pub use error::{Error, Result};
pub use ids::*;
