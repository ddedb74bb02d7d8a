//! Utility modules shared across the pipeline.

pub mod errors;
pub mod hasher;

pub use errors::{Error, Interrupt, Result};
