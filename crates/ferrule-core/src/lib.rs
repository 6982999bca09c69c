//! Ferrule Core
//!
//! Core domain types, errors and pure helpers for the Ferrule pipeline
//! orchestrator. This crate has minimal dependencies and defines the shared
//! vocabulary used across all other crates.

pub mod error;
pub mod events;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;
