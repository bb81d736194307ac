//! Core domain models for adflow
//!
//! This module defines the fundamental data structures that represent
//! workflows, steps, runs and their configuration.

pub mod config;
pub mod context;
pub mod error;
pub mod registry;
pub mod state;
pub mod step;
pub mod transform;
pub mod workflow;

pub use context::*;
pub use error::*;
pub use registry::*;
pub use state::*;
pub use step::*;
pub use transform::*;
pub use workflow::*;
