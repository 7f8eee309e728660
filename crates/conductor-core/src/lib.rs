//! Conductor Core Library
//!
//! Shared functionality for Conductor components:
//! - Configuration resolution and hierarchy
//! - Tracing subscriber setup
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, RecoveryAction};
pub use error::{Error, Result};
