//! # tonelab common library
//!
//! Shared code for the tonelab workspace:
//! - Error and result types
//! - Configuration loading (TOML + environment overrides)
//! - Human-readable duration parsing

pub mod config;
pub mod duration;
pub mod error;

pub use error::{Error, Result};
