//! Common utilities for p2p-usbredir
//!
//! This crate provides functionality shared by the protocol-facing and
//! USB-facing crates: error handling, logging setup, configuration loading
//! and async test helpers.

pub mod config;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use config::{RedirConfig, load_config};
pub use error::{Error, Result};
pub use logging::setup_logging;
