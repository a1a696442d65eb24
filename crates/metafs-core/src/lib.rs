//! Core error taxonomy and configuration for the MetaFS metadata engine.

pub mod config;
pub mod error;

pub use config::{VolumeConfig, LOG_ALIGNMENT};
pub use error::{Error, Result};
