//! Utility modules: configuration and logging.

pub mod config;
pub mod logger;
