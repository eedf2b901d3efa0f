//! Configuration module for wgveil
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use wgveil::config::load_config;
//!
//! let config = load_config("/etc/wgveil/config.json").unwrap();
//! println!("Configured servers: {}", config.servers.len());
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str};
pub use types::{
    Config, LogConfig, PerfConfig, ServerConfig, DEFAULT_MAIN_RECV_BATCH_SIZE,
    DEFAULT_RELAY_BATCH_SIZE, DEFAULT_SEND_CHANNEL_CAPACITY,
};
