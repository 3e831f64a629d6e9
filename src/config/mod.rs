//! Configuration module for rust-resolver
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use rust_resolver::config::{load_config, Config};
//!
//! let config = load_config("/etc/rust-resolver/config.json").unwrap();
//! println!("Nameservers: {:?}", config.dns.nameserver);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{Config, LogConfig};
