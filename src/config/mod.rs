//! Staleguard Configuration Module
//!
//! Runtime configuration loaded from TOML.
//!
//! ## Loading Order
//!
//! 1. `--config <path>` on the command line
//! 2. `STALEGUARD_CONFIG` environment variable (path to TOML file)
//! 3. `staleguard.toml` in the current working directory
//! 4. Built-in defaults (see [`defaults`])
//!
//! Unknown keys are reported as warnings with a "did you mean" suggestion;
//! they never stop a config from loading.

mod staleguard_config;
pub mod defaults;
pub mod validation;

pub use staleguard_config::*;
