//! Mesh Configuration Module
//!
//! Provides coordinator and station configuration loaded from TOML files,
//! replacing hardcoded timing and detection constants with operator-tunable
//! values.
//!
//! ## Loading Order
//!
//! 1. `AGILITY_CONFIG` environment variable (path to TOML file)
//! 2. `mesh_config.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! ## Usage
//!
//! The binaries call `config::init()` once at startup. Library components take
//! their section by value, so nothing below the binaries calls `config::get()`.
//!
//! ```ignore
//! config::init(MeshConfig::load());
//! let link = config::get().link.clone();
//! ```

mod mesh_config;
pub mod defaults;
pub mod validation;

pub use mesh_config::*;

use std::sync::OnceLock;

/// Global mesh configuration, initialized once at startup.
static MESH_CONFIG: OnceLock<MeshConfig> = OnceLock::new();

/// Initialize the global mesh configuration.
///
/// A second call is ignored with a warning.
pub fn init(config: MeshConfig) {
    if MESH_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get a reference to the global mesh configuration.
///
/// Falls back to built-in defaults when `init()` was never called.
pub fn get() -> &'static MeshConfig {
    MESH_CONFIG.get_or_init(MeshConfig::default)
}
