//! # groupcast-settings
//!
//! Configuration with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`GroupcastSettings::default()`]
//! 2. **Settings file**: `~/.groupcast/settings.json` or an explicit path,
//!    overlaid on the defaults
//! 3. **Environment variables**: `GROUPCAST_*` overrides (highest priority)
//!
//! Command-line flags are applied on top by the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env, load_settings, load_settings_from_path, load_settings_with_env, overlay,
    settings_path,
};
pub use types::*;
