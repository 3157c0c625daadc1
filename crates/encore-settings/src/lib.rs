//! # encore-settings
//!
//! Layered configuration for the encore retrieval core.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`EncoreSettings::default()`]
//! 2. **User file**: `~/.encore/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `ENCORE_*` overrides (highest priority)
//!
//! There is no global instance. The application root loads settings once
//! and hands each component its own options struct.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path,
    load_settings_with_env, settings_path,
};
pub use types::*;
