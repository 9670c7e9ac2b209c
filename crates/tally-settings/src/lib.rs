//! # tally-settings
//!
//! Layered configuration for the tally server.
//!
//! Settings are resolved in priority order:
//! 1. **Compiled defaults**: [`TallySettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `PORT`, `HOST`, `LOG_LEVEL`, ...
//!
//! The binary applies its CLI flags on top of the result.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_with_env, validate};
pub use types::{LogFormat, LoggingSettings, ServerSettings, TallySettings};
