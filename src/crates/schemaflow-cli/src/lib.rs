//! # schemaflow-cli
//!
//! Settings and subcommands behind the `schemaflow` binary.

pub mod commands;
pub mod settings;

pub use commands::Fixtures;
pub use settings::{Settings, SettingsError};
