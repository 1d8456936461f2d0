//! Runtime-tunable driver settings with JSON persistence.
//!
//! This module provides:
//! - `DriverSettings`, the knobs applied to every card context
//! - `SettingsManager`, which stores them as JSON in a caller-chosen directory
//!
//! Protocol constants that never change at runtime live in `pci::config`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::pci::config::{ADDRESS_CONFIRM_ATTEMPTS, SEND_COMMAND_MAX_TRIES};
use crate::pci::{MemoryTransport, PollPolicy, Upc2Result};
use crate::traits::RegisterAccess;

fn default_command_attempts() -> u32 {
    SEND_COMMAND_MAX_TRIES
}

fn default_address_confirm_attempts() -> u32 {
    ADDRESS_CONFIRM_ATTEMPTS
}

/// Settings shared by every card context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverSettings {
    /// Status poll budgets per command class.
    #[serde(default)]
    pub poll: PollPolicy,

    /// Submit+poll cycles per command before giving up.
    #[serde(default = "default_command_attempts")]
    pub command_attempts: u32,

    /// Writes of the HPI address register before a transfer goes ahead
    /// unconfirmed.
    #[serde(default = "default_address_confirm_attempts")]
    pub address_confirm_attempts: u32,

    /// HPI register spacing. Detected from the card when unset.
    #[serde(default)]
    pub register_spacing: Option<u32>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            command_attempts: default_command_attempts(),
            address_confirm_attempts: default_address_confirm_attempts(),
            register_spacing: None,
        }
    }
}

impl DriverSettings {
    /// Build a memory transport over `regs` using these settings.
    pub fn transport<R: RegisterAccess>(&self, regs: R) -> MemoryTransport<R> {
        let transport = match self.register_spacing {
            Some(spacing) => MemoryTransport::with_spacing(regs, spacing),
            None => MemoryTransport::attach(regs),
        };
        transport.confirm_attempts(self.address_confirm_attempts)
    }

    /// Check if these settings differ from defaults.
    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Settings file name stored in the driver's data directory.
const SETTINGS_FILENAME: &str = "upc2_settings.json";

/// Manages persistence of driver settings to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager for the given data directory.
    pub fn new(data_dir: &Path) -> Self {
        let settings_file_path = data_dir.join(SETTINGS_FILENAME);
        Self { settings_file_path }
    }

    /// Load settings from disk, returning defaults if the file doesn't exist.
    pub fn load(&self) -> Upc2Result<DriverSettings> {
        if !self.settings_file_path.exists() {
            return Ok(DriverSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(DriverSettings::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    /// Save settings to disk.
    pub fn save(&self, settings: &DriverSettings) -> Upc2Result<()> {
        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(settings)?;
        fs::write(&self.settings_file_path, contents)?;
        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}
