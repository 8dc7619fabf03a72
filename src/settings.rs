use std::{path::Path, time::Duration};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SettingsError;

pub const DEFAULT_SETTINGS_PATH: &str = "tether.toml";

#[derive(Clone, Debug, Default, Parser)]
#[command(version, about, long_about = None)]
pub struct CliTrackerSettings {
    #[arg(short, long)]
    pub config: Option<String>,

    #[arg(short, long)]
    pub slots: Option<usize>,

    #[arg(short, long)]
    pub granularity: Option<u64>,

    #[arg(long)]
    pub block_alignment: Option<u64>,

    #[arg(long)]
    pub block_granularity: Option<u64>,

    #[arg(long)]
    pub concurrent_wait_unsupported: Option<bool>,

    #[arg(long)]
    pub fence_timeout_ms: Option<u64>,

    #[arg(short, long)]
    pub frames: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGranularityOverride {
    pub memory_type: u32,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TomlTrackerSettings {
    #[serde(default = "default_slot_count")]
    pub slots: usize,

    #[serde(default = "default_granularity")]
    pub granularity: u64,

    #[serde(default = "default_block_alignment")]
    pub block_alignment: u64,

    #[serde(default = "default_block_granularity")]
    pub block_granularity: u64,

    #[serde(default)]
    pub block_granularity_overrides: Vec<BlockGranularityOverride>,

    pub concurrent_wait_unsupported: Option<bool>,

    #[serde(default = "default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,

    #[serde(default = "default_frames")]
    pub frames: usize,
}

impl Default for TomlTrackerSettings {
    fn default() -> Self {
        Self {
            slots: default_slot_count(),
            granularity: default_granularity(),
            block_alignment: default_block_alignment(),
            block_granularity: default_block_granularity(),
            block_granularity_overrides: Vec::new(),
            concurrent_wait_unsupported: None,
            fence_timeout_ms: default_fence_timeout_ms(),
            frames: default_frames(),
        }
    }
}

/// Construction-time configuration of the tracking engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerSettings {
    pub slot_count: usize,
    pub granularity: u64,
    pub block_alignment: u64,
    pub block_granularity: u64,
    pub block_granularity_overrides: Vec<BlockGranularityOverride>,
    /// `None` defers to what the device reports.
    pub concurrent_wait_unsupported: Option<bool>,
    pub fence_timeout: Duration,
    pub frames: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        merge_settings(CliTrackerSettings::default(), TomlTrackerSettings::default())
    }
}

impl TrackerSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.slot_count == 0 {
            return Err(SettingsError::Invalid("slot count must be at least 1"));
        }

        if !self.granularity.is_power_of_two() {
            return Err(SettingsError::Invalid(
                "usage granularity must be a power of two",
            ));
        }

        if self.block_alignment == 0 || self.block_alignment > isize::MAX as u64 {
            return Err(SettingsError::Invalid("block alignment out of range"));
        }

        if self.block_granularity == 0
            || self.block_granularity_overrides.iter().any(|o| o.size == 0)
        {
            return Err(SettingsError::Invalid("block granularity must be non-zero"));
        }

        if self.fence_timeout.is_zero() {
            return Err(SettingsError::Invalid("fence timeout must be non-zero"));
        }

        Ok(())
    }

    pub fn block_granularity_for(&self, memory_type: u32) -> u64 {
        self.block_granularity_overrides
            .iter()
            .find(|o| o.memory_type == memory_type)
            .map_or(self.block_granularity, |o| o.size)
    }
}

pub fn read_settings() -> TrackerSettings {
    let cli = CliTrackerSettings::parse();
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| DEFAULT_SETTINGS_PATH.to_string());

    if let Ok(content) = std::fs::read_to_string(&path) {
        if let Ok(toml) = toml::from_str(&content) {
            return merge_settings(cli, toml);
        }

        warn!("Ignoring malformed settings file {}", path);
    }

    merge_settings(cli, TomlTrackerSettings::default())
}

/// Reads and validates a settings file, without consulting the command line.
pub fn read_settings_from(path: impl AsRef<Path>) -> Result<TrackerSettings, SettingsError> {
    let content = std::fs::read_to_string(path)?;
    let toml = toml::from_str(&content)?;

    let settings = merge_settings(CliTrackerSettings::default(), toml);
    settings.validate()?;

    Ok(settings)
}

pub fn merge_settings(cli: CliTrackerSettings, toml: TomlTrackerSettings) -> TrackerSettings {
    TrackerSettings {
        slot_count: cli.slots.unwrap_or(toml.slots),
        granularity: cli.granularity.unwrap_or(toml.granularity),
        block_alignment: cli.block_alignment.unwrap_or(toml.block_alignment),
        block_granularity: cli.block_granularity.unwrap_or(toml.block_granularity),
        block_granularity_overrides: toml.block_granularity_overrides,
        concurrent_wait_unsupported: cli
            .concurrent_wait_unsupported
            .or(toml.concurrent_wait_unsupported),
        fence_timeout: Duration::from_millis(
            cli.fence_timeout_ms.unwrap_or(toml.fence_timeout_ms),
        ),
        frames: cli.frames.unwrap_or(toml.frames),
    }
}

fn default_slot_count() -> usize {
    8
}

fn default_granularity() -> u64 {
    4096
}

fn default_block_alignment() -> u64 {
    64 * 1024
}

fn default_block_granularity() -> u64 {
    64 * 1024 * 1024
}

fn default_fence_timeout_ms() -> u64 {
    100
}

fn default_frames() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = TrackerSettings::default();

        assert_eq!(settings.slot_count, 8);
        assert_eq!(settings.granularity, 4096);
        assert_eq!(settings.fence_timeout, Duration::from_millis(100));
        settings.validate().unwrap();
    }

    #[test]
    fn command_line_wins_over_file() {
        let cli = CliTrackerSettings {
            slots: Some(3),
            ..Default::default()
        };
        let toml: TomlTrackerSettings =
            toml::from_str("slots = 16\ngranularity = 256\n").unwrap();

        let settings = merge_settings(cli, toml);

        assert_eq!(settings.slot_count, 3);
        assert_eq!(settings.granularity, 256);
        assert_eq!(settings.block_alignment, 64 * 1024);
    }

    #[test]
    fn reads_overrides_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
slots = 4
concurrent_wait_unsupported = true

[[block_granularity_overrides]]
memory_type = 1
size = 1048576
"#
        )
        .unwrap();

        let settings = read_settings_from(file.path()).unwrap();

        assert_eq!(settings.slot_count, 4);
        assert_eq!(settings.concurrent_wait_unsupported, Some(true));
        assert_eq!(settings.block_granularity_for(1), 1 << 20);
        assert_eq!(settings.block_granularity_for(0), 64 * 1024 * 1024);
    }

    #[test]
    fn rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "granularity = 1000").unwrap();

        assert!(matches!(
            read_settings_from(file.path()),
            Err(SettingsError::Invalid(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "slots = \"many\"").unwrap();

        assert!(matches!(
            read_settings_from(file.path()),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            read_settings_from("/nonexistent/tether.toml"),
            Err(SettingsError::Io(_))
        ));
    }
}
