use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const SCHEMA_VERSION: &str = "1.0";

/// Largest output buffer a profile may ask for.
pub const MAX_BUFFER_SIZE: u64 = 1024 * 1024;

/// Validation failures for a platform profile.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Unsupported schema_version '{0}'. Supported versions: '1.0'")]
    UnsupportedSchema(String),
    #[error("jump_stack.capacity must be at least 1")]
    ZeroCapacity,
    #[error("output.buffer_size must hold at least 2 bytes, got {0}")]
    BufferTooSmall(usize),
    #[error("output.buffer_size of {0} bytes exceeds the {max} byte limit", max = MAX_BUFFER_SIZE)]
    BufferTooLarge(u64),
    #[error("clock.tick_rate_hz must be greater than zero for the tick clock")]
    ZeroTickRate,
    #[error("channel.path is required when channel.kind is 'file'")]
    MissingChannelPath,
    #[error("channel.baud_rate must be greater than zero")]
    ZeroBaudRate,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JumpStackConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    10
}

impl Default for JumpStackConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// What the output buffer does when a write arrives with only the reserved
/// slot left.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the pending bytes and start over.
    #[default]
    Restart,
    /// Transmit the pending bytes before storing the new one.
    FlushOnFull,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: String, // e.g. "256B"
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub flush_timeout_ms: Option<u64>,
}

fn default_buffer_size() -> String {
    "256B".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            overflow: OverflowPolicy::default(),
            flush_timeout_ms: None,
        }
    }
}

impl OutputConfig {
    pub fn capacity(&self) -> Result<usize> {
        let bytes = parse_size(&self.buffer_size)
            .with_context(|| format!("Invalid output.buffer_size '{}'", self.buffer_size))?;
        if bytes > MAX_BUFFER_SIZE {
            return Err(ConfigError::BufferTooLarge(bytes).into());
        }
        usize::try_from(bytes).context("output.buffer_size does not fit in memory")
    }

    pub fn flush_timeout(&self) -> Option<Duration> {
        self.flush_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[default]
    Stdout,
    File,
    Null,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    #[serde(default)]
    pub kind: ChannelKind,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub baud_rate: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClockSource {
    /// Always reports zero milliseconds.
    Zero,
    /// Derived from a free-running scheduler tick counter.
    #[default]
    Tick,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClockConfig {
    #[serde(default)]
    pub source: ClockSource,
    #[serde(default = "default_tick_rate")]
    pub tick_rate_hz: u32,
}

fn default_tick_rate() -> u32 {
    1000
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            source: ClockSource::default(),
            tick_rate_hz: default_tick_rate(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RngKind {
    #[default]
    Fixed,
    Seeded,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct RngConfig {
    #[serde(default)]
    pub kind: RngKind,
    #[serde(default)]
    pub seed: u64,
}

/// Target profile describing how the platform hooks are wired up.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    pub schema_version: String,
    #[serde(default)]
    pub jump_stack: JumpStackConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub rng: RngConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            jump_stack: JumpStackConfig::default(),
            output: OutputConfig::default(),
            channel: ChannelConfig::default(),
            clock: ClockConfig::default(),
            rng: RngConfig::default(),
        }
    }
}

impl PlatformConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open platform profile at {:?}", path.as_ref()))?;
        let config: Self =
            serde_yaml::from_reader(f).context("Failed to parse Platform Profile YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedSchema(self.schema_version.clone()).into());
        }

        if self.jump_stack.capacity == 0 {
            return Err(ConfigError::ZeroCapacity.into());
        }

        // One slot is always reserved, so a single byte buffer could never hold output.
        let capacity = self.output.capacity()?;
        if capacity < 2 {
            return Err(ConfigError::BufferTooSmall(capacity).into());
        }

        if self.clock.source == ClockSource::Tick && self.clock.tick_rate_hz == 0 {
            return Err(ConfigError::ZeroTickRate.into());
        }

        if self.channel.kind == ChannelKind::File
            && self.channel.path.as_deref().map_or(true, |p| p.trim().is_empty())
        {
            return Err(ConfigError::MissingChannelPath.into());
        }

        if self.channel.baud_rate == Some(0) {
            return Err(ConfigError::ZeroBaudRate.into());
        }

        Ok(())
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    let value = bytes.value();
    if !value.is_finite() || value < 0.0 {
        anyhow::bail!("Size must be a non-negative number of bytes, got {}", size_str);
    }
    if value >= u64::MAX as f64 {
        anyhow::bail!("Size {} is too large", size_str);
    }
    Ok(value as u64)
}
