//! Load-time settings, read once by the bootstrap.
//!
//! Values come from an optional YAML file named by `MEM_HOOK_CONFIG`, overridden field by field by
//! the individual `MEM_HOOK_*` variables.

use std::{env, fmt::Display, fs, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    event::EventKind,
    filter::{KindSet, SizeFilter},
    ring,
};

pub const DEFAULT_CHANNEL: &str = "/mem_hook";
pub const DEFAULT_CAPACITY: u32 = 1 << 16;

pub const CONFIG_VAR: &str = "MEM_HOOK_CONFIG";
pub const CHANNEL_VAR: &str = "MEM_HOOK_CHANNEL";
pub const CAPACITY_VAR: &str = "MEM_HOOK_CAPACITY";
pub const BUFFER_BYTES_VAR: &str = "MEM_HOOK_BUFFER_BYTES";
pub const SIZES_VAR: &str = "MEM_HOOK_SIZES";
pub const SIZE_RANGES_VAR: &str = "MEM_HOOK_SIZE_RANGES";
pub const KINDS_VAR: &str = "MEM_HOOK_KINDS";
pub const SKIP_FRAMES_VAR: &str = "MEM_HOOK_SKIP_FRAMES";
pub const REQUIRE_CXX_VAR: &str = "MEM_HOOK_REQUIRE_CXX";
pub const LOG_VAR: &str = "MEM_HOOK_LOG";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Shared-memory name of the event channel.
    pub channel: String,
    /// Number of event slots; a power of two.
    pub capacity: u32,
    /// Size the region in bytes instead of slots.  Wins over `capacity`.
    pub buffer_bytes: Option<u64>,
    /// Inclusive `[min, max]` allocation sizes to record.
    pub size_ranges: Vec<(u64, u64)>,
    /// Exact allocation sizes to record.
    pub sizes: Vec<u64>,
    /// Kinds to record; all of them when absent.
    pub kinds: Option<Vec<EventKind>>,
    /// Leading frames (the hooks themselves) dropped from every stack.
    pub skip_frames: usize,
    /// Treat unresolvable C++ operators as a bootstrap failure.
    pub require_cxx: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            channel: DEFAULT_CHANNEL.to_string(),
            capacity: DEFAULT_CAPACITY,
            buffer_bytes: None,
            size_ranges: Vec::new(),
            sizes: Vec::new(),
            kinds: None,
            skip_frames: 2,
            require_cxx: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_VAR) {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };

        if let Some(channel) = lookup(CHANNEL_VAR) {
            config.channel = channel;
        }
        if let Some(value) = lookup(CAPACITY_VAR) {
            config.capacity = parse_value(CAPACITY_VAR, &value)?;
        }
        if let Some(value) = lookup(BUFFER_BYTES_VAR) {
            config.buffer_bytes = Some(parse_value(BUFFER_BYTES_VAR, &value)?);
        }
        if let Some(value) = lookup(SIZES_VAR) {
            config.sizes = parse_list(SIZES_VAR, &value, |s| s.parse::<u64>())?;
        }
        if let Some(value) = lookup(SIZE_RANGES_VAR) {
            config.size_ranges = parse_list(SIZE_RANGES_VAR, &value, parse_range)?;
        }
        if let Some(value) = lookup(KINDS_VAR) {
            config.kinds = Some(parse_list(KINDS_VAR, &value, |s| s.parse::<EventKind>())?);
        }
        if let Some(value) = lookup(SKIP_FRAMES_VAR) {
            config.skip_frames = parse_value(SKIP_FRAMES_VAR, &value)?;
        }
        if let Some(value) = lookup(REQUIRE_CXX_VAR) {
            config.require_cxx = parse_value(REQUIRE_CXX_VAR, &value)?;
        }
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Config, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        serde_yaml::from_slice(&bytes).map_err(|source| ConfigError::Yaml {
            path: path.to_string(),
            source,
        })
    }

    /// Slot count the ring is created with.
    pub fn slot_capacity(&self) -> u32 {
        match self.buffer_bytes {
            Some(bytes) => ring::slots_for_bytes(bytes),
            None => self.capacity,
        }
    }

    pub fn size_filter(&self) -> SizeFilter {
        SizeFilter::new(
            self.size_ranges.iter().map(|&(lo, hi)| lo..=hi).collect(),
            self.sizes.clone(),
        )
    }

    pub fn kind_set(&self) -> KindSet {
        match &self.kinds {
            Some(kinds) => kinds.iter().copied().collect(),
            None => KindSet::ALL,
        }
    }
}

fn parse_value<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Value {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_list<T, E, F>(var: &'static str, value: &str, parse: F) -> Result<Vec<T>, ConfigError>
where
    F: Fn(&str) -> Result<T, E>,
    E: Display,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            parse(item).map_err(|e| ConfigError::Value {
                var,
                value: item.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

// "min-max", inclusive on both ends.
fn parse_range(item: &str) -> Result<(u64, u64), String> {
    let (lo, hi) = item
        .split_once('-')
        .ok_or_else(|| "expected MIN-MAX".to_string())?;
    let lo: u64 = lo.trim().parse().map_err(|e| format!("{}", e))?;
    let hi: u64 = hi.trim().parse().map_err(|e| format!("{}", e))?;
    if lo > hi {
        return Err(format!("empty range {}-{}", lo, hi));
    }
    Ok((lo, hi))
}
