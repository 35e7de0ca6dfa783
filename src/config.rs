//! Processor configuration and its INI loader.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::{GrafError, Result};

/// Default history depth, counting the current block.
pub const DEFAULT_TIME_SIZE: usize = 4;
/// Default position in the enumerated device list.
pub const DEFAULT_DEVICE_INDEX: usize = 0;
/// Default block length used by [`crate::GrafStream`].
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// How block data moves between host and device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Explicit write/read of device memory every block.
    #[default]
    Copy,
    /// Device buffers wrap host memory owned by the buffer for its whole lifetime.
    ZeroCopy,
}

/// What the output block holds when no valid result could be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Zero-fill the output.
    #[default]
    Silence,
    /// Copy the input block to the output.
    PassThrough,
}

impl FailurePolicy {
    pub fn apply(self, input: &[f64], output: &mut [f64]) {
        match self {
            FailurePolicy::Silence => output.fill(0.0),
            FailurePolicy::PassThrough => {
                let n = input.len().min(output.len());
                output[..n].copy_from_slice(&input[..n]);
                output[n..].fill(0.0);
            }
        }
    }
}

/// Construction-time parameters of a processing instance.
#[derive(Debug, Clone, PartialEq)]
pub struct GrafConfig {
    /// Blocks weighted by the coefficient tensor, including the current one.
    pub time_size: usize,
    /// Static index into the backend's enumerated device list.
    pub device_index: usize,
    pub transfer: TransferMode,
    pub failure_policy: FailurePolicy,
    /// Fixed block length for the streaming wrapper.
    pub block_size: usize,
}

impl Default for GrafConfig {
    fn default() -> Self {
        Self {
            time_size: DEFAULT_TIME_SIZE,
            device_index: DEFAULT_DEVICE_INDEX,
            transfer: TransferMode::default(),
            failure_policy: FailurePolicy::default(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl GrafConfig {
    pub fn new(time_size: usize) -> Result<Self> {
        Self {
            time_size,
            ..Self::default()
        }
        .validated()
    }

    pub fn with_device(mut self, device_index: usize) -> Self {
        self.device_index = device_index;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferMode) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn validated(self) -> Result<Self> {
        if self.time_size == 0 {
            return Err(GrafError::Config("time_size must be at least 1".to_string()));
        }
        if self.block_size == 0 {
            return Err(GrafError::Config("block_size must be positive".to_string()));
        }
        Ok(self)
    }

    /// Load from an INI file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_ini_str(&content)
    }

    pub fn from_ini_str(content: &str) -> Result<Self> {
        let params = parse_ini(content);
        let mut config = Self::default();

        if let Some(v) = params.get("time_size") {
            config.time_size = parse_usize("time_size", v)?;
        }
        if let Some(v) = params.get("device_index") {
            config.device_index = parse_usize("device_index", v)?;
        }
        if let Some(v) = params.get("block_size") {
            config.block_size = parse_usize("block_size", v)?;
        }
        if let Some(v) = params.get("transfer") {
            config.transfer = match v.to_ascii_lowercase().as_str() {
                "copy" => TransferMode::Copy,
                "zero_copy" | "zerocopy" => TransferMode::ZeroCopy,
                other => {
                    return Err(GrafError::Config(format!("unknown transfer mode '{}'", other)))
                }
            };
        }
        if let Some(v) = params.get("failure_policy") {
            config.failure_policy = match v.to_ascii_lowercase().as_str() {
                "silence" => FailurePolicy::Silence,
                "pass_through" | "passthrough" => FailurePolicy::PassThrough,
                other => {
                    return Err(GrafError::Config(format!("unknown failure policy '{}'", other)))
                }
            };
        }
        config.validated()
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|_| GrafError::Config(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

/// Simple INI parser
fn parse_ini(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') || line.starts_with('#') || line.starts_with(';') || line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = GrafConfig::default();
        assert_eq!(c.time_size, 4);
        assert_eq!(c.device_index, 0);
        assert_eq!(c.transfer, TransferMode::Copy);
        assert_eq!(c.failure_policy, FailurePolicy::Silence);
    }

    #[test]
    fn test_zero_time_size_rejected() {
        assert!(GrafConfig::new(0).is_err());
        assert!(GrafConfig::new(1).is_ok());
    }

    #[test]
    fn test_ini_parsing() {
        let ini = "[graf]\n# comment\ntime_size = 8\ndevice_index=2\ntransfer = zero_copy\nfailure_policy = pass_through\nblock_size = 128\nunknown = 1\n";
        let c = GrafConfig::from_ini_str(ini).unwrap();
        assert_eq!(c.time_size, 8);
        assert_eq!(c.device_index, 2);
        assert_eq!(c.transfer, TransferMode::ZeroCopy);
        assert_eq!(c.failure_policy, FailurePolicy::PassThrough);
        assert_eq!(c.block_size, 128);
    }

    #[test]
    fn test_ini_errors() {
        assert!(GrafConfig::from_ini_str("time_size = -1").is_err());
        assert!(GrafConfig::from_ini_str("transfer = dma").is_err());
        assert!(GrafConfig::from_ini_str("time_size = 0").is_err());
        assert_eq!(GrafConfig::from_ini_str("").unwrap(), GrafConfig::default());
    }

    #[test]
    fn test_failure_policy_apply() {
        let input = [1.0, 2.0, 3.0];
        let mut out = [9.0; 3];
        FailurePolicy::PassThrough.apply(&input, &mut out);
        assert_eq!(out, input);
        FailurePolicy::Silence.apply(&input, &mut out);
        assert_eq!(out, [0.0; 3]);
    }
}
