use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::env;
use crate::ir::Device;

pub const DEFAULT_MIN_GROUP_SIZE: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("min_group_size must be at least 1")]
    InvalidMinGroupSize,
    #[error("invalid fuser configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decides whether fused kernels may target a device at all.
pub trait DeviceGate {
    fn can_fuse_on_device(&self, device: Device) -> bool;
}

/// Settings of one fuser run. Passed by value at call time; nothing here is global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuserConfig {
    /// Smallest number of nodes a group needs to be materialized.
    pub min_group_size: usize,
    /// Allow groups on CPU tensors.
    pub cpu_fusion: bool,
    /// Allow groups on CUDA tensors.
    pub gpu_fusion: bool,
}

impl Default for FuserConfig {
    fn default() -> Self {
        Self {
            min_group_size: DEFAULT_MIN_GROUP_SIZE,
            cpu_fusion: false,
            gpu_fusion: true,
        }
    }
}

impl FuserConfig {
    /// Defaults overridden by `TEFUSE_MIN_GROUP_SIZE`, `TEFUSE_CPU_FUSION` and
    /// `TEFUSE_GPU_FUSION`. The environment is read once per process.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_group_size: env::min_group_size().unwrap_or(defaults.min_group_size),
            cpu_fusion: env::cpu_fusion().unwrap_or(defaults.cpu_fusion),
            gpu_fusion: env::gpu_fusion().unwrap_or(defaults.gpu_fusion),
        }
    }

    /// Parses a JSON object; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: FuserConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_min_group_size(mut self, min_group_size: usize) -> Self {
        self.min_group_size = min_group_size;
        self
    }

    pub fn with_cpu_fusion(mut self, enabled: bool) -> Self {
        self.cpu_fusion = enabled;
        self
    }

    pub fn with_gpu_fusion(mut self, enabled: bool) -> Self {
        self.gpu_fusion = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_group_size == 0 {
            return Err(ConfigError::InvalidMinGroupSize);
        }
        Ok(())
    }
}

impl DeviceGate for FuserConfig {
    fn can_fuse_on_device(&self, device: Device) -> bool {
        match device {
            Device::Cpu => self.cpu_fusion,
            Device::Cuda(_) => self.gpu_fusion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_fusion_is_off_by_default() {
        let config = FuserConfig::default();
        assert_eq!(config.min_group_size, 2);
        assert!(!config.can_fuse_on_device(Device::Cpu));
        assert!(config.can_fuse_on_device(Device::Cuda(1)));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = FuserConfig::from_json(r#"{ "cpu_fusion": true }"#).unwrap();
        assert_eq!(
            config,
            FuserConfig::default().with_cpu_fusion(true)
        );
    }

    #[test]
    fn zero_min_group_size_is_rejected() {
        let err = FuserConfig::from_json(r#"{ "min_group_size": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMinGroupSize));
        assert!(matches!(
            FuserConfig::from_json("{ not json"),
            Err(ConfigError::Json(_))
        ));
    }
}
