use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placement of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl Device {
    pub fn is_cpu(self) -> bool {
        matches!(self, Device::Cpu)
    }

    pub fn is_cuda(self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid device `{0}`")]
pub struct ParseDeviceError(pub String);

impl FromStr for Device {
    type Err = ParseDeviceError;

    /// Accepts `cpu`, `cuda` (device 0) and `cuda:N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse::<u32>().ok())
                .map(Device::Cuda)
                .ok_or_else(|| ParseDeviceError(other.to_string())),
        }
    }
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Float,
    Double,
    Half,
    BFloat16,
    Int,
    Long,
    Short,
    Char,
    Byte,
    Bool,
}

impl ScalarType {
    pub const ALL: [ScalarType; 10] = [
        ScalarType::Float,
        ScalarType::Double,
        ScalarType::Half,
        ScalarType::BFloat16,
        ScalarType::Int,
        ScalarType::Long,
        ScalarType::Short,
        ScalarType::Char,
        ScalarType::Byte,
        ScalarType::Bool,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScalarType::Float => "Float",
            ScalarType::Double => "Double",
            ScalarType::Half => "Half",
            ScalarType::BFloat16 => "BFloat16",
            ScalarType::Int => "Int",
            ScalarType::Long => "Long",
            ScalarType::Short => "Short",
            ScalarType::Char => "Char",
            ScalarType::Byte => "Byte",
            ScalarType::Bool => "Bool",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.as_str() == name)
    }

    pub fn is_floating_point(self) -> bool {
        matches!(
            self,
            ScalarType::Float | ScalarType::Double | ScalarType::Half | ScalarType::BFloat16
        )
    }
}

/// One tensor dimension: size and stride, each possibly unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dim {
    pub size: Option<usize>,
    pub stride: Option<usize>,
}

impl Dim {
    pub fn new(size: usize) -> Self {
        Self {
            size: Some(size),
            stride: None,
        }
    }

    pub fn with_stride(size: usize, stride: usize) -> Self {
        Self {
            size: Some(size),
            stride: Some(stride),
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }
}

/// Tensor annotation. Every field may be unknown; a bare `Tensor` has none of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub scalar: Option<ScalarType>,
    pub dims: Option<Vec<Dim>>,
    pub device: Option<Device>,
}

impl TensorType {
    /// A tensor about which nothing is known.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Contiguous tensor with fully known sizes.
    pub fn contiguous(scalar: ScalarType, sizes: &[usize], device: Device) -> Self {
        let mut stride = 1usize;
        let mut dims = vec![Dim::default(); sizes.len()];
        for (idx, &size) in sizes.iter().enumerate().rev() {
            dims[idx] = Dim::with_stride(size, stride);
            stride = stride.saturating_mul(size.max(1));
        }
        Self {
            scalar: Some(scalar),
            dims: Some(dims),
            device: Some(device),
        }
    }

    pub fn with_device(mut self, device: Option<Device>) -> Self {
        self.device = device;
        self
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    pub fn sizes(&self) -> Option<Vec<Option<usize>>> {
        self.dims
            .as_ref()
            .map(|dims| dims.iter().map(|dim| dim.size).collect())
    }

    /// Device and rank are both known.
    pub fn is_complete(&self) -> bool {
        self.device.is_some() && self.rank().is_some()
    }

    pub fn is_unknown(&self) -> bool {
        self.scalar.is_none() && self.dims.is_none() && self.device.is_none()
    }
}

/// Type of an SSA value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorType),
    TensorList,
    IntList,
    Int,
    Float,
    Bool,
    Str,
    NoneType,
}

impl ValueType {
    pub fn tensor(ty: TensorType) -> Self {
        ValueType::Tensor(ty)
    }

    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            ValueType::Tensor(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, ValueType::Tensor(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_parsing_accepts_bare_cuda() {
        assert_eq!("cpu".parse::<Device>(), Ok(Device::Cpu));
        assert_eq!("cuda".parse::<Device>(), Ok(Device::Cuda(0)));
        assert_eq!("cuda:3".parse::<Device>(), Ok(Device::Cuda(3)));
        assert!("cuda:x".parse::<Device>().is_err());
        assert!("tpu".parse::<Device>().is_err());
    }

    #[test]
    fn devices_compare_by_kind_and_index() {
        assert_ne!(Device::Cpu, Device::Cuda(0));
        assert_ne!(Device::Cuda(0), Device::Cuda(1));
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }

    #[test]
    fn contiguous_strides_are_row_major() {
        let ty = TensorType::contiguous(ScalarType::Float, &[2, 3, 4], Device::Cpu);
        let strides = ty
            .dims
            .as_ref()
            .map(|dims| dims.iter().map(|d| d.stride).collect::<Vec<_>>());
        assert_eq!(strides, Some(vec![Some(12), Some(4), Some(1)]));
        assert_eq!(ty.rank(), Some(3));
        assert!(ty.is_complete());
    }

    #[test]
    fn zero_rank_is_still_complete() {
        let ty = TensorType {
            scalar: Some(ScalarType::Float),
            dims: Some(Vec::new()),
            device: Some(Device::Cuda(0)),
        };
        assert_eq!(ty.rank(), Some(0));
        assert!(ty.is_complete());
        assert!(!TensorType::unknown().is_complete());
    }
}
