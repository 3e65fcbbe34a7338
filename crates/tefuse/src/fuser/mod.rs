//! Tensor-expression fusion: which nodes may be fused, which may share a kernel, and the pass
//! that rewrites groups of them into `prim::TensorExprGroup_<n>` nodes.

mod config;
mod device;
mod fusible;
mod group;
mod partition;
mod rewrite;

pub use config::{ConfigError, DeviceGate, FuserConfig, DEFAULT_MIN_GROUP_SIZE};
pub use device::{devices_consistent, devices_of, DeviceSet};
pub use fusible::{check_fusible, is_fusible, RejectReason};
pub use group::FusionGroup;
pub use partition::{fuse_tensor_exprs, TensorExprFuser};
