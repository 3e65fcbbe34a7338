//! Tensor-expression fusion over a TorchScript-style graph IR.
//!
//! [`fuse_tensor_exprs`] walks a [`Graph`] consumers-first and replaces connected runs of fusible
//! elementwise and structural ops with `prim::TensorExprGroup_<n>` nodes that own the fused
//! subgraph. In-place ops are barriers, every fused value must live on one device, and groups
//! smaller than [`FuserConfig::min_group_size`] are left alone.
//!
//! ```
//! use tefuse::{fuse_tensor_exprs, parse_graph, FuserConfig};
//! use tefuse::testing::FileCheck;
//!
//! let mut graph = parse_graph(r#"
//! graph(%x : Float(16:1, device=cuda:0), %y : Float(16:1, device=cuda:0)):
//!   %a : Float(16:1, device=cuda:0) = aten::mul(%x, %y)
//!   %b : Float(16:1, device=cuda:0) = aten::relu(%a)
//!   return (%b)
//! "#)?;
//! let stats = fuse_tensor_exprs(&mut graph, &FuserConfig::default())?;
//! assert_eq!(stats.groups_created, 1);
//! FileCheck::new()
//!     .check("prim::TensorExprGroup_0")
//!     .check_not("aten::mul")
//!     .check("with prim::TensorExprGroup_0")
//!     .run_graph(&graph)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod env;
pub mod error;
pub mod fuser;
pub mod ir;
pub mod passes;
pub mod refcount;
pub mod testing;

pub use error::FuserError;
pub use fuser::{fuse_tensor_exprs, FuserConfig, TensorExprFuser};
pub use ir::{parse_graph, Graph};
pub use passes::{DeadCodeElimination, GraphPass, PassResult, Pipeline};
pub use refcount::{Ref, RefCount, RefCounted};
