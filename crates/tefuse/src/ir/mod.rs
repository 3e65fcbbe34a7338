//! Graph IR consumed and produced by the fuser: typed SSA values, ordered nodes, grouping-node
//! subgraphs, a text format and structural checks.

pub mod graph;
pub mod index;
pub mod lint;
pub mod ops;
mod print;
pub mod text;
pub mod types;

pub use graph::{Attribute, Graph, GraphError, Node, NodeId, NodeSpec, Value, ValueId};
pub use index::GraphIndex;
pub use lint::LintError;
pub use ops::{symbols, OpClass, OpRegistry, OperatorSchema, Symbol, TENSOR_EXPR_GROUP_PREFIX};
pub use text::{parse_graph, parse_graph_with_names, ParsedGraph, TextIrError};
pub use types::{Device, Dim, ParseDeviceError, ScalarType, TensorType, ValueType};
