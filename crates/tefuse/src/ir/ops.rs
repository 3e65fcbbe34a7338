use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Kind prefix shared by every grouping node created by the fuser.
pub const TENSOR_EXPR_GROUP_PREFIX: &str = "prim::TensorExprGroup_";

pub mod symbols {
    pub const CONSTANT: &str = "prim::Constant";
    pub const LIST_CONSTRUCT: &str = "prim::ListConstruct";
    pub const CAT: &str = "aten::cat";
}

/// Operator identifier of the form `namespace::name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::from(name.into()))
    }

    /// Kind of the `index`-th grouping node of a graph.
    pub fn tensor_expr_group(index: usize) -> Self {
        Self::new(format!("{TENSOR_EXPR_GROUP_PREFIX}{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once("::").map(|(ns, _)| ns)
    }

    pub fn name(&self) -> &str {
        self.0
            .split_once("::")
            .map(|(_, name)| name)
            .unwrap_or(&self.0)
    }

    pub fn is(&self, name: &str) -> bool {
        &*self.0 == name
    }

    pub fn is_tensor_expr_group(&self) -> bool {
        self.group_index().is_some()
    }

    /// Counter suffix of a grouping node kind.
    pub fn group_index(&self) -> Option<usize> {
        self.0
            .strip_prefix(TENSOR_EXPR_GROUP_PREFIX)
            .and_then(|suffix| suffix.parse().ok())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol::new(value)
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Symbol::new)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Pointwise arithmetic and activations.
    Elementwise,
    /// Data movement ops a fused kernel can express (list construction, concatenation).
    Structural,
    Constant,
    Other,
}

/// Capabilities of an operator as seen by graph passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorSchema {
    pub class: OpClass,
    /// The op writes its result into its first operand.
    pub mutates_first_operand: bool,
}

impl OperatorSchema {
    pub const fn new(class: OpClass) -> Self {
        Self {
            class,
            mutates_first_operand: false,
        }
    }

    pub const fn in_place(class: OpClass) -> Self {
        Self {
            class,
            mutates_first_operand: true,
        }
    }

    pub fn is_fusible_class(&self) -> bool {
        matches!(self.class, OpClass::Elementwise | OpClass::Structural)
    }
}

const ELEMENTWISE_BINARY: &[&str] = &[
    "add", "sub", "mul", "div", "pow", "fmod", "remainder", "atan2", "min", "max", "eq", "ne",
    "lt", "le", "gt", "ge", "__and__", "__or__", "__xor__", "__lshift__", "__rshift__", "lerp",
];

const ELEMENTWISE_UNARY: &[&str] = &[
    "neg",
    "abs",
    "exp",
    "expm1",
    "log",
    "log2",
    "log10",
    "log1p",
    "sqrt",
    "rsqrt",
    "reciprocal",
    "sin",
    "cos",
    "tan",
    "asin",
    "acos",
    "atan",
    "sinh",
    "cosh",
    "tanh",
    "sigmoid",
    "relu",
    "erf",
    "erfc",
    "floor",
    "ceil",
    "round",
    "trunc",
    "frac",
    "sign",
    "clamp",
    "threshold",
];

const ELEMENTWISE_OTHER: &[&str] = &["where", "type_as", "addcmul"];

/// Operator capabilities keyed by symbol.
#[derive(Debug, Clone, Default)]
pub struct OpRegistry {
    schemas: HashMap<Symbol, OperatorSchema>,
}

static GLOBAL_REGISTRY: Lazy<Arc<OpRegistry>> = Lazy::new(|| Arc::new(OpRegistry::with_aten()));

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared registry preloaded with [`OpRegistry::with_aten`].
    pub fn global() -> Arc<OpRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Registry with the ATen elementwise ops, their in-place `_` variants, list construction,
    /// concatenation and constants.
    pub fn with_aten() -> Self {
        let mut registry = Self::new();
        for name in ELEMENTWISE_BINARY
            .iter()
            .chain(ELEMENTWISE_UNARY)
            .chain(ELEMENTWISE_OTHER)
        {
            registry.register(
                format!("aten::{name}"),
                OperatorSchema::new(OpClass::Elementwise),
            );
            registry.register(
                format!("aten::{name}_"),
                OperatorSchema::in_place(OpClass::Elementwise),
            );
        }
        registry.register(symbols::CAT, OperatorSchema::new(OpClass::Structural));
        registry.register(
            symbols::LIST_CONSTRUCT,
            OperatorSchema::new(OpClass::Structural),
        );
        registry.register(symbols::CONSTANT, OperatorSchema::new(OpClass::Constant));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, schema: OperatorSchema) {
        self.schemas.insert(Symbol::new(name), schema);
    }

    pub fn schema(&self, kind: &Symbol) -> Option<&OperatorSchema> {
        self.schemas.get(kind)
    }

    pub fn is_mutating(&self, kind: &Symbol) -> bool {
        self.schema(kind)
            .map(|schema| schema.mutates_first_operand)
            .unwrap_or(false)
    }

    pub fn class_of(&self, kind: &Symbol) -> OpClass {
        self.schema(kind)
            .map(|schema| schema.class)
            .unwrap_or(OpClass::Other)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
