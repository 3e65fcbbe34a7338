use thiserror::Error;

use crate::fuser::ConfigError;
use crate::ir::{GraphError, LintError};

/// Failure of a graph pass. Fusion decisions themselves never fail; these cover malformed input
/// graphs, invalid configuration and rewrite invariants.
#[derive(Debug, Error)]
pub enum FuserError {
    #[error("input graph failed lint: {0}")]
    Lint(#[from] LintError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("graph rewrite failed: {0}")]
    Graph(#[from] GraphError),
    #[error("rewritten graph failed lint after {pass}: {source}")]
    Verify {
        pass: &'static str,
        #[source]
        source: LintError,
    },
}
