use std::sync::Arc;

use tracing::debug;

use crate::error::FuserError;
use crate::fuser::{FuserConfig, TensorExprFuser};
use crate::ir::Graph;
use crate::passes::{DeadCodeElimination, GraphPass, PassResult};

pub enum Step {
    Pass(Arc<dyn GraphPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn GraphPass>) {
        self.steps.push(Step::Pass(pass));
    }

    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Pipeline {
        Pipeline { steps: self.steps }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered list of passes run over one graph.
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Fuser followed, unless `skip_dce` is set, by dead code elimination.
    pub fn tensorexpr(config: FuserConfig, skip_dce: bool) -> Pipeline {
        let mut builder = PipelineBuilder::new();
        builder.pass(Arc::new(TensorExprFuser::new(config)));
        if !skip_dce {
            builder.pass(Arc::new(DeadCodeElimination::default()));
        }
        builder.finish()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step in order and returns the accumulated statistics. When `verify` is set the
    /// graph is linted after each pass.
    pub fn run(&self, graph: &mut Graph, verify: bool) -> Result<PassResult, FuserError> {
        let mut totals = PassResult::default();
        run_steps(&self.steps, graph, verify, &mut totals)?;
        Ok(totals)
    }
}

fn run_steps(
    steps: &[Step],
    graph: &mut Graph,
    verify: bool,
    totals: &mut PassResult,
) -> Result<bool, FuserError> {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let stats = pass.run(graph)?;
                debug!(
                    pass = pass.name(),
                    changed = stats.changed,
                    groups = stats.groups_created,
                    fused = stats.nodes_fused,
                    erased = stats.erased_nodes,
                    nodes = graph.len(),
                    "pass finished"
                );
                if verify {
                    graph.lint().map_err(|source| FuserError::Verify {
                        pass: pass.name(),
                        source,
                    })?;
                }
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                loop {
                    if iter >= *max_iters {
                        debug!(max_iters, "fixed point did not converge");
                        break;
                    }
                    iter += 1;
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, graph, verify, &mut local)?;
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    Ok(changed_any)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Reports a change for the first `budget` runs.
    struct Countdown {
        budget: usize,
        runs: AtomicUsize,
    }

    impl GraphPass for Countdown {
        fn name(&self) -> &'static str {
            "countdown"
        }

        fn run(&self, _graph: &mut Graph) -> Result<PassResult, FuserError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(PassResult {
                changed: run < self.budget,
                ..PassResult::default()
            })
        }
    }

    #[test]
    fn fixed_point_stops_once_nothing_changes() {
        let pass = Arc::new(Countdown {
            budget: 2,
            runs: AtomicUsize::new(0),
        });
        let mut builder = Pipeline::builder();
        let inner = Arc::clone(&pass);
        builder.fixed_point(10, move |p| p.pass(inner));
        let result = builder.finish().run(&mut Graph::new(), true).unwrap();
        assert!(result.changed);
        assert_eq!(pass.runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fixed_point_respects_its_iteration_bound() {
        let pass = Arc::new(Countdown {
            budget: usize::MAX,
            runs: AtomicUsize::new(0),
        });
        let mut builder = Pipeline::builder();
        let inner = Arc::clone(&pass);
        builder.fixed_point(4, move |p| p.pass(inner));
        builder.finish().run(&mut Graph::new(), false).unwrap();
        assert_eq!(pass.runs.load(Ordering::SeqCst), 4);
    }
}
