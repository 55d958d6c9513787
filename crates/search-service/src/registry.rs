use std::collections::HashMap;
use std::sync::Arc;

use challenge_tree::{ChallengeResults, NodeId};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::scheduler::PhaseScheduler;
use crate::SearchError;

/// Optional setup hook run once before a phase's first iteration.
pub type InitializeFn =
    Arc<dyn Fn(Arc<PhaseScheduler>) -> BoxFuture<'static, Result<(), SearchError>> + Send + Sync>;

/// Picks the next node to evaluate.
pub type SelectFn =
    Arc<dyn Fn(Arc<PhaseScheduler>) -> BoxFuture<'static, Result<NodeId, SearchError>> + Send + Sync>;

/// Runs one challenge for a node and records the results on it.
pub type EvaluateFn = Arc<
    dyn Fn(Arc<PhaseScheduler>, NodeId) -> BoxFuture<'static, Result<ChallengeResults, SearchError>>
        + Send
        + Sync,
>;

/// Scores an evaluation trail; pure and synchronous.
pub type CalculateValueFn =
    Arc<dyn Fn(&PhaseScheduler, &ChallengeResults, &str) -> f64 + Send + Sync>;

/// Propagates a reward up the graph; synchronous.
pub type BackpropagateFn = Arc<dyn Fn(&PhaseScheduler, NodeId, f64) + Send + Sync>;

/// Grows the graph from an evaluated node.
pub type ExpandFn =
    Arc<dyn Fn(Arc<PhaseScheduler>, NodeId) -> BoxFuture<'static, Result<(), SearchError>> + Send + Sync>;

/// The strategy slots a phase can fill.
///
/// `initialize_phase` is optional; the scheduler fails with
/// [`SearchError::NoStrategy`] when any of the other slots is missing.
#[derive(Clone, Default)]
pub struct PhaseMethods {
    pub initialize_phase: Option<InitializeFn>,
    pub select_node: Option<SelectFn>,
    pub evaluate_node: Option<EvaluateFn>,
    pub calculate_node_value: Option<CalculateValueFn>,
    pub backpropagate_node_value: Option<BackpropagateFn>,
    pub expand_node: Option<ExpandFn>,
}

/// Process-wide table mapping phase names to their strategies.
pub struct PhaseRegistry {
    phases: RwLock<HashMap<String, PhaseMethods>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self {
            phases: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, phase_name: &str, methods: PhaseMethods) {
        debug!(phase = phase_name, "registered phase methods");
        self.phases.write().insert(phase_name.to_string(), methods);
    }

    pub fn methods(&self, phase_name: &str) -> Option<PhaseMethods> {
        self.phases.read().get(phase_name).cloned()
    }

    pub fn contains(&self, phase_name: &str) -> bool {
        self.phases.read().contains_key(phase_name)
    }

    pub fn phase_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.phases.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for PhaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The global registry, populated with the built-in phases on first use.
pub static PHASE_REGISTRY: Lazy<PhaseRegistry> = Lazy::new(|| {
    let registry = PhaseRegistry::new();
    crate::phases::register_builtin(&registry);
    registry
});
