//! Phase 1: broad exploration with performance scoring.
//!
//! Selection favours unexplored regions, node values track how well the
//! model performs, and strong nodes are expanded into harder or broader
//! challenges.

use std::sync::Arc;

use challenge_tree::{ChallengeResults, NodeId};
use futures::FutureExt;
use tracing::debug;

use crate::config::ScoringParams;
use crate::registry::{PhaseMethods, PhaseRegistry};
use crate::scheduler::PhaseScheduler;
use crate::SearchError;

/// When at least this many nodes are still unexplored, selection targets
/// them exclusively.
const ZERO_VALUE_PRIORITY_THRESHOLD: usize = 20;

const DIFFICULTY_WEIGHTS: [(&str, f64); 5] = [
    ("very easy", 1.0),
    ("easy", 1.5),
    ("medium", 2.0),
    ("hard", 2.5),
    ("very hard", 3.0),
];

const MAX_DIFFICULTY_WEIGHT: f64 = 3.0;

pub fn register(registry: &PhaseRegistry) {
    registry.register(
        "phase_1",
        PhaseMethods {
            initialize_phase: None,
            select_node: Some(Arc::new(|scheduler| select_node(scheduler).boxed())),
            evaluate_node: Some(Arc::new(|scheduler, node_id| {
                async move { super::run_challenge_for_node(&scheduler, node_id, None).await }
                    .boxed()
            })),
            calculate_node_value: Some(Arc::new(
                |scheduler: &PhaseScheduler, results: &ChallengeResults, difficulty: &str| {
                    performance_score(&scheduler.scoring_params, results, difficulty)
                },
            )),
            backpropagate_node_value: Some(Arc::new(
                |scheduler: &PhaseScheduler, node_id: NodeId, reward: f64| {
                    let mut tree = scheduler.tree.write();
                    super::backpropagate(
                        &mut tree,
                        node_id,
                        reward,
                        scheduler.search_params.learning_rate,
                        scheduler.search_params.discount_factor,
                    );
                },
            )),
            expand_node: Some(Arc::new(|scheduler, node_id| {
                super::expand_from(scheduler, node_id, 1).boxed()
            })),
        },
    );
}

/// Sample a node proportionally to value, prioritising unexplored nodes
/// while enough of them remain, then descend to a leaf.
async fn select_node(scheduler: Arc<PhaseScheduler>) -> Result<NodeId, SearchError> {
    let (candidates, weights) = {
        let tree = scheduler.tree.read();
        let candidates: Vec<NodeId> = tree.ids().collect();
        let values: Vec<f64> = tree.nodes_in_order().map(|node| node.value).collect();

        let zero_value_count = values.iter().filter(|value| **value == 0.0).count();
        let weights = if zero_value_count >= ZERO_VALUE_PRIORITY_THRESHOLD {
            debug!(count = zero_value_count, "prioritizing unexplored nodes");
            values
                .iter()
                .map(|value| if *value == 0.0 { 1.0 } else { 0.0 })
                .collect()
        } else {
            values.iter().map(|value| value + 1e-3).collect()
        };
        (candidates, weights)
    };

    super::select_with_weights(&scheduler, candidates, weights)
}

fn difficulty_weight(difficulty: &str) -> f64 {
    DIFFICULTY_WEIGHTS
        .iter()
        .find(|(name, _)| *name == difficulty)
        .map(|(_, weight)| *weight)
        .unwrap_or(1.0)
}

/// Normalised performance score in [0, 1].
///
/// Success earns a difficulty-weighted base, each passed test adds one
/// point, and failures, errors, extra attempts and fixer rescues are
/// penalised.
pub(crate) fn performance_score(
    scoring: &ScoringParams,
    results: &ChallengeResults,
    difficulty: &str,
) -> f64 {
    let base_score = if results.success {
        10.0 * difficulty_weight(difficulty)
    } else {
        0.0
    };

    let mut num_passed = 0u32;
    let mut num_failed = 0u32;
    let mut num_errored = 0u32;
    for attempt in &results.data_trail {
        num_passed += attempt.tests_passed_num;
        num_failed += attempt.tests_failed_num;
        num_errored += attempt.tests_errored_num;
    }

    let attempts_till_success = results.attempts_till_success();
    let failure_penalty = f64::from(num_failed) * scoring.penalty_per_failure;
    let error_penalty = f64::from(num_errored) * scoring.penalty_per_error;
    let attempt_penalty =
        attempts_till_success.saturating_sub(1) as f64 * scoring.penalty_per_attempt;
    let fixer_penalty = if results.fixed_by_problem_fixer() {
        scoring.fixed_by_problem_fixer_penalty
    } else {
        0.0
    };

    let raw_score = (base_score + f64::from(num_passed)
        - (failure_penalty + error_penalty + attempt_penalty + fixer_penalty))
        .max(0.0);

    let max_raw_score = 10.0 * MAX_DIFFICULTY_WEIGHT + scoring.max_num_passed;
    raw_score / max_raw_score
}
