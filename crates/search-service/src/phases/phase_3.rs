//! Phase 3: variant generation on hard nodes.
//!
//! Every phase-2 node whose hardness clears the selection threshold is given
//! a set of variant children with the same concepts and difficulty. Only
//! those variants are evaluated, each time telling the environment which
//! problems its siblings already produced so it generates something new.
//! The graph does not grow any further in this phase.

use std::sync::Arc;

use challenge_tree::{ChallengeResults, NodeId, NodeOverrides};
use futures::FutureExt;
use tracing::info;

use crate::registry::{PhaseMethods, PhaseRegistry};
use crate::scheduler::PhaseScheduler;
use crate::SearchError;

pub fn register(registry: &PhaseRegistry) {
    registry.register(
        "phase_3",
        PhaseMethods {
            initialize_phase: Some(Arc::new(|scheduler| {
                initialize_phase(scheduler).boxed()
            })),
            select_node: Some(Arc::new(|scheduler| select_node(scheduler).boxed())),
            evaluate_node: Some(Arc::new(|scheduler, node_id| {
                evaluate_node(scheduler, node_id).boxed()
            })),
            calculate_node_value: Some(Arc::new(
                |_scheduler: &PhaseScheduler, results: &ChallengeResults, _difficulty: &str| {
                    super::hardness_score(results)
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
            // phase 3 does not grow the graph
            expand_node: Some(Arc::new(|_scheduler, _node_id| {
                async { Ok(()) }.boxed()
            })),
        },
    );
}

/// Snapshot the phase-2 value of every hard node and create its variant
/// children.
async fn initialize_phase(scheduler: Arc<PhaseScheduler>) -> Result<(), SearchError> {
    let threshold = scheduler.phase_params.node_selection_threshold;
    let selected: Vec<NodeId> = {
        let tree = scheduler.tree.read();
        tree.nodes_in_order()
            .filter(|node| node.phase == 2 && node.value > threshold)
            .map(|node| node.id)
            .collect()
    };

    let variations = scheduler.phase_params.variations_per_concept;
    let mut created = 0usize;
    {
        let mut tree = scheduler.tree.write();
        for node_id in &selected {
            let Some((value, concepts, difficulty)) = tree
                .node(node_id)
                .map(|node| (node.value, node.concepts.clone(), node.difficulty.clone()))
            else {
                continue;
            };
            if let Some(node) = tree.node_mut(node_id) {
                node.phase_2_value = Some(value);
            }
            for _ in 0..variations {
                tree.add_node(
                    &[*node_id],
                    NodeOverrides {
                        concepts: Some(concepts.clone()),
                        difficulty: Some(difficulty.clone()),
                        phase: Some(3),
                    },
                )?;
                created += 1;
            }
        }
    }

    info!(
        selected = selected.len(),
        created, "created variant nodes for hard challenges"
    );
    Ok(())
}

/// Sample among variant nodes only.
async fn select_node(scheduler: Arc<PhaseScheduler>) -> Result<NodeId, SearchError> {
    let (candidates, weights) = {
        let tree = scheduler.tree.read();
        let candidates: Vec<NodeId> = tree
            .nodes_in_order()
            .filter(|node| node.phase == 3)
            .map(|node| node.id)
            .collect();
        let weights: Vec<f64> = candidates
            .iter()
            .map(|id| tree.node(id).map(|node| node.value + 1e-3).unwrap_or(0.0))
            .collect();
        (candidates, weights)
    };
    super::select_with_weights(&scheduler, candidates, weights)
}

/// Run the challenge with every sibling's problem statement attached, so
/// the environment generates a genuinely different variant.
async fn evaluate_node(
    scheduler: Arc<PhaseScheduler>,
    node_id: NodeId,
) -> Result<ChallengeResults, SearchError> {
    let previous_problems = sibling_problems(&scheduler, &node_id);
    super::run_challenge_for_node(&scheduler, node_id, Some(previous_problems)).await
}

/// Problem statements from every other phase-3 child of each parent, drawn
/// from their latest trail. Variants without a trail contribute an empty
/// string.
fn sibling_problems(scheduler: &PhaseScheduler, node_id: &NodeId) -> Vec<String> {
    let tree = scheduler.tree.read();
    let Some(node) = tree.node(node_id) else {
        return Vec::new();
    };
    let mut problems = Vec::new();
    for parent in &node.parents {
        let Some(parent_node) = tree.node(parent) else {
            continue;
        };
        for sibling in &parent_node.children {
            if sibling == node_id {
                continue;
            }
            let Some(sibling_node) = tree.node(sibling) else {
                continue;
            };
            // a promoted node may also carry children from earlier phases;
            // only fellow variants count
            if sibling_node.phase != 3 {
                continue;
            }
            let statement = sibling_node
                .run_results
                .last()
                .and_then(|results| results.first_success_or_last())
                .map(|attempt| attempt.problem_statement.clone())
                .unwrap_or_default();
            problems.push(statement);
        }
    }
    problems
}
