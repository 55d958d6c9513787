//! Phase 2: targeted search of hard combinations.
//!
//! Node values measure how challenging the model found a problem, so the
//! search drifts toward combinations the model struggles with. Phase 1's
//! performance scores are wiped at startup so they cannot bias the hardness
//! signal.

use std::sync::Arc;

use challenge_tree::{ChallengeResults, NodeId};
use futures::FutureExt;
use tracing::info;

use crate::registry::{PhaseMethods, PhaseRegistry};
use crate::scheduler::PhaseScheduler;
use crate::SearchError;

pub fn register(registry: &PhaseRegistry) {
    registry.register(
        "phase_2",
        PhaseMethods {
            initialize_phase: Some(Arc::new(|scheduler| {
                initialize_phase(scheduler).boxed()
            })),
            select_node: Some(Arc::new(|scheduler| select_node(scheduler).boxed())),
            evaluate_node: Some(Arc::new(|scheduler, node_id| {
                async move { super::run_challenge_for_node(&scheduler, node_id, None).await }
                    .boxed()
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
            expand_node: Some(Arc::new(|scheduler, node_id| {
                super::expand_from(scheduler, node_id, 2).boxed()
            })),
        },
    );
}

/// Re-score every node with the hardness function over its most recent
/// evaluation, so earlier performance values do not carry over.
async fn initialize_phase(scheduler: Arc<PhaseScheduler>) -> Result<(), SearchError> {
    let rescored: Vec<(NodeId, f64)> = {
        let tree = scheduler.tree.read();
        tree.nodes_in_order()
            .map(|node| {
                let value = node
                    .run_results
                    .last()
                    .map(super::hardness_score)
                    .unwrap_or(0.0);
                (node.id, value)
            })
            .collect()
    };

    let count = rescored.len();
    let mut tree = scheduler.tree.write();
    for (node_id, value) in rescored {
        if let Some(node) = tree.node_mut(&node_id) {
            node.value = value;
        }
    }
    info!(nodes = count, "re-scored tree with hardness values");
    Ok(())
}

/// Sample proportionally to hardness, then descend to a leaf.
async fn select_node(scheduler: Arc<PhaseScheduler>) -> Result<NodeId, SearchError> {
    let (candidates, weights) = {
        let tree = scheduler.tree.read();
        let candidates: Vec<NodeId> = tree.ids().collect();
        let weights: Vec<f64> = tree
            .nodes_in_order()
            .map(|node| node.value + 1e-3)
            .collect();
        (candidates, weights)
    };
    super::select_with_weights(&scheduler, candidates, weights)
}
