//! Built-in phase strategies.
//!
//! Each phase module fills the registry slots for one search phase. The
//! selection, expansion and backpropagation machinery they share lives here.

pub mod phase_1;
pub mod phase_2;
pub mod phase_3;

use std::cmp::Ordering;
use std::sync::Arc;

use challenge_tree::tree::DEFAULT_EXPLORATION_WEIGHT;
use challenge_tree::{ChallengeResults, NodeId, NodeOverrides, Tree};
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::environment::ChallengeRequest;
use crate::registry::PhaseRegistry;
use crate::scheduler::PhaseScheduler;
use crate::SearchError;

/// Register every built-in phase with the given registry.
pub fn register_builtin(registry: &PhaseRegistry) {
    phase_1::register(registry);
    phase_2::register(registry);
    phase_3::register(registry);
}

/// Pick a candidate (exploration vs weighted sampling), then walk down to a
/// leaf alternating between random children and the best UCB1 child.
pub(crate) fn select_with_weights(
    scheduler: &PhaseScheduler,
    candidates: Vec<NodeId>,
    weights: Vec<f64>,
) -> Result<NodeId, SearchError> {
    if candidates.is_empty() {
        return Err(SearchError::Selection(
            "no candidate nodes available".to_string(),
        ));
    }

    let exploration = scheduler.phase_params.exploration_probability;
    let explore = scheduler.rng().gen::<f64>() < exploration;
    let root = if explore {
        let picked = *candidates
            .choose(&mut *scheduler.rng())
            .expect("candidates checked non-empty");
        debug!(node = %picked, "random exploration pick");
        picked
    } else {
        match WeightedIndex::new(&weights) {
            Ok(dist) => candidates[dist.sample(&mut *scheduler.rng())],
            // all-zero weights: fall back to a uniform pick
            Err(_) => *candidates
                .choose(&mut *scheduler.rng())
                .expect("candidates checked non-empty"),
        }
    };

    Ok(descend_to_leaf(scheduler, root))
}

/// Walk down from `start` until a leaf, choosing at each step between a
/// random child (exploration) and the child maximising UCB1.
pub(crate) fn descend_to_leaf(scheduler: &PhaseScheduler, start: NodeId) -> NodeId {
    let exploration = scheduler.phase_params.exploration_probability;
    let tree = scheduler.tree.read();
    let mut current = start;
    loop {
        let children = match tree.node(&current) {
            Some(node) if !node.children.is_empty() => node.children.clone(),
            _ => break,
        };
        current = if scheduler.rng().gen::<f64>() < exploration {
            *children
                .choose(&mut *scheduler.rng())
                .expect("children checked non-empty")
        } else {
            children
                .iter()
                .copied()
                .max_by(|a, b| {
                    tree.ucb1(a, DEFAULT_EXPLORATION_WEIGHT)
                        .partial_cmp(&tree.ucb1(b, DEFAULT_EXPLORATION_WEIGHT))
                        .unwrap_or(Ordering::Equal)
                })
                .expect("children checked non-empty")
        };
    }
    current
}

/// Run the environment challenge for a node and append the results to its
/// trail.
pub(crate) async fn run_challenge_for_node(
    scheduler: &Arc<PhaseScheduler>,
    node_id: NodeId,
    previous_problems: Option<Vec<String>>,
) -> Result<ChallengeResults, SearchError> {
    let (concepts, difficulty) = {
        let tree = scheduler.tree.read();
        let node = tree.node(&node_id).ok_or_else(|| SearchError::PhaseExecution {
            phase: scheduler.phase_name.clone(),
            reason: format!("node {node_id} is no longer in the tree"),
        })?;
        (node.concepts.clone(), node.difficulty.clone())
    };

    let results = scheduler
        .environment
        .run_challenge(ChallengeRequest {
            concept: concepts,
            difficulty_level: difficulty,
            max_attempts: Some(scheduler.search_params.max_attempts),
            previous_problems,
        })
        .await;

    debug!(
        node = %node_id,
        success = results.success,
        attempts = results.data_trail.len(),
        "challenge completed"
    );

    {
        let mut tree = scheduler.tree.write();
        if let Some(node) = tree.node_mut(&node_id) {
            node.run_results.push(results.clone());
        }
    }

    Ok(results)
}

/// TD-style backpropagation: blend the reward into the node, then recurse to
/// every parent with the reward discounted by `gamma` per level.
pub(crate) fn backpropagate(
    tree: &mut Tree,
    node_id: NodeId,
    reward: f64,
    learning_rate: f64,
    gamma: f64,
) {
    let mut stack = vec![(node_id, reward)];
    while let Some((current, current_reward)) = stack.pop() {
        let parents = match tree.node_mut(&current) {
            Some(node) => {
                node.update_score(learning_rate, current_reward);
                node.parents.clone()
            }
            None => continue,
        };
        for parent in parents {
            stack.push((parent, current_reward * gamma));
        }
    }
}

/// Repeated expansion shared by phases 1 and 2.
///
/// While the current node clears the performance threshold and depth budget,
/// either combine it with a second selected node (adding concepts) or expand
/// it alone (advancing difficulty). Fresh nodes are evaluated in place before
/// expansion continues from them. `origin` holds the expansion slot and is
/// therefore excluded from the "ancestor being expanded elsewhere" check.
pub(crate) async fn expand_from(
    scheduler: Arc<PhaseScheduler>,
    origin: NodeId,
    phase_tag: u8,
) -> Result<(), SearchError> {
    let mut current = origin;
    let mut expansions = 0usize;
    // Deduplication can hand back a node this walk has already visited
    // (e.g. at the difficulty cap); revisiting one would loop forever.
    let mut seen: std::collections::HashSet<NodeId> = [origin].into_iter().collect();

    loop {
        let Some((value, depth)) = ({
            let tree = scheduler.tree.read();
            tree.node(&current).map(|node| (node.value, node.depth))
        }) else {
            break;
        };
        if value < scheduler.phase_params.performance_threshold
            || depth > scheduler.phase_params.max_depth
        {
            break;
        }

        let ancestor_conflict = {
            let tree = scheduler.tree.read();
            tree.ancestors(&current)
                .into_iter()
                .filter(|id| *id != origin)
                .any(|id| scheduler.is_expanding(&id))
        };
        if ancestor_conflict {
            debug!(node = %current, "stopping expansion, ancestor being expanded elsewhere");
            break;
        }

        let add_concepts =
            scheduler.rng().gen::<f64>() < scheduler.phase_params.exploration_probability;
        let expanded = if add_concepts {
            debug!(node = %current, "expanding by adding new concepts");
            let second = scheduler.select_node().await?;
            let mut tree = scheduler.tree.write();
            tree.add_node(&[current, second], NodeOverrides::phase(phase_tag))?
        } else {
            debug!(node = %current, "expanding by increasing difficulty");
            let mut tree = scheduler.tree.write();
            tree.add_node(&[current], NodeOverrides::phase(phase_tag))?
        };
        expansions += 1;
        tokio::task::yield_now().await;

        if !seen.insert(expanded) {
            debug!(node = %expanded, "expansion revisited a node, stopping");
            break;
        }

        let visits = scheduler
            .tree
            .read()
            .node(&expanded)
            .map(|node| node.visits)
            .unwrap_or(0);
        if visits == 0 {
            info!(node = %expanded, from = %current, "created new node, evaluating");
            scheduler.evaluate_node(expanded).await?;
            if !scheduler.tree.read().contains(&expanded) {
                debug!(node = %expanded, "node removed during evaluation, stopping expansion");
                break;
            }
            current = expanded;
        } else {
            let expanded_value = scheduler
                .tree
                .read()
                .node(&expanded)
                .map(|node| node.value)
                .unwrap_or(0.0);
            if expanded_value >= scheduler.phase_params.performance_threshold {
                debug!(node = %expanded, "reusing existing node, continuing expansion");
                current = expanded;
            } else {
                debug!(
                    node = %expanded,
                    value = expanded_value,
                    "existing node below threshold, stopping expansion"
                );
                break;
            }
        }
    }

    if expansions > 0 {
        debug!(node = %origin, expansions, "expansion completed");
    }
    Ok(())
}

/// Hardness score shared by phases 2 and 3, in [0, 1]. Higher means the
/// model found the challenge harder.
pub(crate) fn hardness_score(results: &ChallengeResults) -> f64 {
    let mut total_tests = 0u32;
    let mut successful_passed = 0u32;
    for attempt in &results.data_trail {
        total_tests +=
            attempt.tests_passed_num + attempt.tests_failed_num + attempt.tests_errored_num;
        if attempt.success {
            successful_passed += attempt.tests_passed_num;
        }
    }

    let success_rate = if total_tests > 0 {
        f64::from(successful_passed) / f64::from(total_tests)
    } else {
        0.0
    };
    let challenge_from_success = 1.0 - success_rate;

    let attempt_factor = (results.attempts_till_success() as f64 / 3.0).min(1.0);
    let fixer_factor = if results.fixed_by_problem_fixer() {
        1.0
    } else {
        0.0
    };

    0.5 * challenge_from_success + 0.3 * attempt_factor + 0.2 * fixer_factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use challenge_tree::AttemptRecord;

    #[test]
    fn backpropagate_discounts_per_level() {
        let mut tree = Tree::new(
            vec!["loops".into(), "conditionals".into()],
            vec!["very easy".into(), "easy".into(), "medium".into()],
        )
        .unwrap();
        tree.initialize().unwrap();

        let pair = tree.nodes_in_order().find(|n| !n.is_root()).unwrap().id;
        let roots = tree.node(&pair).unwrap().parents.clone();
        let child = tree.add_node(&[pair], NodeOverrides::default()).unwrap();

        backpropagate(&mut tree, child, 1.0, 1.0, 0.5);

        assert!((tree.node(&child).unwrap().value - 1.0).abs() < 1e-9);
        assert!((tree.node(&pair).unwrap().value - 0.5).abs() < 1e-9);
        for root in roots {
            assert!((tree.node(&root).unwrap().value - 0.25).abs() < 1e-9);
            assert_eq!(tree.node(&root).unwrap().visits, 1);
        }
    }

    #[test]
    fn hardness_score_matches_reference_trail() {
        // 10 tests across three attempts, 2 passing in the successful final
        // attempt which was rescued by the fixer.
        let results = ChallengeResults {
            success: true,
            data_trail: vec![
                AttemptRecord {
                    tests_failed_num: 4,
                    ..AttemptRecord::default()
                },
                AttemptRecord {
                    tests_failed_num: 2,
                    tests_errored_num: 2,
                    ..AttemptRecord::default()
                },
                AttemptRecord {
                    success: true,
                    tests_passed_num: 2,
                    fixed_by_problem_fixer: true,
                    ..AttemptRecord::default()
                },
            ],
            error: None,
        };
        assert!((hardness_score(&results) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn hardness_score_is_zero_centred_for_trivial_success() {
        let results = ChallengeResults {
            success: true,
            data_trail: vec![AttemptRecord {
                success: true,
                tests_passed_num: 10,
                ..AttemptRecord::default()
            }],
            error: None,
        };
        // perfect pass on the first attempt: only the attempt factor
        // contributes (1/3 of the 0.3 weight)
        assert!((hardness_score(&results) - 0.1).abs() < 1e-9);
    }
}
