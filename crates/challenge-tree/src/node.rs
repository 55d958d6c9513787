use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::results::ChallengeResults;

/// Stable identifier for a node in the challenge graph.
pub type NodeId = Uuid;

/// One vertex in the challenge graph.
///
/// Nodes reference their parents and children by id; the `Tree` is the only
/// owner of node data, which keeps removals and checkpointing straightforward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeNode {
    pub id: NodeId,
    /// Concept set in canonical (sorted) order, at most four entries.
    pub concepts: Vec<String>,
    pub difficulty: String,
    pub challenge_description: String,
    /// Which phase first created this node.
    pub phase: u8,
    pub depth: usize,
    pub parents: Vec<NodeId>,
    pub children: Vec<NodeId>,
    /// Running value estimate, updated by TD-style blending.
    pub value: f64,
    pub visits: u64,
    pub run_results: Vec<ChallengeResults>,
    /// Snapshot of `value` taken when the node is promoted into phase 3.
    #[serde(default)]
    pub phase_2_value: Option<f64>,
}

impl ChallengeNode {
    pub fn new(
        concepts: Vec<String>,
        difficulty: String,
        depth: usize,
        phase: u8,
        parents: Vec<NodeId>,
    ) -> Self {
        debug!(?concepts, %difficulty, depth, "created node");
        Self {
            id: Uuid::new_v4(),
            concepts,
            difficulty,
            challenge_description: String::new(),
            phase,
            depth,
            parents,
            children: Vec::new(),
            value: 0.0,
            visits: 0,
            run_results: Vec::new(),
            phase_2_value: None,
        }
    }

    /// TD-style score update: blend the reward into the running value.
    pub fn update_score(&mut self, learning_rate: f64, reward: f64) {
        self.visits += 1;
        self.value += learning_rate * (reward - self.value);
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}
