use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::Write as _;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::node::{ChallengeNode, NodeId};
use crate::{TreeError, MAX_CONCEPTS};

/// Default UCB1 exploration weight (sqrt 2).
pub const DEFAULT_EXPLORATION_WEIGHT: f64 = std::f64::consts::SQRT_2;

/// Optional overrides for [`Tree::add_node`].
///
/// When `concepts`/`difficulty` are absent they are derived from the parent
/// nodes; `phase` defaults to 1.
#[derive(Debug, Clone, Default)]
pub struct NodeOverrides {
    pub concepts: Option<Vec<String>>,
    pub difficulty: Option<String>,
    pub phase: Option<u8>,
}

impl NodeOverrides {
    pub fn phase(phase: u8) -> Self {
        Self {
            phase: Some(phase),
            ..Self::default()
        }
    }
}

/// JSON-facing snapshot of the whole graph.
#[derive(Debug, Clone, Serialize)]
pub struct TreeData {
    pub nodes: Vec<NodeData>,
    pub concepts: Vec<String>,
    pub difficulties: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeData {
    pub id: NodeId,
    pub concepts: Vec<String>,
    pub difficulty: String,
    pub challenge_description: String,
    pub phase: u8,
    pub depth: usize,
    pub value: f64,
    pub visits: u64,
    pub phase_2_value: Option<f64>,
    pub parents: Vec<NodeId>,
    pub children: Vec<NodeId>,
}

/// The owning container for the challenge graph.
///
/// The graph is a DAG with up to two parents per node. All structural
/// mutations go through this type so the invariants (acyclicity, symmetric
/// links, depth and difficulty laws, deduplication) hold at all times.
pub struct Tree {
    concepts: Vec<String>,
    difficulties: Vec<String>,
    nodes: HashMap<NodeId, ChallengeNode>,
    /// Insertion order, used for stable iteration and checkpoints.
    order: Vec<NodeId>,
}

impl Tree {
    pub fn new(concepts: Vec<String>, difficulties: Vec<String>) -> Result<Self, TreeError> {
        if concepts.is_empty() || difficulties.is_empty() {
            return Err(TreeError::EmptyConfiguration);
        }
        info!(
            concepts = concepts.len(),
            difficulties = difficulties.len(),
            "initialized tree"
        );
        Ok(Self {
            concepts,
            difficulties,
            nodes: HashMap::new(),
            order: Vec::new(),
        })
    }

    /// Build the root layer and the all-pairs second layer.
    ///
    /// One root per concept at the lowest difficulty, then every unordered
    /// pair of roots combined once into a two-concept node at the next
    /// difficulty.
    pub fn initialize(&mut self) -> Result<(), TreeError> {
        let lowest = self.difficulties[0].clone();
        let mut roots = Vec::with_capacity(self.concepts.len());
        for concept in self.concepts.clone() {
            let node = ChallengeNode::new(vec![concept], lowest.clone(), 0, 1, Vec::new());
            roots.push(node.id);
            self.insert(node);
        }
        debug!(count = roots.len(), "created root nodes");

        for (i, left) in roots.iter().enumerate() {
            for right in roots.iter().skip(i + 1) {
                self.add_node(&[*left, *right], NodeOverrides::default())?;
            }
        }

        info!(total = self.len(), roots = roots.len(), "tree initialization complete");
        Ok(())
    }

    /// Add a node derived from `parents`, or return an existing equivalent.
    ///
    /// Nodes tagged phase 3 are deliberate variants and bypass
    /// deduplication; for every other phase a node with the same
    /// `(sorted concepts, difficulty)` pair is returned unchanged.
    pub fn add_node(
        &mut self,
        parents: &[NodeId],
        overrides: NodeOverrides,
    ) -> Result<NodeId, TreeError> {
        // A node may be offered the same parent twice (e.g. when expansion
        // pairs a node with itself); keep the first occurrence only.
        let mut parent_ids: Vec<NodeId> = Vec::new();
        for id in parents {
            if !parent_ids.contains(id) {
                parent_ids.push(*id);
            }
        }
        if parent_ids.is_empty() {
            return Err(TreeError::MissingParents);
        }
        for id in &parent_ids {
            if !self.nodes.contains_key(id) {
                return Err(TreeError::UnknownNode(*id));
            }
        }

        let concepts = match overrides.concepts {
            Some(concepts) => canonical_concepts(concepts.into_iter()),
            None => canonical_concepts(
                parent_ids
                    .iter()
                    .flat_map(|id| self.nodes[id].concepts.iter().cloned()),
            ),
        };
        let difficulty = match overrides.difficulty {
            Some(difficulty) => {
                if !self.difficulties.contains(&difficulty) {
                    return Err(TreeError::UnknownDifficulty(difficulty));
                }
                difficulty
            }
            None => self.assign_difficulty(&parent_ids)?,
        };
        let phase = overrides.phase.unwrap_or(1);

        if phase != 3 {
            if let Some(existing) = self.find_equivalent(&concepts, &difficulty) {
                debug!(node = %existing, "reusing existing node");
                return Ok(existing);
            }
        }

        let depth = 1 + parent_ids
            .iter()
            .map(|id| self.nodes[id].depth)
            .max()
            .unwrap_or(0);

        let node = ChallengeNode::new(concepts, difficulty, depth, phase, parent_ids.clone());
        let node_id = node.id;
        for parent in &parent_ids {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.children.push(node_id);
            }
        }
        self.insert(node);
        Ok(node_id)
    }

    /// Detach a node from its parents and children and drop it.
    ///
    /// Removing an unknown node is a silent no-op; this is only used for
    /// empty-result cleanup.
    pub fn remove_node(&mut self, node_id: &NodeId) {
        let Some(node) = self.nodes.remove(node_id) else {
            warn!(node = %node_id, "remove requested for unknown node");
            return;
        };
        for parent in &node.parents {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.children.retain(|child| child != node_id);
            }
        }
        for child in &node.children {
            if let Some(child_node) = self.nodes.get_mut(child) {
                child_node.parents.retain(|parent| parent != node_id);
            }
        }
        self.order.retain(|id| id != node_id);
        info!(node = %node_id, "node removed from tree");
    }

    /// All transitive ancestors of a node.
    pub fn ancestors(&self, node_id: &NodeId) -> HashSet<NodeId> {
        let mut ancestors = HashSet::new();
        let mut frontier: Vec<NodeId> = self
            .nodes
            .get(node_id)
            .map(|node| node.parents.clone())
            .unwrap_or_default();
        while let Some(current) = frontier.pop() {
            if ancestors.insert(current) {
                if let Some(node) = self.nodes.get(&current) {
                    frontier.extend(node.parents.iter().copied());
                }
            }
        }
        ancestors
    }

    /// UCB1 selection score for a node.
    ///
    /// Unvisited nodes score infinitely high so they are explored first.
    pub fn ucb1(&self, node_id: &NodeId, exploration_weight: f64) -> f64 {
        let Some(node) = self.nodes.get(node_id) else {
            return f64::NEG_INFINITY;
        };
        if node.visits == 0 {
            return f64::INFINITY;
        }
        let parent_visits: u64 = node
            .parents
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|parent| parent.visits)
            .sum();
        let parent_visits = parent_visits.max(1) as f64;
        let exploration = (parent_visits.ln() / node.visits as f64).sqrt();
        node.value + exploration_weight * exploration
    }

    fn assign_difficulty(&self, parents: &[NodeId]) -> Result<String, TreeError> {
        let mut max_index = 0;
        for id in parents {
            let node = &self.nodes[id];
            let index = self
                .difficulty_index(&node.difficulty)
                .ok_or_else(|| TreeError::UnknownDifficulty(node.difficulty.clone()))?;
            max_index = max_index.max(index);
        }
        let next = (max_index + 1).min(self.difficulties.len() - 1);
        Ok(self.difficulties[next].clone())
    }

    fn find_equivalent(&self, concepts: &[String], difficulty: &str) -> Option<NodeId> {
        self.order.iter().copied().find(|id| {
            let node = &self.nodes[id];
            node.concepts == concepts && node.difficulty == difficulty
        })
    }

    fn insert(&mut self, node: ChallengeNode) {
        self.order.push(node.id);
        self.nodes.insert(node.id, node);
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&ChallengeNode> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &NodeId) -> Option<&mut ChallengeNode> {
        self.nodes.get_mut(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Node ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order.iter().copied()
    }

    /// Nodes in insertion order.
    pub fn nodes_in_order(&self) -> impl Iterator<Item = &ChallengeNode> {
        self.order.iter().map(|id| &self.nodes[id])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn concepts(&self) -> &[String] {
        &self.concepts
    }

    pub fn difficulties(&self) -> &[String] {
        &self.difficulties
    }

    pub fn difficulty_index(&self, difficulty: &str) -> Option<usize> {
        self.difficulties.iter().position(|d| d == difficulty)
    }

    /// Write a binary checkpoint of the node list.
    pub fn save(&self, path: &Path) -> Result<(), TreeError> {
        let nodes: Vec<&ChallengeNode> = self.nodes_in_order().collect();
        let encoded = bincode::serialize(&nodes).map_err(|err| TreeError::CheckpointWrite {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        fs::write(path, encoded).map_err(|err| TreeError::CheckpointWrite {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        debug!(path = %path.display(), nodes = self.len(), "tree checkpoint saved");
        Ok(())
    }

    /// Replace the node list from a binary checkpoint.
    ///
    /// The configured concepts and difficulties are kept; only the graph is
    /// swapped out.
    pub fn load(&mut self, path: &Path) -> Result<(), TreeError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TreeError::CheckpointMissing(path.to_path_buf()));
            }
            Err(err) => {
                return Err(TreeError::CheckpointCorrupt {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                });
            }
        };
        let nodes: Vec<ChallengeNode> =
            bincode::deserialize(&bytes).map_err(|err| TreeError::CheckpointCorrupt {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        self.nodes.clear();
        self.order.clear();
        for node in nodes {
            self.insert(node);
        }
        info!(path = %path.display(), nodes = self.len(), "tree loaded from checkpoint");
        Ok(())
    }

    /// Serialize the graph for API responses.
    pub fn to_data(&self) -> TreeData {
        TreeData {
            nodes: self
                .nodes_in_order()
                .map(|node| NodeData {
                    id: node.id,
                    concepts: node.concepts.clone(),
                    difficulty: node.difficulty.clone(),
                    challenge_description: node.challenge_description.clone(),
                    phase: node.phase,
                    depth: node.depth,
                    value: node.value,
                    visits: node.visits,
                    phase_2_value: node.phase_2_value,
                    parents: node.parents.clone(),
                    children: node.children.clone(),
                })
                .collect(),
            concepts: self.concepts.clone(),
            difficulties: self.difficulties.clone(),
        }
    }

    /// Graphviz rendering of the graph, colour-coded by phase.
    ///
    /// Not load-bearing; callers treat failures as warnings.
    pub fn write_dot(&self, path: &Path) -> std::io::Result<()> {
        let mut out = fs::File::create(path)?;
        writeln!(out, "digraph challenge_tree {{")?;
        writeln!(out, "    rankdir=TB;")?;
        writeln!(out, "    node [shape=box, style=\"rounded,filled\"];")?;
        for node in self.nodes_in_order() {
            let fill = match node.phase {
                2 => "lightgreen",
                3 => "lightblue",
                _ => "lightyellow",
            };
            writeln!(
                out,
                "    \"{}\" [fillcolor={}, label=\"{}\\n{}\\nvalue {:.3} visits {}\"];",
                node.id,
                fill,
                node.concepts.join(", "),
                node.difficulty,
                node.value,
                node.visits,
            )?;
        }
        for node in self.nodes_in_order() {
            for child in &node.children {
                writeln!(out, "    \"{}\" -> \"{}\";", node.id, child)?;
            }
        }
        writeln!(out, "}}")?;
        Ok(())
    }
}

fn canonical_concepts(concepts: impl Iterator<Item = String>) -> Vec<String> {
    let unique: BTreeSet<String> = concepts.collect();
    unique.into_iter().take(MAX_CONCEPTS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Tree {
        Tree::new(
            vec!["loops".into(), "conditionals".into(), "functions".into()],
            vec!["very easy".into(), "easy".into()],
        )
        .unwrap()
    }

    fn five_level_tree() -> Tree {
        Tree::new(
            vec!["loops".into(), "conditionals".into()],
            vec![
                "very easy".into(),
                "easy".into(),
                "medium".into(),
                "hard".into(),
                "very hard".into(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn initialize_builds_roots_and_pair_layer() {
        let mut tree = sample_tree();
        tree.initialize().unwrap();

        assert_eq!(tree.len(), 6);

        let roots: Vec<_> = tree.nodes_in_order().filter(|n| n.is_root()).collect();
        assert_eq!(roots.len(), 3);
        assert!(roots.iter().all(|n| n.difficulty == "very easy" && n.depth == 0));

        let pairs: Vec<_> = tree.nodes_in_order().filter(|n| !n.is_root()).collect();
        assert_eq!(pairs.len(), 3);
        let mut pair_concepts: Vec<Vec<String>> =
            pairs.iter().map(|n| n.concepts.clone()).collect();
        pair_concepts.sort();
        assert_eq!(
            pair_concepts,
            vec![
                vec!["conditionals".to_string(), "functions".to_string()],
                vec!["conditionals".to_string(), "loops".to_string()],
                vec!["functions".to_string(), "loops".to_string()],
            ]
        );
        assert!(pairs.iter().all(|n| n.difficulty == "easy" && n.depth == 1));
    }

    #[test]
    fn add_node_deduplicates_equivalent_nodes() {
        let mut tree = sample_tree();
        tree.initialize().unwrap();
        let roots: Vec<NodeId> = tree
            .nodes_in_order()
            .filter(|n| n.is_root())
            .map(|n| n.id)
            .collect();

        let first = tree.add_node(&[roots[0], roots[1]], NodeOverrides::default()).unwrap();
        let second = tree.add_node(&[roots[0], roots[1]], NodeOverrides::default()).unwrap();
        assert_eq!(first, second);

        let node = tree.node(&first).unwrap();
        let mut expected: Vec<String> = vec![
            tree.node(&roots[0]).unwrap().concepts[0].clone(),
            tree.node(&roots[1]).unwrap().concepts[0].clone(),
        ];
        expected.sort();
        assert_eq!(node.concepts, expected);
        assert_eq!(node.difficulty, "easy");
    }

    #[test]
    fn phase_3_nodes_bypass_deduplication() {
        let mut tree = sample_tree();
        tree.initialize().unwrap();
        let root = tree.nodes_in_order().next().unwrap().id;
        let concepts = tree.node(&root).unwrap().concepts.clone();
        let overrides = NodeOverrides {
            concepts: Some(concepts),
            difficulty: Some("very easy".into()),
            phase: Some(3),
        };

        let first = tree.add_node(&[root], overrides.clone()).unwrap();
        let second = tree.add_node(&[root], overrides).unwrap();
        assert_ne!(first, second);
        assert_eq!(tree.node(&root).unwrap().children.len(), 4);
    }

    #[test]
    fn difficulty_advances_but_never_exceeds_top() {
        let mut tree = sample_tree();
        tree.initialize().unwrap();
        let pair = tree
            .nodes_in_order()
            .find(|n| n.difficulty == "easy")
            .unwrap()
            .id;

        // "easy" is already the top level here, so a child stays there.
        let child = tree.add_node(&[pair], NodeOverrides::default()).unwrap();
        assert_eq!(tree.node(&child).unwrap().difficulty, "easy");
    }

    #[test]
    fn depth_and_difficulty_laws_hold_after_expansion() {
        let mut tree = five_level_tree();
        tree.initialize().unwrap();

        let mut current = tree.nodes_in_order().find(|n| !n.is_root()).unwrap().id;
        for _ in 0..5 {
            current = tree.add_node(&[current], NodeOverrides::default()).unwrap();
        }

        for node in tree.nodes_in_order() {
            if node.is_root() {
                assert_eq!(node.depth, 0);
                continue;
            }
            let parent_depth = node
                .parents
                .iter()
                .map(|p| tree.node(p).unwrap().depth)
                .max()
                .unwrap();
            assert_eq!(node.depth, parent_depth + 1);

            let idx = tree.difficulty_index(&node.difficulty).unwrap();
            let max_parent_idx = node
                .parents
                .iter()
                .map(|p| tree.difficulty_index(&tree.node(p).unwrap().difficulty).unwrap())
                .max()
                .unwrap();
            assert!(idx == max_parent_idx || idx == max_parent_idx + 1);
            assert!(idx <= tree.difficulties().len() - 1);
        }
    }

    #[test]
    fn graph_is_acyclic_and_links_are_symmetric() {
        let mut tree = five_level_tree();
        tree.initialize().unwrap();
        let combined = tree.nodes_in_order().find(|n| !n.is_root()).unwrap().id;
        let child = tree.add_node(&[combined], NodeOverrides::default()).unwrap();
        tree.add_node(&[child], NodeOverrides::default()).unwrap();

        for node in tree.nodes_in_order() {
            assert!(!tree.ancestors(&node.id).contains(&node.id));
            for parent in &node.parents {
                assert!(tree.node(parent).unwrap().children.contains(&node.id));
            }
            for child in &node.children {
                assert!(tree.node(child).unwrap().parents.contains(&node.id));
            }
        }
    }

    #[test]
    fn concept_union_is_capped_at_four() {
        let mut tree = Tree::new(
            vec![
                "a".into(),
                "b".into(),
                "c".into(),
                "d".into(),
                "e".into(),
                "f".into(),
            ],
            vec!["very easy".into(), "easy".into(), "medium".into()],
        )
        .unwrap();
        tree.initialize().unwrap();

        let pairs: Vec<NodeId> = tree
            .nodes_in_order()
            .filter(|n| n.concepts.len() == 2)
            .map(|n| n.id)
            .collect();
        // Pairs are generated in combination order: (a,b) is first, (c,d) is
        // tenth and (e,f) last. Two disjoint pairs union to four concepts;
        // adding a third disjoint pair must truncate at the cap.
        let four = tree.add_node(&[pairs[0], pairs[9]], NodeOverrides::default()).unwrap();
        assert_eq!(tree.node(&four).unwrap().concepts.len(), 4);

        let capped = tree.add_node(&[four, pairs[14]], NodeOverrides::default()).unwrap();
        assert_eq!(tree.node(&capped).unwrap().concepts.len(), 4);
    }

    #[test]
    fn remove_node_detaches_links_and_ignores_unknown() {
        let mut tree = sample_tree();
        tree.initialize().unwrap();
        let pair = tree.nodes_in_order().find(|n| !n.is_root()).unwrap().id;
        let parents = tree.node(&pair).unwrap().parents.clone();

        tree.remove_node(&pair);
        assert!(!tree.contains(&pair));
        for parent in parents {
            assert!(!tree.node(&parent).unwrap().children.contains(&pair));
        }

        // removing again is a no-op
        tree.remove_node(&pair);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn duplicate_parents_collapse_to_one() {
        let mut tree = five_level_tree();
        tree.initialize().unwrap();
        let root = tree.nodes_in_order().next().unwrap().id;
        let child = tree.add_node(&[root, root], NodeOverrides::default()).unwrap();
        assert_eq!(tree.node(&child).unwrap().parents, vec![root]);
        assert_eq!(
            tree.node(&root)
                .unwrap()
                .children
                .iter()
                .filter(|id| **id == child)
                .count(),
            1
        );
    }

    #[test]
    fn ucb1_is_infinite_for_unvisited_nodes() {
        let mut tree = sample_tree();
        tree.initialize().unwrap();
        let id = tree.nodes_in_order().next().unwrap().id;
        assert_eq!(tree.ucb1(&id, DEFAULT_EXPLORATION_WEIGHT), f64::INFINITY);
    }

    #[test]
    fn ucb1_decreases_with_visits_and_increases_with_value() {
        let mut tree = sample_tree();
        tree.initialize().unwrap();
        let pair = tree.nodes_in_order().find(|n| !n.is_root()).unwrap().id;
        let parents = tree.node(&pair).unwrap().parents.clone();
        for parent in &parents {
            tree.node_mut(parent).unwrap().visits = 10;
        }

        tree.node_mut(&pair).unwrap().visits = 2;
        tree.node_mut(&pair).unwrap().value = 0.5;
        let few_visits = tree.ucb1(&pair, DEFAULT_EXPLORATION_WEIGHT);

        tree.node_mut(&pair).unwrap().visits = 5;
        let more_visits = tree.ucb1(&pair, DEFAULT_EXPLORATION_WEIGHT);
        assert!(more_visits < few_visits);

        tree.node_mut(&pair).unwrap().value = 0.9;
        let higher_value = tree.ucb1(&pair, DEFAULT_EXPLORATION_WEIGHT);
        assert!(higher_value > more_visits);
    }

    #[test]
    fn checkpoint_roundtrip_preserves_structure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.pkl");

        let mut tree = sample_tree();
        tree.initialize().unwrap();
        let pair = tree.nodes_in_order().find(|n| !n.is_root()).unwrap().id;
        tree.node_mut(&pair).unwrap().update_score(0.9, 0.7);
        tree.save(&path).unwrap();

        let mut restored = sample_tree();
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), tree.len());
        let restored_pair = restored.node(&pair).unwrap();
        assert_eq!(restored_pair.visits, 1);
        assert!((restored_pair.value - 0.63).abs() < 1e-9);
        assert_eq!(restored_pair.parents, tree.node(&pair).unwrap().parents);
    }

    #[test]
    fn load_reports_missing_and_corrupt_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = sample_tree();

        let missing = dir.path().join("absent.pkl");
        assert!(matches!(
            tree.load(&missing),
            Err(TreeError::CheckpointMissing(_))
        ));

        let corrupt = dir.path().join("corrupt.pkl");
        std::fs::write(&corrupt, b"not a checkpoint").unwrap();
        assert!(matches!(
            tree.load(&corrupt),
            Err(TreeError::CheckpointCorrupt { .. })
        ));
    }

    #[test]
    fn to_data_references_nodes_by_id() {
        let mut tree = sample_tree();
        tree.initialize().unwrap();
        let data = tree.to_data();
        assert_eq!(data.nodes.len(), 6);
        assert_eq!(data.concepts.len(), 3);
        for node in &data.nodes {
            for parent in &node.parents {
                assert!(data.nodes.iter().any(|n| n.id == *parent));
            }
        }
    }
}
