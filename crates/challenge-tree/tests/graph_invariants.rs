//! Randomized stress checks for the structural invariants of the challenge
//! graph: acyclicity, the depth law, difficulty monotonicity, symmetric
//! parent/child links, and deduplication for non-variant nodes.

use std::collections::{HashMap, HashSet};

use challenge_tree::{NodeId, NodeOverrides, Tree};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

fn build_tree() -> Tree {
    let mut tree = Tree::new(
        vec![
            "loops".into(),
            "conditionals".into(),
            "functions".into(),
            "recursion".into(),
            "sorting".into(),
        ],
        vec![
            "very easy".into(),
            "easy".into(),
            "medium".into(),
            "hard".into(),
            "very hard".into(),
        ],
    )
    .unwrap();
    tree.initialize().unwrap();
    tree
}

fn assert_invariants(tree: &Tree) {
    let mut dedup_keys: HashMap<(Vec<String>, String), NodeId> = HashMap::new();
    let ids: HashSet<NodeId> = tree.ids().collect();

    for node in tree.nodes_in_order() {
        // concept sets are canonical, bounded, and drawn from the config
        assert!(!node.concepts.is_empty() && node.concepts.len() <= 4);
        let mut sorted = node.concepts.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, node.concepts);
        for concept in &node.concepts {
            assert!(tree.concepts().contains(concept));
        }

        // acyclicity
        assert!(!tree.ancestors(&node.id).contains(&node.id));

        // depth law
        if node.parents.is_empty() {
            assert_eq!(node.depth, 0);
        } else {
            let max_parent_depth = node
                .parents
                .iter()
                .map(|p| tree.node(p).unwrap().depth)
                .max()
                .unwrap();
            assert_eq!(node.depth, max_parent_depth + 1);
        }

        // difficulty monotonicity
        let idx = tree.difficulty_index(&node.difficulty).unwrap();
        assert!(idx <= tree.difficulties().len() - 1);
        if !node.parents.is_empty() && node.phase != 3 {
            let max_parent_idx = node
                .parents
                .iter()
                .map(|p| tree.difficulty_index(&tree.node(p).unwrap().difficulty).unwrap())
                .max()
                .unwrap();
            assert!(idx == max_parent_idx || idx == max_parent_idx + 1);
        }

        // symmetric links, and no dangling references
        for parent in &node.parents {
            assert!(ids.contains(parent));
            assert!(tree.node(parent).unwrap().children.contains(&node.id));
        }
        for child in &node.children {
            assert!(ids.contains(child));
            assert!(tree.node(child).unwrap().parents.contains(&node.id));
        }

        // deduplication for non-variant nodes
        if node.phase != 3 {
            let key = (node.concepts.clone(), node.difficulty.clone());
            if let Some(previous) = dedup_keys.insert(key, node.id) {
                panic!(
                    "nodes {previous} and {} share concepts {:?} at {}",
                    node.id, node.concepts, node.difficulty
                );
            }
        }
    }
}

#[test]
fn invariants_survive_random_growth_and_removal() {
    for seed in [3u64, 17, 4242] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tree = build_tree();

        for step in 0..300 {
            let ids: Vec<NodeId> = tree.ids().collect();
            let roll: f64 = rng.gen();

            if roll < 0.55 {
                // single-parent expansion
                let parent = *ids.choose(&mut rng).unwrap();
                tree.add_node(&[parent], NodeOverrides::default()).unwrap();
            } else if roll < 0.8 {
                // two-parent combination
                let a = *ids.choose(&mut rng).unwrap();
                let b = *ids.choose(&mut rng).unwrap();
                tree.add_node(&[a, b], NodeOverrides::default()).unwrap();
            } else if roll < 0.9 {
                // variant child, exempt from deduplication
                let parent = *ids.choose(&mut rng).unwrap();
                let (concepts, difficulty) = {
                    let node = tree.node(&parent).unwrap();
                    (node.concepts.clone(), node.difficulty.clone())
                };
                tree.add_node(
                    &[parent],
                    NodeOverrides {
                        concepts: Some(concepts),
                        difficulty: Some(difficulty),
                        phase: Some(3),
                    },
                )
                .unwrap();
            } else {
                // remove a deep childless node, as failed evaluations do
                let removable = tree
                    .nodes_in_order()
                    .filter(|n| n.depth > 1 && n.children.is_empty())
                    .map(|n| n.id)
                    .collect::<Vec<_>>();
                if let Some(target) = removable.choose(&mut rng) {
                    tree.remove_node(target);
                }
            }

            if step % 25 == 0 {
                assert_invariants(&tree);
            }
        }
        assert_invariants(&tree);
    }
}

#[test]
fn removal_never_leaves_dangling_links() {
    let mut tree = build_tree();
    let pair = tree.nodes_in_order().find(|n| !n.is_root()).unwrap().id;
    let child = tree.add_node(&[pair], NodeOverrides::default()).unwrap();
    let grandchild = tree.add_node(&[child], NodeOverrides::default()).unwrap();

    tree.remove_node(&grandchild);
    tree.remove_node(&child);
    assert_invariants(&tree);
    assert!(tree.node(&pair).unwrap().children.is_empty());
}
