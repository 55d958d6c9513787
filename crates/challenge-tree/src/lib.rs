//! Challenge graph for adaptive benchmark search.
//!
//! This crate provides the core data structures for the search service:
//! - `ChallengeNode`: one vertex in the challenge graph, defined by a set of
//!   concepts and a difficulty level
//! - `Tree`: the owning graph container, responsible for structural
//!   invariants, deduplication, difficulty assignment and checkpointing
//! - `ChallengeResults`: the evaluation trail returned by the environment
//!   service for a single challenge run

pub mod node;
pub mod results;
pub mod tree;

pub use node::{ChallengeNode, NodeId};
pub use results::{AttemptRecord, ChallengeResults};
pub use tree::{NodeOverrides, Tree, TreeData};

use std::path::PathBuf;
use thiserror::Error;

/// Maximum number of concepts a single node may carry.
pub const MAX_CONCEPTS: usize = 4;

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("tree requires at least one concept and one difficulty level")]
    EmptyConfiguration,

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("a node requires at least one parent")]
    MissingParents,

    #[error("difficulty '{0}' is not part of the configured difficulty levels")]
    UnknownDifficulty(String),

    #[error("checkpoint not found at {0}")]
    CheckpointMissing(PathBuf),

    #[error("malformed checkpoint at {path}: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("failed to write checkpoint to {path}: {reason}")]
    CheckpointWrite { path: PathBuf, reason: String },
}
