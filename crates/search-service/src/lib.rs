//! Adaptive MCTS search service for code-generation benchmarking.
//!
//! This crate drives a tree of programming challenges through a three-phase
//! Monte-Carlo Tree Search:
//! - phase 1 explores the concept/difficulty space broadly, scoring nodes by
//!   model performance
//! - phase 2 searches for combinations the model finds hard
//! - phase 3 generates variants of the hardest nodes
//!
//! Each phase shares one scheduler skeleton ([`scheduler::PhaseScheduler`])
//! parameterised by the strategies registered in [`registry`]. Long-running
//! searches are exposed as resumable tasks over a small HTTP control API.

pub mod api;
pub mod config;
pub mod environment;
pub mod mcts;
pub mod models;
pub mod phases;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod task;

pub use config::Settings;
pub use environment::EnvironmentClient;
pub use mcts::MctsService;
pub use scheduler::PhaseScheduler;
pub use session::SessionService;
pub use task::TaskService;

use std::sync::Arc;

use challenge_tree::{Tree, TreeError};
use thiserror::Error;

/// The tree shared between the scheduler loop and its evaluation tasks.
///
/// Lock scopes are kept short and never cross an await point; the "no
/// ancestor in flight" eligibility rule serialises all logically conflicting
/// writes.
pub type SharedTree = Arc<parking_lot::RwLock<Tree>>;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} already exists")]
    SessionAlreadyExists(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("tree initialization failed: {0}")]
    TreeInitialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("phase '{0}' is not registered")]
    UnknownPhase(String),

    #[error("no strategy found for {phase}.{method}")]
    NoStrategy { phase: String, method: String },

    #[error("node selection failed: {0}")]
    Selection(String),

    #[error("phase {phase} execution failed: {reason}")]
    PhaseExecution { phase: String, reason: String },

    #[error("search cancelled")]
    Cancelled,

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
