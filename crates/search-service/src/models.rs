use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SharedTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Error,
}

/// Execution status of one phase within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseStatus {
    pub status: PhaseState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Experiment directory holding this phase's checkpoints.
    pub path: Option<String>,
}

impl PhaseStatus {
    pub fn new(status: PhaseState) -> Self {
        Self {
            status,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            error: None,
            path: None,
        }
    }
}

/// Resume parameters carried by a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub resume: bool,
    pub tree_pickle_path: Option<String>,
    pub resume_phase: Option<String>,
    pub resume_iteration: Option<u64>,
}

/// One background search run over a session's tree.
///
/// The phase map is the single source of truth for progress and failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub session_id: String,
    pub status: TaskStatus,
    pub phases: BTreeMap<String, PhaseStatus>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: TaskMetadata,
}

impl Task {
    pub fn new(
        task_id: String,
        session_id: String,
        phase_sequence: &[String],
        metadata: TaskMetadata,
    ) -> Self {
        let mut phases = BTreeMap::new();
        for (index, name) in phase_sequence.iter().enumerate() {
            let state = if index == 0 {
                PhaseState::Running
            } else {
                PhaseState::Pending
            };
            phases.insert(name.clone(), PhaseStatus::new(state));
        }
        Self {
            task_id,
            session_id,
            status: TaskStatus::Running,
            phases,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            error: None,
            metadata,
        }
    }

    pub fn update_status(&mut self, status: TaskStatus, error: Option<String>) {
        self.status = status;
        match status {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        if error.is_some() {
            self.error = error;
        }
    }

    pub fn phase_mut(&mut self, phase_name: &str) -> Option<&mut PhaseStatus> {
        self.phases.get_mut(phase_name)
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// One search session, owning exactly one challenge tree.
#[derive(Clone)]
pub struct Session {
    pub session_id: String,
    pub tree: SharedTree,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: String, tree: SharedTree) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            tree,
            status: "active".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
