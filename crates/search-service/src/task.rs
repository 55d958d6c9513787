use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::mcts::MctsService;
use crate::models::{PhaseState, Task, TaskMetadata, TaskStatus};
use crate::session::SessionService;
use crate::{SearchError, SharedTree};

/// Parameters for creating a task.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    /// Session to run against; a fresh one is minted when absent.
    pub session_id: Option<String>,
    pub resume: bool,
    pub tree_pickle_path: Option<String>,
    pub resume_phase: Option<String>,
    pub resume_iteration: Option<u64>,
}

struct TaskEntry {
    task: Arc<RwLock<Task>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Creates tasks, runs their phase sequences in the background, and tracks
/// per-phase status.
pub struct TaskService {
    settings: Arc<Settings>,
    session_service: Arc<SessionService>,
    mcts_service: Arc<MctsService>,
    tasks: DashMap<String, TaskEntry>,
}

impl TaskService {
    pub fn new(
        session_service: Arc<SessionService>,
        mcts_service: Arc<MctsService>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            settings,
            session_service,
            mcts_service,
            tasks: DashMap::new(),
        }
    }

    /// Create a task and start the configured phase sequence in the
    /// background. Returns immediately with the initial status snapshot.
    pub fn create_task(&self, options: CreateTaskOptions) -> Result<Task, SearchError> {
        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = self.session_service.get_or_create_session(&session_id)?;
        self.session_service.touch(&session_id);

        let task_id = Uuid::new_v4().to_string();
        let sequence: Vec<String> = self.settings.phase_sequence().to_vec();
        let metadata = TaskMetadata {
            resume: options.resume,
            tree_pickle_path: options.tree_pickle_path,
            resume_phase: options.resume_phase,
            resume_iteration: options.resume_iteration,
        };

        let task = Task::new(task_id.clone(), session_id.clone(), &sequence, metadata);
        let shared = Arc::new(RwLock::new(task.clone()));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Self::execute_phases(
            Arc::clone(&self.mcts_service),
            Arc::clone(&session.tree),
            Arc::clone(&shared),
            sequence,
            cancel.clone(),
        ));

        self.tasks.insert(
            task_id.clone(),
            TaskEntry {
                task: shared,
                cancel,
                handle,
            },
        );
        info!(task = %task_id, session = %session_id, "created task");
        Ok(task)
    }

    /// Cancel a running task: signal the background job and mark every
    /// unfinished phase cancelled.
    pub fn stop_task(&self, task_id: &str) -> Result<Task, SearchError> {
        let entry = self
            .tasks
            .get(task_id)
            .ok_or_else(|| SearchError::TaskNotFound(task_id.to_string()))?;

        if !entry.handle.is_finished() {
            entry.cancel.cancel();
            let mut task = entry.task.write();
            task.update_status(TaskStatus::Cancelled, None);
            for status in task.phases.values_mut() {
                if matches!(status.status, PhaseState::Running | PhaseState::Pending) {
                    status.status = PhaseState::Cancelled;
                    status.cancelled_at = Some(Utc::now());
                }
            }
            info!(task = %task_id, "cancelled task");
        }

        let result = entry.task.read().clone();
        Ok(result)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, SearchError> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.task.read().clone())
            .ok_or_else(|| SearchError::TaskNotFound(task_id.to_string()))
    }

    pub fn get_all_tasks(&self) -> HashMap<String, Task> {
        self.tasks
            .iter()
            .map(|entry| (entry.key().clone(), entry.task.read().clone()))
            .collect()
    }

    pub fn tasks_for_session(&self, session_id: &str) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|entry| entry.task.read().clone())
            .filter(|task| task.session_id == session_id)
            .collect()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .iter()
            .map(|entry| entry.task.read().clone())
            .filter(|task| task.status == status)
            .collect()
    }

    /// Drop finished tasks older than the cutoff; returns how many were
    /// removed.
    pub fn cleanup_completed_tasks(&self, max_age_hours: i64) -> usize {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        let stale: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| {
                let task = entry.task.read();
                task.is_finished()
                    && task
                        .completed_at
                        .map(|finished| finished < cutoff)
                        .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for task_id in &stale {
            self.tasks.remove(task_id);
        }
        stale.len()
    }

    async fn execute_phases(
        mcts_service: Arc<MctsService>,
        tree: SharedTree,
        shared: Arc<RwLock<Task>>,
        sequence: Vec<String>,
        cancel: CancellationToken,
    ) {
        let task_id = shared.read().task_id.clone();
        let metadata = shared.read().metadata.clone();

        if metadata.resume {
            if let Some(path) = &metadata.tree_pickle_path {
                let loaded = tree.write().load(Path::new(path));
                if let Err(err) = loaded {
                    error!(task = %task_id, %err, "failed to load resume checkpoint");
                    Self::fail(&shared, err.to_string());
                    return;
                }
                info!(task = %task_id, path, "resumed tree from checkpoint");
            }
            // everything before the resume phase has already run
            if let Some(resume_phase) = &metadata.resume_phase {
                let mut task = shared.write();
                for phase_name in &sequence {
                    if phase_name == resume_phase {
                        break;
                    }
                    if let Some(status) = task.phase_mut(phase_name) {
                        status.status = PhaseState::Completed;
                        status.completed_at = Some(Utc::now());
                    }
                }
            }
        }

        match mcts_service
            .run_multiple_phases(&sequence, tree, &shared, &cancel)
            .await
        {
            Ok(()) => {
                shared.write().update_status(TaskStatus::Completed, None);
                info!(task = %task_id, "task completed");
            }
            Err(SearchError::Cancelled) => {
                // stop_task already transitioned the statuses; make sure a
                // token cancelled by other means still lands in a terminal
                // state
                let mut task = shared.write();
                if !task.is_finished() {
                    task.update_status(TaskStatus::Cancelled, None);
                }
                info!(task = %task_id, "task cancelled");
            }
            Err(err) => {
                error!(task = %task_id, %err, "task failed");
                Self::fail(&shared, err.to_string());
            }
        }
    }

    fn fail(shared: &Arc<RwLock<Task>>, reason: String) {
        let mut task = shared.write();
        task.update_status(TaskStatus::Failed, Some(reason.clone()));
        for status in task.phases.values_mut() {
            if status.status == PhaseState::Running {
                status.status = PhaseState::Error;
                status.error = Some(reason.clone());
            }
        }
    }
}
