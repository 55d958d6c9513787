use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Settings;
use crate::environment::EnvironmentClient;
use crate::models::{PhaseState, Task};
use crate::registry::PHASE_REGISTRY;
use crate::scheduler::PhaseScheduler;
use crate::{SearchError, SharedTree};

/// Builds phase schedulers from configuration and runs them for a task.
pub struct MctsService {
    settings: Arc<Settings>,
}

impl MctsService {
    pub fn new(settings: Arc<Settings>) -> Self {
        info!(phases = ?PHASE_REGISTRY.phase_names(), "phase registry loaded");
        Self { settings }
    }

    /// Run one phase over the given tree, tracking status on the task.
    pub async fn run_phase(
        &self,
        phase_name: &str,
        tree: SharedTree,
        task: &Arc<RwLock<Task>>,
        cancel: &CancellationToken,
    ) -> Result<(), SearchError> {
        if !PHASE_REGISTRY.contains(phase_name) {
            return Err(SearchError::UnknownPhase(phase_name.to_string()));
        }

        let task_id = task.read().task_id.clone();
        info!(phase = phase_name, task = %task_id, "starting phase");
        {
            let mut task = task.write();
            if let Some(status) = task.phase_mut(phase_name) {
                status.status = PhaseState::Running;
                status.started_at = Some(Utc::now());
            }
        }

        let config = self.settings.phase_config(phase_name)?;
        let environment =
            EnvironmentClient::new(&config.environment, &self.settings.env_service_url);
        let scheduler =
            PhaseScheduler::new(phase_name, tree, environment, config, cancel.child_token())?;

        let metadata = task.read().metadata.clone();
        if metadata.resume
            && metadata.resume_phase.as_deref() == Some(phase_name)
        {
            if let Some(iteration) = metadata.resume_iteration {
                scheduler.set_resume_state(iteration);
            }
        }

        match scheduler.run().await {
            Ok(()) => {
                let mut task = task.write();
                if let Some(status) = task.phase_mut(phase_name) {
                    status.status = PhaseState::Completed;
                    status.completed_at = Some(Utc::now());
                    status.path = Some(scheduler.experiment_dir().display().to_string());
                }
                info!(phase = phase_name, task = %task_id, "phase completed");
                Ok(())
            }
            // stop_task owns the status transitions for a cancellation
            Err(SearchError::Cancelled) => Err(SearchError::Cancelled),
            Err(err) => {
                let reason = err.to_string();
                error!(phase = phase_name, task = %task_id, %reason, "phase failed");
                {
                    let mut task = task.write();
                    if let Some(status) = task.phase_mut(phase_name) {
                        status.status = PhaseState::Error;
                        status.error = Some(reason.clone());
                    }
                }
                Err(SearchError::PhaseExecution {
                    phase: phase_name.to_string(),
                    reason,
                })
            }
        }
    }

    /// Run a phase sequence, skipping phases already completed (resume).
    pub async fn run_multiple_phases(
        &self,
        sequence: &[String],
        tree: SharedTree,
        task: &Arc<RwLock<Task>>,
        cancel: &CancellationToken,
    ) -> Result<(), SearchError> {
        for phase_name in sequence {
            let already_completed = task
                .read()
                .phases
                .get(phase_name)
                .map(|status| status.status == PhaseState::Completed)
                .unwrap_or(false);
            if already_completed {
                info!(phase = %phase_name, "skipping phase, already completed");
                continue;
            }
            self.run_phase(phase_name, Arc::clone(&tree), task, cancel)
                .await?;
        }
        Ok(())
    }
}
