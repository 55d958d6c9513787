use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use challenge_tree::{ChallengeResults, NodeId};
use dashmap::DashSet;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PhaseConfig, PhaseParams, ScoringParams, SearchParams};
use crate::environment::EnvironmentClient;
use crate::registry::{PhaseMethods, PHASE_REGISTRY};
use crate::{SearchError, SharedTree};

/// Selection retries before the scheduler backs off.
const MAX_SELECTION_ATTEMPTS: usize = 10;
/// How long to wait when no eligible node exists and nothing is in flight.
const NO_ELIGIBLE_BACKOFF: Duration = Duration::from_secs(2);
/// Checkpoint cadence, in completed iterations.
const CHECKPOINT_INTERVAL: u64 = 10;

/// Generic MCTS driver, parameterised by the strategies registered for one
/// phase.
///
/// One instance runs one phase of one task. It owns the concurrency model:
/// up to `num_nodes_per_iteration` evaluations run as concurrent tasks, and
/// the eligibility rule (no node may be evaluated or expanded while it or
/// any ancestor is in flight) serialises all conflicting tree writes without
/// long-held locks.
pub struct PhaseScheduler {
    pub phase_name: String,
    pub tree: SharedTree,
    pub environment: EnvironmentClient,
    pub phase_params: PhaseParams,
    pub search_params: SearchParams,
    pub scoring_params: ScoringParams,
    methods: PhaseMethods,
    /// Nodes currently holding an expansion slot.
    nodes_being_expanded: DashSet<NodeId>,
    /// Consecutive finished evaluations with a value delta under threshold.
    no_change_iterations: AtomicU32,
    converged: AtomicBool,
    rng: Mutex<StdRng>,
    experiment_dir: PathBuf,
    starting_iteration: AtomicU64,
    cancel: CancellationToken,
}

impl PhaseScheduler {
    pub fn new(
        phase_name: &str,
        tree: SharedTree,
        environment: EnvironmentClient,
        config: &PhaseConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, SearchError> {
        let methods = PHASE_REGISTRY
            .methods(phase_name)
            .ok_or_else(|| SearchError::UnknownPhase(phase_name.to_string()))?;

        let timestamp = chrono::Local::now().format("%m%d_%H%M");
        let experiment_dir = config.phase_params.experiments_root.join(format!(
            "{timestamp}_{phase_name}_{}",
            config.phase_params.max_depth
        ));
        std::fs::create_dir_all(&experiment_dir)?;

        let rng = match config.search_params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            phase = phase_name,
            experiment_dir = %experiment_dir.display(),
            "initialized phase scheduler"
        );

        Ok(Arc::new(Self {
            phase_name: phase_name.to_string(),
            tree,
            environment,
            phase_params: config.phase_params.clone(),
            search_params: config.search_params.clone(),
            scoring_params: config.scoring_params.clone(),
            methods,
            nodes_being_expanded: DashSet::new(),
            no_change_iterations: AtomicU32::new(0),
            converged: AtomicBool::new(false),
            rng: Mutex::new(rng),
            experiment_dir,
            starting_iteration: AtomicU64::new(0),
            cancel,
        }))
    }

    /// Start counting from `iteration` and skip `initialize_phase`, for
    /// resuming from a checkpoint.
    pub fn set_resume_state(&self, iteration: u64) {
        info!(phase = %self.phase_name, iteration, "set resume state");
        self.starting_iteration.store(iteration, Ordering::SeqCst);
    }

    pub fn experiment_dir(&self) -> &PathBuf {
        &self.experiment_dir
    }

    pub fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock()
    }

    pub fn is_expanding(&self, node_id: &NodeId) -> bool {
        self.nodes_being_expanded.contains(node_id)
    }

    /// Run the search until convergence, iteration budget, or cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), SearchError> {
        info!(
            phase = %self.phase_name,
            max_iterations = self.phase_params.max_iterations,
            max_depth = self.phase_params.max_depth,
            "starting search"
        );

        let mut iteration = self.starting_iteration.load(Ordering::SeqCst);
        let mut tasks: JoinSet<NodeId> = JoinSet::new();
        let mut in_flight: HashSet<NodeId> = HashSet::new();

        if iteration == 0 {
            self.initialize_phase().await?;
        } else {
            info!(iteration, "skipping initialization, resuming");
        }

        let mut last_checkpoint = iteration;
        while !self.converged.load(Ordering::SeqCst)
            && iteration < self.phase_params.max_iterations
        {
            if self.cancel.is_cancelled() {
                return self.shutdown_cancelled(&mut tasks, iteration).await;
            }

            self.fill_task_queue(&mut tasks, &mut in_flight).await?;

            if tasks.is_empty() {
                iteration += 1;
            } else {
                // wait for at least one task, or for a stop signal
                let first = tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    joined = tasks.join_next() => joined,
                };
                let Some(first) = first else {
                    return self.shutdown_cancelled(&mut tasks, iteration).await;
                };
                let mut finished = 1u64;
                Self::reap(first, &mut in_flight);
                while let Some(result) = tasks.try_join_next() {
                    finished += 1;
                    Self::reap(result, &mut in_flight);
                }
                debug!(finished, pending = tasks.len(), "tasks completed");
                iteration += finished;
            }

            if self.no_change_iterations.load(Ordering::SeqCst)
                >= self.phase_params.convergence_checks
            {
                info!(
                    iteration,
                    checks = self.phase_params.convergence_checks,
                    "convergence achieved"
                );
                self.converged.store(true, Ordering::SeqCst);
            }

            if iteration % CHECKPOINT_INTERVAL == 0 {
                info!(
                    iteration,
                    max = self.phase_params.max_iterations,
                    tree_size = self.tree.read().len(),
                    "search progress"
                );
            }
            if iteration - last_checkpoint >= CHECKPOINT_INTERVAL {
                self.save_progress(&format!("iteration_{iteration}"));
                last_checkpoint = iteration;
            }
        }

        // wait for the stragglers before the final checkpoint
        while let Some(result) = tasks.join_next().await {
            Self::reap(result, &mut in_flight);
        }

        info!(
            phase = %self.phase_name,
            iteration,
            tree_size = self.tree.read().len(),
            "search completed"
        );
        self.save_progress("final");
        Ok(())
    }

    /// Top up the queue with eligible nodes until the fan-out limit.
    async fn fill_task_queue(
        self: &Arc<Self>,
        tasks: &mut JoinSet<NodeId>,
        in_flight: &mut HashSet<NodeId>,
    ) -> Result<(), SearchError> {
        while tasks.len() < self.phase_params.num_nodes_per_iteration {
            let mut selected = None;
            for attempt in 1..=MAX_SELECTION_ATTEMPTS {
                let candidate = self.select_node().await?;
                if self.is_eligible(&candidate, in_flight) {
                    selected = Some(candidate);
                    break;
                }
                debug!(node = %candidate, attempt, "candidate conflicts with running nodes");
                tokio::task::yield_now().await;
            }

            let Some(node_id) = selected else {
                if in_flight.is_empty() {
                    warn!(
                        attempts = MAX_SELECTION_ATTEMPTS,
                        "no eligible node found, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(NO_ELIGIBLE_BACKOFF) => {}
                    }
                    continue;
                }
                // Let the in-flight evaluations finish and free their nodes.
                break;
            };

            debug!(node = %node_id, running = tasks.len(), "spawning evaluation task");
            in_flight.insert(node_id);
            let scheduler = Arc::clone(self);
            tasks.spawn(async move {
                scheduler.evaluate_node_task(node_id).await;
                node_id
            });
        }
        Ok(())
    }

    /// A node is eligible while neither it nor any ancestor is being
    /// evaluated or expanded.
    fn is_eligible(&self, candidate: &NodeId, in_flight: &HashSet<NodeId>) -> bool {
        let related = {
            let tree = self.tree.read();
            let mut related = tree.ancestors(candidate);
            related.insert(*candidate);
            related
        };
        !related
            .iter()
            .any(|id| in_flight.contains(id) || self.nodes_being_expanded.contains(id))
    }

    fn reap(result: Result<NodeId, tokio::task::JoinError>, in_flight: &mut HashSet<NodeId>) {
        match result {
            Ok(node_id) => {
                in_flight.remove(&node_id);
            }
            Err(err) => {
                // Evaluation tasks handle their own failures; a join error
                // here means an abort or panic.
                warn!(%err, "evaluation task did not complete cleanly");
            }
        }
    }

    /// Evaluate one node, racing against the per-node timeout.
    ///
    /// Timeouts free the slot and leave the node untouched. Other failures
    /// also drop the node from the tree when it has no children and sits
    /// below the pair layer.
    async fn evaluate_node_task(self: &Arc<Self>, node_id: NodeId) {
        debug!(node = %node_id, "starting evaluation task");
        let timeout = Duration::from_secs_f64(self.phase_params.task_timeout);
        match tokio::time::timeout(timeout, self.evaluate_node(node_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(node = %node_id, %err, "error evaluating node");
                self.nodes_being_expanded.remove(&node_id);
                self.remove_if_disposable(&node_id);
            }
            Err(_) => {
                warn!(
                    node = %node_id,
                    timeout_secs = self.phase_params.task_timeout,
                    "evaluation timed out"
                );
                self.nodes_being_expanded.remove(&node_id);
            }
        }
    }

    /// The full evaluation pipeline for one node: run the challenge, stamp
    /// the node, score, backpropagate, track convergence, then expand.
    ///
    /// Also called from inside expansion for freshly created nodes, hence
    /// the boxed recursion.
    pub fn evaluate_node(
        self: &Arc<Self>,
        node_id: NodeId,
    ) -> BoxFuture<'static, Result<(), SearchError>> {
        let scheduler = Arc::clone(self);
        async move {
            let results = scheduler.run_evaluate_hook(node_id).await?;

            if results.data_trail.is_empty() {
                error!(node = %node_id, "empty data trail, removing node from tree");
                scheduler.nodes_being_expanded.remove(&node_id);
                scheduler.remove_if_disposable(&node_id);
                return Ok(());
            }

            scheduler.update_node_data(&node_id, &results);

            let Some((previous_value, difficulty)) = ({
                let tree = scheduler.tree.read();
                tree.node(&node_id)
                    .map(|node| (node.value, node.difficulty.clone()))
            }) else {
                return Ok(());
            };

            let value = scheduler.calculate_node_value(&results, &difficulty)?;
            scheduler.backpropagate_node_value(node_id, value)?;

            tokio::task::yield_now().await;

            let new_value = scheduler
                .tree
                .read()
                .node(&node_id)
                .map(|node| node.value)
                .unwrap_or(previous_value);
            let delta = (new_value - previous_value).abs();
            if delta <= scheduler.phase_params.value_delta_threshold {
                let checks = scheduler.no_change_iterations.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(node = %node_id, delta, checks, "value delta below threshold");
            } else {
                scheduler.no_change_iterations.store(0, Ordering::SeqCst);
                debug!(node = %node_id, delta, "value changed, resetting convergence counter");
            }

            scheduler.expand_node(node_id).await?;
            scheduler.nodes_being_expanded.remove(&node_id);
            Ok(())
        }
        .boxed()
    }

    /// Stamp the node's challenge description from its evaluation trail.
    fn update_node_data(&self, node_id: &NodeId, results: &ChallengeResults) {
        let mut tree = self.tree.write();
        if let Some(node) = tree.node_mut(node_id) {
            if let Some(attempt) = results.first_success_or_last() {
                node.challenge_description = attempt.problem_statement.clone();
            }
            debug!(
                node = %node_id,
                attempts = results.data_trail.len(),
                "updated node challenge data"
            );
        }
    }

    fn remove_if_disposable(&self, node_id: &NodeId) {
        let mut tree = self.tree.write();
        let disposable = tree
            .node(node_id)
            .map(|node| node.depth > 1 && node.children.is_empty())
            .unwrap_or(false);
        if disposable {
            tree.remove_node(node_id);
        }
    }

    async fn initialize_phase(self: &Arc<Self>) -> Result<(), SearchError> {
        match self.methods.initialize_phase.clone() {
            Some(hook) => {
                hook(Arc::clone(self)).await?;
                info!(phase = %self.phase_name, "phase initialized");
            }
            None => {
                debug!(phase = %self.phase_name, "no initialize_phase registered");
            }
        }
        Ok(())
    }

    pub async fn select_node(self: &Arc<Self>) -> Result<NodeId, SearchError> {
        let hook = self
            .methods
            .select_node
            .clone()
            .ok_or_else(|| self.no_strategy("select_node"))?;
        hook(Arc::clone(self)).await
    }

    async fn run_evaluate_hook(self: &Arc<Self>, node_id: NodeId) -> Result<ChallengeResults, SearchError> {
        let hook = self
            .methods
            .evaluate_node
            .clone()
            .ok_or_else(|| self.no_strategy("evaluate_node"))?;
        hook(Arc::clone(self), node_id).await
    }

    pub fn calculate_node_value(
        &self,
        results: &ChallengeResults,
        difficulty: &str,
    ) -> Result<f64, SearchError> {
        let hook = self
            .methods
            .calculate_node_value
            .clone()
            .ok_or_else(|| self.no_strategy("calculate_node_value"))?;
        Ok(hook(self, results, difficulty))
    }

    pub fn backpropagate_node_value(&self, node_id: NodeId, reward: f64) -> Result<(), SearchError> {
        let hook = self
            .methods
            .backpropagate_node_value
            .clone()
            .ok_or_else(|| self.no_strategy("backpropagate_node_value"))?;
        hook(self, node_id, reward);
        Ok(())
    }

    /// Claim the expansion slot for a node and run the phase's expansion.
    ///
    /// Skipped when the node or any ancestor already holds a slot
    /// elsewhere; the slot is released by the evaluation pipeline.
    async fn expand_node(self: &Arc<Self>, node_id: NodeId) -> Result<(), SearchError> {
        let hook = self
            .methods
            .expand_node
            .clone()
            .ok_or_else(|| self.no_strategy("expand_node"))?;

        let related = {
            let tree = self.tree.read();
            let mut related = tree.ancestors(&node_id);
            related.insert(node_id);
            related
        };
        if related.iter().any(|id| self.nodes_being_expanded.contains(id)) {
            debug!(node = %node_id, "skipping expansion, ancestor already being expanded");
            return Ok(());
        }

        self.nodes_being_expanded.insert(node_id);
        hook(Arc::clone(self), node_id).await
    }

    async fn shutdown_cancelled(
        &self,
        tasks: &mut JoinSet<NodeId>,
        iteration: u64,
    ) -> Result<(), SearchError> {
        warn!(phase = %self.phase_name, iteration, "search cancelled, stopping all tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        self.save_progress(&format!("cancelled_iteration_{iteration}"));
        Err(SearchError::Cancelled)
    }

    /// Write a checkpoint (and a non-load-bearing DOT rendering).
    pub fn save_progress(&self, label: &str) {
        let prefix = format!("{}_tree_{label}", self.phase_name);
        let tree = self.tree.read();

        let checkpoint = self.experiment_dir.join(format!("{prefix}.pkl"));
        if let Err(err) = tree.save(&checkpoint) {
            error!(%err, "failed to save tree checkpoint");
        }

        let dot = self.experiment_dir.join(format!("{prefix}.dot"));
        if let Err(err) = tree.write_dot(&dot) {
            warn!(%err, "failed to write tree visualization");
        }
    }

    fn no_strategy(&self, method: &str) -> SearchError {
        SearchError::NoStrategy {
            phase: self.phase_name.clone(),
            method: method.to_string(),
        }
    }
}
