use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::SearchError;

/// Tunables for one scheduler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseParams {
    pub max_depth: usize,
    pub max_iterations: u64,
    pub performance_threshold: f64,
    pub value_delta_threshold: f64,
    pub convergence_checks: u32,
    pub exploration_probability: f64,
    pub num_nodes_per_iteration: usize,
    /// Per-node wall clock budget in seconds.
    pub task_timeout: f64,
    /// Phase 3: minimum value for a node to receive variants.
    pub node_selection_threshold: f64,
    /// Phase 3: how many variants each selected node gets.
    pub variations_per_concept: usize,
    /// Where experiment checkpoint directories are created.
    pub experiments_root: PathBuf,
}

impl Default for PhaseParams {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_iterations: 100,
            performance_threshold: 0.4,
            value_delta_threshold: 0.3,
            convergence_checks: 5,
            exploration_probability: 0.2,
            num_nodes_per_iteration: 5,
            task_timeout: 180.0,
            node_selection_threshold: 0.5,
            variations_per_concept: 5,
            experiments_root: PathBuf::from("experiments"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub max_attempts: u32,
    pub discount_factor: f64,
    pub learning_rate: f64,
    /// Seed for the scheduler's RNG; random when absent.
    pub seed: Option<u64>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            discount_factor: 0.9,
            learning_rate: 0.9,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringParams {
    pub penalty_per_failure: f64,
    pub penalty_per_error: f64,
    pub penalty_per_attempt: f64,
    pub fixed_by_problem_fixer_penalty: f64,
    pub max_num_passed: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            penalty_per_failure: 2.0,
            penalty_per_error: 3.0,
            penalty_per_attempt: 1.0,
            fixed_by_problem_fixer_penalty: 5.0,
            max_num_passed: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Environment name passed as a query parameter on every run.
    pub name: String,
    /// Overrides the service-wide environment URL when set.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: "environment_coding_challenge".to_string(),
            base_url: None,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub phase_params: PhaseParams,
    pub search_params: SearchParams,
    pub scoring_params: ScoringParams,
    pub environment: EnvironmentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    pub concepts: Vec<String>,
    pub difficulties: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub description: String,
    pub phase_sequences: Vec<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            description: "Default experiment configuration".to_string(),
            phase_sequences: vec![
                "phase_1".to_string(),
                "phase_2".to_string(),
                "phase_3".to_string(),
            ],
        }
    }
}

#[derive(Deserialize)]
struct TreeConfigFile {
    tree_configs: TreeConfig,
}

/// Application settings, loaded once at startup from the `configs/` YAML
/// files.
#[derive(Debug, Clone)]
pub struct Settings {
    pub tree_config: TreeConfig,
    pub phase_configs: HashMap<String, PhaseConfig>,
    pub experiment_config: ExperimentConfig,
    /// Base URL of the environment service; `ENV_SERVICE_URL` wins over the
    /// built-in default, per-phase `environment.base_url` wins over both.
    pub env_service_url: String,
}

impl Settings {
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Self, SearchError> {
        let dir = config_dir.as_ref();

        let tree_file: TreeConfigFile = read_yaml(&dir.join("tree_configs.yaml"))?;
        let phase_configs: HashMap<String, PhaseConfig> =
            read_yaml(&dir.join("phase_configs.yaml"))?;
        let experiment_config: ExperimentConfig =
            read_yaml(&dir.join("experiment_configs.yaml"))?;

        let env_service_url = env::var("ENV_SERVICE_URL")
            .unwrap_or_else(|_| "http://node-env:8000".to_string());

        let settings = Self {
            tree_config: tree_file.tree_configs,
            phase_configs,
            experiment_config,
            env_service_url,
        };
        settings.validate()?;

        info!(
            concepts = settings.tree_config.concepts.len(),
            phases = settings.phase_configs.len(),
            experiment = %settings.experiment_config.name,
            "settings loaded"
        );
        Ok(settings)
    }

    pub fn phase_config(&self, phase_name: &str) -> Result<&PhaseConfig, SearchError> {
        self.phase_configs.get(phase_name).ok_or_else(|| {
            SearchError::Configuration(format!("no phase config found for {phase_name}"))
        })
    }

    pub fn phase_sequence(&self) -> &[String] {
        &self.experiment_config.phase_sequences
    }

    fn validate(&self) -> Result<(), SearchError> {
        if self.tree_config.concepts.is_empty() || self.tree_config.difficulties.is_empty() {
            return Err(SearchError::Configuration(
                "tree config requires at least one concept and one difficulty".to_string(),
            ));
        }
        for phase_name in &self.experiment_config.phase_sequences {
            if !self.phase_configs.contains_key(phase_name) {
                return Err(SearchError::Configuration(format!(
                    "experiment references phase '{phase_name}' with no config block"
                )));
            }
        }
        Ok(())
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, SearchError> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        SearchError::Configuration(format!("config file {}: {err}", path.display()))
    })?;
    let parsed = serde_yaml::from_str(&content).map_err(|err| {
        SearchError::Configuration(format!("config file {}: {err}", path.display()))
    })?;
    debug!(path = %path.display(), "loaded config");
    Ok(parsed)
}
