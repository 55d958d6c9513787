#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::routing::post;
use axum::{Json, Router};
use challenge_tree::{AttemptRecord, ChallengeResults};
use search_service::config::{
    EnvironmentConfig, ExperimentConfig, PhaseConfig, PhaseParams, ScoringParams, SearchParams,
    TreeConfig,
};
use search_service::Settings;

/// Spawn a stub environment service that answers every challenge with the
/// given results after an optional delay. Returns its base URL.
pub async fn spawn_env_stub(delay: Duration, results: ChallengeResults) -> String {
    let app = Router::new().route(
        "/run-challenge",
        post(move |_body: Json<serde_json::Value>| {
            let results = results.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Json(results)
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub environment");
    let addr = listener.local_addr().expect("stub local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub environment");
    });
    format!("http://{addr}")
}

/// Like [`spawn_env_stub`], but also records every request body it
/// receives so tests can inspect what the scheduler sent.
pub async fn spawn_recording_env_stub(
    results: ChallengeResults,
) -> (String, std::sync::Arc<std::sync::Mutex<Vec<serde_json::Value>>>) {
    let captured = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&captured);
    let app = Router::new().route(
        "/run-challenge",
        post(move |Json(body): Json<serde_json::Value>| {
            let results = results.clone();
            let sink = std::sync::Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(body);
                Json(results)
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub environment");
    let addr = listener.local_addr().expect("stub local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub environment");
    });
    (format!("http://{addr}"), captured)
}

/// A trail with one successful attempt passing `passed` tests.
pub fn success_results(passed: u32) -> ChallengeResults {
    ChallengeResults {
        success: true,
        data_trail: vec![AttemptRecord {
            problem_statement: "Write a program.".to_string(),
            success: true,
            tests_passed_num: passed,
            attempt_num: 1,
            ..AttemptRecord::default()
        }],
        error: None,
    }
}

/// A failed run with an empty trail, as the client produces for transport
/// errors.
pub fn empty_results() -> ChallengeResults {
    ChallengeResults {
        success: false,
        data_trail: Vec::new(),
        error: Some("stubbed failure".to_string()),
    }
}

/// Fast phase parameters for tests: small tree budgets, seeded RNG, and an
/// isolated experiments directory.
pub fn fast_phase_config(env_url: &str, experiments_root: &Path) -> PhaseConfig {
    PhaseConfig {
        phase_params: PhaseParams {
            max_depth: 2,
            max_iterations: 10,
            performance_threshold: 0.4,
            value_delta_threshold: 0.3,
            convergence_checks: 2,
            exploration_probability: 0.2,
            num_nodes_per_iteration: 2,
            task_timeout: 10.0,
            node_selection_threshold: 0.5,
            variations_per_concept: 2,
            experiments_root: experiments_root.to_path_buf(),
        },
        search_params: SearchParams {
            max_attempts: 3,
            discount_factor: 0.9,
            learning_rate: 0.9,
            seed: Some(7),
        },
        scoring_params: ScoringParams::default(),
        environment: EnvironmentConfig {
            name: "environment_coding_challenge".to_string(),
            base_url: Some(env_url.to_string()),
            timeout_secs: 30,
        },
    }
}

/// Settings with the given phase sequence, every phase using the fast test
/// config against the stub environment.
pub fn test_settings(env_url: &str, experiments_root: &Path, sequence: &[&str]) -> Settings {
    let mut phase_configs = HashMap::new();
    for phase_name in sequence {
        phase_configs.insert(
            phase_name.to_string(),
            fast_phase_config(env_url, experiments_root),
        );
    }
    Settings {
        tree_config: TreeConfig {
            concepts: vec!["loops".into(), "conditionals".into(), "functions".into()],
            difficulties: vec!["very easy".into(), "easy".into()],
        },
        phase_configs,
        experiment_config: ExperimentConfig {
            name: "test".to_string(),
            description: "test experiment".to_string(),
            phase_sequences: sequence.iter().map(|name| name.to_string()).collect(),
        },
        env_service_url: env_url.to_string(),
    }
}

/// Recursively look for a file whose name contains `needle`.
pub fn find_file_containing(dir: &Path, needle: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file_containing(&path, needle) {
                return Some(found);
            }
        } else if path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.contains(needle))
            .unwrap_or(false)
        {
            return Some(path);
        }
    }
    None
}
