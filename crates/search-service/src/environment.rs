use std::time::Duration;

use challenge_tree::ChallengeResults;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::EnvironmentConfig;

/// Parameters for one challenge run.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeRequest {
    pub concept: Vec<String>,
    pub difficulty_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_problems: Option<Vec<String>>,
}

/// Client for the external evaluation environment.
///
/// The environment generates a challenge for a concept/difficulty pair, lets
/// the model under test attempt it, and reports the attempt trail. Transport
/// and HTTP failures never surface as errors: they come back as a failed
/// [`ChallengeResults`] with an empty trail, which the scheduler treats the
/// same as an empty evaluation.
#[derive(Debug, Clone)]
pub struct EnvironmentClient {
    client: reqwest::Client,
    base_url: String,
    name: String,
}

impl EnvironmentClient {
    pub fn new(config: &EnvironmentConfig, fallback_url: &str) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| fallback_url.to_string());
        info!(%base_url, name = %config.name, "environment client ready");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            name: config.name.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run one challenge against the environment service.
    pub async fn run_challenge(&self, request: ChallengeRequest) -> ChallengeResults {
        let url = format!("{}/run-challenge", self.base_url);
        debug!(
            concept = ?request.concept,
            difficulty = %request.difficulty_level,
            "running challenge"
        );

        let response = match self
            .client
            .post(&url)
            .query(&[("environment_name", self.name.as_str())])
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                let reason = format!("timeout when calling {url}");
                error!("{reason}: {err}");
                return ChallengeResults::failed(reason);
            }
            Err(err) => {
                let reason = format!("network error when calling {url}: {err}");
                error!("{reason}");
                return ChallengeResults::failed(reason);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = format!("HTTP {status} from environment service: {body}");
            error!("{reason}");
            return ChallengeResults::failed(reason);
        }

        match response.json::<ChallengeResults>().await {
            Ok(results) => results,
            Err(err) => {
                let reason = format!("invalid JSON from environment service: {err}");
                error!("{reason}");
                ChallengeResults::failed(reason)
            }
        }
    }
}
