use serde::{Deserialize, Serialize};

/// Outcome of a single environment run for one challenge node.
///
/// The environment replies with a trail of solution attempts. Transport
/// failures are folded into the same shape with `success == false` and an
/// empty trail so callers only have to deal with one representation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChallengeResults {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data_trail: Vec<AttemptRecord>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One attempt inside an evaluation trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptRecord {
    #[serde(default)]
    pub problem_statement: String,
    #[serde(default)]
    pub test_cases: String,
    #[serde(default)]
    pub solution_code: String,
    #[serde(default)]
    pub tests_passed_num: u32,
    #[serde(default)]
    pub tests_failed_num: u32,
    #[serde(default)]
    pub tests_errored_num: u32,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub fixed_by_problem_fixer: bool,
    #[serde(default)]
    pub attempt_num: u32,
    #[serde(default)]
    pub error_feedback: Option<String>,
    #[serde(default)]
    pub test_validation: Option<String>,
    #[serde(default)]
    pub test_error_analysis: Option<String>,
}

impl ChallengeResults {
    /// A failed result with an empty trail, used for transport errors.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data_trail: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// The first successful attempt, falling back to the last attempt.
    pub fn first_success_or_last(&self) -> Option<&AttemptRecord> {
        self.data_trail
            .iter()
            .find(|attempt| attempt.success)
            .or_else(|| self.data_trail.last())
    }

    /// 1-based index of the first successful attempt, or the trail length
    /// when no attempt succeeded.
    pub fn attempts_till_success(&self) -> usize {
        self.data_trail
            .iter()
            .position(|attempt| attempt.success)
            .map(|idx| idx + 1)
            .unwrap_or(self.data_trail.len())
    }

    /// Whether the trail ended with the problem fixer rescuing the run.
    pub fn fixed_by_problem_fixer(&self) -> bool {
        self.data_trail
            .last()
            .map(|attempt| attempt.success && attempt.fixed_by_problem_fixer)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(success: bool, fixed: bool) -> AttemptRecord {
        AttemptRecord {
            success,
            fixed_by_problem_fixer: fixed,
            ..AttemptRecord::default()
        }
    }

    #[test]
    fn attempts_till_success_uses_first_success() {
        let results = ChallengeResults {
            success: true,
            data_trail: vec![attempt(false, false), attempt(true, false), attempt(true, false)],
            error: None,
        };
        assert_eq!(results.attempts_till_success(), 2);
    }

    #[test]
    fn attempts_till_success_falls_back_to_trail_length() {
        let results = ChallengeResults {
            success: false,
            data_trail: vec![attempt(false, false), attempt(false, false)],
            error: None,
        };
        assert_eq!(results.attempts_till_success(), 2);
    }

    #[test]
    fn fixer_flag_requires_final_success() {
        let fixed = ChallengeResults {
            success: true,
            data_trail: vec![attempt(false, false), attempt(true, true)],
            error: None,
        };
        assert!(fixed.fixed_by_problem_fixer());

        let unfixed = ChallengeResults {
            success: false,
            data_trail: vec![attempt(false, true)],
            error: None,
        };
        assert!(!unfixed.fixed_by_problem_fixer());
    }

    #[test]
    fn tolerates_sparse_payloads() {
        let results: ChallengeResults =
            serde_json::from_str(r#"{"success": true, "data_trail": [{"success": true}]}"#)
                .unwrap();
        assert!(results.success);
        assert_eq!(results.data_trail.len(), 1);
        assert_eq!(results.data_trail[0].tests_passed_num, 0);
    }
}
