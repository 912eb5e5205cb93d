use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::comparator::CompareMode;

pub type SubmissionId = i64;

/// Scheduling priority; higher is served first, FIFO among equals
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Per-request limit overrides. Each field may only lower a limit; values
/// above the system ceiling are clamped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cap_bytes: Option<u64>,
}

/// One input / expected-output pair of a problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    /// Per-case time override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u32>,
    /// Per-case memory override in MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u32>,
    /// Per-case comparison mode; falls back to the problem's mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare: Option<CompareMode>,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            time_limit_ms: None,
            memory_limit_mb: None,
            compare: None,
        }
    }

    pub fn with_time_limit(mut self, time_ms: u32) -> Self {
        self.time_limit_ms = Some(time_ms);
        self
    }

    pub fn with_memory_limit(mut self, memory_mb: u32) -> Self {
        self.memory_limit_mb = Some(memory_mb);
        self
    }

    pub fn with_compare(mut self, mode: CompareMode) -> Self {
        self.compare = Some(mode);
        self
    }
}

/// Where the test cases of a submission come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaseSource {
    /// Cases are fetched from the problem store
    Problem { problem_id: i64 },
    /// Ad hoc run request carrying its own cases
    Inline {
        cases: Vec<TestCase>,
        #[serde(default)]
        compare: CompareMode,
    },
}

/// Code to judge. Immutable once created.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: SubmissionId,
    pub language: String,
    pub source: String,
    pub cases: CaseSource,
    pub requested_at: SystemTime,
    pub priority: Priority,
    pub limits: LimitOverride,
}

impl Submission {
    pub fn for_problem(
        id: SubmissionId,
        language: impl Into<String>,
        source: impl Into<String>,
        problem_id: i64,
    ) -> Self {
        Self {
            id,
            language: language.into(),
            source: source.into(),
            cases: CaseSource::Problem { problem_id },
            requested_at: SystemTime::now(),
            priority: Priority::Normal,
            limits: LimitOverride::default(),
        }
    }

    pub fn inline(
        id: SubmissionId,
        language: impl Into<String>,
        source: impl Into<String>,
        cases: Vec<TestCase>,
        compare: CompareMode,
    ) -> Self {
        Self {
            id,
            language: language.into(),
            source: source.into(),
            cases: CaseSource::Inline { cases, compare },
            requested_at: SystemTime::now(),
            priority: Priority::Normal,
            limits: LimitOverride::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_limits(mut self, limits: LimitOverride) -> Self {
        self.limits = limits;
        self
    }

    pub fn problem_id(&self) -> Option<i64> {
        match self.cases {
            CaseSource::Problem { problem_id } => Some(problem_id),
            CaseSource::Inline { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_case_source_tagged() {
        let source: CaseSource =
            serde_json::from_str(r#"{"kind":"problem","problem_id":7}"#).unwrap();
        assert_eq!(source, CaseSource::Problem { problem_id: 7 });
    }

    #[test]
    fn test_testcase_optional_fields() {
        let case: TestCase =
            serde_json::from_str(r#"{"input":"1\n","expected_output":"2\n"}"#).unwrap();
        assert_eq!(case.time_limit_ms, None);
        assert_eq!(case.compare, None);
    }
}
