use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict attached to a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseVerdict {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    OutputLimitExceeded,
}

impl CaseVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CaseVerdict::Accepted)
    }
}

impl fmt::Display for CaseVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        VerdictStatus::from(*self).fmt(f)
    }
}

/// Overall status of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    OutputLimitExceeded,
    CompileError,
    InternalError,
    Cancelled,
}

impl From<CaseVerdict> for VerdictStatus {
    fn from(verdict: CaseVerdict) -> Self {
        match verdict {
            CaseVerdict::Accepted => VerdictStatus::Accepted,
            CaseVerdict::WrongAnswer => VerdictStatus::WrongAnswer,
            CaseVerdict::TimeLimitExceeded => VerdictStatus::TimeLimitExceeded,
            CaseVerdict::MemoryLimitExceeded => VerdictStatus::MemoryLimitExceeded,
            CaseVerdict::RuntimeError => VerdictStatus::RuntimeError,
            CaseVerdict::OutputLimitExceeded => VerdictStatus::OutputLimitExceeded,
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictStatus::Accepted => "accepted",
            VerdictStatus::WrongAnswer => "wrong_answer",
            VerdictStatus::TimeLimitExceeded => "time_limit_exceeded",
            VerdictStatus::MemoryLimitExceeded => "memory_limit_exceeded",
            VerdictStatus::RuntimeError => "runtime_error",
            VerdictStatus::OutputLimitExceeded => "output_limit_exceeded",
            VerdictStatus::CompileError => "compile_error",
            VerdictStatus::InternalError => "internal_error",
            VerdictStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Result of one executed test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    /// Zero-based position of the case in the problem
    pub index: usize,
    pub verdict: CaseVerdict,
    pub time_ms: u32,
    pub memory_kb: u32,
    /// Program output (truncated)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
}
