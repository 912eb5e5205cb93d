//! Core data model shared by every stage of the judging engine

pub mod submission;
pub mod utils;
pub mod verdict;

pub use submission::{CaseSource, LimitOverride, Priority, Submission, SubmissionId, TestCase};
pub use verdict::{CaseResult, CaseVerdict, VerdictStatus};
