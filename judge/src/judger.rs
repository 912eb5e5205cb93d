//! Judger module for processing one submission
//!
//! Compiles the submission once, runs it against each test case in order and
//! aggregates the per-case results into a single outcome. Every expected
//! failure of untrusted code ends up as a verdict; only engine faults are
//! logged as errors.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::comparator::{compare, CompareMode};
use crate::compiler::{CompileArtifact, CompileResult};
use crate::config::EngineConfig;
use crate::core::utils::non_empty_preview;
use crate::core::{CaseResult, CaseVerdict, Submission, SubmissionId, TestCase, VerdictStatus};
use crate::languages::LanguageConfig;
use crate::sandbox::{ExecutionOutcome, ExecutionSpec, ExecutionStatus, Sandbox};

/// Where a submission is in its judging lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "case", rename_all = "snake_case")]
pub enum JudgeState {
    Queued,
    Compiling,
    Running(usize),
    Done,
    CompileError,
    Cancelled,
}

impl JudgeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JudgeState::Done | JudgeState::CompileError | JudgeState::Cancelled
        )
    }

    fn rank(&self) -> usize {
        match self {
            JudgeState::Queued => 0,
            JudgeState::Compiling => 1,
            JudgeState::Running(i) => i.saturating_add(2),
            JudgeState::Done | JudgeState::CompileError | JudgeState::Cancelled => usize::MAX,
        }
    }
}

/// Called on every state transition
pub type ProgressFn = Arc<dyn Fn(SubmissionId, JudgeState) + Send + Sync>;

/// Enforces strictly forward state transitions
pub struct StateTracker {
    id: SubmissionId,
    current: JudgeState,
    progress: Option<ProgressFn>,
}

impl StateTracker {
    pub fn new(id: SubmissionId, progress: Option<ProgressFn>) -> Self {
        Self {
            id,
            current: JudgeState::Queued,
            progress,
        }
    }

    pub fn current(&self) -> JudgeState {
        self.current
    }

    /// Move to `next`. Backward moves and moves out of a terminal state are
    /// refused.
    pub fn advance(&mut self, next: JudgeState) -> bool {
        if self.current.is_terminal() || next.rank() <= self.current.rank() {
            warn!(
                "Submission {}: refused transition {:?} -> {:?}",
                self.id, self.current, next
            );
            return false;
        }
        self.current = next;
        if let Some(ref progress) = self.progress {
            progress(self.id, next);
        }
        true
    }
}

/// Aggregate result of judging one submission
#[derive(Debug, Clone)]
pub struct JudgeOutcome {
    pub status: VerdictStatus,
    /// Index of the first failing case
    pub failing_case: Option<usize>,
    /// Max CPU time over executed cases
    pub time_ms: u32,
    /// Max peak memory over executed cases
    pub memory_kb: u32,
    /// Executed cases, in order
    pub cases: Vec<CaseResult>,
    pub compile_output: Option<String>,
    /// stderr of the first failing case
    pub stderr: Option<String>,
    /// Description of an engine fault
    pub message: Option<String>,
    /// Number of run steps executed
    pub executions: usize,
}

impl JudgeOutcome {
    fn new(status: VerdictStatus) -> Self {
        Self {
            status,
            failing_case: None,
            time_ms: 0,
            memory_kb: 0,
            cases: Vec::new(),
            compile_output: None,
            stderr: None,
            message: None,
            executions: 0,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(VerdictStatus::InternalError)
        }
    }

    pub fn cancelled() -> Self {
        Self::new(VerdictStatus::Cancelled)
    }
}

/// Everything needed to judge one submission
pub struct JudgeTask<'a> {
    pub submission: &'a Submission,
    pub language: &'a LanguageConfig,
    pub cases: &'a [TestCase],
    /// Comparison mode for cases that do not declare one
    pub compare: &'a CompareMode,
}

/// Compile-then-run pipeline
pub struct JudgePipeline {
    sandbox: Arc<dyn Sandbox>,
    config: Arc<EngineConfig>,
    fail_fast: bool,
    scratch_root: Option<PathBuf>,
    progress: Option<ProgressFn>,
}

impl JudgePipeline {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: Arc<EngineConfig>) -> Self {
        let fail_fast = config.fail_fast;
        Self {
            sandbox,
            config,
            fail_fast,
            scratch_root: None,
            progress: None,
        }
    }

    /// Stop at the first failing case (default from config)
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Create artifact directories under `root`
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Judge one submission. Never fails: engine faults become an
    /// `InternalError` outcome.
    pub async fn judge(&self, task: JudgeTask<'_>, cancel: &CancellationToken) -> JudgeOutcome {
        let id = task.submission.id;
        let mut tracker = StateTracker::new(id, self.progress.clone());

        let outcome = self.run_states(&task, &mut tracker, cancel).await;

        if !tracker.current().is_terminal() {
            tracker.advance(JudgeState::Done);
        }

        info!(
            "Job summary: submission_id={}, verdict={}, max_time_ms={}, max_memory_kb={}",
            id, outcome.status, outcome.time_ms, outcome.memory_kb
        );
        outcome
    }

    async fn run_states(
        &self,
        task: &JudgeTask<'_>,
        tracker: &mut StateTracker,
        cancel: &CancellationToken,
    ) -> JudgeOutcome {
        let id = task.submission.id;

        if cancel.is_cancelled() {
            tracker.advance(JudgeState::Cancelled);
            return JudgeOutcome::cancelled();
        }
        if task.cases.is_empty() {
            error!("Submission {} has no test cases to judge", id);
            return JudgeOutcome::internal_error("no test cases to judge");
        }

        tracker.advance(JudgeState::Compiling);
        // Owned here and dropped when judging ends, removing the directory
        let mut artifact = match CompileArtifact::prepare(
            self.scratch_root.as_deref(),
            task.language,
            &task.submission.source,
        )
        .await
        {
            Ok(artifact) => artifact,
            Err(e) => return engine_fault(id, "preparing artifact", &e),
        };

        let compiled = artifact
            .compile(
                self.sandbox.as_ref(),
                task.language,
                self.config.compile_limits(),
                self.config.stderr_preview_bytes,
                cancel,
            )
            .await;
        match compiled {
            Ok(CompileResult::Success) => {
                debug!(
                    "Submission {} compiled in {}ms",
                    id,
                    artifact.diagnostics().duration_ms
                );
            }
            Ok(CompileResult::Failed { message }) => {
                info!("Submission {} failed to compile", id);
                tracker.advance(JudgeState::CompileError);
                let mut outcome = JudgeOutcome::new(VerdictStatus::CompileError);
                outcome.compile_output = Some(message);
                return outcome;
            }
            Ok(CompileResult::Cancelled) => {
                tracker.advance(JudgeState::Cancelled);
                return JudgeOutcome::cancelled();
            }
            Err(e) => return engine_fault(id, "compiling", &e),
        }

        let mut outcome = JudgeOutcome::new(VerdictStatus::Accepted);

        for (index, case) in task.cases.iter().enumerate() {
            if cancel.is_cancelled() {
                tracker.advance(JudgeState::Cancelled);
                outcome.status = VerdictStatus::Cancelled;
                return outcome;
            }
            tracker.advance(JudgeState::Running(index));

            let limits = task
                .language
                .limits_for(case, &task.submission.limits, &self.config);
            let spec = ExecutionSpec::new(artifact.path())
                .with_command(task.language.run_step(&limits))
                .with_limits(limits)
                .with_stdin(case.input.as_str());

            outcome.executions += 1;
            let result = match self.sandbox.execute(&spec, cancel).await {
                Ok(result) => result,
                Err(e) => return engine_fault(id, "running test case", &e),
            };
            if result.status == ExecutionStatus::Cancelled {
                tracker.advance(JudgeState::Cancelled);
                outcome.status = VerdictStatus::Cancelled;
                return outcome;
            }

            outcome.time_ms = outcome.time_ms.max(result.time_ms);
            outcome.memory_kb = outcome.memory_kb.max(result.memory_kb);

            let mode = case.compare.as_ref().unwrap_or(task.compare);
            let verdict = case_verdict(&result, &case.expected_output, mode);
            debug!(
                "Submission {} case {}: {} ({}ms, {}KB)",
                id, index, verdict, result.time_ms, result.memory_kb
            );

            outcome.cases.push(CaseResult {
                index,
                verdict,
                time_ms: result.time_ms,
                memory_kb: result.memory_kb,
                output_preview: non_empty_preview(&result.stdout, self.config.stderr_preview_bytes),
            });

            if !verdict.is_accepted() {
                if outcome.failing_case.is_none() {
                    outcome.failing_case = Some(index);
                    outcome.status = verdict.into();
                    outcome.stderr =
                        non_empty_preview(&result.stderr, self.config.stderr_preview_bytes);
                }
                if self.fail_fast {
                    break;
                }
            }
        }

        outcome
    }
}

/// Map one execution to a case verdict
fn case_verdict(result: &ExecutionOutcome, expected: &str, mode: &CompareMode) -> CaseVerdict {
    match result.status {
        ExecutionStatus::Exited(0) => {
            if compare(expected, &result.stdout, result.truncated, mode) {
                CaseVerdict::Accepted
            } else {
                CaseVerdict::WrongAnswer
            }
        }
        ExecutionStatus::Exited(_) | ExecutionStatus::Signaled(_) => CaseVerdict::RuntimeError,
        ExecutionStatus::TimeLimitExceeded => CaseVerdict::TimeLimitExceeded,
        ExecutionStatus::MemoryLimitExceeded => CaseVerdict::MemoryLimitExceeded,
        ExecutionStatus::OutputLimitExceeded => CaseVerdict::OutputLimitExceeded,
        // handled by the caller before comparison
        ExecutionStatus::Cancelled => CaseVerdict::RuntimeError,
    }
}

fn engine_fault(id: SubmissionId, stage: &str, err: &dyn std::error::Error) -> JudgeOutcome {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    error!("Engine fault while {} for submission {}: {}", stage, id, message);
    JudgeOutcome::internal_error(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageRegistry;
    use crate::sandbox::SandboxError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn exec(status: ExecutionStatus, stdout: &str) -> ExecutionOutcome {
        ExecutionOutcome {
            status,
            exit_code: match status {
                ExecutionStatus::Exited(code) => Some(code),
                _ => None,
            },
            signal: None,
            wall_time_ms: 5,
            time_ms: 3,
            memory_kb: 1024,
            stdout: stdout.to_string(),
            stderr: String::new(),
            truncated: status == ExecutionStatus::OutputLimitExceeded,
        }
    }

    enum Step {
        Outcome(ExecutionOutcome),
        SpawnFailure,
    }

    /// Replays scripted outcomes and records what it was asked to run
    #[derive(Default)]
    struct ScriptedSandbox {
        compile: Mutex<Option<ExecutionOutcome>>,
        runs: Mutex<VecDeque<Step>>,
        run_dirs: Mutex<Vec<PathBuf>>,
        stdins: Mutex<Vec<String>>,
    }

    impl ScriptedSandbox {
        fn new(compile: ExecutionOutcome, runs: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                compile: Mutex::new(Some(compile)),
                runs: Mutex::new(runs.into()),
                ..Default::default()
            })
        }

        fn run_count(&self) -> usize {
            self.run_dirs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        async fn execute(
            &self,
            spec: &ExecutionSpec,
            _cancel: &CancellationToken,
        ) -> Result<ExecutionOutcome, SandboxError> {
            if spec.copy_out_dir.is_some() {
                return Ok(self
                    .compile
                    .lock()
                    .unwrap()
                    .take()
                    .expect("compiled twice"));
            }
            self.run_dirs.lock().unwrap().push(spec.work_dir.clone());
            self.stdins
                .lock()
                .unwrap()
                .push(spec.stdin.clone().unwrap_or_default());
            match self.runs.lock().unwrap().pop_front().expect("unexpected run") {
                Step::Outcome(outcome) => Ok(outcome),
                Step::SpawnFailure => Err(SandboxError::Spawn {
                    program: "./main".into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
            }
        }
    }

    fn ok(stdout: &str) -> Step {
        Step::Outcome(exec(ExecutionStatus::Exited(0), stdout))
    }

    fn echo_cases() -> Vec<TestCase> {
        vec![TestCase::new("3\n", "3\n"), TestCase::new("5\n", "6\n")]
    }

    async fn judge(
        sandbox: Arc<ScriptedSandbox>,
        cases: &[TestCase],
        fail_fast: bool,
        cancel: &CancellationToken,
    ) -> JudgeOutcome {
        let registry = LanguageRegistry::builtin().unwrap();
        let cpp = registry.get("cpp").unwrap();
        let submission = Submission::for_problem(1, "cpp", "int main() {}", 1);
        let pipeline = JudgePipeline::new(sandbox, Arc::new(EngineConfig::default()))
            .with_fail_fast(fail_fast);
        let task = JudgeTask {
            submission: &submission,
            language: &cpp,
            cases,
            compare: &CompareMode::Exact,
        };
        pipeline.judge(task, cancel).await
    }

    #[tokio::test]
    async fn test_all_cases_accepted() {
        let sandbox = ScriptedSandbox::new(
            exec(ExecutionStatus::Exited(0), ""),
            vec![ok("1\n"), ok("2\n")],
        );
        let cases = vec![TestCase::new("1\n", "1\n"), TestCase::new("2\n", "2\n")];
        let outcome = judge(sandbox.clone(), &cases, true, &CancellationToken::new()).await;

        assert_eq!(outcome.status, VerdictStatus::Accepted);
        assert_eq!(outcome.failing_case, None);
        assert_eq!(outcome.cases.len(), 2);
        assert_eq!(outcome.memory_kb, 1024);
        assert_eq!(*sandbox.stdins.lock().unwrap(), vec!["1\n", "2\n"]);
    }

    #[tokio::test]
    async fn test_wrong_answer_stops_at_failing_case() {
        let sandbox = ScriptedSandbox::new(
            exec(ExecutionStatus::Exited(0), ""),
            vec![ok("3\n"), ok("5\n")],
        );
        let mut cases = echo_cases();
        cases.push(TestCase::new("7\n", "7\n"));
        let outcome = judge(sandbox.clone(), &cases, true, &CancellationToken::new()).await;

        assert_eq!(outcome.status, VerdictStatus::WrongAnswer);
        assert_eq!(outcome.failing_case, Some(1));
        assert_eq!(outcome.executions, 2);
        assert_eq!(outcome.cases.len(), 2);
        assert_eq!(outcome.cases[0].verdict, CaseVerdict::Accepted);
        assert_eq!(sandbox.run_count(), 2);
    }

    #[tokio::test]
    async fn test_run_all_cases_keeps_first_failure() {
        let sandbox = ScriptedSandbox::new(
            exec(ExecutionStatus::Exited(0), ""),
            vec![
                Step::Outcome(exec(ExecutionStatus::TimeLimitExceeded, "")),
                ok("wrong\n"),
                ok("7\n"),
            ],
        );
        let cases = vec![
            TestCase::new("1\n", "1\n"),
            TestCase::new("2\n", "2\n"),
            TestCase::new("7\n", "7\n"),
        ];
        let outcome = judge(sandbox.clone(), &cases, false, &CancellationToken::new()).await;

        assert_eq!(outcome.status, VerdictStatus::TimeLimitExceeded);
        assert_eq!(outcome.failing_case, Some(0));
        assert_eq!(outcome.executions, 3);
        assert_eq!(outcome.cases[1].verdict, CaseVerdict::WrongAnswer);
        assert_eq!(outcome.cases[2].verdict, CaseVerdict::Accepted);
    }

    #[tokio::test]
    async fn test_compile_error_runs_nothing() {
        let mut failed = exec(ExecutionStatus::Exited(1), "");
        failed.stderr = "main.cpp:1: error: expected ';'".into();
        let sandbox = ScriptedSandbox::new(failed, vec![]);
        let outcome = judge(sandbox.clone(), &echo_cases(), true, &CancellationToken::new()).await;

        assert_eq!(outcome.status, VerdictStatus::CompileError);
        assert!(outcome.compile_output.unwrap().contains("error"));
        assert_eq!(outcome.executions, 0);
        assert_eq!(sandbox.run_count(), 0);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases = vec![TestCase::new("", "")];
        for (status, expected) in [
            (ExecutionStatus::TimeLimitExceeded, VerdictStatus::TimeLimitExceeded),
            (ExecutionStatus::MemoryLimitExceeded, VerdictStatus::MemoryLimitExceeded),
            (ExecutionStatus::OutputLimitExceeded, VerdictStatus::OutputLimitExceeded),
            (ExecutionStatus::Exited(1), VerdictStatus::RuntimeError),
            (ExecutionStatus::Signaled(11), VerdictStatus::RuntimeError),
        ] {
            let sandbox = ScriptedSandbox::new(
                exec(ExecutionStatus::Exited(0), ""),
                vec![Step::Outcome(exec(status, ""))],
            );
            let outcome = judge(sandbox, &cases, true, &CancellationToken::new()).await;
            assert_eq!(outcome.status, expected, "for {:?}", status);
        }
    }

    #[tokio::test]
    async fn test_truncated_output_never_accepted() {
        let mut capped = exec(ExecutionStatus::Exited(0), "3\n");
        capped.truncated = true;
        let sandbox = ScriptedSandbox::new(
            exec(ExecutionStatus::Exited(0), ""),
            vec![Step::Outcome(capped)],
        );
        let cases = vec![TestCase::new("3\n", "3\n")];
        let outcome = judge(sandbox, &cases, true, &CancellationToken::new()).await;
        assert_eq!(outcome.status, VerdictStatus::WrongAnswer);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_internal_error() {
        let sandbox = ScriptedSandbox::new(
            exec(ExecutionStatus::Exited(0), ""),
            vec![Step::SpawnFailure],
        );
        let outcome = judge(sandbox, &echo_cases(), true, &CancellationToken::new()).await;
        assert_eq!(outcome.status, VerdictStatus::InternalError);
        assert!(outcome.message.unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let sandbox = ScriptedSandbox::new(exec(ExecutionStatus::Exited(0), ""), vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = judge(sandbox.clone(), &echo_cases(), true, &cancel).await;
        assert_eq!(outcome.status, VerdictStatus::Cancelled);
        assert_eq!(sandbox.run_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_mid_run() {
        let sandbox = ScriptedSandbox::new(
            exec(ExecutionStatus::Exited(0), ""),
            vec![ok("3\n"), Step::Outcome(exec(ExecutionStatus::Cancelled, ""))],
        );
        let outcome = judge(sandbox.clone(), &echo_cases(), true, &CancellationToken::new()).await;
        assert_eq!(outcome.status, VerdictStatus::Cancelled);
        assert_eq!(outcome.cases.len(), 1);
    }

    #[tokio::test]
    async fn test_single_artifact_removed_after_judging() {
        let sandbox = ScriptedSandbox::new(
            exec(ExecutionStatus::Exited(0), ""),
            vec![ok("3\n"), ok("6\n")],
        );
        judge(sandbox.clone(), &echo_cases(), true, &CancellationToken::new()).await;

        let dirs = sandbox.run_dirs.lock().unwrap().clone();
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0], dirs[1]);
        assert!(!dirs[0].exists());
    }

    #[tokio::test]
    async fn test_progress_reports_forward_states() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |_, state| sink.lock().unwrap().push(state));

        let registry = LanguageRegistry::builtin().unwrap();
        let cpp = registry.get("cpp").unwrap();
        let submission = Submission::for_problem(9, "cpp", "int main() {}", 1);
        let sandbox = ScriptedSandbox::new(
            exec(ExecutionStatus::Exited(0), ""),
            vec![ok("3\n"), ok("6\n")],
        );
        let pipeline = JudgePipeline::new(sandbox, Arc::new(EngineConfig::default()))
            .with_progress(progress);
        let cases = echo_cases();
        pipeline
            .judge(
                JudgeTask {
                    submission: &submission,
                    language: &cpp,
                    cases: &cases,
                    compare: &CompareMode::Exact,
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                JudgeState::Compiling,
                JudgeState::Running(0),
                JudgeState::Running(1),
                JudgeState::Done
            ]
        );
    }

    #[test]
    fn test_state_tracker_is_forward_only() {
        let mut tracker = StateTracker::new(1, None);
        assert!(tracker.advance(JudgeState::Compiling));
        assert!(tracker.advance(JudgeState::Running(0)));
        assert!(!tracker.advance(JudgeState::Compiling));
        assert!(!tracker.advance(JudgeState::Running(0)));
        assert!(tracker.advance(JudgeState::Running(2)));
        assert!(tracker.advance(JudgeState::Done));
        assert!(!tracker.advance(JudgeState::Cancelled));
        assert_eq!(tracker.current(), JudgeState::Done);
    }
}
