//! Judge engine facade
//!
//! Validates requests, admits them into the queue and runs the worker pool
//! that judges them. Every admitted submission is reported exactly once,
//! including when it is cancelled or the engine shuts down.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::comparator::CompareMode;
use crate::config::EngineConfig;
use crate::core::{CaseSource, Submission, SubmissionId, TestCase};
use crate::error::EngineError;
use crate::judger::{JudgeOutcome, JudgePipeline, JudgeTask, ProgressFn};
use crate::languages::{LanguageError, LanguageRegistry};
use crate::queue::{CancelOutcome, ClaimedJob, JobHandler, JudgeQueue, WorkSlot, WorkerPool};
use crate::reporter::{ResultReporter, SubmissionStore, SubmissionVerdict};
use crate::sandbox::Sandbox;
use crate::storage::ProblemStore;

/// Handle to an admitted submission
pub struct JudgeHandle {
    id: SubmissionId,
    result: oneshot::Receiver<SubmissionVerdict>,
}

impl JudgeHandle {
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Wait for the verdict
    pub async fn wait(self) -> SubmissionVerdict {
        let id = self.id;
        self.result
            .await
            .unwrap_or_else(|_| SubmissionVerdict::internal_error(id, "verdict channel closed"))
    }
}

/// Snapshot of engine load
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub accepting: bool,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub in_flight: usize,
    pub workers: usize,
}

pub struct JudgeEngine {
    config: Arc<EngineConfig>,
    languages: Arc<LanguageRegistry>,
    queue: Arc<JudgeQueue>,
    reporter: Arc<ResultReporter>,
    pool: Mutex<Option<WorkerPool>>,
    workers: usize,
    next_id: AtomicI64,
}

impl JudgeEngine {
    /// Start the worker pool
    pub fn start(
        config: EngineConfig,
        languages: LanguageRegistry,
        sandbox: Arc<dyn Sandbox>,
        problems: Arc<dyn ProblemStore>,
        submissions: Arc<dyn SubmissionStore>,
    ) -> Arc<Self> {
        let config = Arc::new(config.clamped());
        let languages = Arc::new(languages);
        let queue = Arc::new(JudgeQueue::new(config.queue_capacity));
        let reporter = Arc::new(ResultReporter::new(submissions, config.max_case_details));

        let progress_reporter = Arc::clone(&reporter);
        let progress: ProgressFn =
            Arc::new(move |id, state| progress_reporter.progress(id, state));
        let pipeline = JudgePipeline::new(sandbox, Arc::clone(&config)).with_progress(progress);

        let worker = Arc::new(Worker {
            pipeline,
            languages: Arc::clone(&languages),
            problems,
        });
        let workers = config.max_concurrent_jobs;
        let pool = WorkerPool::start(workers, Arc::clone(&queue), worker);

        info!(
            "Judge engine started: workers={}, queue_capacity={}, fail_fast={}",
            workers, config.queue_capacity, config.fail_fast
        );

        // Locally assigned ids start from the clock so they rarely collide
        // with ids handed in by callers across restarts
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(1);

        Arc::new(Self {
            config,
            languages,
            queue,
            reporter,
            pool: Mutex::new(Some(pool)),
            workers,
            next_id: AtomicI64::new(seed),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn languages(&self) -> &LanguageRegistry {
        &self.languages
    }

    /// A fresh id for requests that do not carry one
    pub fn next_submission_id(&self) -> SubmissionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Validate and enqueue a submission without blocking
    pub fn submit(&self, submission: Submission) -> Result<JudgeHandle, EngineError> {
        self.validate(&submission)?;

        let id = submission.id;
        let (tx, rx) = oneshot::channel();
        let reporter = Arc::clone(&self.reporter);
        self.queue
            .push(submission, move || reporter.completion(id, Some(tx)))?;

        Ok(JudgeHandle { id, result: rx })
    }

    /// Submit and wait for the verdict
    pub async fn run(&self, submission: Submission) -> Result<SubmissionVerdict, EngineError> {
        Ok(self.submit(submission)?.wait().await)
    }

    /// Cancel a queued or running submission. Idempotent while the
    /// submission is known to the engine.
    pub async fn cancel(&self, id: SubmissionId) -> Result<(), EngineError> {
        match self.queue.cancel(id)? {
            CancelOutcome::Dequeued(job) => {
                info!("Cancelled queued submission {}", id);
                job.completion
                    .finish_with(SubmissionVerdict::cancelled(id))
                    .await;
            }
            CancelOutcome::Signalled => info!("Cancelling running submission {}", id),
        }
        Ok(())
    }

    /// Stop admission, cancel everything and wait for the workers to exit
    pub async fn shutdown(&self) {
        let drained = self.queue.close();
        info!(
            "Shutting down judge engine ({} queued submissions cancelled)",
            drained.len()
        );
        for job in drained {
            let id = job.submission.id;
            job.completion
                .finish_with(SubmissionVerdict::cancelled(id))
                .await;
        }
        if let Some(pool) = self.pool.lock().await.take() {
            pool.join().await;
        }
        info!("Judge engine stopped");
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            accepting: !self.queue.is_closed(),
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            in_flight: self.queue.in_flight(),
            workers: self.workers,
        }
    }

    fn validate(&self, submission: &Submission) -> Result<(), EngineError> {
        self.languages
            .get(&submission.language)
            .map_err(|e| match e {
                LanguageError::Unsupported(tag) => EngineError::UnsupportedLanguage(tag),
                other => EngineError::MalformedRequest(other.to_string()),
            })?;

        if submission.source.trim().is_empty() {
            return Err(EngineError::MalformedRequest("source code is empty".into()));
        }
        if submission.source.len() > self.config.max_source_bytes {
            return Err(EngineError::MalformedRequest(format!(
                "source code exceeds {} bytes",
                self.config.max_source_bytes
            )));
        }
        if let CaseSource::Inline { ref cases, .. } = submission.cases {
            if cases.is_empty() {
                return Err(EngineError::MalformedRequest(
                    "at least one test case is required".into(),
                ));
            }
        }

        let limits = &submission.limits;
        if limits.time_ms == Some(0) || limits.memory_mb == Some(0) || limits.output_cap_bytes == Some(0)
        {
            return Err(EngineError::MalformedRequest(
                "limit overrides must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Judges claimed jobs for the pool
struct Worker {
    pipeline: JudgePipeline,
    languages: Arc<LanguageRegistry>,
    problems: Arc<dyn ProblemStore>,
}

impl Worker {
    async fn judge(&self, submission: &Submission, cancel: &CancellationToken) -> JudgeOutcome {
        if cancel.is_cancelled() {
            return JudgeOutcome::cancelled();
        }

        let language = match self.languages.get(&submission.language) {
            Ok(language) => language,
            Err(e) => return JudgeOutcome::internal_error(e.to_string()),
        };

        let (cases, compare) = match submission.cases {
            CaseSource::Inline {
                ref cases,
                compare,
            } => (cases.clone(), compare),
            CaseSource::Problem { problem_id } => match self.load_problem(problem_id).await {
                Ok(problem) => problem,
                Err(e) => {
                    error!(
                        "Failed to load test cases of problem {} for submission {}: {:#}",
                        problem_id, submission.id, e
                    );
                    return JudgeOutcome::internal_error(format!(
                        "failed to load test cases: {:#}",
                        e
                    ));
                }
            },
        };

        let task = JudgeTask {
            submission,
            language: &language,
            cases: &cases,
            compare: &compare,
        };
        self.pipeline.judge(task, cancel).await
    }

    async fn load_problem(&self, problem_id: i64) -> anyhow::Result<(Vec<TestCase>, CompareMode)> {
        let cases = self.problems.list_test_cases(problem_id).await?;
        let compare = self.problems.comparison_mode(problem_id).await?;
        Ok((cases, compare))
    }
}

#[async_trait]
impl JobHandler for Worker {
    async fn handle(&self, job: ClaimedJob, _slot: WorkSlot) {
        let ClaimedJob {
            submission,
            cancel,
            completion,
            running,
        } = job;

        let outcome = self.judge(&submission, &cancel).await;
        completion.finish(outcome).await;
        drop(running);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LimitOverride, VerdictStatus};
    use crate::reporter::MemorySubmissionStore;
    use crate::sandbox::ProcessSandbox;
    use crate::storage::MemoryProblemStore;
    use std::time::Duration;
    use tokio_test::assert_ok;

    const ECHO: &str = "read x\necho $x\n";

    struct Fixture {
        engine: Arc<JudgeEngine>,
        problems: Arc<MemoryProblemStore>,
        reports: Arc<MemorySubmissionStore>,
    }

    fn fixture(workers: usize, queue_capacity: usize) -> Fixture {
        let config = EngineConfig {
            max_concurrent_jobs: workers,
            queue_capacity,
            ..EngineConfig::default()
        };
        let problems = Arc::new(MemoryProblemStore::new());
        let reports = Arc::new(MemorySubmissionStore::new());
        let engine = JudgeEngine::start(
            config,
            LanguageRegistry::builtin().unwrap(),
            Arc::new(ProcessSandbox::new()),
            problems.clone(),
            reports.clone(),
        );
        Fixture {
            engine,
            problems,
            reports,
        }
    }

    async fn wait_for_reports(store: &MemorySubmissionStore, count: usize) {
        for _ in 0..500 {
            if store.total_reports() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_echo_wrong_answer_on_second_case() {
        let f = fixture(2, 16);
        f.problems.insert(
            1,
            vec![TestCase::new("3\n", "3\n"), TestCase::new("5\n", "6\n")],
            CompareMode::Exact,
        );

        let verdict = assert_ok!(
            f.engine
                .run(Submission::for_problem(100, "sh", ECHO, 1))
                .await
        );
        assert_eq!(verdict.verdict, VerdictStatus::WrongAnswer);
        assert_eq!(verdict.failing_case, Some(1));
        assert_eq!(verdict.cases.len(), 2);
        assert_eq!(f.reports.reports(100).len(), 1);
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_token_mode_ignores_trailing_whitespace() {
        let f = fixture(1, 16);
        let source = "read x\nprintf '%s  \\n\\n' \"$x\"\n";
        let submission = Submission::inline(
            101,
            "shell",
            source,
            vec![TestCase::new("42\n", "42")],
            CompareMode::Token,
        );
        let verdict = assert_ok!(f.engine.run(submission).await);
        assert_eq!(verdict.verdict, VerdictStatus::Accepted);
        assert_eq!(verdict.failing_case, None);
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_compile_error_executes_nothing() {
        let f = fixture(1, 16);
        let submission = Submission::inline(
            102,
            "sh",
            "if then fi (\n",
            vec![TestCase::new("", "")],
            CompareMode::Exact,
        );
        let verdict = assert_ok!(f.engine.run(submission).await);
        assert_eq!(verdict.verdict, VerdictStatus::CompileError);
        assert!(verdict.compile_output.is_some_and(|out| !out.is_empty()));
        assert!(verdict.cases.is_empty());
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_sleeping_program_is_stopped() {
        let f = fixture(1, 16);
        let submission = Submission::inline(
            103,
            "sh",
            "sleep 5\necho done\n",
            vec![TestCase::new("", "done\n")],
            CompareMode::Exact,
        )
        .with_limits(LimitOverride {
            time_ms: Some(100),
            ..Default::default()
        });
        let verdict = assert_ok!(f.engine.run(submission).await);
        assert_eq!(verdict.verdict, VerdictStatus::TimeLimitExceeded);
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_large_output_is_never_accepted() {
        let f = fixture(1, 16);
        // the capped prefix would match
        let submission = Submission::inline(
            104,
            "sh",
            "yes\n",
            vec![TestCase::new("", "y\ny\n")],
            CompareMode::Token,
        )
        .with_limits(LimitOverride {
            output_cap_bytes: Some(4),
            ..Default::default()
        });
        let verdict = assert_ok!(f.engine.run(submission).await);
        assert_eq!(verdict.verdict, VerdictStatus::OutputLimitExceeded);
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_memory_hog_is_memory_limit_exceeded() {
        let f = fixture(1, 16);
        let submission = Submission::inline(
            108,
            "sh",
            "x=$(head -c 200000000 /dev/zero | tr '\\0' a)\necho done\n",
            vec![TestCase::new("", "done\n")],
            CompareMode::Exact,
        )
        .with_limits(LimitOverride {
            memory_mb: Some(32),
            ..Default::default()
        });
        let verdict = assert_ok!(f.engine.run(submission).await);
        assert_eq!(verdict.verdict, VerdictStatus::MemoryLimitExceeded);
        assert_eq!(verdict.failing_case, Some(0));
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_small_program_fits_small_limit() {
        let f = fixture(1, 16);
        let submission = Submission::inline(
            109,
            "sh",
            ECHO,
            vec![TestCase::new("7\n", "7\n")],
            CompareMode::Exact,
        )
        .with_limits(LimitOverride {
            memory_mb: Some(8),
            ..Default::default()
        });
        let verdict = assert_ok!(f.engine.run(submission).await);
        assert_eq!(verdict.verdict, VerdictStatus::Accepted);
        assert!(verdict.memory < 8 * 1024);
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_input_errors_are_rejected_synchronously() {
        let f = fixture(1, 16);
        let err = f
            .engine
            .submit(Submission::for_problem(1, "cobol", ECHO, 1))
            .err()
            .unwrap();
        assert_eq!(err.code(), "unsupported_language");

        let err = f
            .engine
            .submit(Submission::for_problem(2, "sh", "   ", 1))
            .err()
            .unwrap();
        assert_eq!(err.code(), "malformed_request");

        let huge = "#".repeat(f.engine.config().max_source_bytes + 1);
        let err = f
            .engine
            .submit(Submission::for_problem(3, "sh", huge, 1))
            .err()
            .unwrap();
        assert_eq!(err.code(), "malformed_request");

        let err = f
            .engine
            .submit(Submission::inline(4, "sh", ECHO, vec![], CompareMode::Exact))
            .err()
            .unwrap();
        assert_eq!(err.code(), "malformed_request");

        f.engine.shutdown().await;
        assert_eq!(f.reports.total_reports(), 0);
    }

    #[tokio::test]
    async fn test_unknown_problem_is_internal_error() {
        let f = fixture(1, 16);
        let verdict = assert_ok!(
            f.engine
                .run(Submission::for_problem(105, "sh", ECHO, 999))
                .await
        );
        assert_eq!(verdict.verdict, VerdictStatus::InternalError);
        assert!(verdict.message.is_some());
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_running_submission() {
        let f = fixture(1, 16);
        let submission = Submission::inline(
            106,
            "sh",
            "sleep 30\n",
            vec![TestCase::new("", "")],
            CompareMode::Exact,
        )
        .with_limits(LimitOverride {
            time_ms: Some(15_000),
            ..Default::default()
        });
        let handle = assert_ok!(f.engine.submit(submission));

        while f.engine.health().in_flight == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_ok!(f.engine.cancel(106).await);

        let started = std::time::Instant::now();
        let verdict = handle.wait().await;
        assert_eq!(verdict.verdict, VerdictStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));

        wait_for_reports(&f.reports, 1).await;
        assert_eq!(f.reports.reports(106).len(), 1);
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_reports_every_submission_once() {
        let f = fixture(1, 16);
        let slow = LimitOverride {
            time_ms: Some(15_000),
            ..Default::default()
        };
        for id in 200..205 {
            let submission = Submission::inline(
                id,
                "sh",
                "sleep 30\n",
                vec![TestCase::new("", "")],
                CompareMode::Exact,
            )
            .with_limits(slow);
            assert_ok!(f.engine.submit(submission));
        }

        f.engine.shutdown().await;
        wait_for_reports(&f.reports, 5).await;

        for id in 200..205 {
            let reports = f.reports.reports(id);
            assert_eq!(reports.len(), 1, "submission {}", id);
            assert_eq!(reports[0].verdict, VerdictStatus::Cancelled);
        }
        let err = f
            .engine
            .submit(Submission::for_problem(300, "sh", ECHO, 1))
            .err()
            .unwrap();
        assert_eq!(err.code(), "shutting_down");
        assert!(!f.engine.health().accepting);
    }
}
