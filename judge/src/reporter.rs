//! Result reporting
//!
//! Converts a finished judge outcome into the external verdict shape and
//! hands it to the submission store. A [`Completion`] is created for every
//! admitted submission and can only be consumed once; dropping it without
//! reporting still produces an `InternalError` report.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::core::{CaseResult, SubmissionId, VerdictStatus};
use crate::judger::{JudgeOutcome, JudgeState};

/// The verdict handed to callers and the submission store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionVerdict {
    pub submission_id: SubmissionId,
    pub verdict: VerdictStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_case: Option<usize>,
    /// Max CPU time in milliseconds
    pub time: u32,
    /// Max peak memory in KB
    pub memory: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<CaseResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SubmissionVerdict {
    /// Build the external shape, keeping at most `max_case_details` cases
    pub fn from_outcome(id: SubmissionId, outcome: JudgeOutcome, max_case_details: usize) -> Self {
        let mut cases = outcome.cases;
        cases.truncate(max_case_details);
        Self {
            submission_id: id,
            verdict: outcome.status,
            failing_case: outcome.failing_case,
            time: outcome.time_ms,
            memory: outcome.memory_kb,
            cases,
            compile_output: outcome.compile_output,
            stderr: outcome.stderr,
            message: outcome.message,
        }
    }

    pub fn cancelled(id: SubmissionId) -> Self {
        Self::from_outcome(id, JudgeOutcome::cancelled(), 0)
    }

    pub fn internal_error(id: SubmissionId, message: impl Into<String>) -> Self {
        Self::from_outcome(id, JudgeOutcome::internal_error(message), 0)
    }
}

/// External collaborator that persists verdicts
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn report_verdict(&self, id: SubmissionId, verdict: &SubmissionVerdict) -> Result<()>;

    /// Progress is best effort; the default drops it
    async fn report_progress(&self, _id: SubmissionId, _state: JudgeState) -> Result<()> {
        Ok(())
    }
}

/// Store that only logs, for running without Redis
pub struct LogSubmissionStore;

#[async_trait]
impl SubmissionStore for LogSubmissionStore {
    async fn report_verdict(&self, id: SubmissionId, verdict: &SubmissionVerdict) -> Result<()> {
        info!(
            "Verdict for submission {}: {} (time={}ms, memory={}KB)",
            id, verdict.verdict, verdict.time, verdict.memory
        );
        Ok(())
    }
}

/// Store that keeps every report in memory
#[derive(Default)]
pub struct MemorySubmissionStore {
    reports: Mutex<HashMap<SubmissionId, Vec<SubmissionVerdict>>>,
    progress: Mutex<Vec<(SubmissionId, JudgeState)>>,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All verdicts reported for `id`, in order
    pub fn reports(&self, id: SubmissionId) -> Vec<SubmissionVerdict> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_reports(&self) -> usize {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Progress updates for `id`, in the order the store received them
    pub fn progress(&self, id: SubmissionId) -> Vec<JudgeState> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(sid, _)| *sid == id)
            .map(|(_, state)| *state)
            .collect()
    }
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn report_verdict(&self, id: SubmissionId, verdict: &SubmissionVerdict) -> Result<()> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .push(verdict.clone());
        Ok(())
    }

    async fn report_progress(&self, id: SubmissionId, state: JudgeState) -> Result<()> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, state));
        Ok(())
    }
}

/// Forwards verdicts and progress to the submission store
pub struct ResultReporter {
    store: Arc<dyn SubmissionStore>,
    max_case_details: usize,
    progress_tx: mpsc::UnboundedSender<(SubmissionId, JudgeState)>,
}

impl ResultReporter {
    /// Must be called inside a tokio runtime, which runs the progress
    /// publisher until the reporter is dropped.
    pub fn new(store: Arc<dyn SubmissionStore>, max_case_details: usize) -> Self {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(publish_progress(Arc::clone(&store), progress_rx));
            }
            Err(_) => warn!("No tokio runtime; progress updates will be dropped"),
        }
        Self {
            store,
            max_case_details,
            progress_tx,
        }
    }

    pub fn max_case_details(&self) -> usize {
        self.max_case_details
    }

    /// Create the single completion for an admitted submission
    pub fn completion(
        self: &Arc<Self>,
        id: SubmissionId,
        waiter: Option<oneshot::Sender<SubmissionVerdict>>,
    ) -> Completion {
        Completion {
            id,
            reporter: Arc::clone(self),
            waiter,
            done: false,
        }
    }

    /// Queue progress for the store without waiting for it. Updates reach
    /// the store in the order they were queued.
    pub fn progress(&self, id: SubmissionId, state: JudgeState) {
        // Only fails once the publisher is gone
        let _ = self.progress_tx.send((id, state));
    }

    async fn deliver(&self, id: SubmissionId, verdict: &SubmissionVerdict) {
        if let Err(e) = self.store.report_verdict(id, verdict).await {
            error!("Failed to report verdict for submission {}: {:#}", id, e);
        }
    }
}

/// Single publisher, so one submission's states are never reordered
async fn publish_progress(
    store: Arc<dyn SubmissionStore>,
    mut rx: mpsc::UnboundedReceiver<(SubmissionId, JudgeState)>,
) {
    while let Some((id, state)) = rx.recv().await {
        if let Err(e) = store.report_progress(id, state).await {
            warn!("Failed to publish progress for {}: {:#}", id, e);
        }
    }
}

/// Obligation to report exactly one verdict for a submission
pub struct Completion {
    id: SubmissionId,
    reporter: Arc<ResultReporter>,
    waiter: Option<oneshot::Sender<SubmissionVerdict>>,
    done: bool,
}

impl Completion {
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Report a finished judge outcome
    pub async fn finish(self, outcome: JudgeOutcome) {
        let verdict =
            SubmissionVerdict::from_outcome(self.id, outcome, self.reporter.max_case_details);
        self.finish_with(verdict).await;
    }

    /// Report a verdict built elsewhere (cancelled, internal error)
    pub async fn finish_with(mut self, verdict: SubmissionVerdict) {
        self.done = true;
        self.reporter.deliver(self.id, &verdict).await;
        if let Some(waiter) = self.waiter.take() {
            // The caller may have stopped waiting
            let _ = waiter.send(verdict);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        error!("Submission {} finished without a verdict", self.id);
        let verdict = SubmissionVerdict::internal_error(self.id, "judging aborted");
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(verdict.clone());
        }
        let reporter = Arc::clone(&self.reporter);
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { reporter.deliver(id, &verdict).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CaseVerdict;

    fn reporter(store: Arc<MemorySubmissionStore>, max_case_details: usize) -> Arc<ResultReporter> {
        Arc::new(ResultReporter::new(store, max_case_details))
    }

    #[test]
    fn test_case_details_are_bounded() {
        let mut outcome = JudgeOutcome::cancelled();
        outcome.status = VerdictStatus::Accepted;
        outcome.cases = (0..5)
            .map(|index| CaseResult {
                index,
                verdict: CaseVerdict::Accepted,
                time_ms: 1,
                memory_kb: 1,
                output_preview: None,
            })
            .collect();
        let verdict = SubmissionVerdict::from_outcome(3, outcome, 2);
        assert_eq!(verdict.cases.len(), 2);
        assert_eq!(verdict.verdict, VerdictStatus::Accepted);
    }

    #[test]
    fn test_verdict_json_shape() {
        let verdict = SubmissionVerdict::cancelled(4);
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["verdict"], "cancelled");
        assert_eq!(json["submission_id"], 4);
        assert!(json.get("failing_case").is_none());
        assert!(json.get("cases").is_none());
    }

    #[tokio::test]
    async fn test_finish_reports_once_and_wakes_waiter() {
        let store = Arc::new(MemorySubmissionStore::new());
        let (tx, rx) = oneshot::channel();
        let completion = reporter(store.clone(), 8).completion(1, Some(tx));

        completion.finish(JudgeOutcome::cancelled()).await;

        assert_eq!(rx.await.unwrap().verdict, VerdictStatus::Cancelled);
        assert_eq!(store.reports(1).len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_completion_still_reports() {
        let store = Arc::new(MemorySubmissionStore::new());
        let (tx, rx) = oneshot::channel();
        drop(reporter(store.clone(), 8).completion(2, Some(tx)));

        let verdict = rx.await.unwrap();
        assert_eq!(verdict.verdict, VerdictStatus::InternalError);

        // delivery to the store happens on a spawned task
        for _ in 0..100 {
            if store.total_reports() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.reports(2).len(), 1);
    }

    /// Publishes slowly for early states so that any reordering would show
    struct SlowStore {
        inner: MemorySubmissionStore,
    }

    #[async_trait]
    impl SubmissionStore for SlowStore {
        async fn report_verdict(&self, id: SubmissionId, verdict: &SubmissionVerdict) -> Result<()> {
            self.inner.report_verdict(id, verdict).await
        }

        async fn report_progress(&self, id: SubmissionId, state: JudgeState) -> Result<()> {
            if let JudgeState::Running(case) = state {
                let delay = 10u64.saturating_sub(case as u64);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            self.inner.report_progress(id, state).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_progress_is_published_in_order() {
        let store = Arc::new(SlowStore {
            inner: MemorySubmissionStore::new(),
        });
        let reporter = ResultReporter::new(store.clone(), 8);

        let mut expected = vec![JudgeState::Queued, JudgeState::Compiling];
        expected.extend((0..10).map(JudgeState::Running));
        expected.push(JudgeState::Done);
        for state in &expected {
            reporter.progress(7, *state);
        }

        for _ in 0..200 {
            if store.inner.progress(7).len() == expected.len() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(store.inner.progress(7), expected);
    }
}
