//! The deferred execution queue.
//!
//! Every lifecycle step in the process goes through one [`DeferredQueue`]. A single
//! worker task pulls steps off an unbounded channel and runs them one at a time, so
//! workspaces, the port range and the process table are never mutated concurrently.
//! Submission never blocks: callers get a [`StepTicket`] that resolves once the step
//! has run.

use std::{
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::{FutureExt, future::BoxFuture};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::StepFailure;

/// Default upper bound on a single step's run time.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Default number of finished steps kept in the activity log.
pub const DEFAULT_ACTIVITY_CAPACITY: usize = 256;

/// Configuration for the deferred queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// A step running longer than this fails with [`StepFailure::TimedOut`].
    /// `None` lets a hung step stall the queue indefinitely.
    pub step_timeout: Option<Duration>,
    /// Number of finished steps kept for [`DeferredQueue::activity`].
    pub activity_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            step_timeout: Some(DEFAULT_STEP_TIMEOUT),
            activity_capacity: DEFAULT_ACTIVITY_CAPACITY,
        }
    }
}

/// How a finished step ended, as recorded in the activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ActivityOutcome {
    Succeeded,
    Skipped(String),
    Failed(String),
}

/// One finished step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityRecord {
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcome: ActivityOutcome,
}

/// Bounded ring of recently finished steps.
#[derive(Debug)]
struct ActivityLog {
    capacity: usize,
    records: Mutex<VecDeque<ActivityRecord>>,
}

impl ActivityLog {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn record(&self, record: ActivityRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    fn snapshot(&self) -> Vec<ActivityRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// A unit of work waiting in the queue.
struct DeferredStep {
    label: String,
    run: BoxFuture<'static, ()>,
}

/// Resolves to the outcome of one submitted step.
#[must_use = "dropping a ticket does not cancel the step, but its outcome is lost"]
pub struct StepTicket<T> {
    label: String,
    rx: oneshot::Receiver<Result<T, StepFailure>>,
}

impl<T> StepTicket<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wait for the step to run and return its outcome.
    pub async fn outcome(self) -> Result<T, StepFailure> {
        let Self { label, rx } = self;
        rx.await
            .unwrap_or_else(|_| Err(StepFailure::QueueClosed { label }))
    }
}

/// Handle to the process-wide serial work queue.
///
/// Cloning the handle is cheap; all clones feed the same worker.
#[derive(Clone)]
pub struct DeferredQueue {
    tx: mpsc::UnboundedSender<DeferredStep>,
    config: Arc<QueueConfig>,
    activity: Arc<ActivityLog>,
    pending: Arc<AtomicUsize>,
}

impl std::fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish()
    }
}

impl DeferredQueue {
    /// Create the queue and spawn its worker on the current tokio runtime.
    pub fn spawn(config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let activity = Arc::new(ActivityLog::new(config.activity_capacity));
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_worker(rx));

        Self {
            tx,
            config: Arc::new(config),
            activity,
            pending,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a step. Returns immediately.
    ///
    /// An error returned by the step becomes [`StepFailure::Failed`], unless the error
    /// is itself a [`StepFailure`], which is passed through unchanged. Panics and
    /// timeouts are caught and reported the same way.
    pub fn submit<T, F>(&self, label: impl Into<String>, step: F) -> StepTicket<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = oneshot::channel();
        let timeout = self.config.step_timeout;
        let step_label = label.clone();
        let activity = self.activity.clone();
        let pending = self.pending.clone();

        let run = async move {
            let started_at = Utc::now();
            let start = Instant::now();
            tracing::debug!(label = %step_label, "Running deferred step");

            let outcome = guard(step_label.clone(), timeout, step).await;
            let status = outcome.as_ref().map(|_| ());
            activity.record(finish(step_label, started_at, start.elapsed(), status));
            pending.fetch_sub(1, Ordering::SeqCst);

            // The submitter may not care about the result.
            let _ = tx.send(outcome);
        }
        .boxed();

        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(rejected) = self.tx.send(DeferredStep {
            label: label.clone(),
            run,
        }) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(label = %rejected.0.label, "Deferred queue is closed, dropping step");
        } else {
            tracing::trace!(label = %label, "Step deferred");
        }

        StepTicket { label, rx }
    }

    /// Resolves once every step submitted before this call has run.
    pub async fn flush(&self) {
        let _ = self.submit("queue#flush", async { Ok(()) }).outcome().await;
    }

    /// Number of steps submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Recently finished steps, oldest first.
    pub fn activity(&self) -> Vec<ActivityRecord> {
        self.activity.snapshot()
    }
}

/// Run a step, turning errors, panics and timeouts into a [`StepFailure`].
async fn guard<T, F>(label: String, timeout: Option<Duration>, step: F) -> Result<T, StepFailure>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let step = AssertUnwindSafe(step).catch_unwind();
    let result = match timeout {
        Some(after) => match tokio::time::timeout(after, step).await {
            Ok(result) => result,
            Err(_) => return Err(StepFailure::TimedOut { label, after }),
        },
        None => step.await,
    };

    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => match err.downcast::<StepFailure>() {
            Ok(failure) => Err(failure),
            Err(err) => Err(StepFailure::Failed {
                label,
                message: format!("{err:#}"),
            }),
        },
        Err(_) => Err(StepFailure::Panicked { label }),
    }
}

/// Log a finished step and turn it into an activity record.
fn finish(
    label: String,
    started_at: DateTime<Utc>,
    elapsed: Duration,
    status: Result<(), &StepFailure>,
) -> ActivityRecord {
    let elapsed_ms = elapsed.as_millis() as u64;
    let outcome = match status {
        Ok(()) => {
            tracing::debug!(label = %label, elapsed_ms, "Deferred step finished");
            ActivityOutcome::Succeeded
        }
        Err(failure) if failure.is_skipped() => {
            tracing::debug!(label = %label, %failure, "Deferred step skipped");
            ActivityOutcome::Skipped(failure.to_string())
        }
        Err(failure) => {
            tracing::warn!(label = %label, elapsed_ms, %failure, "Deferred step failed");
            ActivityOutcome::Failed(failure.to_string())
        }
    };

    ActivityRecord {
        label,
        started_at,
        elapsed_ms,
        outcome,
    }
}

/// Pulls steps off the channel and runs them to completion, one at a time.
async fn run_worker(mut rx: mpsc::UnboundedReceiver<DeferredStep>) {
    while let Some(step) = rx.recv().await {
        tracing::trace!(label = %step.label, "Dequeued step");
        step.run.await;
    }

    tracing::debug!("Deferred queue closed");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[tokio::test]
    async fn test_steps_run_in_submission_order() {
        let queue = DeferredQueue::spawn(QueueConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let tickets = (0..20)
            .map(|i| {
                let seen = seen.clone();
                queue.submit(format!("step#{i}"), async move {
                    tokio::task::yield_now().await;
                    seen.lock().unwrap().push(i);
                    Ok(i)
                })
            })
            .collect::<Vec<_>>();

        for (i, ticket) in tickets.into_iter().enumerate() {
            assert_eq!(ticket.outcome().await.unwrap(), i);
        }
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_error_becomes_step_failure_and_queue_continues() {
        let queue = DeferredQueue::spawn(QueueConfig::default());

        let failing =
            queue.submit::<(), _>("deploy#provision", async { Err(anyhow::anyhow!("clone failed")) });
        let next = queue.submit("deploy#start", async { Ok("started") });

        assert_eq!(
            failing.outcome().await,
            Err(StepFailure::Failed {
                label: "deploy#provision".to_string(),
                message: "clone failed".to_string(),
            })
        );
        assert_eq!(next.outcome().await.unwrap(), "started");
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let queue = DeferredQueue::spawn(QueueConfig::default());

        let panicking = queue.submit::<(), _>("boom", async {
            if true {
                panic!("step exploded");
            }
            Ok(())
        });
        let next = queue.submit("after", async { Ok(42) });

        assert_eq!(
            panicking.outcome().await,
            Err(StepFailure::Panicked {
                label: "boom".to_string()
            })
        );
        assert_eq!(next.outcome().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_timeout_escalates_to_step_failure() {
        let queue = DeferredQueue::spawn(QueueConfig {
            step_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });

        let hung = queue.submit("hung", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let next = queue.submit("after", async { Ok(()) });

        assert!(matches!(
            hung.outcome().await,
            Err(StepFailure::TimedOut { ref label, .. }) if label == "hung"
        ));
        assert!(next.outcome().await.is_ok());
    }

    #[tokio::test]
    async fn test_step_failure_passes_through() {
        let queue = DeferredQueue::spawn(QueueConfig::default());
        let skipped = queue.submit::<(), _>("create#start", async {
            Err(StepFailure::Skipped {
                label: "create#start".to_string(),
                cause: "earlier step failed".to_string(),
            }
            .into())
        });

        assert!(skipped.outcome().await.unwrap_err().is_skipped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_runs_two_steps_at_once() {
        let queue = DeferredQueue::spawn(QueueConfig::default());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let submitters = (0..8)
            .map(|task| {
                let queue = queue.clone();
                let in_flight = in_flight.clone();
                let overlapped = overlapped.clone();
                tokio::spawn(async move {
                    let tickets = (0..10)
                        .map(|i| {
                            let in_flight = in_flight.clone();
                            let overlapped = overlapped.clone();
                            queue.submit(format!("task{task}#{i}"), async move {
                                if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                                    overlapped.store(true, Ordering::SeqCst);
                                }
                                tokio::time::sleep(Duration::from_millis(1)).await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            })
                        })
                        .collect::<Vec<_>>();
                    for ticket in tickets {
                        ticket.outcome().await.unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for submitter in submitters {
            submitter.await.unwrap();
        }

        assert!(!overlapped.load(Ordering::SeqCst));
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_activity_log_is_bounded() {
        let queue = DeferredQueue::spawn(QueueConfig {
            activity_capacity: 3,
            ..Default::default()
        });

        for i in 0..5 {
            let _ = queue.submit(format!("step#{i}"), async { Ok(()) });
        }
        let _ = queue.submit::<(), _>("step#fail", async { Err(anyhow::anyhow!("nope")) });
        queue.flush().await;

        let labels = queue
            .activity()
            .into_iter()
            .map(|record| record.label)
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["step#4", "step#fail", "queue#flush"]);
        assert_eq!(queue.pending(), 0);
    }
}
