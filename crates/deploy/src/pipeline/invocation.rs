//! One run of a named pipeline and the handle its caller waits on.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::oneshot;

use crate::{
    error::{PipelineError, StepFailure},
    queue::{DeferredQueue, StepTicket},
};

/// What happens to a step when an earlier step of the same invocation failed,
/// and what its own failure does to later steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepPolicy {
    /// Skipped after an earlier failure; its failure skips later steps.
    Abort,
    /// Skipped after an earlier failure; its failure is only logged.
    Tolerant,
    /// Always runs and never affects later steps.
    Always,
}

/// Submits the steps of one pipeline run, labelled `<pipeline>#<action>`.
///
/// Steps run in submission order. Once an [`StepPolicy::Abort`] step fails, the
/// remaining abortable steps of this invocation are skipped, while completion
/// steps still run.
#[derive(Clone)]
pub(crate) struct Invocation {
    pipeline: &'static str,
    queue: DeferredQueue,
    failure: Arc<Mutex<Option<String>>>,
}

impl Invocation {
    pub(crate) fn new(pipeline: &'static str, queue: DeferredQueue) -> Self {
        Self {
            pipeline,
            queue,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn step<T, F>(&self, action: &str, step: F) -> StepTicket<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.submit(StepPolicy::Abort, action, step)
    }

    pub(crate) fn tolerant<T, F>(&self, action: &str, step: F) -> StepTicket<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.submit(StepPolicy::Tolerant, action, step)
    }

    pub(crate) fn always<T, F>(&self, action: &str, step: F) -> StepTicket<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.submit(StepPolicy::Always, action, step)
    }

    fn submit<T, F>(&self, policy: StepPolicy, action: &str, step: F) -> StepTicket<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let label = format!("{}#{}", self.pipeline, action);
        let failure = self.failure.clone();
        let step_label = label.clone();

        self.queue.submit(label, async move {
            if policy == StepPolicy::Always {
                return step.await;
            }

            let earlier = lock(&failure).clone();
            if let Some(cause) = earlier {
                return Err(StepFailure::Skipped {
                    label: step_label,
                    cause,
                }
                .into());
            }

            if policy == StepPolicy::Tolerant {
                return step.await;
            }

            // Stays set if the step panics or times out before clearing it.
            *lock(&failure) = Some(format!("`{step_label}` did not complete"));
            let result = step.await;
            *lock(&failure) = match &result {
                Ok(_) => None,
                Err(err) => Some(format!("`{step_label}` failed: {err:#}")),
            };
            result
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The first failure among already-submitted steps, in submission order.
pub(crate) async fn first_failure(
    tickets: impl IntoIterator<Item = StepTicket<()>>,
) -> Result<(), StepFailure> {
    for ticket in tickets {
        ticket.outcome().await?;
    }
    Ok(())
}

/// Completes a [`PipelineHandle`]. Consumed by the pipeline's last step.
pub(crate) struct Completion<T> {
    tx: oneshot::Sender<Result<T, PipelineError>>,
}

impl<T> Completion<T> {
    pub(crate) fn complete(self, result: Result<T, PipelineError>) {
        // Fire-and-forget callers drop their handle.
        let _ = self.tx.send(result);
    }
}

/// Resolves when a pipeline invocation has run its last step.
#[must_use = "dropping the handle does not cancel the pipeline"]
pub struct PipelineHandle<T> {
    pipeline: &'static str,
    rx: oneshot::Receiver<Result<T, PipelineError>>,
}

impl<T> PipelineHandle<T> {
    pub(crate) fn channel(pipeline: &'static str) -> (Completion<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (Completion { tx }, Self { pipeline, rx })
    }

    pub fn pipeline(&self) -> &'static str {
        self.pipeline
    }

    /// Wait for the pipeline to finish.
    pub async fn wait(self) -> Result<T, PipelineError> {
        let Self { pipeline, rx } = self;
        rx.await.unwrap_or_else(|_| {
            Err(PipelineError::Step(StepFailure::QueueClosed {
                label: format!("{pipeline}#callback"),
            }))
        })
    }
}
