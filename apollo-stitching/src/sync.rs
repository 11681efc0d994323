//! Tracking of the asynchronous work spawned for one execution.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::ExecutionError;

/// Waits for a dynamic set of tasks.
///
/// Tasks may be added while another party is already waiting on [`CompletionGate::resolved`],
/// the wait only ends once the count of outstanding tasks drops back to zero.
///
/// The first task failure is kept and reported by [`CompletionGate::resolved`]; it also
/// cancels the gate's token so that the remaining tasks stop early.
#[derive(Clone)]
pub(crate) struct CompletionGate {
    inner: Arc<Inner>,
}

struct Inner {
    outstanding: watch::Sender<usize>,
    failure: Mutex<Option<ExecutionError>>,
    cancellation: CancellationToken,
}

impl CompletionGate {
    pub(crate) fn new(cancellation: CancellationToken) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                outstanding,
                failure: Mutex::new(None),
                cancellation,
            }),
        }
    }

    /// Spawns `task` on the runtime, in the current span.
    ///
    /// The task is dropped without completing if the gate is cancelled.
    pub(crate) fn add<F>(&self, task: F)
    where
        F: Future<Output = Result<(), ExecutionError>> + Send + 'static,
    {
        self.inner.outstanding.send_modify(|outstanding| *outstanding += 1);

        let cancellation = self.inner.cancellation.clone();
        let handle = tokio::spawn(
            async move {
                tokio::select! {
                    _ = cancellation.cancelled() => Ok(()),
                    result = task => result,
                }
            }
            .in_current_span(),
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let failure = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(err) if err.is_cancelled() => None,
                Err(err) => Some(ExecutionError::from(err)),
            };
            if let Some(err) = failure {
                tracing::error!(error = %err, "stitching task failed");
                inner.failure.lock().get_or_insert(err);
                inner.cancellation.cancel();
            }
            inner.outstanding.send_modify(|outstanding| *outstanding -= 1);
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        *self.inner.outstanding.borrow() == 0
    }

    /// Resolves once every task added so far, and every task added while waiting, has settled.
    pub(crate) async fn resolved(&self) -> Result<(), ExecutionError> {
        let mut outstanding = self.inner.outstanding.subscribe();
        if outstanding.wait_for(|outstanding| *outstanding == 0).await.is_err() {
            // the sender lives as long as `self`
            return Err(ExecutionError::TaskFailed(
                "completion gate was dropped".to_string(),
            ));
        }
        match self.inner.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }
}
