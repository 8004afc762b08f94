use flume::Receiver;

use crate::{CancelFlag, Completion, LlamaSessionError};

/// A handle to a completion queued on, or running on, a session's worker.
///
/// If this handle is dropped before the completion finishes, the completion is cancelled.
pub struct CompletionHandle {
    /// Where the worker sends the result.
    reply: Receiver<Result<Completion, LlamaSessionError>>,

    /// Shared with the worker, checked between generation steps.
    cancel: CancelFlag,
}

impl CompletionHandle {
    pub(crate) fn new(
        reply: Receiver<Result<Completion, LlamaSessionError>>,
        cancel: CancelFlag,
    ) -> Self {
        Self { reply, cancel }
    }

    /// Asks the worker to stop this completion at the next generation step.
    ///
    /// The completion still resolves, with [`StopReason::Cancelled`][crate::StopReason] and
    /// whatever text was produced so far.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns the flag this completion observes, for cancelling from elsewhere.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Blocks the current thread until the completion finishes.
    pub fn wait(self) -> Result<Completion, LlamaSessionError> {
        self.reply
            .recv()
            .map_err(|_| LlamaSessionError::WorkerStopped)?
    }

    /// Asynchronously waits for the completion to finish.
    pub async fn wait_async(self) -> Result<Completion, LlamaSessionError> {
        self.reply
            .recv_async()
            .await
            .map_err(|_| LlamaSessionError::WorkerStopped)?
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        // Harmless if the completion already finished.
        self.cancel.cancel();
    }
}
