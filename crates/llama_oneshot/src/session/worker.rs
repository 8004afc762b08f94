//! The thread that owns a session's [`LlamaContext`].

use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use flume::{Receiver, Sender};
use tracing::{error, info, trace, warn};

use crate::{
    CancelFlag, Completion, CompletionParams, ContextParams, LlamaContext, LlamaLoadError,
    LlamaSessionError, ModelCache, ModelSource, SessionStatus, StopReason,
};

/// A request for the worker, with the channel its answer goes to.
pub(crate) enum Command {
    Load {
        source: ModelSource,
        params: ContextParams,
        cache: Option<ModelCache>,
        reply: Sender<Result<(), LlamaLoadError>>,
    },
    Complete {
        prompt: String,
        params: CompletionParams,
        cancel: CancelFlag,
        reply: Sender<Result<Completion, LlamaSessionError>>,
    },
    Release {
        reply: Sender<()>,
    },
}

pub(crate) struct Worker {
    context: Option<LlamaContext>,
    status: Arc<RwLock<SessionStatus>>,
}

impl Worker {
    pub(crate) fn new(status: Arc<RwLock<SessionStatus>>) -> Self {
        Self {
            context: None,
            status,
        }
    }

    /// Serves commands, one at a time, until every sender is gone.
    pub(crate) fn run(mut self, commands: Receiver<Command>) {
        trace!("Session worker started");

        while let Ok(command) = commands.recv() {
            match command {
                Command::Load {
                    source,
                    params,
                    cache,
                    reply,
                } => {
                    let result = self.load(&source, params, cache.as_ref());
                    let _ = reply.send(result);
                }
                Command::Complete {
                    prompt,
                    params,
                    cancel,
                    reply,
                } => {
                    let result = self.complete(&prompt, &params, &cancel);
                    let _ = reply.send(result);
                }
                Command::Release { reply } => {
                    self.release();
                    let _ = reply.send(());
                }
            }
        }

        trace!("Session worker stopped");
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn ready_status(&self) -> SessionStatus {
        match &self.context {
            Some(ctx) => SessionStatus::Ready {
                model_path: ctx.model().path().to_path_buf(),
                n_ctx: ctx.n_ctx(),
            },
            None => SessionStatus::Unloaded,
        }
    }

    /// Builds the new context before touching the old one, so a failed load leaves the previous
    /// context serving.
    fn load(
        &mut self,
        source: &ModelSource,
        params: ContextParams,
        cache: Option<&ModelCache>,
    ) -> Result<(), LlamaLoadError> {
        self.set_status(SessionStatus::Loading);

        let result = source
            .resolve(cache)
            .map_err(LlamaLoadError::from)
            .and_then(|path| LlamaContext::load(path, params));

        match result {
            Ok(ctx) => {
                // The old context, if any, is freed here.
                self.context = Some(ctx);
                self.set_status(self.ready_status());
                Ok(())
            }
            Err(e) => {
                error!("Failed to load {source:?}: {e}");

                if self.context.is_some() {
                    warn!("Keeping the previously loaded model");
                    self.set_status(self.ready_status());
                } else {
                    self.set_status(SessionStatus::Failed(e.to_string()));
                }

                Err(e)
            }
        }
    }

    fn complete(
        &mut self,
        prompt: &str,
        params: &CompletionParams,
        cancel: &CancelFlag,
    ) -> Result<Completion, LlamaSessionError> {
        let ctx = self.context.as_mut().ok_or(LlamaSessionError::NotLoaded)?;

        if cancel.is_cancelled() {
            trace!("Skipping a completion cancelled while queued");
            return Ok(Completion::empty(StopReason::Cancelled));
        }

        Ok(ctx.complete(prompt, params, cancel)?)
    }

    fn release(&mut self) {
        if self.context.take().is_some() {
            info!("Released model");
        }

        self.set_status(SessionStatus::Unloaded);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if thread::panicking() {
            self.context = None;
            self.set_status(SessionStatus::Failed(
                "the session worker stopped unexpectedly".to_owned(),
            ));
        }
    }
}
