//! Functionality for the [`LlamaSession`] struct

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use flume::Sender;
use thiserror::Error;
use tracing::{trace, warn};

use crate::{
    CancelFlag, Completion, CompletionParams, ContextParams, LlamaContextError, LlamaLoadError,
    ModelCache, ModelSource,
};

mod completion;
mod worker;

pub use completion::CompletionHandle;
use worker::{Command, Worker};

/// An error raised by a [`LlamaSession`].
#[derive(Error, Debug)]
pub enum LlamaSessionError {
    /// No model is loaded; call [`LlamaSession::load`] first.
    #[error("no model is loaded")]
    NotLoaded,

    /// Loading the model or creating its context failed.
    #[error("load failed: {0}")]
    Load(#[from] LlamaLoadError),

    /// The completion was refused by the context.
    #[error("completion failed: {0}")]
    Context(#[from] LlamaContextError),

    /// The worker thread is gone.
    #[error("the session worker has stopped")]
    WorkerStopped,

    /// The worker thread could not be started.
    #[error("failed to spawn the session worker: {0}")]
    Spawn(#[source] io::Error),
}

/// What a [`LlamaSession`] is currently able to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// No model is loaded.
    Unloaded,

    /// A model is being loaded.
    Loading,

    /// A model is loaded and completions can be served.
    Ready {
        /// The file the model was loaded from.
        model_path: PathBuf,

        /// The context window, in tokens.
        n_ctx: u32,
    },

    /// The last load failed and nothing is loaded. Carries a user-facing description.
    Failed(String),
}

impl SessionStatus {
    /// Returns `true` if completions can be served.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// The entry point for completions: one model, one context, one worker thread.
///
/// Every operation is queued to the session's worker and runs there in order, so two
/// completions never touch the context at the same time. The session is `Send + Sync`; share it
/// behind an `Arc` to submit work from several threads.
pub struct LlamaSession {
    /// Queue of the worker thread. Dropping it stops the worker.
    commands: Option<Sender<Command>>,

    /// Updated by the worker as loads and releases happen.
    status: Arc<RwLock<SessionStatus>>,

    /// Used to materialise [`ModelSource::Asset`] models.
    cache: Option<ModelCache>,

    worker: Option<JoinHandle<()>>,
}

impl LlamaSession {
    /// Starts a session with no model loaded.
    ///
    /// Assets are cached in [`ModelCache::default_location`], when the platform has one.
    pub fn new() -> Result<Self, LlamaSessionError> {
        let (commands, queue) = flume::unbounded();
        let status = Arc::new(RwLock::new(SessionStatus::Unloaded));

        let worker = Worker::new(status.clone());
        let handle = thread::Builder::new()
            .name("llama-session".into())
            .spawn(move || worker.run(queue))
            .map_err(LlamaSessionError::Spawn)?;

        let cache = match ModelCache::default_location() {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!("Asset models will not be available: {e}");
                None
            }
        };

        Ok(Self {
            commands: Some(commands),
            status,
            cache,
            worker: Some(handle),
        })
    }

    /// Uses `cache` to materialise asset models.
    pub fn with_cache(mut self, cache: ModelCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Returns what the session can currently do.
    pub fn status(&self) -> SessionStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn send(&self, command: Command) -> Result<(), LlamaSessionError> {
        self.commands
            .as_ref()
            .ok_or(LlamaSessionError::WorkerStopped)?
            .send(command)
            .map_err(|_| LlamaSessionError::WorkerStopped)
    }

    fn queue_load(
        &self,
        source: ModelSource,
        params: ContextParams,
    ) -> Result<flume::Receiver<Result<(), LlamaLoadError>>, LlamaSessionError> {
        let (reply, result) = flume::bounded(1);

        self.send(Command::Load {
            source,
            params,
            cache: self.cache.clone(),
            reply,
        })?;

        Ok(result)
    }

    /// Loads a model and creates its context, replacing the current one on success.
    ///
    /// If loading fails, the previously loaded model, if any, keeps serving completions.
    pub fn load(&self, source: ModelSource, params: ContextParams) -> Result<(), LlamaSessionError> {
        self.queue_load(source, params)?
            .recv()
            .map_err(|_| LlamaSessionError::WorkerStopped)??;

        Ok(())
    }

    /// Asynchronously loads a model; see [`LlamaSession::load`].
    pub async fn load_async(
        &self,
        source: ModelSource,
        params: ContextParams,
    ) -> Result<(), LlamaSessionError> {
        self.queue_load(source, params)?
            .recv_async()
            .await
            .map_err(|_| LlamaSessionError::WorkerStopped)??;

        Ok(())
    }

    /// Queues a completion of `prompt`, returning a handle to wait on or cancel it.
    pub fn start_completion(
        &self,
        prompt: impl Into<String>,
        params: CompletionParams,
    ) -> Result<CompletionHandle, LlamaSessionError> {
        let (reply, result) = flume::bounded(1);
        let cancel = CancelFlag::new();

        self.send(Command::Complete {
            prompt: prompt.into(),
            params,
            cancel: cancel.clone(),
            reply,
        })?;

        Ok(CompletionHandle::new(result, cancel))
    }

    /// Completes `prompt`, blocking until the completion finishes.
    ///
    /// Queues behind any load or completion already submitted to this session.
    pub fn complete(
        &self,
        prompt: impl Into<String>,
        params: CompletionParams,
    ) -> Result<Completion, LlamaSessionError> {
        self.start_completion(prompt, params)?.wait()
    }

    /// Asynchronously completes `prompt`; see [`LlamaSession::complete`].
    pub async fn complete_async(
        &self,
        prompt: impl Into<String>,
        params: CompletionParams,
    ) -> Result<Completion, LlamaSessionError> {
        self.start_completion(prompt, params)?.wait_async().await
    }

    fn queue_release(&self) -> Option<flume::Receiver<()>> {
        let (reply, done) = flume::bounded(1);
        self.send(Command::Release { reply }).ok().map(|_| done)
    }

    /// Frees the loaded model and its context, if any. Calling this again is a no-op.
    pub fn release(&self) {
        if let Some(done) = self.queue_release() {
            let _ = done.recv();
        }
    }

    /// Asynchronously frees the loaded model; see [`LlamaSession::release`].
    pub async fn release_async(&self) {
        if let Some(done) = self.queue_release() {
            let _ = done.recv_async().await;
        }
    }
}

impl Drop for LlamaSession {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish what's queued, then exit.
        self.commands = None;

        if let Some(worker) = self.worker.take() {
            trace!("Waiting for the session worker to stop");

            if worker.join().is_err() {
                warn!("The session worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::{AssetError, DirectoryAssets, StopReason};

    fn session() -> LlamaSession {
        LlamaSession::new().unwrap()
    }

    #[test]
    fn starts_unloaded() {
        let session = session();

        assert_eq!(session.status(), SessionStatus::Unloaded);
        assert!(!session.status().is_ready());
    }

    #[test]
    fn complete_needs_a_model() {
        let session = session();

        let err = session
            .complete("What is the capital of Kenya?", CompletionParams::default())
            .unwrap_err();

        assert!(matches!(err, LlamaSessionError::NotLoaded));
    }

    #[test]
    fn missing_model_fails_to_load() {
        let session = session();

        let err = session
            .load(
                ModelSource::path("/definitely/not/here.gguf"),
                ContextParams::with_n_ctx(256),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            LlamaSessionError::Load(LlamaLoadError::DoesNotExist(_))
        ));
        assert!(matches!(session.status(), SessionStatus::Failed(_)));

        // Releasing after a failed load, twice, is a no-op.
        session.release();
        session.release();
        assert_eq!(session.status(), SessionStatus::Unloaded);
    }

    #[test]
    fn missing_asset_fails_to_load() {
        let assets = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let session = session().with_cache(ModelCache::new(cache.path()));
        let store = Arc::new(DirectoryAssets::new(assets.path()));

        let err = session
            .load(ModelSource::asset(store, "m.gguf"), ContextParams::default())
            .unwrap_err();

        assert!(matches!(
            err,
            LlamaSessionError::Load(LlamaLoadError::Asset(AssetError::NotFound(_)))
        ));
    }

    #[test]
    fn handle_cancels_on_drop() {
        let session = session();
        let handle = session
            .start_completion("prompt", CompletionParams::default())
            .unwrap();
        let flag = handle.cancel_flag();

        assert!(!flag.is_cancelled());
        drop(handle);
        assert!(flag.is_cancelled());
    }

    #[test]
    fn completion_reasons_are_distinct() {
        assert_ne!(
            Completion::empty(StopReason::Cancelled),
            Completion::empty(StopReason::EmptyPrompt)
        );
    }

    #[tokio::test]
    async fn invalid_container_fails_async() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a model at all").unwrap();

        let session = session();
        let err = session
            .load_async(ModelSource::path(file.path()), ContextParams::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LlamaSessionError::Load(LlamaLoadError::InvalidContainer(_))
        ));

        let err = session
            .complete_async("prompt", CompletionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlamaSessionError::NotLoaded));

        session.release_async().await;
        session.release_async().await;
    }

    #[test]
    fn shared_between_threads() {
        let session = Arc::new(session());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.complete("prompt", CompletionParams::default()))
            })
            .collect();

        for handle in handles {
            assert!(matches!(
                handle.join().unwrap(),
                Err(LlamaSessionError::NotLoaded)
            ));
        }
    }
}
