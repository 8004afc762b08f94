//! Functionality for the [`LlamaContext`] struct

use std::path::Path;
use std::slice;

use derive_more::Deref;
use thiserror::Error;
use tracing::{error, info, trace};

use llama_cpp_sys::{
    llama_context, llama_context_default_params, llama_decode, llama_free, llama_get_logits_ith,
    llama_kv_cache_clear, llama_new_context_with_model, llama_set_n_threads,
};

use crate::batch::Batch;
use crate::{
    generate, CancelFlag, Completion, CompletionParams, DecodeContext, LlamaLoadError, LlamaModel,
    LlamaParams, LlamaTokenizationError, Token,
};

mod params;

pub use params::*;

/// The inner part of a [`LlamaContext`].
#[derive(Deref)]
struct LlamaContextInner {
    /// A pointer to the inner context.
    ptr: *mut llama_context,
}

// SAFETY: a context is only ever used through `&mut LlamaContext`, so it never sees two threads
// at once.
unsafe impl Send for LlamaContextInner {}

impl Drop for LlamaContextInner {
    fn drop(&mut self) {
        trace!("Freeing context");

        // SAFETY: `drop`ping more than once is unsound [1], so `self.ptr` cannot have been
        // `free`d yet.
        //
        // [1]: See https://github.com/rust-lang/rust/issues/60977
        unsafe { llama_free(self.ptr) }
    }
}

/// An error raised while advancing a [`LlamaContext`].
#[derive(Error, Debug)]
pub enum LlamaContextError {
    /// More tokens were provided to a single decode than the batch can hold.
    #[error("{provided_tokens} were provided, but the batch only holds {max_tokens}")]
    MaxTokensExceeded {
        /// The number of provided tokens.
        provided_tokens: usize,

        /// The maximum number of tokens.
        max_tokens: usize,
    },

    /// An error occurred on the other side of the FFI boundary; check your logs.
    #[error("advancing context failed (error code {0})")]
    DecodeFailed(i32),

    /// The prompt and its token budget don't fit in the context window, and the context was
    /// created with [`OverflowPolicy::Reject`].
    #[error("{prompt_tokens} prompt tokens plus {max_tokens} output tokens exceed the context of {n_ctx}")]
    PromptTooLong {
        /// The number of prompt tokens.
        prompt_tokens: usize,

        /// The requested output budget.
        max_tokens: usize,

        /// The context window.
        n_ctx: usize,
    },
}

/// A fixed-size decoding context over a [`LlamaModel`].
///
/// A context holds the model's KV state for the tokens decoded so far. It is cleared at the
/// start of every completion, so completions never see each other's tokens.
pub struct LlamaContext {
    /// The llama.cpp context. Declared first so it is freed before `model` is released.
    ctx: LlamaContextInner,

    /// The model this context was created from.
    model: LlamaModel,

    /// Reusable batch of `n_batch` slots.
    batch: Batch,

    n_ctx: u32,
    n_batch: u32,
    n_threads: u32,
    overflow_policy: OverflowPolicy,

    /// Number of tokens currently in the KV state; the position of the next decoded token.
    n_past: usize,

    /// Batch index of the logits produced by the last successful decode.
    logits_index: Option<i32>,
}

impl LlamaContext {
    /// Creates a context for `model`.
    pub fn new(model: &LlamaModel, params: ContextParams) -> Result<Self, LlamaLoadError> {
        let n_ctx = params.resolved_n_ctx();
        let n_batch = params.resolved_n_batch();
        let n_threads = params.resolved_n_threads();

        if n_ctx as usize > model.train_len() {
            info!(
                "Context of {n_ctx} tokens is larger than the {} the model was trained with",
                model.train_len()
            );
        }

        let mut ctx_params = unsafe { llama_context_default_params() };
        ctx_params.n_ctx = n_ctx;
        ctx_params.n_batch = n_batch;
        ctx_params.n_threads = n_threads;
        ctx_params.n_threads_batch = n_threads;

        let ptr = unsafe {
            // SAFETY: the model pointer stays valid for as long as `model` is alive, and the
            // context keeps a clone of it.
            llama_new_context_with_model(model.as_ptr(), ctx_params)
        };

        if ptr.is_null() {
            error!("llama.cpp failed to create a context of {n_ctx} tokens");
            return Err(LlamaLoadError::ContextInit { n_ctx });
        }

        info!(n_ctx, n_batch, n_threads, "Created context");

        Ok(Self {
            ctx: LlamaContextInner { ptr },
            model: model.clone(),
            batch: Batch::new(n_batch as usize),
            n_ctx,
            n_batch,
            n_threads,
            overflow_policy: params.overflow_policy,
            n_past: 0,
            logits_index: None,
        })
    }

    /// Loads the model at `path` with default model parameters, then creates a context for it.
    pub fn load(path: impl AsRef<Path>, params: ContextParams) -> Result<Self, LlamaLoadError> {
        let model = LlamaModel::load_from_file(path, LlamaParams::default())?;
        Self::new(&model, params)
    }

    /// Returns the model this context was created from.
    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    /// Returns the context window, in tokens.
    pub fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    /// Returns the maximum number of tokens decoded in one batch.
    pub fn n_batch(&self) -> u32 {
        self.n_batch
    }

    /// Returns the number of threads decodes currently run on.
    pub fn n_threads(&self) -> u32 {
        self.n_threads
    }

    /// Returns the number of tokens currently held in the context.
    pub fn n_past(&self) -> usize {
        self.n_past
    }

    /// Returns what this context does when a prompt may not fit.
    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow_policy
    }

    /// Removes every token from the context.
    pub fn clear(&mut self) {
        trace!("Clearing {} tokens from the context", self.n_past);

        // SAFETY: `self.ctx` is a valid context.
        unsafe { llama_kv_cache_clear(*self.ctx) };

        self.n_past = 0;
        self.logits_index = None;
    }

    /// Sets the number of threads used by subsequent decodes.
    pub fn set_threads(&mut self, n_threads: u32) {
        if n_threads == self.n_threads {
            return;
        }

        // SAFETY: `self.ctx` is a valid context.
        unsafe { llama_set_n_threads(*self.ctx, n_threads, n_threads) };

        self.n_threads = n_threads;
    }

    /// Appends `tokens` after everything already decoded, requesting logits for the last one.
    ///
    /// At most [`LlamaContext::n_batch`] tokens may be decoded at once; see
    /// [`evaluate_prompt`][crate::evaluate_prompt] for chunking longer inputs.
    pub fn decode(&mut self, tokens: &[Token]) -> Result<(), LlamaContextError> {
        if tokens.is_empty() {
            return Ok(());
        }

        if tokens.len() > self.n_batch as usize {
            return Err(LlamaContextError::MaxTokensExceeded {
                provided_tokens: tokens.len(),
                max_tokens: self.n_batch as usize,
            });
        }

        self.batch.clear();
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            self.batch.add(*token, self.n_past + i, i == last);
        }

        trace!("Starting LLaMA decode for batch of {}", self.batch.len());

        let err = unsafe {
            // SAFETY: `batch` was filled above, and holds no more than `n_batch` tokens.
            llama_decode(*self.ctx, self.batch.handle())
        };

        if err != 0 {
            error!("llama_decode failed with code {err}");
            self.logits_index = None;
            return Err(LlamaContextError::DecodeFailed(err));
        }

        self.n_past += tokens.len();
        self.logits_index = Some(last as i32);

        Ok(())
    }

    /// Returns the logits produced for the last decoded token.
    ///
    /// The slice is empty when nothing has been decoded since the last [`LlamaContext::clear`],
    /// or when the last decode failed.
    pub fn logits(&self) -> &[f32] {
        let Some(index) = self.logits_index else {
            return &[];
        };

        let ptr = unsafe {
            // SAFETY: `index` is the batch slot that requested logits in the last decode.
            llama_get_logits_ith(*self.ctx, index)
        };

        if ptr.is_null() {
            return &[];
        }

        // SAFETY: llama.cpp keeps one row of `n_vocab` logits per requested slot, valid until
        // the next decode, which needs `&mut self`.
        unsafe { slice::from_raw_parts(ptr, self.model.vocabulary_size()) }
    }

    /// Runs a single, independent completion of `prompt` on this context.
    ///
    /// See [`generate`].
    pub fn complete(
        &mut self,
        prompt: &str,
        params: &CompletionParams,
        cancel: &CancelFlag,
    ) -> Result<Completion, LlamaContextError> {
        generate(self, prompt, params, cancel)
    }
}

impl DecodeContext for LlamaContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx as usize
    }

    fn n_batch(&self) -> usize {
        self.n_batch as usize
    }

    fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow_policy
    }

    fn clear(&mut self) {
        LlamaContext::clear(self)
    }

    fn set_threads(&mut self, n_threads: u32) {
        LlamaContext::set_threads(self, n_threads)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, LlamaTokenizationError> {
        self.model.tokenize(text)
    }

    fn decode(&mut self, tokens: &[Token]) -> Result<(), LlamaContextError> {
        LlamaContext::decode(self, tokens)
    }

    fn logits(&self) -> &[f32] {
        LlamaContext::logits(self)
    }

    fn token_to_byte_piece(&self, token: Token) -> Vec<u8> {
        self.model.token_to_byte_piece(token)
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.is_end_of_generation(token)
    }
}
