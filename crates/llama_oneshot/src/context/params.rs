//! Implements [`ContextParams`], which configures a [`crate::LlamaContext`]

use std::cmp::{max, min};

/// Context size used when none is requested.
pub const DEFAULT_N_CTX: u32 = 2048;

/// Upper bound on the prompt processing batch size.
pub const MAX_N_BATCH: u32 = 512;

/// What to do when a prompt plus its token budget may not fit in the context window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Log a warning and generate anyway.
    #[default]
    Warn,

    /// Refuse the completion with [`LlamaContextError::PromptTooLong`][crate::LlamaContextError].
    Reject,
}

/// Context-specific parameters.
#[derive(Clone, Debug, Default)]
pub struct ContextParams {
    /// Context window in tokens, prompt and generated output combined. 0 = [`DEFAULT_N_CTX`]
    pub n_ctx: u32,

    /// Prompt processing batch size. 0 = `min(512, n_ctx)`; never larger than `n_ctx`
    pub n_batch: u32,

    /// Number of threads used for decoding, `None` or `Some(0)` to detect
    pub n_threads: Option<u32>,

    /// Behaviour when the prompt may overflow the context window
    pub overflow_policy: OverflowPolicy,
}

impl ContextParams {
    /// Creates parameters for a context of `n_ctx` tokens, everything else defaulted.
    pub fn with_n_ctx(n_ctx: u32) -> Self {
        Self {
            n_ctx,
            ..Self::default()
        }
    }

    /// The context size that will actually be allocated.
    pub fn resolved_n_ctx(&self) -> u32 {
        if self.n_ctx == 0 {
            DEFAULT_N_CTX
        } else {
            self.n_ctx
        }
    }

    /// The batch size that will actually be used; always `1..=n_ctx`.
    pub fn resolved_n_batch(&self) -> u32 {
        let n_ctx = self.resolved_n_ctx();

        if self.n_batch == 0 {
            min(MAX_N_BATCH, n_ctx)
        } else {
            min(self.n_batch, n_ctx)
        }
    }

    /// The thread count that will actually be used.
    pub fn resolved_n_threads(&self) -> u32 {
        resolve_threads(self.n_threads)
    }
}

/// The thread count used when the caller leaves it up to us: every core, but never fewer
/// than two.
pub fn default_thread_count() -> u32 {
    max(2, num_cpus::get() as u32)
}

/// Resolves a thread-count hint, with `None` and `Some(0)` meaning "detect".
pub(crate) fn resolve_threads(hint: Option<u32>) -> u32 {
    match hint {
        Some(n) if n > 0 => n,
        _ => default_thread_count(),
    }
}
