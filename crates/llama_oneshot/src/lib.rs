//! Single-turn text completion on top of [llama.cpp][llama.cpp], built for on-device use:
//! one quantized model, one bounded context window, one completion at a time, and no state
//! carried from one completion into the next.
//!
//! Most callers only need a [`LlamaSession`], which owns a dedicated worker thread and the
//! loaded model:
//!
//! ```no_run
//! use llama_oneshot::{CompletionParams, ContextParams, LlamaSession, ModelSource};
//!
//! let session = LlamaSession::new().expect("Could not start the session worker");
//!
//! // Loads the model and allocates a 2048 token context on the session's worker.
//! session
//!     .load(ModelSource::path("model.gguf"), ContextParams::default())
//!     .expect("Could not load model");
//!
//! let params = CompletionParams {
//!     max_tokens: 32,
//!     temperature: 0.0,
//!     ..CompletionParams::default()
//! };
//!
//! let completion = session
//!     .complete("What is the capital of Kenya?", params)
//!     .unwrap();
//!
//! println!("{} ({:?})", completion.text, completion.stop_reason);
//! ```
//!
//! Every call to [`LlamaSession::complete`] starts by clearing the context's KV state, feeds
//! the prompt through the model in `n_batch`-sized chunks, then samples up to
//! [`CompletionParams::max_tokens`] tokens with a [`SamplerChain`] built fresh for that call.
//!
//! The lower layers are public as well: [`LlamaModel`] and [`LlamaContext`] wrap the native
//! handles, and [`generate`] runs the decode loop against anything implementing
//! [`DecodeContext`].
//!
//! ## Logging
//!
//! llama.cpp's own logs are re-routed through [`tracing`][tracing] under the `llama.cpp`
//! target instead of `stderr`. Load failures in particular are explained there.
//!
//! ## License
//!
//! MIT or Apache 2.0 (the "Rust" license), at your option.
//!
//! [tracing]: https://docs.rs/tracing/latest/tracing/
//! [llama.cpp]: https://github.com/ggerganov/llama.cpp/

#![warn(missing_docs)]

use thiserror::Error;

mod batch;
mod context;
mod detail;
mod generation;
mod model;
mod sampler;
mod session;
mod store;

pub use context::*;
pub use generation::*;
pub use model::*;
pub use sampler::*;
pub use session::*;
pub use store::*;

/// A single token produced or consumed by a [`LlamaModel`].
///
/// On its own this is just an index into the model's vocabulary; use
/// [`LlamaModel::token_to_byte_piece`] to see what it stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Token(pub i32);

/// An error that occurred on the other side of the C FFI boundary.
///
/// GGML and llama.cpp typically log useful information before failing, which is forwarded to this
/// crate's [`tracing`] handler.
///
/// [tracing]: https://docs.rs/tracing/latest/tracing/
#[derive(Error, Debug)]
#[error("an internal assertion failed in llama.cpp; check `tracing` output.")]
pub struct LlamaInternalError;
