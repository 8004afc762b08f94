//! Implements the [`LlamaModel`] struct

use std::ffi::{c_char, CString};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use derive_more::Deref;
use thiserror::Error;
use tracing::{error, info, trace};

use backend::BackendRef;
use llama_cpp_sys::{
    llama_free_model, llama_load_model_from_file, llama_model, llama_n_ctx_train, llama_n_vocab,
    llama_token, llama_token_bos, llama_token_eos, llama_token_to_piece, llama_tokenize,
};
pub use params::*;

use crate::{AssetError, ContextParams, LlamaContext, LlamaInternalError, Token};

mod backend;
mod params;

/// The magic bytes every GGUF container starts with.
const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// An error raised while loading a model or creating its context.
#[derive(Error, Debug)]
pub enum LlamaLoadError {
    /// The given path couldn't be loaded because it doesn't exist on the filesystem.
    #[error("Path does not exist: {0}")]
    DoesNotExist(PathBuf),

    /// The file exists, but couldn't be opened or read.
    #[error("Could not read {path}: {source}")]
    Unreadable {
        /// The model file.
        path: PathBuf,

        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The file isn't a GGUF container.
    #[error("{0} is not a GGUF model file")]
    InvalidContainer(PathBuf),

    /// Something went wrong on the other side of the C FFI boundary.
    #[error("Llama.cpp couldn't load the provided model: {0}")]
    LlamaError(#[from] LlamaInternalError),

    /// The model loaded, but llama.cpp couldn't allocate a context for it.
    #[error("Failed to create a context of {n_ctx} tokens")]
    ContextInit {
        /// The requested context size.
        n_ctx: u32,
    },

    /// The model file couldn't be materialised from its asset store.
    #[error("Could not resolve the model file: {0}")]
    Asset(#[from] AssetError),

    /// The blocking load task was cancelled before it finished.
    #[error("Model loading was cancelled")]
    Cancelled,
}

/// An error raised while tokenizing some input for a model.
#[derive(Error, Debug)]
pub enum LlamaTokenizationError {
    /// Nothing was provided to tokenize.
    #[error("Input was empty")]
    EmptyInput,

    /// The input was non-empty, but produced no tokens.
    #[error("Input produced no tokens")]
    NoTokens,

    /// llama.cpp only supports vectors of length up to `i32::MAX`.
    #[error("Input was too large: {n_bytes} were provided, but llama.cpp only supports up to {max_bytes}")]
    InputTooLarge {
        /// The number of bytes that were being tokenized.
        n_bytes: usize,

        /// The maximum number of bytes that _can_ be tokenized.
        max_bytes: usize,
    },

    /// Something went wrong on the other side of the C FFI boundary.
    #[error("Tokenization failed: {0}")]
    LlamaError(#[from] LlamaInternalError),
}

/// The inner part of a [`LlamaModel`].
///
/// This is a thin wrapper over a `*mut llama_model`, shared across threads through an `Arc`.
#[derive(Deref)]
struct LlamaModelInner {
    #[deref]
    model: *mut llama_model,
    _backend_ref: BackendRef,
}

// SAFETY: the model is never mutated after `llama_load_model_from_file` returns; llama.cpp only
// reads weights and vocabulary through it.
unsafe impl Send for LlamaModelInner {}

unsafe impl Sync for LlamaModelInner {}

impl Drop for LlamaModelInner {
    fn drop(&mut self) {
        trace!("Freeing model");

        unsafe {
            // SAFETY: `drop`ping more than once is unsound [1], so `self.model` cannot have been
            // `free`d yet.
            //
            // [1]: See https://github.com/rust-lang/rust/issues/60977
            llama_free_model(self.model);
        }
    }
}

/// A loaded [llama.cpp](https://github.com/ggerganov/llama.cpp/tree/master) model and its
/// vocabulary.
///
/// Cloning is cheap and shares the same weights. The weights are freed when the last clone,
/// including the one held by every [`LlamaContext`] created from it, is dropped.
#[derive(Clone)]
pub struct LlamaModel {
    /// A handle to the inner model on the other side of the C FFI boundary.
    model: Arc<LlamaModelInner>,

    /// The file this model was loaded from.
    path: PathBuf,

    /// The size of this model's vocabulary, in tokens.
    vocabulary_size: usize,

    /// The beginning of sentence (BOS) token for this model.
    bos_token: Token,

    /// The end of sentence (EOS) token for this model.
    eos_token: Token,

    /// The number of tokens in the context the model was trained with.
    training_size: usize,
}

impl LlamaModel {
    /// Loads a model from a compatible GGUF (`.gguf`) file.
    ///
    /// Missing, unreadable, and non-GGUF files are rejected before llama.cpp ever sees them. If the
    /// model still fails to load on the other side of the C FFI boundary, llama.cpp will log an
    /// error to this crate's `tracing` handler.
    pub fn load_from_file(
        file_path: impl AsRef<Path>,
        model_params: LlamaParams,
    ) -> Result<Self, LlamaLoadError> {
        let file_path = file_path.as_ref();
        info!("Loading model \"{}\"", file_path.to_string_lossy());

        check_container(file_path)?;

        let backend_ref = BackendRef::get();

        let c_path = CString::new(file_path.to_string_lossy().into_owned().into_bytes())
            .map_err(|_| LlamaLoadError::DoesNotExist(file_path.into()))?;

        let model = unsafe {
            // SAFETY: Assume that llama.cpp will gracefully fail and return `nullptr` if
            // `llama_load_model_from_file` fails.
            //
            // This is, unfortunately, the best we can do here.
            llama_load_model_from_file(c_path.as_ptr(), model_params.into())
        };

        if model.is_null() {
            error!("llama.cpp failed to load \"{}\"", file_path.to_string_lossy());
            return Err(LlamaInternalError.into());
        }

        let inner = LlamaModelInner {
            model,
            _backend_ref: backend_ref,
        };

        // SAFETY: `model` is not null for all of the getters below.
        let vocabulary_size = unsafe { llama_n_vocab(model) } as usize;
        let training_size = unsafe { llama_n_ctx_train(model) } as usize;
        let bos_token = Token(unsafe { llama_token_bos(model) });
        let eos_token = Token(unsafe { llama_token_eos(model) });

        info!(
            vocabulary_size,
            training_size, "Model \"{}\" loaded", file_path.to_string_lossy()
        );

        Ok(Self {
            model: Arc::new(inner),
            path: file_path.to_path_buf(),
            vocabulary_size,
            bos_token,
            eos_token,
            training_size,
        })
    }

    /// Loads a model from a compatible GGUF (`.gguf`) file asynchronously.
    ///
    /// This is a thin `tokio` wrapper over [`LlamaModel::load_from_file`].
    pub async fn load_from_file_async(
        file_path: impl AsRef<Path>,
        params: LlamaParams,
    ) -> Result<Self, LlamaLoadError> {
        let path = file_path.as_ref().to_owned();

        match tokio::task::spawn_blocking(move || Self::load_from_file(path, params)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(LlamaLoadError::Cancelled),
        }
    }

    /// Creates a new decoding context for this model.
    ///
    /// This is equivalent to [`LlamaContext::new`].
    pub fn create_context(&self, params: ContextParams) -> Result<LlamaContext, LlamaLoadError> {
        LlamaContext::new(self, params)
    }

    /// Converts `text` into tokens, with a leading BOS token and special tokens parsed.
    pub fn tokenize(&self, text: &str) -> Result<Vec<Token>, LlamaTokenizationError> {
        self.tokenize_bytes(text, true, true)
    }

    /// Converts `content` into a vector of tokens that are valid input for this model.
    ///
    /// Runs llama.cpp's tokenizer twice: once to learn how many tokens `content` needs, then
    /// again into a buffer of exactly that size.
    ///
    /// # Parameters
    ///
    /// * `content` - The data slice to be tokenized.
    /// * `add_bos` - Prepend the beginning of sentence token.
    /// * `special` - Parse special tokens. If false, special tokens are parsed as if they were plain text.
    pub fn tokenize_bytes(
        &self,
        content: impl AsRef<[u8]>,
        add_bos: bool,
        special: bool,
    ) -> Result<Vec<Token>, LlamaTokenizationError> {
        let content = content.as_ref();

        if content.is_empty() {
            return Err(LlamaTokenizationError::EmptyInput);
        }

        if content.len() > i32::MAX as usize {
            return Err(LlamaTokenizationError::InputTooLarge {
                n_bytes: content.len(),
                max_bytes: i32::MAX as usize,
            });
        }

        let required = unsafe {
            // SAFETY: with `n_tokens_max == 0` llama.cpp writes nothing and returns the negated
            // number of tokens it would have produced.
            llama_tokenize(
                **self.model,
                content.as_ptr() as *const c_char,
                content.len() as i32,
                ptr::null_mut(),
                0,
                add_bos,
                special,
            )
        };

        let n_tokens = required.unsigned_abs() as usize;
        if n_tokens == 0 {
            return Err(LlamaTokenizationError::NoTokens);
        }

        let mut out_buf: Vec<Token> = Vec::with_capacity(n_tokens);

        let n_written_tokens = unsafe {
            // SAFETY: `out_buf` has room for `n_tokens` tokens, and `Token` is
            // `#[repr(transparent)]` over a `llama_token`.
            llama_tokenize(
                **self.model,
                content.as_ptr() as *const c_char,
                content.len() as i32,
                out_buf.as_mut_ptr() as *mut llama_token,
                n_tokens as i32,
                add_bos,
                special,
            )
        };

        if n_written_tokens < 0 || n_written_tokens as usize > n_tokens {
            return Err(LlamaInternalError.into());
        }

        unsafe {
            // SAFETY: tokenization succeeded, and the value is the number of tokens present in
            // `out_buf`.
            out_buf.set_len(n_written_tokens as usize);
        }

        trace!("Tokenized {} bytes into {} tokens", content.len(), out_buf.len());

        Ok(out_buf)
    }

    /// Converts the provided token into its byte piece, using the model's vocabulary.
    ///
    /// Control tokens render as empty pieces, and a multi-byte UTF-8 character may be split across
    /// several pieces; accumulate them with a [`TokenDecoder`][crate::TokenDecoder].
    pub fn token_to_byte_piece(&self, token: Token) -> Vec<u8> {
        let initial_size = 8u16;
        let mut buffer = vec![0u8; usize::from(initial_size)];

        let size = unsafe {
            // SAFETY: Casting `*mut u8` to `*mut i8` is safe because `u8` and
            // `i8` have the same size and alignment.
            llama_token_to_piece(
                **self.model,
                token.0,
                buffer.as_mut_ptr() as *mut c_char,
                std::os::raw::c_int::from(initial_size),
            )
        };

        if size >= 0 {
            buffer.truncate(size as usize);
            return buffer;
        }

        // The piece didn't fit; `size` is the negated length it needs.
        buffer.resize(size.unsigned_abs() as usize, 0);
        let size = unsafe {
            // SAFETY: as above; the length of `buffer` is accurate.
            llama_token_to_piece(
                **self.model,
                token.0,
                buffer.as_mut_ptr() as *mut c_char,
                buffer.len() as std::os::raw::c_int,
            )
        };

        buffer.truncate(size.max(0) as usize);
        buffer
    }

    /// Converts the provided token into a [`String`] piece, replacing invalid UTF-8.
    pub fn token_to_piece(&self, token: Token) -> String {
        String::from_utf8_lossy(&self.token_to_byte_piece(token)).into_owned()
    }

    /// Returns `true` if `token` ends generation for this model.
    ///
    /// Only EOS counts. The bundled llama.cpp reports a fixed codellama infill id as its EOT
    /// token, which is an ordinary token in larger vocabularies.
    pub fn is_end_of_generation(&self, token: Token) -> bool {
        token == self.eos_token
    }

    /// Returns the file this model was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the beginning of sentence (BOS) token for this model.
    pub fn bos(&self) -> Token {
        self.bos_token
    }

    /// Returns the end of sentence (EOS) token for this model.
    pub fn eos(&self) -> Token {
        self.eos_token
    }

    /// Returns the number of possible values a [`Token`] can have for this model.
    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary_size
    }

    /// Returns the number of tokens in the context the model was trained with.
    pub fn train_len(&self) -> usize {
        self.training_size
    }

    /// Returns the raw model pointer, for use by contexts created from this model.
    pub(crate) fn as_ptr(&self) -> *mut llama_model {
        **self.model
    }
}

/// Checks that `path` exists, is readable, and starts with the GGUF magic.
fn check_container(path: &Path) -> Result<(), LlamaLoadError> {
    if !path.exists() {
        return Err(LlamaLoadError::DoesNotExist(path.into()));
    }

    let unreadable = |source| LlamaLoadError::Unreadable {
        path: path.into(),
        source,
    };

    let mut magic = [0u8; 4];
    let mut file = File::open(path).map_err(unreadable)?;

    match file.read_exact(&mut magic) {
        Ok(()) if &magic == GGUF_MAGIC => Ok(()),
        Ok(()) => Err(LlamaLoadError::InvalidContainer(path.into())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(LlamaLoadError::InvalidContainer(path.into()))
        }
        Err(e) => Err(unreadable(e)),
    }
}
