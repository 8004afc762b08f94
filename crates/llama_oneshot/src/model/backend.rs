//! Implements the process-wide [llama.cpp][llama.cpp] backend and [`BackendRef`].
//!
//! [llama.cpp]: https://github.com/ggerganov/llama.cpp/

use std::ptr;
use std::sync::OnceLock;

use tracing::debug;

use llama_cpp_sys::{llama_backend_init, llama_log_set};

use crate::detail;

/// The process-wide backend. Initialised on first use, never torn down.
static BACKEND: OnceLock<Backend> = OnceLock::new();

/// Number of times [`Backend::init`] has run.
#[cfg(test)]
static INIT_CALLS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

/// Marker for an initialised llama.cpp backend.
struct Backend {}

impl Backend {
    /// Initialises the [llama.cpp][llama.cpp] backend and sets its logger.
    ///
    /// Only ever called from inside [`BACKEND`]'s `get_or_init`.
    ///
    /// [llama.cpp]: https://github.com/ggerganov/llama.cpp/
    fn init() -> Self {
        debug!("Initialising llama.cpp backend");

        #[cfg(test)]
        INIT_CALLS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        unsafe {
            // SAFETY: `OnceLock` runs this exactly once, before any model exists.
            llama_backend_init();

            // SAFETY: performs a simple assignment to static variables. Runs once, before any
            // logs are made.
            llama_log_set(Some(detail::llama_log_callback), ptr::null_mut());
        }

        Self {}
    }
}

/// Proof that the backend has been initialised.
///
/// Every [`LlamaModel`][crate::LlamaModel] holds one, so no native call can happen before
/// [`llama_backend_init`] has run. Concurrent callers block on the same one-time initialisation.
#[derive(Clone, Copy)]
pub(crate) struct BackendRef {
    _backend: &'static Backend,
}

impl BackendRef {
    /// Returns a reference to the backend, initialising it if this is the first call.
    pub(crate) fn get() -> Self {
        Self {
            _backend: BACKEND.get_or_init(Backend::init),
        }
    }
}
