//! Implements [`LlamaParams`]

use llama_cpp_sys::{llama_model_default_params, llama_model_params};

/// Parameters for loading a model.
///
/// Everything runs on the CPU; no layers are ever offloaded to a GPU.
#[derive(Clone, Debug)]
pub struct LlamaParams {
    /// Only load the vocabulary, no weights
    pub vocab_only: bool,

    /// Use mmap if possible
    pub use_mmap: bool,

    /// Force system to keep model in RAM
    pub use_mlock: bool,
}

impl Default for LlamaParams {
    fn default() -> Self {
        // SAFETY: Stack constructor, always safe
        let c_params = unsafe { llama_model_default_params() };

        Self {
            vocab_only: c_params.vocab_only,
            use_mmap: c_params.use_mmap,
            use_mlock: c_params.use_mlock,
        }
    }
}

impl From<LlamaParams> for llama_model_params {
    fn from(value: LlamaParams) -> Self {
        // SAFETY: Stack constructor, always safe
        let mut c_params = unsafe { llama_model_default_params() };

        c_params.n_gpu_layers = 0;
        c_params.vocab_only = value.vocab_only;
        c_params.use_mmap = value.use_mmap;
        c_params.use_mlock = value.use_mlock;

        c_params
    }
}
