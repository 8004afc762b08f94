//! Implements [`CompletionParams`]

/// `top_p` used when the caller leaves it unset (zero).
pub const DEFAULT_TOP_P: f32 = 0.95;

/// Per-call decoding parameters for a single completion.
///
/// Out-of-range values are not errors; [`CompletionParams::normalized`] maps them onto the
/// nearest meaningful setting.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionParams {
    /// Maximum number of tokens to generate, at least 1
    pub max_tokens: u32,

    /// Sampling temperature. 0.0 = greedy, deterministic decoding
    pub temperature: f32,

    /// Nucleus sampling threshold in `[0, 1]`. 0.0 = [`DEFAULT_TOP_P`]
    pub top_p: f32,

    /// RNG seed, `None` for a fresh, non-reproducible seed on every call
    pub seed: Option<u32>,

    /// Number of threads for this call, `None` or `Some(0)` to detect
    pub n_threads: Option<u32>,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            max_tokens: 128,
            temperature: 0.7,
            top_p: DEFAULT_TOP_P,
            seed: None,
            n_threads: None,
        }
    }
}

impl CompletionParams {
    /// Sets the seed from a signed 32-bit value, where anything negative means "no fixed seed".
    pub fn with_signed_seed(mut self, seed: i32) -> Self {
        self.seed = u32::try_from(seed).ok();
        self
    }

    /// Returns a copy with every field clamped to its usable range.
    ///
    /// * `max_tokens` of 0 becomes 1.
    /// * Negative or NaN `temperature` becomes 0.0.
    /// * `top_p` is clamped to `[0, 1]`; 0.0 and NaN become [`DEFAULT_TOP_P`].
    /// * A thread hint of 0 becomes `None`.
    pub fn normalized(&self) -> Self {
        let temperature = if self.temperature > 0.0 {
            self.temperature
        } else {
            0.0
        };

        let top_p = if self.top_p.is_nan() {
            DEFAULT_TOP_P
        } else {
            match self.top_p.clamp(0.0, 1.0) {
                p if p == 0.0 => DEFAULT_TOP_P,
                p => p,
            }
        };

        Self {
            max_tokens: self.max_tokens.max(1),
            temperature,
            top_p,
            seed: self.seed,
            n_threads: self.n_threads.filter(|&n| n > 0),
        }
    }

    /// Returns `true` if these parameters select the greedy sampler.
    pub fn is_greedy(&self) -> bool {
        self.normalized().temperature == 0.0
    }
}
