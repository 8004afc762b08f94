//! The single-turn generation loop: prompt evaluation, then sample/feed until done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, trace, warn};

use crate::context::resolve_threads;
use crate::{LlamaContextError, LlamaTokenizationError, OverflowPolicy, SamplerChain, Token};

mod params;
mod token_decoder;

pub use params::*;
pub use token_decoder::TokenDecoder;

/// Tokens of headroom required beyond the prompt and the token budget before an overflow
/// warning is raised.
pub const CONTEXT_SAFETY_MARGIN: usize = 8;

/// A decoding context the generation loop can drive.
///
/// [`LlamaContext`][crate::LlamaContext] is the real implementation; the trait exists so the
/// loop can run against anything that produces logits.
pub trait DecodeContext {
    /// Context window in tokens.
    fn n_ctx(&self) -> usize;

    /// Largest number of tokens a single [`DecodeContext::decode`] call accepts.
    fn n_batch(&self) -> usize;

    /// What to do when a prompt may not fit.
    fn overflow_policy(&self) -> OverflowPolicy {
        OverflowPolicy::Warn
    }

    /// Forgets every token decoded so far; the next decode starts at position 0.
    fn clear(&mut self);

    /// Sets the number of threads used by subsequent decodes.
    fn set_threads(&mut self, n_threads: u32);

    /// Tokenizes a prompt, with BOS and special tokens.
    fn tokenize(&self, text: &str) -> Result<Vec<Token>, LlamaTokenizationError>;

    /// Appends at most [`DecodeContext::n_batch`] tokens to the context, producing logits for the
    /// last one.
    fn decode(&mut self, tokens: &[Token]) -> Result<(), LlamaContextError>;

    /// Logits for the last decoded token, or an empty slice if there are none.
    fn logits(&self) -> &[f32];

    /// The byte piece `token` stands for.
    fn token_to_byte_piece(&self, token: Token) -> Vec<u8>;

    /// Returns `true` if `token` ends generation.
    fn is_end_of_generation(&self, token: Token) -> bool;
}

/// Why a completion stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced an end-of-generation token.
    EndOfGeneration,

    /// `max_tokens` tokens were generated.
    TokenBudget,

    /// Feeding a generated token back into the context failed; the text so far is kept.
    DecodeFailed,

    /// The caller cancelled the completion.
    Cancelled,

    /// The prompt produced no tokens.
    EmptyPrompt,

    /// Evaluating the prompt failed; nothing was generated.
    PromptDecodeFailed,
}

/// The result of a single completion.
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    /// The generated text, possibly empty.
    pub text: String,

    /// Why generation stopped.
    pub stop_reason: StopReason,

    /// Number of prompt tokens evaluated, BOS included.
    pub prompt_tokens: usize,

    /// Number of tokens generated, end-of-generation excluded.
    pub generated_tokens: usize,
}

impl Completion {
    /// An empty completion that never touched the context.
    pub(crate) fn empty(stop_reason: StopReason) -> Self {
        Self {
            text: String::new(),
            stop_reason,
            prompt_tokens: 0,
            generated_tokens: 0,
        }
    }
}

/// A cooperative cancellation flag, checked between generation steps.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a flag that isn't cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every completion observing this flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once [`CancelFlag::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Feeds `tokens` into `ctx` in chunks of at most `n_batch` tokens.
///
/// Any failed chunk aborts the whole evaluation.
pub fn evaluate_prompt<C>(ctx: &mut C, tokens: &[Token]) -> Result<(), LlamaContextError>
where
    C: DecodeContext + ?Sized,
{
    let n_batch = ctx.n_batch().max(1);

    if tokens.len() > n_batch {
        info!(
            "Prompt of {} tokens exceeds the batch size ({n_batch}), splitting the input",
            tokens.len()
        );
    }

    for (i, chunk) in tokens.chunks(n_batch).enumerate() {
        trace!("Decoding prompt chunk {i} ({} tokens)", chunk.len());
        ctx.decode(chunk)?;
    }

    Ok(())
}

/// Checks that the prompt plus its budget fits in the context window, per `policy`.
pub fn check_context_overflow(
    prompt_tokens: usize,
    max_tokens: usize,
    n_ctx: usize,
    policy: OverflowPolicy,
) -> Result<(), LlamaContextError> {
    if prompt_tokens + max_tokens + CONTEXT_SAFETY_MARGIN <= n_ctx {
        return Ok(());
    }

    match policy {
        OverflowPolicy::Warn => {
            warn!(
                prompt_tokens,
                max_tokens, n_ctx, "Potential context overflow, output may be truncated"
            );
            Ok(())
        }
        OverflowPolicy::Reject => Err(LlamaContextError::PromptTooLong {
            prompt_tokens,
            max_tokens,
            n_ctx,
        }),
    }
}

/// The states of a single completion.
#[derive(Debug)]
enum GenerationState {
    AwaitingPrompt,
    Evaluating(Vec<Token>),
    Sampling,
    Feeding(Token),
    Done(StopReason),
    Failed(StopReason),
}

/// Runs one complete, independent completion of `prompt` on `ctx`.
///
/// The context is cleared first, so nothing from an earlier call can leak into this one. Only a
/// strict-mode overflow is returned as an error; every other failure ends the completion with
/// whatever text was produced and a matching [`StopReason`].
pub fn generate<C>(
    ctx: &mut C,
    prompt: &str,
    params: &CompletionParams,
    cancel: &CancelFlag,
) -> Result<Completion, LlamaContextError>
where
    C: DecodeContext + ?Sized,
{
    generate_with_sampler(ctx, prompt, params, SamplerChain::from_params(params), cancel)
}

/// Like [`generate`], but selects tokens with `sampler` instead of the chain built from
/// `params`. The temperature, `top_p` and seed in `params` are then only logged.
pub fn generate_with_sampler<C>(
    ctx: &mut C,
    prompt: &str,
    params: &CompletionParams,
    mut sampler: SamplerChain,
    cancel: &CancelFlag,
) -> Result<Completion, LlamaContextError>
where
    C: DecodeContext + ?Sized,
{
    let params = params.normalized();
    let max_tokens = params.max_tokens as usize;
    let n_threads = resolve_threads(params.n_threads);
    let started = Instant::now();

    ctx.clear();
    ctx.set_threads(n_threads);

    info!(
        n_threads,
        max_tokens,
        temperature = params.temperature,
        top_p = params.top_p,
        seed = ?params.seed,
        "Starting completion"
    );

    let mut decoder = TokenDecoder::new();
    let mut prompt_tokens = 0;
    let mut generated_tokens = 0;
    let mut state = GenerationState::AwaitingPrompt;

    let stop_reason = loop {
        state = match state {
            GenerationState::AwaitingPrompt => match ctx.tokenize(prompt) {
                Ok(tokens) => {
                    prompt_tokens = tokens.len();
                    check_context_overflow(
                        prompt_tokens,
                        max_tokens,
                        ctx.n_ctx(),
                        ctx.overflow_policy(),
                    )?;
                    GenerationState::Evaluating(tokens)
                }
                Err(e) => {
                    warn!("Nothing to complete: {e}");
                    GenerationState::Failed(StopReason::EmptyPrompt)
                }
            },
            GenerationState::Evaluating(tokens) => match evaluate_prompt(ctx, &tokens) {
                Ok(()) => GenerationState::Sampling,
                Err(e) => {
                    error!("Failed to evaluate prompt: {e}");
                    GenerationState::Failed(StopReason::PromptDecodeFailed)
                }
            },
            GenerationState::Sampling => {
                if cancel.is_cancelled() {
                    GenerationState::Done(StopReason::Cancelled)
                } else {
                    match sampler.sample(ctx.logits()) {
                        None => {
                            error!("No logits available to sample from");
                            GenerationState::Done(StopReason::DecodeFailed)
                        }
                        Some(token) if ctx.is_end_of_generation(token) => {
                            GenerationState::Done(StopReason::EndOfGeneration)
                        }
                        Some(token) => {
                            sampler.accept(token);
                            decoder.add_token(&ctx.token_to_byte_piece(token));
                            generated_tokens += 1;
                            GenerationState::Feeding(token)
                        }
                    }
                }
            }
            // The last budgeted token is never fed back; nothing would read its logits.
            GenerationState::Feeding(_) if generated_tokens >= max_tokens => {
                GenerationState::Done(StopReason::TokenBudget)
            }
            GenerationState::Feeding(token) => match ctx.decode(&[token]) {
                Ok(()) => GenerationState::Sampling,
                Err(e) => {
                    error!("Failed to decode generated token {generated_tokens}: {e}");
                    GenerationState::Done(StopReason::DecodeFailed)
                }
            },
            GenerationState::Done(reason) => break reason,
            GenerationState::Failed(reason) => break reason,
        };
    };

    let elapsed = started.elapsed().as_secs_f64();
    let tokens_per_second = if elapsed > 0.0 {
        generated_tokens as f64 / elapsed
    } else {
        0.0
    };

    info!(
        prompt_tokens,
        generated_tokens,
        ?stop_reason,
        tokens_per_second,
        "Completion finished"
    );

    Ok(Completion {
        text: decoder.into_string(),
        stop_reason,
        prompt_tokens,
        generated_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An in-memory context over a tiny vocabulary.
    ///
    /// Token ids index into `vocab`; id 0 is BOS and id 1 is EOS. The next token's logits are
    /// a pure function of the last decoded token, following `script`.
    struct ScriptedContext {
        vocab: Vec<&'static str>,
        script: Vec<(i32, i32)>,
        n_ctx: usize,
        n_batch: usize,
        policy: OverflowPolicy,
        history: Vec<Token>,
        decode_calls: Vec<usize>,
        clears: usize,
        threads: Option<u32>,
        fail_on_decode: Option<usize>,
        logits: Vec<f32>,
    }

    impl ScriptedContext {
        fn new(vocab: Vec<&'static str>, script: Vec<(i32, i32)>) -> Self {
            Self {
                vocab,
                script,
                n_ctx: 256,
                n_batch: 512,
                policy: OverflowPolicy::Warn,
                history: Vec::new(),
                decode_calls: Vec::new(),
                clears: 0,
                threads: None,
                fail_on_decode: None,
                logits: Vec::new(),
            }
        }

        /// A model that answers "Nairobi" to anything, then stops.
        fn nairobi() -> Self {
            Self::new(
                vec!["<s>", "</s>", " Nai", "robi", ".", "What", " is", " the", " capital"],
                vec![(8, 2), (5, 2), (2, 3), (3, 4), (4, 1)],
            )
        }

        /// A model that repeats "la" forever.
        fn endless() -> Self {
            Self::new(vec!["<s>", "</s>", "la"], vec![(0, 2), (2, 2)])
        }

        fn next_for(&self, last: Token) -> i32 {
            self.script
                .iter()
                .find(|(from, _)| *from == last.0)
                .map(|(_, to)| *to)
                .unwrap_or(1)
        }
    }

    impl DecodeContext for ScriptedContext {
        fn n_ctx(&self) -> usize {
            self.n_ctx
        }

        fn n_batch(&self) -> usize {
            self.n_batch
        }

        fn overflow_policy(&self) -> OverflowPolicy {
            self.policy
        }

        fn clear(&mut self) {
            self.history.clear();
            self.logits.clear();
            self.clears += 1;
        }

        fn set_threads(&mut self, n_threads: u32) {
            self.threads = Some(n_threads);
        }

        fn tokenize(&self, text: &str) -> Result<Vec<Token>, LlamaTokenizationError> {
            if text.is_empty() {
                return Err(LlamaTokenizationError::EmptyInput);
            }

            let mut tokens = vec![Token(0)];
            for word in text.split_inclusive(' ') {
                let word = word.trim();
                let id = self
                    .vocab
                    .iter()
                    .position(|v| v.trim() == word)
                    .unwrap_or(self.vocab.len() - 1);
                tokens.push(Token(id as i32));
            }

            Ok(tokens)
        }

        fn decode(&mut self, tokens: &[Token]) -> Result<(), LlamaContextError> {
            assert!(tokens.len() <= self.n_batch, "chunk larger than n_batch");

            if self.fail_on_decode == Some(self.decode_calls.len()) {
                self.decode_calls.push(tokens.len());
                self.logits.clear();
                return Err(LlamaContextError::DecodeFailed(1));
            }

            self.decode_calls.push(tokens.len());
            self.history.extend_from_slice(tokens);

            let last = *tokens.last().unwrap();
            let next = self.next_for(last);
            self.logits = (0..self.vocab.len() as i32)
                .map(|id| if id == next { 10.0 } else { 0.0 })
                .collect();

            Ok(())
        }

        fn logits(&self) -> &[f32] {
            &self.logits
        }

        fn token_to_byte_piece(&self, token: Token) -> Vec<u8> {
            self.vocab[token.0 as usize].as_bytes().to_vec()
        }

        fn is_end_of_generation(&self, token: Token) -> bool {
            token == Token(1)
        }
    }

    fn greedy(max_tokens: u32) -> CompletionParams {
        CompletionParams {
            max_tokens,
            temperature: 0.0,
            ..CompletionParams::default()
        }
    }

    #[test]
    fn stops_at_end_of_generation() {
        let mut ctx = ScriptedContext::nairobi();

        let completion =
            generate(&mut ctx, "What is the capital", &greedy(32), &CancelFlag::new()).unwrap();

        assert_eq!(completion.text, " Nairobi.");
        assert_eq!(completion.stop_reason, StopReason::EndOfGeneration);
        assert_eq!(completion.prompt_tokens, 5);
        assert_eq!(completion.generated_tokens, 3);
    }

    #[test]
    fn budget_bounds_generated_tokens() {
        let mut ctx = ScriptedContext::endless();

        let completion = generate(&mut ctx, "la", &greedy(16), &CancelFlag::new()).unwrap();

        assert_eq!(completion.generated_tokens, 16);
        assert_eq!(completion.text, "la".repeat(16));
        assert_eq!(completion.stop_reason, StopReason::TokenBudget);
        // One prompt chunk plus 15 fed tokens; the 16th is never fed back.
        assert_eq!(ctx.decode_calls.len(), 16);
    }

    #[test]
    fn state_is_cleared_before_every_completion() {
        let mut ctx = ScriptedContext::nairobi();
        let cancel = CancelFlag::new();

        let long = "What is the capital ".repeat(20);
        generate(&mut ctx, &long, &greedy(4), &cancel).unwrap();
        let first_history = ctx.history.len();

        let completion = generate(&mut ctx, "What", &greedy(32), &cancel).unwrap();

        assert_eq!(ctx.clears, 2);
        assert!(first_history > ctx.history.len());
        assert_eq!(ctx.history[0], Token(0));
        assert_eq!(completion.text, " Nairobi.");
    }

    #[test]
    fn prompt_is_split_into_batches() {
        let mut ctx = ScriptedContext::nairobi();
        ctx.n_batch = 4;

        let prompt = "What is the capital What is the capital";
        generate(&mut ctx, prompt, &greedy(1), &CancelFlag::new()).unwrap();

        // BOS + 8 words = 9 prompt tokens.
        assert_eq!(&ctx.decode_calls[..3], &[4, 4, 1]);
    }

    #[test]
    fn empty_prompt_is_not_an_error() {
        let mut ctx = ScriptedContext::nairobi();

        let completion = generate(&mut ctx, "", &greedy(8), &CancelFlag::new()).unwrap();

        assert_eq!(completion.text, "");
        assert_eq!(completion.stop_reason, StopReason::EmptyPrompt);
        assert!(ctx.decode_calls.is_empty());
    }

    #[test]
    fn failed_prompt_evaluation_returns_nothing() {
        let mut ctx = ScriptedContext::nairobi();
        ctx.n_batch = 2;
        ctx.fail_on_decode = Some(1);

        let completion =
            generate(&mut ctx, "What is the capital", &greedy(8), &CancelFlag::new()).unwrap();

        assert_eq!(completion.text, "");
        assert_eq!(completion.stop_reason, StopReason::PromptDecodeFailed);
        assert_eq!(completion.generated_tokens, 0);
    }

    #[test]
    fn failed_feed_keeps_partial_output() {
        let mut ctx = ScriptedContext::endless();
        // Call 0 is the prompt, calls 1 and 2 feed tokens, call 3 fails.
        ctx.fail_on_decode = Some(3);

        let completion = generate(&mut ctx, "la", &greedy(16), &CancelFlag::new()).unwrap();

        assert_eq!(completion.text, "lalala");
        assert_eq!(completion.generated_tokens, 3);
        assert_eq!(completion.stop_reason, StopReason::DecodeFailed);
    }

    #[test]
    fn cancellation_is_checked_between_steps() {
        let mut ctx = ScriptedContext::endless();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let completion = generate(&mut ctx, "la", &greedy(16), &cancel).unwrap();

        assert_eq!(completion.text, "");
        assert_eq!(completion.stop_reason, StopReason::Cancelled);
        assert_eq!(completion.prompt_tokens, 2);
    }

    #[test]
    fn overflow_warns_by_default() {
        let mut ctx = ScriptedContext::endless();
        ctx.n_ctx = 16;

        let completion = generate(&mut ctx, "la", &greedy(16), &CancelFlag::new()).unwrap();

        assert_eq!(completion.generated_tokens, 16);
    }

    #[test]
    fn overflow_rejected_in_strict_mode() {
        let mut ctx = ScriptedContext::endless();
        ctx.n_ctx = 16;
        ctx.policy = OverflowPolicy::Reject;

        let err = generate(&mut ctx, "la", &greedy(16), &CancelFlag::new()).unwrap_err();

        assert!(matches!(
            err,
            LlamaContextError::PromptTooLong {
                prompt_tokens: 2,
                max_tokens: 16,
                n_ctx: 16
            }
        ));
        assert!(ctx.decode_calls.is_empty());
    }

    #[test]
    fn overflow_margin() {
        assert!(check_context_overflow(100, 100, 208, OverflowPolicy::Reject).is_ok());
        assert!(check_context_overflow(100, 100, 207, OverflowPolicy::Reject).is_err());
        assert!(check_context_overflow(100, 100, 207, OverflowPolicy::Warn).is_ok());
    }

    #[test]
    fn thread_hint_reaches_context() {
        let mut ctx = ScriptedContext::nairobi();
        let params = CompletionParams {
            n_threads: Some(3),
            ..greedy(1)
        };

        generate(&mut ctx, "What", &params, &CancelFlag::new()).unwrap();
        assert_eq!(ctx.threads, Some(3));

        generate(&mut ctx, "What", &greedy(1), &CancelFlag::new()).unwrap();
        assert_eq!(ctx.threads, Some(crate::default_thread_count()));
    }

    /// Records every token the chain accepts.
    struct Recorder(Arc<std::sync::Mutex<Vec<Token>>>);

    impl crate::Sampler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn apply(&mut self, _candidates: &mut crate::TokenDataArray) {}

        fn accept(&mut self, token: Token) {
            self.0.lock().unwrap().push(token);
        }
    }

    #[test]
    fn emitted_tokens_are_accepted_in_order() {
        let mut ctx = ScriptedContext::nairobi();
        let accepted = Arc::new(std::sync::Mutex::new(vec![]));
        let sampler = SamplerChain::new()
            .with(Recorder(accepted.clone()))
            .with(crate::Greedy);

        let completion = generate_with_sampler(
            &mut ctx,
            "What is the capital",
            &greedy(32),
            sampler,
            &CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(completion.stop_reason, StopReason::EndOfGeneration);
        assert_eq!(*accepted.lock().unwrap(), vec![Token(2), Token(3), Token(4)]);
    }

    #[test]
    fn budget_stop_accepts_the_last_token() {
        let mut ctx = ScriptedContext::nairobi();
        let accepted = Arc::new(std::sync::Mutex::new(vec![]));
        let sampler = SamplerChain::new()
            .with(Recorder(accepted.clone()))
            .with(crate::Greedy);

        let completion = generate_with_sampler(
            &mut ctx,
            "What is the capital",
            &greedy(2),
            sampler,
            &CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(completion.stop_reason, StopReason::TokenBudget);
        assert_eq!(*accepted.lock().unwrap(), vec![Token(2), Token(3)]);
    }

    #[test]
    fn greedy_is_deterministic() {
        let mut ctx = ScriptedContext::nairobi();
        let cancel = CancelFlag::new();

        let a = generate(&mut ctx, "What is the capital", &greedy(32), &cancel).unwrap();
        let b = generate(&mut ctx, "What is the capital", &greedy(32), &cancel).unwrap();

        assert_eq!(a, b);
    }
}
