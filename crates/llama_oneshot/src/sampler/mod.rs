//! Token selection: a [`SamplerChain`] of [`Sampler`] stages over one step's logits.

use std::cmp::Ordering;

use tracing::trace;

use crate::{CompletionParams, Token};

mod stages;

pub use stages::*;

/// A candidate token, with its logit and (once computed) its probability.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TokenData {
    /// The candidate token.
    pub id: Token,

    /// Its raw, possibly scaled, logit.
    pub logit: f32,

    /// Its probability, valid after [`TokenDataArray::softmax`].
    pub p: f32,
}

/// The candidate set a [`Sampler`] works on.
#[derive(Clone, Debug)]
pub struct TokenDataArray {
    /// The remaining candidates.
    pub data: Vec<TokenData>,

    /// Whether `data` is sorted by descending logit.
    pub sorted: bool,

    /// Index into `data` of the chosen token, once a selector stage ran.
    pub selected: Option<usize>,
}

impl TokenDataArray {
    /// Creates a candidate for every entry of `logits`, with the token id being its index.
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenData {
                id: Token(i as i32),
                logit,
                p: 0.0,
            })
            .collect();

        Self {
            data,
            sorted: false,
            selected: None,
        }
    }

    /// Sorts candidates by descending logit; ties keep their vocabulary order.
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }

        self.data
            .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(Ordering::Equal));
        self.sorted = true;
        self.selected = None;
    }

    /// Sorts the candidates, then fills in their probabilities from the current logits.
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }

        self.sort();

        let max_logit = self.data[0].logit;
        let mut sum = 0.0;
        for candidate in self.data.iter_mut() {
            candidate.p = (candidate.logit - max_logit).exp();
            sum += candidate.p;
        }

        for candidate in self.data.iter_mut() {
            candidate.p /= sum;
        }
    }

    /// The token chosen by a selector stage, if any.
    pub fn selected_token(&self) -> Option<Token> {
        self.selected
            .and_then(|i| self.data.get(i))
            .map(|candidate| candidate.id)
    }
}

/// One stage of a [`SamplerChain`].
///
/// Stages either narrow or rescale the candidates, or select one of them by setting
/// [`TokenDataArray::selected`].
pub trait Sampler: Send {
    /// A short name for logs.
    fn name(&self) -> &str;

    /// Applies this stage to `candidates`.
    fn apply(&mut self, candidates: &mut TokenDataArray);

    /// Called with every token the chain emitted.
    fn accept(&mut self, _token: Token) {}
}

/// An ordered list of [`Sampler`] stages, built for a single completion.
#[derive(Default)]
pub struct SamplerChain {
    stages: Vec<Box<dyn Sampler>>,
}

impl SamplerChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `stage`, builder style.
    pub fn with(mut self, stage: impl Sampler + 'static) -> Self {
        self.push(stage);
        self
    }

    /// Appends `stage`.
    pub fn push(&mut self, stage: impl Sampler + 'static) {
        self.stages.push(Box::new(stage));
    }

    /// Builds the chain for `params`.
    ///
    /// A temperature of zero selects greedy decoding. Anything else is nucleus filtering,
    /// then temperature scaling, then a seeded draw from what's left.
    pub fn from_params(params: &CompletionParams) -> Self {
        let params = params.normalized();

        if params.temperature == 0.0 {
            return Self::new().with(Greedy);
        }

        Self::new()
            .with(TopP::new(params.top_p, 1))
            .with(Temperature::new(params.temperature))
            .with(Dist::new(params.seed))
    }

    /// The names of every stage, in order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Picks the next token from one step's logits.
    ///
    /// Returns `None` if there are no logits. If no stage selects a token, the best remaining
    /// candidate is used.
    pub fn sample(&mut self, logits: &[f32]) -> Option<Token> {
        if logits.is_empty() {
            return None;
        }

        let mut candidates = TokenDataArray::from_logits(logits);

        for stage in self.stages.iter_mut() {
            stage.apply(&mut candidates);
        }

        let token = candidates.selected_token().or_else(|| {
            candidates.sort();
            candidates.data.first().map(|candidate| candidate.id)
        });

        trace!("Sampled {token:?} from {} candidates", candidates.data.len());

        token
    }

    /// Lets every stage observe the token that was emitted.
    pub fn accept(&mut self, token: Token) {
        for stage in self.stages.iter_mut() {
            stage.accept(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(temperature: f32, top_p: f32, seed: Option<u32>) -> CompletionParams {
        CompletionParams {
            temperature,
            top_p,
            seed,
            ..CompletionParams::default()
        }
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let chain = SamplerChain::from_params(&params(0.0, 0.5, Some(3)));
        assert_eq!(chain.stage_names(), vec!["greedy"]);

        let chain = SamplerChain::from_params(&params(-2.0, 0.5, None));
        assert_eq!(chain.stage_names(), vec!["greedy"]);
    }

    #[test]
    fn stochastic_chain_order() {
        let chain = SamplerChain::from_params(&params(0.8, 0.9, Some(1)));
        assert_eq!(chain.stage_names(), vec!["top_p", "temperature", "dist"]);
    }

    #[test]
    fn no_logits_no_token() {
        let mut chain = SamplerChain::from_params(&params(0.0, 0.95, None));
        assert_eq!(chain.sample(&[]), None);
    }

    #[test]
    fn greedy_picks_argmax() {
        let mut chain = SamplerChain::from_params(&params(0.0, 0.95, None));
        assert_eq!(chain.sample(&[0.1, 2.5, -1.0, 2.4]), Some(Token(1)));
    }

    #[test]
    fn chain_without_selector_uses_best_candidate() {
        let mut chain = SamplerChain::new().with(Temperature::new(0.5));
        assert_eq!(chain.sample(&[0.0, 1.0, 3.0]), Some(Token(2)));
    }

    #[test]
    fn same_seed_same_tokens() {
        let logits: Vec<f32> = (0..64).map(|i| ((i * 37) % 11) as f32 * 0.3).collect();
        let p = params(1.2, 0.98, Some(42));

        let mut a = SamplerChain::from_params(&p);
        let mut b = SamplerChain::from_params(&p);

        let run_a: Vec<_> = (0..32).map(|_| a.sample(&logits)).collect();
        let run_b: Vec<_> = (0..32).map(|_| b.sample(&logits)).collect();

        assert_eq!(run_a, run_b);
    }

    #[test]
    fn different_seeds_diverge() {
        let logits = vec![1.0; 256];

        let mut a = SamplerChain::from_params(&params(1.0, 1.0, Some(1)));
        let mut b = SamplerChain::from_params(&params(1.0, 1.0, Some(2)));

        let run_a: Vec<_> = (0..32).map(|_| a.sample(&logits)).collect();
        let run_b: Vec<_> = (0..32).map(|_| b.sample(&logits)).collect();

        assert_ne!(run_a, run_b);
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut candidates = TokenDataArray::from_logits(&[1.0, 2.0, 3.0]);
        candidates.softmax();

        let sum: f32 = candidates.data.iter().map(|c| c.p).sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(candidates.data[0].id, Token(2));
        assert!(candidates.sorted);
    }
}
