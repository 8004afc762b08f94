//! The stages [`SamplerChain::from_params`][crate::SamplerChain::from_params] is built from.
//!
//! These run in Rust over the logits row rather than through llama.cpp's samplers, so a chain
//! can mix in caller-defined [`Sampler`]s and be exercised without a model loaded.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::warn;

use crate::{Sampler, TokenDataArray};

/// Selects the candidate with the highest logit; the lowest token id wins ties.
#[derive(Clone, Copy, Debug, Default)]
pub struct Greedy;

impl Sampler for Greedy {
    fn name(&self) -> &str {
        "greedy"
    }

    fn apply(&mut self, candidates: &mut TokenDataArray) {
        let mut best: Option<usize> = None;

        for (i, candidate) in candidates.data.iter().enumerate() {
            match best {
                Some(b) if candidates.data[b].logit >= candidate.logit => {}
                _ => best = Some(i),
            }
        }

        candidates.selected = best;
    }
}

/// Nucleus filtering: keeps the smallest prefix of candidates, by descending probability, whose
/// cumulative probability reaches `p`, and never fewer than `min_keep`.
#[derive(Clone, Copy, Debug)]
pub struct TopP {
    p: f32,
    min_keep: usize,
}

impl TopP {
    /// Creates the stage; a `p` of 1.0 or more keeps everything.
    pub fn new(p: f32, min_keep: usize) -> Self {
        Self {
            p,
            min_keep: min_keep.max(1),
        }
    }
}

impl Sampler for TopP {
    fn name(&self) -> &str {
        "top_p"
    }

    fn apply(&mut self, candidates: &mut TokenDataArray) {
        if self.p >= 1.0 || candidates.data.is_empty() {
            return;
        }

        candidates.softmax();

        let mut cumulative = 0.0;
        let mut keep = candidates.data.len();

        for (i, candidate) in candidates.data.iter().enumerate() {
            cumulative += candidate.p;

            if cumulative >= self.p && i + 1 >= self.min_keep {
                keep = i + 1;
                break;
            }
        }

        candidates.data.truncate(keep);
    }
}

/// Divides every logit by the temperature.
#[derive(Clone, Copy, Debug)]
pub struct Temperature(f32);

impl Temperature {
    /// Creates the stage. Only meaningful for temperatures above zero.
    pub fn new(temperature: f32) -> Self {
        Self(temperature)
    }
}

impl Sampler for Temperature {
    fn name(&self) -> &str {
        "temperature"
    }

    fn apply(&mut self, candidates: &mut TokenDataArray) {
        if self.0 <= 0.0 {
            return;
        }

        for candidate in candidates.data.iter_mut() {
            candidate.logit /= self.0;
        }
    }
}

/// Draws one candidate at random, weighted by probability.
///
/// The generator is seeded once, when the stage is built, and advances with every draw.
#[derive(Clone, Debug)]
pub struct Dist {
    rng: StdRng,
}

impl Dist {
    /// Creates the stage; `None` seeds from system entropy.
    pub fn new(seed: Option<u32>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(u64::from(seed)),
            None => StdRng::from_entropy(),
        };

        Self { rng }
    }
}

impl Sampler for Dist {
    fn name(&self) -> &str {
        "dist"
    }

    fn apply(&mut self, candidates: &mut TokenDataArray) {
        if candidates.data.is_empty() {
            return;
        }

        candidates.softmax();

        let weights = candidates.data.iter().map(|candidate| candidate.p);
        candidates.selected = match WeightedIndex::new(weights) {
            Ok(dist) => Some(dist.sample(&mut self.rng)),
            Err(e) => {
                warn!("Cannot sample from the candidate distribution ({e}), using the best candidate");
                Some(0)
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Token;

    fn ids(candidates: &TokenDataArray) -> Vec<i32> {
        candidates.data.iter().map(|c| c.id.0).collect()
    }

    #[test]
    fn greedy_prefers_lowest_id_on_ties() {
        let mut candidates = TokenDataArray::from_logits(&[0.5, 3.0, 3.0, 1.0]);
        Greedy.apply(&mut candidates);

        assert_eq!(candidates.selected_token(), Some(Token(1)));
    }

    #[test]
    fn top_p_keeps_smallest_nucleus() {
        // Probabilities after softmax are roughly 0.64, 0.24, 0.09, 0.03.
        let mut candidates = TokenDataArray::from_logits(&[1.0, 3.0, 0.0, 2.0]);
        TopP::new(0.8, 1).apply(&mut candidates);

        assert_eq!(ids(&candidates), vec![1, 3]);
    }

    #[test]
    fn top_p_respects_min_keep() {
        let mut candidates = TokenDataArray::from_logits(&[10.0, 0.0, 0.0, 0.0]);
        TopP::new(0.5, 3).apply(&mut candidates);

        assert_eq!(candidates.data.len(), 3);
    }

    #[test]
    fn top_p_of_one_keeps_everything() {
        let mut candidates = TokenDataArray::from_logits(&[10.0, 0.0, 0.0, 0.0]);
        TopP::new(1.0, 1).apply(&mut candidates);

        assert_eq!(candidates.data.len(), 4);
        assert!(!candidates.sorted);
    }

    #[test]
    fn temperature_scales_logits() {
        let mut candidates = TokenDataArray::from_logits(&[1.0, -2.0]);
        Temperature::new(0.5).apply(&mut candidates);

        assert_eq!(candidates.data[0].logit, 2.0);
        assert_eq!(candidates.data[1].logit, -4.0);
    }

    #[test]
    fn dist_single_candidate() {
        let mut candidates = TokenDataArray::from_logits(&[0.3]);
        Dist::new(Some(7)).apply(&mut candidates);

        assert_eq!(candidates.selected_token(), Some(Token(0)));
    }

    #[test]
    fn dist_never_picks_impossible_tokens() {
        let mut dist = Dist::new(Some(99));

        for _ in 0..100 {
            let mut candidates = TokenDataArray::from_logits(&[f32::NEG_INFINITY, 0.0, 1.0]);
            dist.apply(&mut candidates);
            assert_ne!(candidates.selected_token(), Some(Token(0)));
        }
    }

    #[test]
    fn dist_falls_back_on_broken_weights() {
        let mut candidates = TokenDataArray::from_logits(&[f32::NAN, f32::NAN]);
        Dist::new(Some(1)).apply(&mut candidates);

        assert!(candidates.selected_token().is_some());
    }
}
