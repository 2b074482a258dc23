use std::cmp::Ordering;

use crate::generation::LogitsHook;

/// A candidate token and its probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenProbability {
    pub token_id: u32,
    pub probability: f32,
}

/// The top candidates observed at one generation step, most probable first.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDistribution {
    pub step: usize,
    pub candidates: Vec<TokenProbability>,
}

/// Generation hook recording the `top_k` most probable candidates of every step.
///
/// The logits are observed, never modified.
#[derive(Debug, Clone)]
pub struct UncertaintyEstimator {
    top_k: usize,
    steps: Vec<StepDistribution>,
}

impl UncertaintyEstimator {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k: top_k.max(1),
            steps: Vec::new(),
        }
    }

    #[inline]
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// The captured distributions, one per generated token.
    #[inline]
    pub fn steps(&self) -> &[StepDistribution] {
        &self.steps
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }
}

impl LogitsHook for UncertaintyEstimator {
    fn on_step(&mut self, step: usize, _input_ids: &[u32], logits: &mut [f32]) {
        let probs = softmax(logits);
        self.steps.push(StepDistribution {
            step,
            candidates: top_k(&probs, self.top_k),
        });
    }
}

fn by_probability_desc(a: &TokenProbability, b: &TokenProbability) -> Ordering {
    b.probability
        .total_cmp(&a.probability)
        .then(a.token_id.cmp(&b.token_id))
}

/// Numerically stable softmax. Non-finite inputs get a zero probability.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }

    let exps: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// The `k` most probable entries, most probable first, ties broken by the lowest token id.
pub fn top_k(probs: &[f32], k: usize) -> Vec<TokenProbability> {
    let mut candidates: Vec<TokenProbability> = probs
        .iter()
        .enumerate()
        .map(|(i, &p)| TokenProbability {
            token_id: i as u32,
            probability: p,
        })
        .collect();

    if k < candidates.len() {
        candidates.select_nth_unstable_by(k, by_probability_desc);
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(by_probability_desc);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_softmax() {
        let probs = softmax(&[0.0, 0.0, 0.0, 0.0]);
        for p in &probs {
            assert_relative_eq!(*p, 0.25);
        }

        let probs = softmax(&[1000.0, 1000.0, f32::NEG_INFINITY]);
        assert_relative_eq!(probs[0], 0.5);
        assert_relative_eq!(probs[1], 0.5);
        assert_eq!(probs[2], 0.0);

        let probs = softmax(&[f32::NEG_INFINITY; 3]);
        assert_eq!(probs, vec![0.0; 3]);
    }

    #[test]
    fn test_top_k_descending_with_ties() {
        let top = top_k(&[0.1, 0.4, 0.1, 0.3, 0.1], 3);
        let ids: Vec<u32> = top.iter().map(|c| c.token_id).collect();
        assert_eq!(ids, vec![1, 3, 0]);

        let all = top_k(&[0.2, 0.8], 10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].token_id, 1);
    }

    #[test]
    fn test_estimator_records_each_step() {
        let mut estimator = UncertaintyEstimator::new(2);
        let mut logits = vec![2.0, 1.0, 0.0];
        estimator.on_step(0, &[5, 6], &mut logits);
        let mut logits = vec![0.0, 0.0, 3.0];
        estimator.on_step(1, &[5, 6, 0], &mut logits);

        // observation only
        assert_eq!(logits, vec![0.0, 0.0, 3.0]);

        let steps = estimator.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step, 0);
        assert_eq!(steps[0].candidates.len(), 2);
        assert_eq!(steps[0].candidates[0].token_id, 0);
        assert_eq!(steps[0].candidates[1].token_id, 1);
        assert_eq!(steps[1].candidates[0].token_id, 2);
        assert!(steps[0].candidates[0].probability > steps[0].candidates[1].probability);

        estimator.clear();
        assert!(estimator.steps().is_empty());
    }
}
