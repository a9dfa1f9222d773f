//! Token selection strategies.
//!
//! Both strategies operate on the raw score vector of the last position.
//! [`GreedySampler`] is deterministic; [`NucleusSampler`] draws from the
//! smallest high-probability prefix whose mass reaches `top_p`, using a random
//! source it owns so draws can be replayed from a seed.

use crate::error::{DecodeError, DecodeResult};
use ndarray::{Array1, ArrayView1};
use paligemma_kernels::softmax_inplace;

pub trait Sampler {
    fn name(&self) -> &'static str;

    /// Pick exactly one token id from a score vector over the vocabulary.
    fn sample(&mut self, scores: ArrayView1<'_, f32>) -> DecodeResult<u32>;
}

/// Index of the largest score. Ties go to the lowest index.
///
/// A NaN score is a `Sampling` error instead of being treated as the maximum.
pub fn argmax(scores: ArrayView1<'_, f32>) -> DecodeResult<u32> {
    if scores.is_empty() {
        return Err(DecodeError::shape("cannot select from an empty score vector"));
    }
    let mut best = 0usize;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &v) in scores.iter().enumerate() {
        if v.is_nan() {
            return Err(DecodeError::sampling(format!("score at index {} is NaN", i)));
        }
        if v > max_val {
            max_val = v;
            best = i;
        }
    }
    Ok(best as u32)
}

/// Softmax of `scores / temperature`.
pub fn softmax_with_temperature(scores: ArrayView1<'_, f32>, temperature: f32) -> Array1<f32> {
    let mut probs = scores.mapv(|s| s / temperature);
    softmax_inplace(probs.view_mut());
    probs
}

/// A probability distribution truncated to its top-p nucleus.
///
/// Entries are ordered by descending probability; `token_ids[rank]` maps a
/// rank back to its vocabulary id. Probabilities are renormalized over the
/// kept entries.
#[derive(Debug, Clone, PartialEq)]
pub struct NucleusDistribution {
    probs: Vec<f32>,
    token_ids: Vec<u32>,
}

impl NucleusDistribution {
    /// Truncate `probs` to the nucleus of mass `top_p` and renormalize.
    ///
    /// An entry is dropped when the cumulative mass of the entries ranked
    /// above it already exceeds `top_p`, so the most likely entry always
    /// survives.
    pub fn from_probs(probs: ArrayView1<'_, f32>, top_p: f32) -> DecodeResult<Self> {
        if probs.is_empty() {
            return Err(DecodeError::shape("cannot sample from an empty distribution"));
        }

        let mut order: Vec<u32> = (0..probs.len() as u32).collect();
        // Stable sort: equal probabilities keep ascending vocabulary order.
        order.sort_by(|&a, &b| probs[b as usize].total_cmp(&probs[a as usize]));

        if top_p < 1.0 {
            let mut kept = 0;
            let mut cumulative = 0.0f32;
            for &id in &order {
                if cumulative > top_p {
                    break;
                }
                cumulative += probs[id as usize];
                kept += 1;
            }
            order.truncate(kept);
        }

        let total: f64 = order.iter().map(|&id| probs[id as usize] as f64).sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(DecodeError::sampling(format!(
                "truncated distribution has mass {}; scores are likely corrupted",
                total
            )));
        }
        let sorted: Vec<f32> = order
            .iter()
            .map(|&id| (probs[id as usize] as f64 / total) as f32)
            .collect();

        Ok(Self {
            probs: sorted,
            token_ids: order,
        })
    }

    /// Number of entries kept in the nucleus.
    pub fn len(&self) -> usize {
        self.probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    /// Renormalized probabilities in rank order.
    pub fn probs(&self) -> &[f32] {
        &self.probs
    }

    /// Vocabulary ids in rank order.
    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// Map a uniform draw `u` in `[0, 1)` to a vocabulary id.
    pub fn draw(&self, u: f32) -> u32 {
        let mut cumulative = 0.0f32;
        for (rank, &p) in self.probs.iter().enumerate() {
            cumulative += p;
            if u < cumulative {
                return self.token_ids[rank];
            }
        }
        // Rounding left the cumulative mass just under 1.
        self.probs
            .iter()
            .rposition(|&p| p > 0.0)
            .map_or(self.token_ids[0], |rank| self.token_ids[rank])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn sample(&mut self, scores: ArrayView1<'_, f32>) -> DecodeResult<u32> {
        argmax(scores)
    }
}

#[derive(Debug, Clone)]
pub struct NucleusSampler {
    top_p: f32,
    temperature: f32,
    rng: fastrand::Rng,
}

impl NucleusSampler {
    pub fn new(top_p: f32, temperature: f32, rng: fastrand::Rng) -> DecodeResult<Self> {
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(DecodeError::config(format!(
                "top_p must lie in (0, 1], got {}",
                top_p
            )));
        }
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(DecodeError::config(format!(
                "temperature must be a positive finite number, got {}",
                temperature
            )));
        }
        Ok(Self {
            top_p,
            temperature,
            rng,
        })
    }

    pub fn seeded(top_p: f32, temperature: f32, seed: u64) -> DecodeResult<Self> {
        Self::new(top_p, temperature, fastrand::Rng::with_seed(seed))
    }

    /// The truncated distribution this sampler draws from for `scores`.
    pub fn distribution(&self, scores: ArrayView1<'_, f32>) -> DecodeResult<NucleusDistribution> {
        let probs = softmax_with_temperature(scores, self.temperature);
        NucleusDistribution::from_probs(probs.view(), self.top_p)
    }
}

impl Sampler for NucleusSampler {
    fn name(&self) -> &'static str {
        "nucleus"
    }

    fn sample(&mut self, scores: ArrayView1<'_, f32>) -> DecodeResult<u32> {
        let dist = self.distribution(scores)?;
        Ok(dist.draw(self.rng.f32()))
    }
}
