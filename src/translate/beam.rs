//! Beam search bookkeeping, independent of any model.
//!
//! The caller scores expansions of the live hypotheses; `BeamSearch::step` keeps the best
//! `width` continuations, moves hypotheses that hit an end token to the finished pool,
//! and reports which parent each survivor came from so the caller can reshuffle its
//! per-beam decoder state.

use std::cmp::Ordering;

#[derive(Clone, Debug, PartialEq)]
pub struct Hypothesis<T> {
    pub tokens: Vec<T>,
    /// Sum of token log-probabilities.
    pub score: f32,
}

impl<T> Hypothesis<T> {
    pub fn root() -> Self {
        Self {
            tokens: Vec::new(),
            score: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate<T> {
    pub parent: usize,
    pub token: T,
    /// Cumulative score of the parent plus this token's log-probability.
    pub score: f32,
}

pub struct BeamSearch<T> {
    width: usize,
    length_penalty: f32,
    finished: Vec<(f32, Hypothesis<T>)>,
}

impl<T: Copy> BeamSearch<T> {
    pub fn new(width: usize, length_penalty: f32) -> Self {
        Self {
            width: width.max(1),
            length_penalty,
            finished: Vec::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// How many expansions per live hypothesis the caller should score.
    pub fn candidates_per_beam(&self) -> usize {
        self.width * 2
    }

    pub fn normalized(&self, score: f32, len: usize) -> f32 {
        score / (len.max(1) as f32).powf(self.length_penalty)
    }

    /// Selects the next live beams as `(parent index, hypothesis)` pairs.
    pub fn step(
        &mut self,
        live: &[Hypothesis<T>],
        mut candidates: Vec<Candidate<T>>,
        is_end: impl Fn(T) -> bool,
    ) -> Vec<(usize, Hypothesis<T>)> {
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        let mut next = Vec::with_capacity(self.width);
        for (rank, c) in candidates.into_iter().enumerate() {
            let Some(parent) = live.get(c.parent) else {
                continue;
            };
            if is_end(c.token) {
                // An end token ranked below the beam width would never have been kept.
                if rank < self.width {
                    self.add_finished(Hypothesis {
                        tokens: parent.tokens.clone(),
                        score: c.score,
                    });
                }
            } else {
                let mut tokens = parent.tokens.clone();
                tokens.push(c.token);
                next.push((
                    c.parent,
                    Hypothesis {
                        tokens,
                        score: c.score,
                    },
                ));
            }
            if next.len() >= self.width {
                break;
            }
        }
        next
    }

    /// True once no live hypothesis can beat the worst finished one.
    pub fn is_done(&self, live: &[Hypothesis<T>]) -> bool {
        if live.is_empty() {
            return true;
        }
        if self.finished.len() < self.width {
            return false;
        }
        let worst = self
            .finished
            .iter()
            .map(|(s, _)| *s)
            .fold(f32::INFINITY, f32::min);
        let best_live = live
            .iter()
            .map(|h| self.normalized(h.score, h.tokens.len()))
            .fold(f32::NEG_INFINITY, f32::max);
        worst >= best_live
    }

    /// Best hypothesis by length-normalised score. Live beams count when too few finished.
    pub fn finish(mut self, live: Vec<Hypothesis<T>>) -> Option<Hypothesis<T>> {
        if self.finished.len() < self.width {
            for h in live {
                self.add_finished(h);
            }
        }
        self.finished
            .into_iter()
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal))
            .map(|(_, h)| h)
    }

    fn add_finished(&mut self, hyp: Hypothesis<T>) {
        let norm = self.normalized(hyp.score, hyp.tokens.len());
        self.finished.push((norm, hyp));
        if self.finished.len() > self.width {
            let worst = self
                .finished
                .iter()
                .enumerate()
                .min_by(|a, b| a.1 .0.total_cmp(&b.1 .0))
                .map(|(i, _)| i);
            if let Some(i) = worst {
                self.finished.swap_remove(i);
            }
        }
    }
}

pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![f32::NEG_INFINITY; logits.len()];
    }
    let sum: f32 = logits.iter().map(|&x| (x - max).exp()).sum();
    let log_z = max + sum.ln();
    logits.iter().map(|&x| x - log_z).collect()
}

/// Indices and values of the `k` largest entries, best first.
pub fn top_k(values: &[f32], k: usize) -> Vec<(usize, f32)> {
    let k = k.min(values.len());
    if k == 0 {
        return Vec::new();
    }
    let mut idx: Vec<usize> = (0..values.len()).collect();
    let desc = |a: &usize, b: &usize| values[*b].total_cmp(&values[*a]);
    idx.select_nth_unstable_by(k - 1, desc);
    idx.truncate(k);
    idx.sort_by(desc);
    idx.into_iter().map(|i| (i, values[i])).collect()
}
