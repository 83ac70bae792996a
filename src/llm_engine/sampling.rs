//! Per-request token selection
//!
//! Stage order is fixed: penalties, optional top-p, optional temperature,
//! then a greedy pick. The greedy stage makes the result deterministic for
//! a given history and logits vector.

use std::collections::HashMap;

use super::provider::CompletionRequest;
use super::runtime::Token;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Penalties { frequency: f32, presence: f32 },
    TopP(f32),
    Temperature(f32),
}

/// Candidate token with its current score. Stages mask candidates by
/// dropping them from the list.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    token: Token,
    logit: f32,
}

#[derive(Debug, Clone)]
pub struct SamplingPipeline {
    stages: Vec<Stage>,
    history: HashMap<Token, u32>,
}

impl SamplingPipeline {
    pub fn from_request(request: &CompletionRequest) -> Self {
        let mut stages = vec![Stage::Penalties {
            frequency: request.frequency_penalty.unwrap_or(0.0),
            presence: request.presence_penalty.unwrap_or(0.0),
        }];
        if let Some(p) = request.top_p {
            stages.push(Stage::TopP(p));
        }
        if let Some(t) = request.temperature {
            stages.push(Stage::Temperature(t));
        }
        Self {
            stages,
            history: HashMap::new(),
        }
    }

    /// Record a token as part of the sequence so penalties see it
    pub fn accept(&mut self, token: Token) {
        *self.history.entry(token).or_insert(0) += 1;
    }

    /// Pick the next token. `None` only for an empty logits vector.
    pub fn sample(&self, logits: &[f32]) -> Option<Token> {
        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| Candidate {
                token: i as Token,
                logit,
            })
            .collect();

        for stage in &self.stages {
            match *stage {
                Stage::Penalties { frequency, presence } => {
                    self.apply_penalties(&mut candidates, frequency, presence)
                }
                Stage::TopP(p) => apply_top_p(&mut candidates, p),
                Stage::Temperature(t) => apply_temperature(&mut candidates, t),
            }
        }

        greedy(&candidates)
    }

    fn apply_penalties(&self, candidates: &mut [Candidate], frequency: f32, presence: f32) {
        if frequency == 0.0 && presence == 0.0 {
            return;
        }
        for candidate in candidates.iter_mut() {
            if let Some(&count) = self.history.get(&candidate.token) {
                candidate.logit -= count as f32 * frequency + presence;
            }
        }
    }
}

/// Keep the smallest high-probability set whose mass reaches `p`, at
/// least one candidate.
fn apply_top_p(candidates: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 || candidates.len() <= 1 {
        return;
    }
    candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));

    let max = candidates[0].logit;
    let weights: Vec<f32> = candidates.iter().map(|c| (c.logit - max).exp()).collect();
    let total: f32 = weights.iter().sum();

    let mut cumulative = 0.0;
    let mut keep = candidates.len();
    for (i, w) in weights.iter().enumerate() {
        cumulative += w / total;
        if cumulative >= p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

/// Non-positive temperature collapses to the single best candidate
fn apply_temperature(candidates: &mut Vec<Candidate>, t: f32) {
    if t <= 0.0 {
        if let Some(best) = greedy_candidate(candidates) {
            candidates.clear();
            candidates.push(best);
        }
        return;
    }
    for candidate in candidates.iter_mut() {
        candidate.logit /= t;
    }
}

fn greedy_candidate(candidates: &[Candidate]) -> Option<Candidate> {
    candidates.iter().copied().reduce(|best, c| {
        if c.logit.total_cmp(&best.logit).is_gt() {
            c
        } else {
            best
        }
    })
}

fn greedy(candidates: &[Candidate]) -> Option<Token> {
    greedy_candidate(candidates).map(|c| c.token)
}
