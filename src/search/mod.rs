// src/search/mod.rs - Search strategies over road-closure configurations

pub mod genetic;
pub mod greedy;
pub mod mcts;
pub mod pso;
pub mod space;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::evaluator::Evaluator;
use crate::infra::errors::SearchError;
use crate::oracle::Session;
use space::{Configuration, SegmentSpace};

/// Everything a strategy needs to talk to the oracle.
pub struct SearchContext<'a> {
    pub evaluator: &'a Evaluator,
    pub space: &'a SegmentSpace,
    pub sessions: &'a [Session],
}

impl<'a> SearchContext<'a> {
    pub fn new(evaluator: &'a Evaluator, space: &'a SegmentSpace, sessions: &'a [Session]) -> Self {
        Self {
            evaluator,
            space,
            sessions,
        }
    }

    /// First session still usable; single-session strategies run on it.
    pub fn primary(&self) -> Result<&'a Session, SearchError> {
        self.sessions
            .iter()
            .find(|s| !s.is_lost())
            .ok_or(SearchError::AllSessionsLost {
                sessions: self.sessions.len(),
            })
    }
}

/// Best configuration a strategy found.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub strategy: &'static str,
    pub configuration: Configuration,
    pub objective: f64,
    /// Rounds, iterations or generations, depending on the strategy.
    pub iterations: usize,
    pub evaluations: usize,
}

#[async_trait]
pub trait SearchStrategy: Send {
    fn name(&self) -> &'static str;

    async fn search(&mut self, ctx: &SearchContext<'_>) -> Result<SearchOutcome, SearchError>;
}

/// Seeded when a seed is given, otherwise from OS entropy.
pub fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}
