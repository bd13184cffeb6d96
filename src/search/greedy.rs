// src/search/greedy.rs - Steepest-descent hill climbing over adjacent closures

use async_trait::async_trait;

use super::space::Configuration;
use super::{SearchContext, SearchOutcome, SearchStrategy};
use crate::evaluator::{Evaluation, FitnessTransform};
use crate::infra::errors::SearchError;

/// Repeatedly closes the single adjacent segment that lowers the objective
/// most, until no adjacent closure strictly improves on the current state.
#[derive(Debug, Default)]
pub struct GreedySearch {
    start: Option<Configuration>,
}

impl GreedySearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from `config` instead of the baseline.
    pub fn starting_from(config: Configuration) -> Self {
        Self {
            start: Some(config),
        }
    }
}

#[async_trait]
impl SearchStrategy for GreedySearch {
    fn name(&self) -> &'static str {
        "greedy"
    }

    async fn search(&mut self, ctx: &SearchContext<'_>) -> Result<SearchOutcome, SearchError> {
        let session = ctx.primary()?;
        let evaluations_before = ctx.evaluator.evaluations();
        let transform = FitnessTransform::Reciprocal;

        let mut current = self.start.clone().unwrap_or_else(|| ctx.space.root());
        if !ctx.space.is_admissible(&current) {
            return Err(SearchError::Invariant(format!(
                "greedy start {current} violates the baseline or forbidden set"
            )));
        }
        let mut current_objective = ctx.evaluator.score(session, &current, transform).await?.objective;
        tracing::info!(objective = current_objective, closed = current.len(), "Greedy start");

        let mut rounds = 0;
        loop {
            let candidates = ctx.evaluator.adjacent(session, &current, ctx.space).await?;
            rounds += 1;
            if candidates.is_empty() {
                tracing::info!(round = rounds, "No adjacent segments left to close");
                break;
            }

            let mut best: Option<(Configuration, Evaluation)> = None;
            for segment in candidates {
                let candidate = current.with(segment);
                let evaluation = ctx.evaluator.score(session, &candidate, transform).await?;
                tracing::debug!(segment, objective = evaluation.objective, "Greedy candidate");
                // Strict comparison: the first of equally good candidates wins.
                if best
                    .as_ref()
                    .map_or(true, |(_, b)| evaluation.objective < b.objective)
                {
                    best = Some((candidate, evaluation));
                }
            }

            match best {
                Some((candidate, evaluation)) if evaluation.objective < current_objective => {
                    tracing::info!(
                        round = rounds,
                        objective = evaluation.objective,
                        closed = candidate.len(),
                        "Greedy step accepted"
                    );
                    current = candidate;
                    current_objective = evaluation.objective;
                }
                _ => {
                    tracing::info!(round = rounds, "No strictly improving neighbour");
                    break;
                }
            }
        }

        Ok(SearchOutcome {
            strategy: self.name(),
            configuration: current,
            objective: current_objective,
            iterations: rounds,
            evaluations: ctx.evaluator.evaluations() - evaluations_before,
        })
    }
}
