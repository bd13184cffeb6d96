// src/search/genetic.rs - Generational genetic algorithm over closure masks

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;

use super::space::{Configuration, SegmentSpace};
use super::{rng_from_seed, SearchContext, SearchOutcome, SearchStrategy};
use crate::evaluator::{Evaluation, FitnessTransform};
use crate::infra::config::GeneticConfig;
use crate::infra::errors::SearchError;

/// A full-universe closure mask and its cached evaluation.
#[derive(Debug, Clone)]
pub struct Individual {
    pub chromosome: Vec<bool>,
    pub evaluation: Option<Evaluation>,
}

impl Individual {
    pub fn new(chromosome: Vec<bool>) -> Self {
        Self {
            chromosome,
            evaluation: None,
        }
    }

    /// Unevaluated individuals rank below everything.
    pub fn fitness(&self) -> f64 {
        self.evaluation.map_or(f64::NEG_INFINITY, |e| e.fitness)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationStats {
    pub generation: usize,
    pub best_fitness: f64,
    pub best_objective: f64,
    pub generations_without_improvement: usize,
}

/// Per-gene uniform crossover with a mutation share.
///
/// Each gene comes from the first parent with probability `p1`, from the
/// second with `p2`, and is random otherwise. The child is then forced back
/// into the admissible set.
pub fn mate<R: Rng>(
    first: &[bool],
    second: &[bool],
    p1: f64,
    p2: f64,
    space: &SegmentSpace,
    rng: &mut R,
) -> Vec<bool> {
    let mut child: Vec<bool> = first
        .iter()
        .zip(second)
        .map(|(&a, &b)| {
            let r: f64 = rng.gen();
            if r < p1 {
                a
            } else if r < p1 + p2 {
                b
            } else {
                rng.gen()
            }
        })
        .collect();
    space.enforce(&mut child);
    child
}

/// Generations-without-improvement after observing `best`.
pub fn stagnation(previous_best: Option<f64>, best: f64, margin: f64, stale: usize) -> usize {
    match previous_best {
        Some(prev) if (prev - best).abs() <= margin => stale + 1,
        _ => 0,
    }
}

pub struct GeneticSearch {
    config: GeneticConfig,
    rng: StdRng,
    history: Vec<GenerationStats>,
    converged: bool,
}

impl GeneticSearch {
    pub fn new(config: &GeneticConfig, seed: Option<u64>) -> Self {
        Self {
            config: config.clone(),
            rng: rng_from_seed(seed),
            history: Vec::new(),
            converged: false,
        }
    }

    /// One entry per evaluated generation of the last search.
    pub fn history(&self) -> &[GenerationStats] {
        &self.history
    }

    /// Whether the last search stopped on stagnation rather than the generation cap.
    pub fn converged(&self) -> bool {
        self.converged
    }

    fn initial_population(&mut self, space: &SegmentSpace) -> Vec<Individual> {
        (0..self.config.population_size)
            .map(|_| Individual::new(space.random_mask(&mut self.rng, self.config.init_closure_probability)))
            .collect()
    }

    async fn evaluate_missing(
        &self,
        ctx: &SearchContext<'_>,
        population: &mut [Individual],
    ) -> Result<(), SearchError> {
        let pending: Vec<usize> = population
            .iter()
            .enumerate()
            .filter(|(_, ind)| ind.evaluation.is_none())
            .map(|(i, _)| i)
            .collect();
        let configs: Vec<Configuration> = pending
            .iter()
            .map(|&i| ctx.space.configuration(&population[i].chromosome))
            .collect();

        let evaluations = ctx
            .evaluator
            .score_batch(ctx.sessions, &configs, FitnessTransform::Reciprocal)
            .await?;
        for (i, evaluation) in pending.into_iter().zip(evaluations) {
            population[i].evaluation = Some(evaluation);
        }
        Ok(())
    }

    /// Elites survive unchanged; the rest are children of the mating pool.
    fn next_generation(&mut self, ranked: &[Individual], space: &SegmentSpace) -> Vec<Individual> {
        let size = ranked.len();
        let elites = ((size as f64 * self.config.elite_fraction).floor() as usize).min(size);
        let pool = ((size as f64 * self.config.mating_fraction).floor() as usize).clamp(1, size);

        let mut next: Vec<Individual> = ranked[..elites].to_vec();
        while next.len() < size {
            let first = &ranked[self.rng.gen_range(0..pool)];
            let second = &ranked[self.rng.gen_range(0..pool)];
            let child = mate(
                &first.chromosome,
                &second.chromosome,
                self.config.parent_one_probability,
                self.config.parent_two_probability,
                space,
                &mut self.rng,
            );
            next.push(Individual::new(child));
        }
        next
    }
}

#[async_trait]
impl SearchStrategy for GeneticSearch {
    fn name(&self) -> &'static str {
        "genetic"
    }

    async fn search(&mut self, ctx: &SearchContext<'_>) -> Result<SearchOutcome, SearchError> {
        if self.config.population_size == 0 {
            return Err(SearchError::Config("genetic population is empty".into()));
        }
        let evaluations_before = ctx.evaluator.evaluations();
        self.history.clear();
        self.converged = false;

        let mut population = self.initial_population(ctx.space);
        let mut previous_best: Option<f64> = None;
        let mut stale = 0;
        let mut generation = 0;

        loop {
            generation += 1;
            self.evaluate_missing(ctx, &mut population).await?;
            population.sort_by(|a, b| b.fitness().total_cmp(&a.fitness()));

            let leader = population
                .first()
                .and_then(|best| best.evaluation)
                .ok_or_else(|| SearchError::Invariant("best individual is unevaluated".into()))?;
            stale = stagnation(previous_best, leader.fitness, self.config.convergence_margin, stale);
            self.history.push(GenerationStats {
                generation,
                best_fitness: leader.fitness,
                best_objective: leader.objective,
                generations_without_improvement: stale,
            });
            tracing::info!(
                generation,
                best_objective = leader.objective,
                stale,
                "Generation evaluated"
            );

            if stale >= self.config.patience {
                self.converged = true;
                break;
            }
            if generation >= self.config.max_generations {
                tracing::warn!(generation, "Generation cap reached before convergence");
                break;
            }
            previous_best = Some(leader.fitness);
            population = self.next_generation(&population, ctx.space);
        }

        let best = population
            .first()
            .ok_or_else(|| SearchError::Invariant("population died out".into()))?;
        let objective = best.evaluation.map_or(f64::INFINITY, |e| e.objective);
        Ok(SearchOutcome {
            strategy: self.name(),
            configuration: ctx.space.configuration(&best.chromosome),
            objective,
            iterations: generation,
            evaluations: ctx.evaluator.evaluations() - evaluations_before,
        })
    }
}
