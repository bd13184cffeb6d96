// src/search/pso.rs - Binary particle swarm optimisation
//
// Positions are closure masks. Each velocity component is pulled toward
// agreement with the particle's own best and the swarm's best; a bit is
// kept while its velocity is positive and flipped otherwise. The concurrent
// mode gives every particle its own oracle session and evaluates the swarm
// in parallel, with a barrier before the global best is updated.

use async_trait::async_trait;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::Rng;

use super::space::SegmentSpace;
use super::{rng_from_seed, SearchContext, SearchOutcome, SearchStrategy};
use crate::evaluator::{Evaluation, FitnessTransform};
use crate::infra::config::PsoConfig;
use crate::infra::errors::SearchError;

const TRANSFORM: FitnessTransform = FitnessTransform::Reciprocal;

#[derive(Debug, Clone)]
pub struct Particle {
    pub position: Vec<bool>,
    pub velocity: Vec<f64>,
    pub best_position: Vec<bool>,
    pub best: Evaluation,
}

impl Particle {
    pub fn new(position: Vec<bool>, velocity: Vec<f64>) -> Self {
        Self {
            best_position: position.clone(),
            position,
            velocity,
            best: Evaluation::failed(TRANSFORM),
        }
    }

    /// Adopt the current position as personal best if strictly fitter.
    pub fn record(&mut self, evaluation: Evaluation) -> bool {
        if evaluation.fitness > self.best.fitness {
            self.best = evaluation;
            self.best_position.clone_from(&self.position);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    pub inertia: f64,
    pub cognitive: f64,
    pub social: f64,
}

/// Inertia weight annealed linearly from `w_start` toward `w_end`.
pub fn inertia(iteration: usize, iterations: usize, w_start: f64, w_end: f64) -> f64 {
    if iterations == 0 {
        return w_start;
    }
    w_start - (w_start - w_end) * (iteration as f64 / iterations as f64)
}

/// Move one particle toward its personal best and the global best.
pub fn update_particle<R: Rng>(
    particle: &mut Particle,
    global_best: &[bool],
    coefficients: Coefficients,
    space: &SegmentSpace,
    rng: &mut R,
) {
    let agree = |a: bool, b: bool| if a == b { 1.0 } else { -1.0 };

    for d in 0..particle.position.len() {
        let r1: f64 = rng.gen();
        let r2: f64 = rng.gen();
        let here = particle.position[d];
        particle.velocity[d] = coefficients.inertia * particle.velocity[d]
            + r1 * coefficients.cognitive * agree(particle.best_position[d], here)
            + r2 * coefficients.social * agree(global_best[d], here);
    }
    for (bit, &v) in particle.position.iter_mut().zip(&particle.velocity) {
        if v <= 0.0 {
            *bit = !*bit;
        }
    }
    space.enforce(&mut particle.position);
}

/// Whether particles share one session or each own one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmMode {
    Sequential,
    Concurrent,
}

#[derive(Debug, Clone)]
struct GlobalBest {
    position: Vec<bool>,
    evaluation: Evaluation,
}

impl GlobalBest {
    fn offer(&mut self, position: &[bool], evaluation: Evaluation) {
        if evaluation.fitness > self.evaluation.fitness {
            self.position = position.to_vec();
            self.evaluation = evaluation;
        }
    }
}

pub struct SwarmSearch {
    config: PsoConfig,
    mode: SwarmMode,
    rng: StdRng,
}

impl SwarmSearch {
    pub fn new(config: &PsoConfig, mode: SwarmMode, seed: Option<u64>) -> Self {
        Self {
            config: config.clone(),
            mode,
            rng: rng_from_seed(seed),
        }
    }

    fn initial_swarm(&mut self, space: &SegmentSpace) -> Vec<Particle> {
        (0..self.config.swarm_size)
            .map(|_| {
                let position = space.random_mask(&mut self.rng, self.config.init_closure_probability);
                let velocity = (0..space.universe())
                    .map(|_| self.rng.gen_range(-1.0..1.0))
                    .collect();
                Particle::new(position, velocity)
            })
            .collect()
    }

    fn coefficients(&self, iteration: usize) -> Coefficients {
        Coefficients {
            inertia: inertia(
                iteration,
                self.config.iterations,
                self.config.w_start,
                self.config.w_end,
            ),
            cognitive: self.config.c1,
            social: self.config.c2,
        }
    }

    /// Evaluate `indices` of the swarm, each on its own session, and wait for all.
    async fn evaluate_concurrently(
        ctx: &SearchContext<'_>,
        swarm: &[Particle],
        indices: &[usize],
    ) -> Vec<(usize, Result<Evaluation, SearchError>)> {
        let jobs = indices.iter().map(|&i| {
            let config = ctx.space.configuration(&swarm[i].position);
            async move {
                let result = ctx
                    .evaluator
                    .score(&ctx.sessions[i], &config, TRANSFORM)
                    .await
                    .map_err(SearchError::from);
                (i, result)
            }
        });
        join_all(jobs).await
    }

    async fn run_sequential(
        &mut self,
        ctx: &SearchContext<'_>,
    ) -> Result<(GlobalBest, usize), SearchError> {
        let session = ctx.primary()?;
        let mut swarm = self.initial_swarm(ctx.space);

        for particle in swarm.iter_mut() {
            let config = ctx.space.configuration(&particle.position);
            let evaluation = ctx.evaluator.score(session, &config, TRANSFORM).await?;
            particle.record(evaluation);
        }
        let mut global = best_of(&swarm)?;

        for iteration in 0..self.config.iterations {
            let coefficients = self.coefficients(iteration);
            for particle in swarm.iter_mut() {
                update_particle(particle, &global.position, coefficients, ctx.space, &mut self.rng);
                let config = ctx.space.configuration(&particle.position);
                let evaluation = ctx.evaluator.score(session, &config, TRANSFORM).await?;
                particle.record(evaluation);
                global.offer(&particle.position, evaluation);
            }
            tracing::info!(
                iteration = iteration + 1,
                best_objective = global.evaluation.objective,
                "Swarm iteration"
            );
        }
        Ok((global, self.config.iterations))
    }

    async fn run_concurrent(
        &mut self,
        ctx: &SearchContext<'_>,
    ) -> Result<(GlobalBest, usize), SearchError> {
        if ctx.sessions.len() < self.config.swarm_size {
            return Err(SearchError::Config(format!(
                "concurrent swarm of {} needs as many sessions, got {}",
                self.config.swarm_size,
                ctx.sessions.len()
            )));
        }

        let mut swarm = self.initial_swarm(ctx.space);
        let mut alive: Vec<usize> = (0..swarm.len()).collect();

        let results = Self::evaluate_concurrently(ctx, &swarm, &alive).await;
        apply_results(&mut swarm, &mut alive, results)?;
        let mut global = best_of(&swarm)?;

        for iteration in 0..self.config.iterations {
            let coefficients = self.coefficients(iteration);
            for &i in &alive {
                update_particle(&mut swarm[i], &global.position, coefficients, ctx.space, &mut self.rng);
            }

            let results = Self::evaluate_concurrently(ctx, &swarm, &alive).await;
            apply_results(&mut swarm, &mut alive, results)?;
            for &i in &alive {
                global.offer(&swarm[i].best_position, swarm[i].best);
            }
            tracing::info!(
                iteration = iteration + 1,
                particles = alive.len(),
                best_objective = global.evaluation.objective,
                "Swarm iteration"
            );
        }
        Ok((global, self.config.iterations))
    }
}

/// Record results in personal bests; particles whose session failed are dropped.
fn apply_results(
    swarm: &mut [Particle],
    alive: &mut Vec<usize>,
    results: Vec<(usize, Result<Evaluation, SearchError>)>,
) -> Result<(), SearchError> {
    let before = alive.len();
    for (i, result) in results {
        match result {
            Ok(evaluation) => {
                swarm[i].record(evaluation);
            }
            Err(e) => {
                tracing::error!(particle = i, "Particle dropped: {}", e);
                alive.retain(|&p| p != i);
            }
        }
    }
    if alive.is_empty() {
        return Err(SearchError::AllSessionsLost { sessions: before });
    }
    Ok(())
}

fn best_of(swarm: &[Particle]) -> Result<GlobalBest, SearchError> {
    swarm
        .iter()
        .max_by(|a, b| a.best.fitness.total_cmp(&b.best.fitness))
        .map(|p| GlobalBest {
            position: p.best_position.clone(),
            evaluation: p.best,
        })
        .ok_or_else(|| SearchError::Config("swarm is empty".into()))
}

#[async_trait]
impl SearchStrategy for SwarmSearch {
    fn name(&self) -> &'static str {
        match self.mode {
            SwarmMode::Sequential => "pso",
            SwarmMode::Concurrent => "pso-parallel",
        }
    }

    async fn search(&mut self, ctx: &SearchContext<'_>) -> Result<SearchOutcome, SearchError> {
        let evaluations_before = ctx.evaluator.evaluations();
        let (global, iterations) = match self.mode {
            SwarmMode::Sequential => self.run_sequential(ctx).await?,
            SwarmMode::Concurrent => self.run_concurrent(ctx).await?,
        };

        Ok(SearchOutcome {
            strategy: self.name(),
            configuration: ctx.space.configuration(&global.position),
            objective: global.evaluation.objective,
            iterations,
            evaluations: ctx.evaluator.evaluations() - evaluations_before,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn space() -> SegmentSpace {
        SegmentSpace::new(6, [0], [5]).unwrap()
    }

    fn particle(velocity: f64) -> Particle {
        Particle::new(
            vec![true, false, true, false, true, false],
            vec![velocity; 6],
        )
    }

    #[test]
    fn test_inertia_anneals_linearly() {
        assert!((inertia(0, 10, 0.9, 0.2) - 0.9).abs() < 1e-12);
        assert!((inertia(5, 10, 0.9, 0.2) - 0.55).abs() < 1e-12);
        assert!(inertia(9, 10, 0.9, 0.2) > 0.2);
    }

    #[test]
    fn test_zero_coefficients_keep_zero_velocity() {
        let s = space();
        let mut rng = StdRng::seed_from_u64(1);
        let mut p = particle(0.0);
        let coefficients = Coefficients {
            inertia: 0.0,
            cognitive: 0.0,
            social: 0.0,
        };
        let global = p.position.clone();
        update_particle(&mut p, &global, coefficients, &s, &mut rng);
        assert!(p.velocity.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_pure_inertia_keeps_velocity() {
        let s = space();
        let mut rng = StdRng::seed_from_u64(2);
        let mut p = particle(0.7);
        let coefficients = Coefficients {
            inertia: 1.0,
            cognitive: 0.0,
            social: 0.0,
        };
        let global = vec![false; 6];
        update_particle(&mut p, &global, coefficients, &s, &mut rng);
        assert!(p.velocity.iter().all(|&v| (v - 0.7).abs() < 1e-12));
        // Positive velocity keeps every free bit.
        assert_eq!(p.position, vec![true, false, true, false, true, false]);
    }

    #[test]
    fn test_non_positive_velocity_flips_free_bits() {
        let s = space();
        let mut rng = StdRng::seed_from_u64(3);
        let mut p = particle(-0.5);
        let coefficients = Coefficients {
            inertia: 1.0,
            cognitive: 0.0,
            social: 0.0,
        };
        let global = p.position.clone();
        update_particle(&mut p, &global, coefficients, &s, &mut rng);
        assert_eq!(p.position, vec![true, true, false, true, false, false]);
    }

    #[test]
    fn test_update_never_sets_forbidden_or_clears_baseline() {
        let s = space();
        let mut rng = StdRng::seed_from_u64(4);
        let mut p = Particle::new(vec![false; 6], vec![0.0; 6]);
        let coefficients = Coefficients {
            inertia: 0.9,
            cognitive: 2.0,
            social: 2.0,
        };
        for _ in 0..100 {
            let global = s.random_mask(&mut rng, 0.5);
            update_particle(&mut p, &global, coefficients, &s, &mut rng);
            assert!(p.position[0]);
            assert!(!p.position[5]);
        }
    }

    #[test]
    fn test_record_requires_strict_improvement() {
        let mut p = particle(0.0);
        assert!(p.record(Evaluation { objective: 10.0, fitness: 0.1 }));
        p.position = vec![false; 6];
        assert!(!p.record(Evaluation { objective: 10.0, fitness: 0.1 }));
        assert_eq!(p.best_position, vec![true, false, true, false, true, false]);
    }

    #[test]
    fn test_apply_results_drops_failed_particles() {
        let mut swarm = vec![particle(0.0), particle(0.0)];
        let mut alive = vec![0, 1];
        let results = vec![
            (0, Ok(Evaluation { objective: 4.0, fitness: 0.25 })),
            (1, Err(SearchError::AllSessionsLost { sessions: 1 })),
        ];
        apply_results(&mut swarm, &mut alive, results).unwrap();
        assert_eq!(alive, vec![0]);
        assert_eq!(swarm[0].best.objective, 4.0);

        let results = vec![(0, Err(SearchError::Invariant("lost".into())))];
        assert!(matches!(
            apply_results(&mut swarm, &mut alive, results),
            Err(SearchError::AllSessionsLost { .. })
        ));
    }
}
