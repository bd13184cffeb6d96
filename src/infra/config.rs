// src/infra/config.rs - Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::infra::errors::SearchError;

/// Roads closed in the reference pedestrian-zone plan; every configuration keeps them.
pub const DEFAULT_BASELINE: [usize; 34] = [
    10, 11, 82, 132, 133, 158, 201, 202, 203, 271, 274, 276, 277, 279, 292, 302, 303, 304, 305,
    306, 307, 308, 309, 310, 311, 344, 425, 426, 427, 428, 540, 583, 585, 640,
];

/// Road segments in the reference model.
pub const DEFAULT_UNIVERSE: usize = 643;

/// One simulated weekend at 15 s per tick, plus two warm-up ticks.
pub const DEFAULT_HORIZON_TICKS: u32 = 11_520 + 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Seed for every random draw in the search; entropy when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub oracle: OracleConfig,

    #[serde(default)]
    pub space: SpaceConfig,

    #[serde(default)]
    pub mcts: MctsConfig,

    #[serde(default)]
    pub genetic: GeneticConfig,

    #[serde(default)]
    pub pso: PsoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub address: String,
    pub model_path: String,
    pub experiment: String,
    /// Upper bound on a single oracle round-trip. Steps are slow.
    pub call_timeout_secs: u64,
    pub horizon_ticks: u32,
    pub synchronous_step: bool,
    pub objective_expr: String,
    /// `{closed}` is replaced by the closed-segment list, e.g. `[1, 2]`.
    pub adjacency_expr: String,
    pub closed_roads_param: String,
    /// Name of a string parameter carrying a fresh run id on each reload.
    pub run_id_param: Option<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            address: "localhost:6868".into(),
            model_path: "models/HKAM.gaml".into(),
            experiment: "exp".into(),
            call_timeout_secs: 3_600,
            horizon_ticks: DEFAULT_HORIZON_TICKS,
            synchronous_step: true,
            objective_expr: "max_aqi".into(),
            adjacency_expr: "adjacent_roads({closed})".into(),
            closed_roads_param: "Closed roads".into(),
            run_id_param: Some("Id".into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    pub universe: usize,
    pub baseline: Vec<usize>,
    pub forbidden: Vec<usize>,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            universe: DEFAULT_UNIVERSE,
            baseline: DEFAULT_BASELINE.to_vec(),
            forbidden: Vec::new(),
        }
    }
}

/// Iteration count or wall-clock limit; exactly one may be given.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchBudget {
    Iterations(u32),
    TimeLimitSecs(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MctsConfig {
    pub exploration: f64,
    /// Closures added beyond the root before a state counts as terminal.
    pub max_closures: usize,
    pub budget: SearchBudget,
}

impl Default for MctsConfig {
    fn default() -> Self {
        Self {
            exploration: 1.4,
            max_closures: 10,
            budget: SearchBudget::Iterations(643),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneticConfig {
    pub population_size: usize,
    pub elite_fraction: f64,
    pub mating_fraction: f64,
    pub parent_one_probability: f64,
    pub parent_two_probability: f64,
    pub init_closure_probability: f64,
    pub convergence_margin: f64,
    pub patience: usize,
    pub max_generations: usize,
    /// Oracle sessions used to evaluate a generation in parallel.
    pub sessions: usize,
}

impl Default for GeneticConfig {
    fn default() -> Self {
        Self {
            population_size: 1_000,
            elite_fraction: 0.10,
            mating_fraction: 0.90,
            parent_one_probability: 0.45,
            parent_two_probability: 0.45,
            init_closure_probability: 0.5,
            convergence_margin: 1e-4,
            patience: 10,
            max_generations: 200,
            sessions: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsoConfig {
    pub swarm_size: usize,
    pub iterations: usize,
    pub w_start: f64,
    pub w_end: f64,
    pub c1: f64,
    pub c2: f64,
    pub init_closure_probability: f64,
}

impl Default for PsoConfig {
    fn default() -> Self {
        Self {
            swarm_size: 100,
            iterations: 1_000,
            w_start: 0.9,
            w_end: 0.2,
            c1: 2.0,
            c2: 2.0,
            init_closure_probability: 0.1,
        }
    }
}

fn probability(name: &str, p: f64) -> Result<(), SearchError> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(SearchError::Config(format!("{name} must be in [0, 1], got {p}")))
    }
}

impl Config {
    /// Load `$ROADOPT_CONFIG` or `./roadopt.toml`, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var_os("ROADOPT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("roadopt.toml"));
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Reject parameter combinations no strategy can run with.
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.oracle.call_timeout_secs == 0 {
            return Err(SearchError::Config("oracle.call_timeout_secs must be > 0".into()));
        }
        if !self.oracle.adjacency_expr.contains("{closed}") {
            return Err(SearchError::Config(
                "oracle.adjacency_expr must contain the {closed} placeholder".into(),
            ));
        }

        if self.mcts.exploration < 0.0 || !self.mcts.exploration.is_finite() {
            return Err(SearchError::Config("mcts.exploration must be >= 0".into()));
        }
        match self.mcts.budget {
            SearchBudget::Iterations(0) | SearchBudget::TimeLimitSecs(0) => {
                return Err(SearchError::Config("mcts.budget must be > 0".into()));
            }
            _ => {}
        }

        let g = &self.genetic;
        if g.population_size < 2 {
            return Err(SearchError::Config("genetic.population_size must be >= 2".into()));
        }
        probability("genetic.elite_fraction", g.elite_fraction)?;
        probability("genetic.mating_fraction", g.mating_fraction)?;
        probability("genetic.parent_one_probability", g.parent_one_probability)?;
        probability("genetic.parent_two_probability", g.parent_two_probability)?;
        probability("genetic.init_closure_probability", g.init_closure_probability)?;
        if g.parent_one_probability + g.parent_two_probability > 1.0 {
            return Err(SearchError::Config(
                "genetic parent probabilities must sum to at most 1".into(),
            ));
        }
        if g.patience == 0 || g.max_generations == 0 || g.sessions == 0 {
            return Err(SearchError::Config(
                "genetic.patience, max_generations and sessions must be > 0".into(),
            ));
        }

        let p = &self.pso;
        if p.swarm_size == 0 || p.iterations == 0 {
            return Err(SearchError::Config("pso.swarm_size and iterations must be > 0".into()));
        }
        probability("pso.init_closure_probability", p.init_closure_probability)?;

        Ok(())
    }
}
