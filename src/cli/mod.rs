// src/cli/mod.rs - CLI definition (clap derive)

pub mod run;

use clap::{Parser, Subcommand};

use crate::infra::config::{Config, SearchBudget};

#[derive(Parser)]
#[command(
    name = "roadopt",
    about = "Search road-closure plans that lower peak air-quality index",
    version
)]
pub struct Cli {
    /// Config file path (default: $ROADOPT_CONFIG or ./roadopt.toml)
    #[arg(long)]
    pub config: Option<String>,

    /// Oracle address, host:port
    #[arg(long)]
    pub address: Option<String>,

    /// Seed for reproducible runs
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Show log targets and thread ids
    #[arg(short, long)]
    pub verbose: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Steepest-descent closure of adjacent segments
    Greedy,
    /// Monte-Carlo tree search
    Mcts {
        /// Iteration budget
        #[arg(long, conflicts_with = "time_limit")]
        iterations: Option<u32>,
        /// Wall-clock budget in seconds
        #[arg(long)]
        time_limit: Option<u64>,
        /// UCT exploration constant
        #[arg(short = 'c', long)]
        exploration: Option<f64>,
        /// Closures beyond the baseline before a state is terminal
        #[arg(long)]
        max_closures: Option<usize>,
    },
    /// Generational genetic algorithm
    Genetic {
        #[arg(long)]
        population: Option<usize>,
        /// Oracle sessions evaluating in parallel
        #[arg(long)]
        sessions: Option<usize>,
        #[arg(long)]
        patience: Option<usize>,
    },
    /// Binary particle swarm on one session
    Pso {
        #[arg(long)]
        swarm: Option<usize>,
        #[arg(long)]
        iterations: Option<usize>,
    },
    /// Binary particle swarm, one session per particle
    PsoParallel {
        #[arg(long)]
        swarm: Option<usize>,
        #[arg(long)]
        iterations: Option<usize>,
    },
}

/// Strategy selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Greedy,
    Mcts,
    Genetic,
    Pso,
    PsoParallel,
}

impl Commands {
    pub fn strategy(&self) -> StrategyKind {
        match self {
            Commands::Greedy => StrategyKind::Greedy,
            Commands::Mcts { .. } => StrategyKind::Mcts,
            Commands::Genetic { .. } => StrategyKind::Genetic,
            Commands::Pso { .. } => StrategyKind::Pso,
            Commands::PsoParallel { .. } => StrategyKind::PsoParallel,
        }
    }
}

impl Cli {
    /// Command-line flags take precedence over the config file.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref address) = self.address {
            config.oracle.address = address.clone();
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }

        match self.command {
            Commands::Greedy => {}
            Commands::Mcts {
                iterations,
                time_limit,
                exploration,
                max_closures,
            } => {
                if let Some(n) = iterations {
                    config.mcts.budget = SearchBudget::Iterations(n);
                }
                if let Some(secs) = time_limit {
                    config.mcts.budget = SearchBudget::TimeLimitSecs(secs);
                }
                if let Some(c) = exploration {
                    config.mcts.exploration = c;
                }
                if let Some(m) = max_closures {
                    config.mcts.max_closures = m;
                }
            }
            Commands::Genetic {
                population,
                sessions,
                patience,
            } => {
                if let Some(p) = population {
                    config.genetic.population_size = p;
                }
                if let Some(s) = sessions {
                    config.genetic.sessions = s;
                }
                if let Some(p) = patience {
                    config.genetic.patience = p;
                }
            }
            Commands::Pso { swarm, iterations } | Commands::PsoParallel { swarm, iterations } => {
                if let Some(s) = swarm {
                    config.pso.swarm_size = s;
                }
                if let Some(n) = iterations {
                    config.pso.iterations = n;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strategy_subcommands() {
        let cli = Cli::try_parse_from(["roadopt", "--seed", "4", "pso-parallel", "--swarm", "8"])
            .unwrap();
        assert_eq!(cli.command.strategy(), StrategyKind::PsoParallel);
        assert_eq!(cli.seed, Some(4));

        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.pso.swarm_size, 8);
        assert_eq!(config.seed, Some(4));
    }

    #[test]
    fn test_mcts_time_limit_override() {
        let cli = Cli::try_parse_from(["roadopt", "mcts", "--time-limit", "60", "-c", "2.0"]).unwrap();
        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.mcts.budget, SearchBudget::TimeLimitSecs(60));
        assert!((config.mcts.exploration - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_mcts_budgets_conflict() {
        let parsed = Cli::try_parse_from([
            "roadopt",
            "mcts",
            "--iterations",
            "5",
            "--time-limit",
            "60",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["roadopt"]).is_err());
    }
}
