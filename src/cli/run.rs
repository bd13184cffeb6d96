// src/cli/run.rs - Driver: connect, open sessions, search, report

use std::time::{Duration, Instant};

use serde::Serialize;

use super::StrategyKind;
use crate::evaluator::Evaluator;
use crate::infra::config::Config;
use crate::infra::errors::SearchError;
use crate::oracle::protocol::ReplyStatus;
use crate::oracle::{ModelRef, OracleLink, Session};
use crate::search::genetic::GeneticSearch;
use crate::search::greedy::GreedySearch;
use crate::search::mcts::MctsSearch;
use crate::search::pso::{SwarmMode, SwarmSearch};
use crate::search::space::SegmentSpace;
use crate::search::{SearchContext, SearchOutcome, SearchStrategy};

/// Result of a full run, as printed.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(flatten)]
    pub outcome: SearchOutcome,
    pub failed_evaluations: usize,
    pub elapsed_secs: f64,
}

pub fn build_strategy(kind: StrategyKind, config: &Config) -> Box<dyn SearchStrategy> {
    match kind {
        StrategyKind::Greedy => Box::new(GreedySearch::new()),
        StrategyKind::Mcts => Box::new(MctsSearch::new(&config.mcts, config.seed)),
        StrategyKind::Genetic => Box::new(GeneticSearch::new(&config.genetic, config.seed)),
        StrategyKind::Pso => Box::new(SwarmSearch::new(&config.pso, SwarmMode::Sequential, config.seed)),
        StrategyKind::PsoParallel => {
            Box::new(SwarmSearch::new(&config.pso, SwarmMode::Concurrent, config.seed))
        }
    }
}

/// Oracle sessions a strategy runs on.
pub fn session_count(kind: StrategyKind, config: &Config) -> usize {
    match kind {
        StrategyKind::Greedy | StrategyKind::Mcts | StrategyKind::Pso => 1,
        StrategyKind::Genetic => config.genetic.sessions,
        StrategyKind::PsoParallel => config.pso.swarm_size,
    }
}

/// Send `stop` to every live session. Returns how many the oracle confirmed.
pub async fn stop_sessions(sessions: &[Session]) -> usize {
    let mut stopped = 0;
    for session in sessions.iter().filter(|s| !s.is_lost()) {
        match session.stop().await {
            Ok(ReplyStatus::CommandExecutedSuccessfully) => stopped += 1,
            Ok(status) => {
                tracing::warn!(session = %session.id(), ?status, "Oracle refused to stop session");
            }
            Err(e) => tracing::warn!(session = %session.id(), "Failed to stop session: {}", e),
        }
    }
    stopped
}

/// Run one strategy on already-open sessions, then stop them.
pub async fn run_on_sessions(
    strategy: &mut dyn SearchStrategy,
    evaluator: &Evaluator,
    space: &SegmentSpace,
    sessions: &[Session],
) -> Result<RunReport, SearchError> {
    let started = Instant::now();
    tracing::info!(strategy = strategy.name(), sessions = sessions.len(), "Search started");

    let ctx = SearchContext::new(evaluator, space, sessions);
    let result = strategy.search(&ctx).await;

    stop_sessions(sessions).await;

    let outcome = result?;
    let elapsed = started.elapsed();
    tracing::info!(
        strategy = outcome.strategy,
        objective = outcome.objective,
        evaluations = outcome.evaluations,
        elapsed_secs = elapsed.as_secs_f64(),
        "Search finished"
    );

    Ok(RunReport {
        outcome,
        failed_evaluations: evaluator.failures(),
        elapsed_secs: elapsed.as_secs_f64(),
    })
}

/// Connect to the oracle configured in `config` and run `kind` end to end.
pub async fn run_search(kind: StrategyKind, config: &Config) -> anyhow::Result<RunReport> {
    let space = SegmentSpace::from_config(&config.space)?;
    let evaluator = Evaluator::new(&config.oracle);
    let timeout = Duration::from_secs(config.oracle.call_timeout_secs);

    let mut link = OracleLink::connect(&config.oracle.address, timeout).await?;
    let model = ModelRef::new(&config.oracle.model_path, &config.oracle.experiment);
    let sessions = Session::open_many(
        link.correlator().clone(),
        &model,
        evaluator.parameters(&space.root()),
        session_count(kind, config),
    )
    .await?;

    let mut strategy = build_strategy(kind, config);
    let result = run_on_sessions(strategy.as_mut(), &evaluator, &space, &sessions).await;

    let faults = link.drain_faults();
    if !faults.is_empty() {
        tracing::warn!(count = faults.len(), "Oracle protocol faults during the run");
    }
    link.shutdown();

    Ok(result?)
}

pub fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let outcome = &report.outcome;
    println!("Strategy:      {}", outcome.strategy);
    println!("Objective:     {:.3}", outcome.objective);
    println!("Closed roads:  {} {}", outcome.configuration.len(), outcome.configuration);
    println!("Iterations:    {}", outcome.iterations);
    println!(
        "Evaluations:   {} ({} failed)",
        outcome.evaluations, report.failed_evaluations
    );
    println!("Elapsed:       {:.1}s", report.elapsed_secs);
    Ok(())
}
