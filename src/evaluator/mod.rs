// src/evaluator/mod.rs - Configuration scoring through an oracle session

pub mod batch;
pub mod fitness;

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use crate::infra::config::OracleConfig;
use crate::infra::errors::{EvaluationError, OracleError};
use crate::oracle::protocol::{CommandKind, Parameter, ReplyStatus};
use crate::oracle::Session;
use crate::search::space::{Configuration, SegmentSpace};
pub use fitness::{Evaluation, FitnessTransform};

/// Runs one simulation per configuration and reads back the objective.
///
/// Each evaluation holds the session lane for its whole reload, step and
/// expression sequence. Evaluations on different sessions run concurrently.
#[derive(Debug)]
pub struct Evaluator {
    horizon_ticks: u32,
    synchronous_step: bool,
    objective_expr: String,
    adjacency_expr: String,
    closed_roads_param: String,
    run_id_param: Option<String>,
    evaluations: AtomicUsize,
    failures: AtomicUsize,
}

impl Evaluator {
    pub fn new(config: &OracleConfig) -> Self {
        Self {
            horizon_ticks: config.horizon_ticks,
            synchronous_step: config.synchronous_step,
            objective_expr: config.objective_expr.clone(),
            adjacency_expr: config.adjacency_expr.clone(),
            closed_roads_param: config.closed_roads_param.clone(),
            run_id_param: config.run_id_param.clone(),
            evaluations: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Simulation runs attempted so far.
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// Runs that were scored as worst instead of failing the search.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Experiment parameters describing `config`, plus a fresh run id.
    pub fn parameters(&self, config: &Configuration) -> Vec<Parameter> {
        let mut params = vec![Parameter::int_list(&self.closed_roads_param, config.iter())];
        if let Some(ref name) = self.run_id_param {
            params.push(Parameter::string(name, uuid::Uuid::new_v4().to_string()));
        }
        params
    }

    /// Raw objective for `config`: reload, run the horizon, read the expression.
    pub async fn objective(
        &self,
        session: &Session,
        config: &Configuration,
    ) -> Result<f64, EvaluationError> {
        if session.is_lost() {
            return Err(OracleError::Connection(format!("session {} is lost", session.id())).into());
        }

        let lane = session.acquire().await;
        let status = lane.reload(self.parameters(config)).await?;
        require_success(CommandKind::Reload, status)?;
        let status = lane.step(self.horizon_ticks, self.synchronous_step).await?;
        require_success(CommandKind::Step, status)?;
        let value = lane.expression(&self.objective_expr).await?;
        drop(lane);

        parse_objective(&self.objective_expr, &value)
    }

    /// Objective and fitness for `config`. Channel failures mark the session lost.
    pub async fn evaluate(
        &self,
        session: &Session,
        config: &Configuration,
        transform: FitnessTransform,
    ) -> Result<Evaluation, EvaluationError> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        match self.objective(session, config).await {
            Ok(objective) => {
                tracing::debug!(session = %session.id(), closed = config.len(), objective, "Evaluated");
                Ok(Evaluation::scored(objective, transform))
            }
            Err(e) => {
                if !e.is_recoverable() {
                    session.mark_lost();
                }
                Err(e)
            }
        }
    }

    /// Like [`evaluate`](Self::evaluate), but a candidate-level failure yields
    /// the sentinel worst evaluation instead of an error.
    pub async fn score(
        &self,
        session: &Session,
        config: &Configuration,
        transform: FitnessTransform,
    ) -> Result<Evaluation, EvaluationError> {
        match self.evaluate(session, config, transform).await {
            Err(e) if e.is_recoverable() => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session = %session.id(),
                    closed = config.len(),
                    "Candidate scored as worst: {}",
                    e
                );
                Ok(Evaluation::failed(transform))
            }
            other => other,
        }
    }

    /// Segments the oracle reports as adjacent to `config`, restricted to
    /// legal actions in `space`.
    pub async fn adjacent(
        &self,
        session: &Session,
        config: &Configuration,
        space: &SegmentSpace,
    ) -> Result<Vec<usize>, EvaluationError> {
        let expr = self.adjacency_expr.replace("{closed}", &config.to_string());
        let value = {
            let lane = session.acquire().await;
            lane.expression(&expr).await
        };
        let value = value.map_err(|e| {
            if e.is_session_fatal() {
                session.mark_lost();
            }
            EvaluationError::from(e)
        })?;

        let candidates = parse_segments(&value)?;
        Ok(space.legal_actions(config, candidates))
    }
}

fn require_success(kind: CommandKind, status: ReplyStatus) -> Result<(), OracleError> {
    if status == ReplyStatus::CommandExecutedSuccessfully {
        Ok(())
    } else {
        Err(OracleError::CommandFailed {
            kind,
            status,
            message: format!("{kind} was not executed"),
        })
    }
}

/// Accepts a JSON number or a numeric string; must be finite and >= 0.
pub(crate) fn parse_objective(expr: &str, value: &Value) -> Result<f64, EvaluationError> {
    let number = match value {
        Value::Null => None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(x) => Some(x),
            Err(_) => {
                return Err(EvaluationError::NonNumericObjective {
                    expr: expr.to_string(),
                    content: s.clone(),
                })
            }
        },
        _ => {
            return Err(EvaluationError::NonNumericObjective {
                expr: expr.to_string(),
                content: value.to_string(),
            })
        }
    };

    match number {
        None => Err(EvaluationError::MissingObjective {
            expr: expr.to_string(),
        }),
        Some(x) if x.is_finite() && x >= 0.0 => Ok(x),
        Some(_) => Err(EvaluationError::NonNumericObjective {
            expr: expr.to_string(),
            content: value.to_string(),
        }),
    }
}

/// Accepts a JSON array of ids, or a string holding one.
pub(crate) fn parse_segments(value: &Value) -> Result<Vec<usize>, EvaluationError> {
    let malformed = || EvaluationError::MalformedAdjacency {
        content: value.to_string(),
    };

    let decoded;
    let items = match value {
        Value::Array(items) => items,
        Value::String(s) => {
            decoded = serde_json::from_str::<Value>(s.trim()).map_err(|_| malformed())?;
            match &decoded {
                Value::Array(items) => items,
                _ => return Err(malformed()),
            }
        }
        _ => return Err(malformed()),
    };

    items
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(malformed)
        })
        .collect()
}
