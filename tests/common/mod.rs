// tests/common/mod.rs - In-process fake oracle for integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use roadopt::evaluator::Evaluator;
use roadopt::infra::config::OracleConfig;
use roadopt::oracle::protocol::{Command, OracleMessage, Parameter, ReplyStatus, Request};
use roadopt::oracle::{Correlator, ModelRef, Session};
use roadopt::search::space::{Configuration, SegmentSpace};
use roadopt::search::SearchContext;

pub type ObjectiveFn = Arc<dyn Fn(&[usize]) -> Option<f64> + Send + Sync>;
pub type AdjacencyFn = Arc<dyn Fn(&[usize]) -> Vec<usize> + Send + Sync>;

/// Answers oracle requests from closures over the closed-road list.
///
/// `max_aqi` is answered by the objective closure (`None` makes the oracle
/// reject the expression), `adjacent_roads([..])` by the adjacency closure.
/// Requests for silenced sessions never get a reply.
#[derive(Clone)]
pub struct FakeOracle {
    objective: ObjectiveFn,
    adjacency: AdjacencyFn,
    silent: HashSet<String>,
    refuse_stop: bool,
    log: Arc<Mutex<Vec<Request>>>,
}

impl FakeOracle {
    pub fn new(
        objective: impl Fn(&[usize]) -> Option<f64> + Send + Sync + 'static,
        adjacency: impl Fn(&[usize]) -> Vec<usize> + Send + Sync + 'static,
    ) -> Self {
        Self {
            objective: Arc::new(objective),
            adjacency: Arc::new(adjacency),
            silent: HashSet::new(),
            refuse_stop: false,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn silence(mut self, session: &str) -> Self {
        self.silent.insert(session.to_string());
        self
    }

    /// Answer every `stop` with a non-success status.
    pub fn refuse_stop(mut self) -> Self {
        self.refuse_stop = true;
        self
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    /// Closed-road lists sent with each reload.
    pub fn reloaded(&self) -> Vec<Vec<usize>> {
        self.requests()
            .iter()
            .filter_map(|r| match &r.command {
                Command::Reload { parameters, .. } => Some(closed_roads(parameters)),
                _ => None,
            })
            .collect()
    }

    pub fn spawn(&self, call_timeout: Duration) -> Arc<Correlator> {
        let (correlator, mut rx) = Correlator::channel(call_timeout);
        let oracle = self.clone();
        let target = correlator.clone();
        tokio::spawn(async move {
            let mut state: HashMap<String, Vec<usize>> = HashMap::new();
            let mut next_id = 0u64;
            while let Some(request) = rx.recv().await {
                oracle.log.lock().unwrap().push(request.clone());
                if let Some(reply) = oracle.handle(&mut state, &mut next_id, &request) {
                    let _ = target.dispatch(reply);
                }
            }
        });
        correlator
    }

    fn handle(
        &self,
        state: &mut HashMap<String, Vec<usize>>,
        next_id: &mut u64,
        request: &Request,
    ) -> Option<OracleMessage> {
        if let Some(session) = request.command.session() {
            if self.silent.contains(session.as_str()) {
                return None;
            }
        }

        let ok = |content: Value| {
            Some(OracleMessage::reply_to(
                request,
                ReplyStatus::CommandExecutedSuccessfully,
                content,
            ))
        };
        let reject = |content: Value| {
            Some(OracleMessage::reply_to(
                request,
                ReplyStatus::UnableToExecuteRequest,
                content,
            ))
        };

        match &request.command {
            Command::Load { parameters, .. } => {
                let id = next_id.to_string();
                *next_id += 1;
                state.insert(id.clone(), closed_roads(parameters));
                ok(json!(id))
            }
            Command::Reload { exp_id, parameters } => {
                state.insert(exp_id.as_str().to_string(), closed_roads(parameters));
                ok(Value::Null)
            }
            Command::Stop { .. } if self.refuse_stop => reject(json!("experiment busy")),
            Command::Step { .. } | Command::Stop { .. } => ok(Value::Null),
            Command::Expression { exp_id, expr } => {
                if expr == "max_aqi" {
                    let closed = state.get(exp_id.as_str()).cloned().unwrap_or_default();
                    match (self.objective)(&closed) {
                        Some(value) => ok(json!(value.to_string())),
                        None => reject(json!("nil")),
                    }
                } else if let Some(list) = expr
                    .strip_prefix("adjacent_roads(")
                    .and_then(|rest| rest.strip_suffix(')'))
                {
                    let closed: Vec<usize> = serde_json::from_str(list).unwrap();
                    ok(json!(format!("{:?}", (self.adjacency)(&closed))))
                } else {
                    reject(json!(format!("unknown expression {expr}")))
                }
            }
        }
    }
}

fn closed_roads(parameters: &[Parameter]) -> Vec<usize> {
    parameters
        .iter()
        .find(|p| p.name == "Closed roads")
        .and_then(|p| p.value.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_u64()).map(|v| v as usize).collect())
        .unwrap_or_default()
}

/// A wired-up evaluator, space and set of open sessions.
pub struct Harness {
    pub oracle: FakeOracle,
    pub correlator: Arc<Correlator>,
    pub evaluator: Evaluator,
    pub space: SegmentSpace,
    pub sessions: Vec<Session>,
}

impl Harness {
    pub async fn new(oracle: FakeOracle, space: SegmentSpace, sessions: usize) -> Self {
        Self::with_timeout(oracle, space, sessions, Duration::from_secs(5)).await
    }

    pub async fn with_timeout(
        oracle: FakeOracle,
        space: SegmentSpace,
        sessions: usize,
        call_timeout: Duration,
    ) -> Self {
        let correlator = oracle.spawn(call_timeout);
        let evaluator = Evaluator::new(&OracleConfig {
            horizon_ticks: 10,
            ..OracleConfig::default()
        });
        let sessions = Session::open_many(
            correlator.clone(),
            &ModelRef::new("models/test.gaml", "exp"),
            evaluator.parameters(&space.root()),
            sessions,
        )
        .await
        .unwrap();

        Self {
            oracle,
            correlator,
            evaluator,
            space,
            sessions,
        }
    }

    pub fn ctx(&self) -> SearchContext<'_> {
        SearchContext::new(&self.evaluator, &self.space, &self.sessions)
    }

    pub fn session(&self, id: &str) -> &Session {
        self.sessions.iter().find(|s| s.id().as_str() == id).unwrap()
    }

    /// Every reloaded configuration kept the baseline and avoided forbidden segments.
    pub fn assert_all_admissible(&self) {
        for closed in self.oracle.reloaded() {
            let config = Configuration::from_segments(closed.iter().copied());
            assert!(
                self.space.is_admissible(&config),
                "inadmissible configuration evaluated: {config}"
            );
        }
    }
}
