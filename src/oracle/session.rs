// src/oracle/session.rs - One oracle experiment, used one command at a time

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use super::correlator::Correlator;
use super::protocol::{ModelRef, Parameter, ReplyStatus, SessionId};
use crate::infra::errors::OracleError;

/// A loaded experiment on the oracle.
///
/// The oracle keeps simulation state per session, so a reload/step/expression
/// sequence must not interleave with another on the same session. Callers
/// take the [`SessionLane`] for the whole sequence.
pub struct Session {
    id: SessionId,
    correlator: Arc<Correlator>,
    lane: Mutex<()>,
    lost: AtomicBool,
}

impl Session {
    /// Load the model and wrap the returned experiment id.
    pub async fn open(
        correlator: Arc<Correlator>,
        model: &ModelRef,
        parameters: Vec<Parameter>,
    ) -> Result<Self, OracleError> {
        let id = correlator.load(model, parameters).await?;
        tracing::info!(session = %id, "Loaded {} ({})", model.path, model.experiment);
        Ok(Self {
            id,
            correlator,
            lane: Mutex::new(()),
            lost: AtomicBool::new(false),
        })
    }

    /// Load `count` sessions concurrently. If any load fails, the ones that
    /// succeeded are stopped and the first error is returned.
    pub async fn open_many(
        correlator: Arc<Correlator>,
        model: &ModelRef,
        parameters: Vec<Parameter>,
        count: usize,
    ) -> Result<Vec<Self>, OracleError> {
        let loads = (0..count).map(|_| Self::open(correlator.clone(), model, parameters.clone()));
        let results = join_all(loads).await;

        let mut sessions = Vec::with_capacity(count);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(sessions),
            Some(e) => {
                for session in &sessions {
                    let _ = session.stop().await;
                }
                Err(e)
            }
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Wait for exclusive use of the session.
    pub async fn acquire(&self) -> SessionLane<'_> {
        SessionLane {
            session: self,
            _guard: self.lane.lock().await,
        }
    }

    /// Set once a channel-level failure made this session unusable, either
    /// through one of its own calls or a stray reply naming it.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire) || self.correlator.is_faulted(&self.id)
    }

    pub fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            tracing::error!(session = %self.id, "Oracle session lost");
        }
    }

    /// End the experiment on the oracle.
    pub async fn stop(&self) -> Result<ReplyStatus, OracleError> {
        let _lane = self.lane.lock().await;
        self.correlator.stop(&self.id).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("lost", &self.is_lost())
            .finish()
    }
}

/// Exclusive access to a session for the duration of one command sequence.
pub struct SessionLane<'a> {
    session: &'a Session,
    _guard: MutexGuard<'a, ()>,
}

impl SessionLane<'_> {
    pub fn id(&self) -> &SessionId {
        &self.session.id
    }

    pub async fn reload(&self, parameters: Vec<Parameter>) -> Result<ReplyStatus, OracleError> {
        self.session.correlator.reload(&self.session.id, parameters).await
    }

    pub async fn step(&self, ticks: u32, synchronous: bool) -> Result<ReplyStatus, OracleError> {
        self.session.correlator.step(&self.session.id, ticks, synchronous).await
    }

    pub async fn expression(&self, expr: &str) -> Result<Value, OracleError> {
        self.session.correlator.expression(&self.session.id, expr).await
    }
}
