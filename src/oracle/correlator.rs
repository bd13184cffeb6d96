// src/oracle/correlator.rs - Match asynchronous oracle replies to pending calls
//
// Every call registers a single-assignment slot keyed by request id *before*
// the request is handed to the channel, so a fast reply can never race its
// own registration. Inbound messages are routed by the echoed command
// (kind + session + request id). A reply nobody is waiting for is a protocol
// error, never silently dropped. Closing the channel fails every pending call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::protocol::*;
use crate::infra::errors::OracleError;

type Slot = oneshot::Sender<Result<OracleReply, OracleError>>;

struct PendingCall {
    kind: CommandKind,
    session: Option<SessionId>,
    slot: Slot,
}

impl PendingCall {
    /// An echo without a session id only identifies session-less calls.
    fn answers(&self, key: &CorrelationKey) -> bool {
        self.kind == key.kind && self.session == key.session
    }
}

#[derive(Default)]
struct PendingTable {
    calls: HashMap<u64, PendingCall>,
    /// Sessions named by a reply nobody was waiting for.
    faulted: HashSet<SessionId>,
    closed: Option<String>,
}

/// Owns the pending-call table for one oracle channel.
pub struct Correlator {
    outbound: mpsc::UnboundedSender<Request>,
    table: Mutex<PendingTable>,
    next_request_id: AtomicU64,
    call_timeout: Duration,
}

impl Correlator {
    pub fn new(outbound: mpsc::UnboundedSender<Request>, call_timeout: Duration) -> Self {
        Self {
            outbound,
            table: Mutex::new(PendingTable::default()),
            next_request_id: AtomicU64::new(1),
            call_timeout,
        }
    }

    /// Create a correlator together with the receiving end of its outbound queue.
    pub fn channel(call_timeout: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<Request>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(tx, call_timeout)), rx)
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.table().calls.len()
    }

    /// True once a stray reply named this session, whether or not it had calls pending.
    pub fn is_faulted(&self, session: &SessionId) -> bool {
        self.table().faulted.contains(session)
    }

    pub fn is_closed(&self) -> bool {
        self.table().closed.is_some() || self.outbound.is_closed()
    }

    // ─── Oracle operations ──────────────────────────────────────────────

    /// Instantiate an experiment and return its session id.
    pub async fn load(
        &self,
        model: &ModelRef,
        parameters: Vec<Parameter>,
    ) -> Result<SessionId, OracleError> {
        let reply = self
            .call(Command::Load {
                model: model.path.clone(),
                experiment: model.experiment.clone(),
                parameters,
            })
            .await?;
        let reply = ensure_success(CommandKind::Load, reply)?;

        match reply.content {
            Value::String(s) if !s.is_empty() => Ok(SessionId::new(s)),
            Value::Number(n) => Ok(SessionId::new(n.to_string())),
            other => Err(OracleError::Protocol(format!(
                "load reply carries no experiment id: {other}"
            ))),
        }
    }

    pub async fn reload(
        &self,
        session: &SessionId,
        parameters: Vec<Parameter>,
    ) -> Result<ReplyStatus, OracleError> {
        let reply = self
            .call(Command::Reload {
                exp_id: session.clone(),
                parameters,
            })
            .await?;
        Ok(reply.status)
    }

    pub async fn step(
        &self,
        session: &SessionId,
        ticks: u32,
        synchronous: bool,
    ) -> Result<ReplyStatus, OracleError> {
        let reply = self
            .call(Command::Step {
                exp_id: session.clone(),
                nb_step: ticks,
                sync: synchronous,
            })
            .await?;
        Ok(reply.status)
    }

    /// Evaluate an expression in the session; non-success replies are errors.
    pub async fn expression(&self, session: &SessionId, expr: &str) -> Result<Value, OracleError> {
        let reply = self
            .call(Command::Expression {
                exp_id: session.clone(),
                expr: expr.to_string(),
            })
            .await?;
        Ok(ensure_success(CommandKind::Expression, reply)?.content)
    }

    pub async fn stop(&self, session: &SessionId) -> Result<ReplyStatus, OracleError> {
        let reply = self
            .call(Command::Stop {
                exp_id: session.clone(),
            })
            .await?;
        Ok(reply.status)
    }

    // ─── Inbound side ───────────────────────────────────────────────────

    /// Route one inbound message to the call it answers.
    ///
    /// Returns `Protocol` when nothing is waiting for the message. If the
    /// stray reply names a session, that session is marked faulted and its
    /// pending calls are failed with the same error; other sessions are
    /// untouched.
    pub fn dispatch(&self, message: OracleMessage) -> Result<(), OracleError> {
        let Some(echo) = message.command else {
            tracing::debug!(status = ?message.status, "Ignoring oracle notification");
            return Ok(());
        };
        let key = echo.key();

        let resolved = {
            let mut table = self.table();
            find_pending(&table.calls, &key).and_then(|id| table.calls.remove(&id))
        };

        match resolved {
            Some(call) => {
                tracing::debug!(reply = %key, status = ?message.status, "Resolved oracle call");
                // The caller may have timed out in the meantime; nothing to do then.
                let _ = call.slot.send(Ok(OracleReply {
                    status: message.status,
                    content: message.content,
                }));
                Ok(())
            }
            None => {
                let err = OracleError::Protocol(format!("reply {key} matches no pending call"));
                if let Some(ref session) = key.session {
                    self.table().faulted.insert(session.clone());
                    let failed = self.fail_session(session, err.clone());
                    tracing::error!(session = %session, failed, "Failing session after stray reply");
                }
                Err(err)
            }
        }
    }

    /// Fail every pending call of one session. Returns how many were failed.
    pub fn fail_session(&self, session: &SessionId, error: OracleError) -> usize {
        let failed: Vec<PendingCall> = {
            let mut table = self.table();
            let ids: Vec<u64> = table
                .calls
                .iter()
                .filter(|(_, c)| c.session.as_ref() == Some(session))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| table.calls.remove(&id))
                .collect()
        };
        let count = failed.len();
        for call in failed {
            let _ = call.slot.send(Err(error.clone()));
        }
        count
    }

    /// Fail a single pending call, e.g. one whose request could not be sent.
    pub fn fail_request(&self, request_id: u64, error: OracleError) -> bool {
        let call = self.table().calls.remove(&request_id);
        match call {
            Some(call) => {
                let _ = call.slot.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Mark the channel lost and fail every pending call with `Connection`.
    pub fn close(&self, reason: &str) {
        let drained: Vec<PendingCall> = {
            let mut table = self.table();
            table.closed.get_or_insert_with(|| reason.to_string());
            table.calls.drain().map(|(_, c)| c).collect()
        };
        if !drained.is_empty() {
            tracing::warn!(pending = drained.len(), "Oracle channel closed: {}", reason);
        }
        for call in drained {
            let _ = call
                .slot
                .send(Err(OracleError::Connection(reason.to_string())));
        }
    }

    // ─── Internals ──────────────────────────────────────────────────────

    async fn call(&self, command: Command) -> Result<OracleReply, OracleError> {
        let kind = command.kind();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let slot = self.register(request_id, &command)?;

        let request = Request {
            command,
            request_id,
        };
        tracing::debug!(request = %request.key(), "Sending oracle request");
        if self.outbound.send(request).is_err() {
            self.forget(request_id);
            return Err(OracleError::Connection("oracle channel is not open".into()));
        }

        match tokio::time::timeout(self.call_timeout, slot).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OracleError::Connection(
                "pending call was dropped before it resolved".into(),
            )),
            Err(_) => {
                self.forget(request_id);
                let after_ms = self.call_timeout.as_millis() as u64;
                tracing::warn!(request_id, kind = %kind, after_ms, "Oracle call timed out");
                Err(OracleError::Timeout { kind, after_ms })
            }
        }
    }

    fn register(
        &self,
        request_id: u64,
        command: &Command,
    ) -> Result<oneshot::Receiver<Result<OracleReply, OracleError>>, OracleError> {
        let kind = command.kind();
        let session = command.session().cloned();
        let mut table = self.table();

        if let Some(ref reason) = table.closed {
            return Err(OracleError::Connection(reason.clone()));
        }
        if let Some(ref s) = session {
            let busy = table
                .calls
                .values()
                .any(|c| c.kind == kind && c.session.as_ref() == Some(s));
            if busy {
                return Err(OracleError::Protocol(format!(
                    "'{kind}' is already pending on session {s}"
                )));
            }
        }

        let (tx, rx) = oneshot::channel();
        table.calls.insert(
            request_id,
            PendingCall {
                kind,
                session,
                slot: tx,
            },
        );
        Ok(rx)
    }

    fn forget(&self, request_id: u64) {
        self.table().calls.remove(&request_id);
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Locate the pending call a reply answers.
///
/// With a request id the match is exact (and must agree on kind and session).
/// Without one, the reply is accepted only if exactly one call of that kind is
/// pending for the echoed session.
fn find_pending(calls: &HashMap<u64, PendingCall>, key: &CorrelationKey) -> Option<u64> {
    match key.request_id {
        Some(id) => calls
            .get(&id)
            .filter(|call| call.answers(key))
            .map(|_| id),
        None => {
            let mut matching = calls
                .iter()
                .filter(|(_, call)| call.answers(key))
                .map(|(id, _)| *id);
            let first = matching.next();
            if matching.next().is_some() {
                None
            } else {
                first
            }
        }
    }
}

fn ensure_success(kind: CommandKind, reply: OracleReply) -> Result<OracleReply, OracleError> {
    if reply.is_success() {
        Ok(reply)
    } else {
        Err(OracleError::CommandFailed {
            kind,
            status: reply.status,
            message: reply.content_text(),
        })
    }
}
