// src/oracle/protocol.rs - Oracle wire messages (JSON, one document per line)
//
// Requests carry the command kind, the session (`exp_id`) and a request id.
// Replies echo the originating command under `command`, which is what the
// correlator uses to find the pending call. Messages without an echo are
// unsolicited notifications from the oracle.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The five logical oracle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Load,
    Reload,
    Step,
    Expression,
    Stop,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandKind::Load => "load",
            CommandKind::Reload => "reload",
            CommandKind::Step => "step",
            CommandKind::Expression => "expression",
            CommandKind::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// Oracle-side experiment identifier returned by `load`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed experiment parameter, e.g. the list of closed roads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    #[serde(rename = "type")]
    pub ty: String,
    pub name: String,
    pub value: Value,
}

impl Parameter {
    pub fn int_list(name: impl Into<String>, values: impl IntoIterator<Item = usize>) -> Self {
        Self {
            ty: "list<int>".into(),
            name: name.into(),
            value: Value::Array(values.into_iter().map(Value::from).collect()),
        }
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            ty: "string".into(),
            name: name.into(),
            value: Value::String(value.into()),
        }
    }
}

/// Model file and experiment to instantiate with `load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub path: String,
    pub experiment: String,
}

impl ModelRef {
    pub fn new(path: impl Into<String>, experiment: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            experiment: experiment.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    Load {
        model: String,
        experiment: String,
        parameters: Vec<Parameter>,
    },
    Reload {
        exp_id: SessionId,
        parameters: Vec<Parameter>,
    },
    Step {
        exp_id: SessionId,
        nb_step: u32,
        sync: bool,
    },
    Expression {
        exp_id: SessionId,
        expr: String,
    },
    Stop {
        exp_id: SessionId,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Load { .. } => CommandKind::Load,
            Command::Reload { .. } => CommandKind::Reload,
            Command::Step { .. } => CommandKind::Step,
            Command::Expression { .. } => CommandKind::Expression,
            Command::Stop { .. } => CommandKind::Stop,
        }
    }

    /// The session a command targets; `None` for `load`, which creates one.
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            Command::Load { .. } => None,
            Command::Reload { exp_id, .. }
            | Command::Step { exp_id, .. }
            | Command::Expression { exp_id, .. }
            | Command::Stop { exp_id } => Some(exp_id),
        }
    }
}

/// An outbound request as written to the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(flatten)]
    pub command: Command,
    pub request_id: u64,
}

impl Request {
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey {
            kind: self.command.kind(),
            session: self.command.session().cloned(),
            request_id: Some(self.request_id),
        }
    }
}

/// Status tag of an oracle reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    CommandExecutedSuccessfully,
    UnableToExecuteRequest,
    MalformedRequest,
    GamaServerError,
    RuntimeError,
    SimulationStatus,
    SimulationOutput,
    #[serde(other)]
    Unknown,
}

/// The part of a reply that identifies the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEcho {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

impl CommandEcho {
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey {
            kind: self.kind,
            session: self.exp_id.clone(),
            request_id: self.request_id,
        }
    }
}

/// Any inbound message from the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleMessage {
    #[serde(rename = "type")]
    pub status: ReplyStatus,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandEcho>,
}

impl OracleMessage {
    /// Build the reply an oracle would send for `request`.
    pub fn reply_to(request: &Request, status: ReplyStatus, content: Value) -> Self {
        Self {
            status,
            content,
            command: Some(CommandEcho {
                kind: request.command.kind(),
                exp_id: request.command.session().cloned(),
                request_id: Some(request.request_id),
            }),
        }
    }
}

/// A resolved pending call.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleReply {
    pub status: ReplyStatus,
    pub content: Value,
}

impl OracleReply {
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::CommandExecutedSuccessfully
    }

    /// Content rendered as plain text; string payloads are unquoted.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Identifier pairing a request with its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub kind: CommandKind,
    pub session: Option<SessionId>,
    pub request_id: Option<u64>,
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref s) = self.session {
            write!(f, "@{s}")?;
        }
        if let Some(id) = self.request_id {
            write!(f, "#{id}")?;
        }
        Ok(())
    }
}
