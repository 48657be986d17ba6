use thiserror::Error;

use crate::config::ConfigError;
use crate::fsm::StateId;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("server requires TLS but the connection is not secured")]
    SecurityRequiredByServer,

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("connection timeout")]
    Timeout,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error(transparent)]
    StreamManagement(#[from] StreamManagementError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Stanza(#[from] StanzaError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StanzaError {
    #[error("stanza parse failed: {0}")]
    Parse(String),

    #[error("stanza serialization failed: {0}")]
    Serialize(String),

    #[error("unsupported stanza element <{0}/>")]
    Unsupported(String),
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectionError::AuthenticationFailed(_)
            | ConnectionError::SecurityRequiredByServer
            | ConnectionError::Graph(_)
            | ConnectionError::Config(_)
            | ConnectionError::Stanza(_) => false,
            ConnectionError::Walk(walk) => walk.is_retryable(),
            _ => true,
        }
    }
}

/// Problems detected while assembling a [`crate::fsm::StateGraph`]. All of
/// them are raised before any network I/O takes place.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("state {referenced_by} references unknown state {missing:?}")]
    UnknownState {
        referenced_by: StateId,
        missing: StateId,
    },

    #[error("state graph contains a cycle through {state}")]
    Cycle { state: StateId },

    #[error("state graph contains no final state")]
    NoFinalState,

    #[error("no final state is reachable from {initial}")]
    UnreachableFinalState { initial: StateId },

    #[error("states not reachable from the initial state: {states:?}")]
    UnreachableStates { states: Vec<StateId> },

    #[error("non-final state {state} has no successor")]
    DeadEndState { state: StateId },

    #[error("state {state} declares precedence over {target}, which is not part of the graph")]
    UnknownPrecedenceTarget { state: StateId, target: StateId },
}

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("{}", describe_dead_end(.path, .failed))]
    DeadEnd {
        path: Vec<StateId>,
        failed: Vec<(StateId, String)>,
    },

    #[error("mandatory state {state} could not be entered: {reason}")]
    MandatoryStateFailed { state: StateId, reason: String },

    #[error("transition into {state} failed: {source}")]
    Fatal {
        state: StateId,
        #[source]
        source: Box<ConnectionError>,
    },
}

impl WalkError {
    pub fn is_retryable(&self) -> bool {
        match self {
            WalkError::DeadEnd { .. } | WalkError::MandatoryStateFailed { .. } => false,
            WalkError::Fatal { source, .. } => source.is_retryable(),
        }
    }

    pub fn failed_states(&self) -> Vec<StateId> {
        match self {
            WalkError::DeadEnd { failed, .. } => failed.iter().map(|(state, _)| *state).collect(),
            WalkError::MandatoryStateFailed { state, .. } | WalkError::Fatal { state, .. } => {
                vec![*state]
            }
        }
    }
}

fn describe_dead_end(path: &[StateId], failed: &[(StateId, String)]) -> String {
    let walked = path
        .iter()
        .map(|state| state.to_string())
        .collect::<Vec<_>>()
        .join(" -> ");
    let unsatisfied = failed
        .iter()
        .map(|(state, reason)| format!("{state} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("no path to a final state after {walked}; unsatisfied capabilities: {unsatisfied}")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamManagementError {
    #[error("stream management is not enabled")]
    NotEnabled,

    #[error("stream management is already {0}")]
    AlreadyEnabled(&'static str),

    #[error("stanza '{0}' is not awaiting acknowledgment")]
    NotPending(String),

    #[error("peer acknowledged up to {acked}, but only {sent} stanza(s) were sent")]
    CounterMismatch { acked: u32, sent: u32 },

    #[error("unacknowledged queue is full ({capacity} stanzas)")]
    QueueFull { capacity: usize },

    #[error("peer resumed stream '{received}', expected '{expected}'")]
    StreamIdMismatch { expected: String, received: String },

    #[error("unexpected stream-management element <{0}/>")]
    UnexpectedNonza(String),
}
