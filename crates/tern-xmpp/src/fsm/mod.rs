//! Declarative connection state machine: descriptors, the validated graph
//! assembled from them, and the walker that negotiates a path through it.

pub mod context;
pub mod descriptor;
pub mod graph;
pub mod registry;
pub mod walker;

use std::fmt;
use std::future::Future;

pub use context::ConnectionContext;
pub use descriptor::{Property, StateDescriptor};
pub use graph::{GraphOptions, StateGraph};
pub use registry::DescriptorRegistry;
pub use walker::{GraphWalker, WalkContext};

use crate::error::ConnectionError;

/// Identity of a connection state. The discriminant is the state's
/// priority, which breaks ties between otherwise unordered candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateId {
    Disconnected = 0,
    Connect = 10,
    ConnectedButUnauthenticated = 20,
    StartTls = 30,
    SaslAuthentication = 40,
    AuthenticatedButUnbound = 50,
    Compression = 60,
    ResourceBinding = 70,
    StreamResumption = 80,
    StreamManagementEnable = 90,
    AuthenticatedAndResourceBound = 100,
    InstantStreamResumption = 110,
}

impl StateId {
    pub const INITIAL: StateId = StateId::Disconnected;
    pub const ESTABLISHED: StateId = StateId::AuthenticatedAndResourceBound;

    pub fn priority(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether a state can be entered given what the server has advertised.
#[derive(Debug)]
pub enum Feasibility {
    Possible,
    Impossible(String),
    Fatal(ConnectionError),
}

#[derive(Debug)]
pub enum TransitionOutcome {
    Success(String),
    /// The state could not be entered; the walker tries the next candidate.
    Failed(String),
    /// Protocol violation. Aborts the walk without backtracking.
    Fatal(ConnectionError),
}

impl TransitionOutcome {
    pub fn success(description: impl Into<String>) -> Self {
        TransitionOutcome::Success(description.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        TransitionOutcome::Failed(reason.into())
    }
}

impl From<Result<TransitionOutcome, ConnectionError>> for TransitionOutcome {
    fn from(result: Result<TransitionOutcome, ConnectionError>) -> Self {
        result.unwrap_or_else(TransitionOutcome::Fatal)
    }
}

/// One step of a walk, reported for the state it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionStep {
    /// The walker is picking the next state after this one.
    DetermineNextState,
    /// The state was ruled out without being entered.
    NotPossible { reason: String },
    AboutToTransition,
    Entered { description: String },
    /// The state was attempted and failed; the walker backtracks.
    Failed { reason: String },
    /// The attempt aborted the walk.
    Aborted { error: String },
    FinalStateReached,
}

/// What the walker drives. The walker only sees descriptors and outcomes;
/// the driver owns the runtime states and whatever I/O they need.
pub trait StateDriver: Send {
    fn is_transition_possible(&mut self, descriptor: &'static StateDescriptor) -> Feasibility;

    fn transition_into(
        &mut self,
        descriptor: &'static StateDescriptor,
    ) -> impl Future<Output = TransitionOutcome> + Send;

    /// Observe each step of the walk.
    fn on_transition(&mut self, _state: StateId, _step: TransitionStep) {}
}
