//! Runtime halves of the capability modules. Each type performs the
//! protocol exchange for one state of the connection graph.

pub mod bind;
pub mod compression;
pub mod connect;
pub mod sasl;
pub mod sm;
pub mod tls;

use std::future::Future;

pub use bind::ResourceBinding;
pub use compression::Compression;
pub use connect::{Connect, Established, Marker};
pub use sasl::{SaslAuthentication, SelectedMechanism, select_mechanism};
pub use sm::{EnableStreamManagement, StreamResumption};
pub use tls::StartTls;

use crate::fsm::{ConnectionContext, Feasibility, TransitionOutcome};
use crate::transport::TransportConnector;

pub trait ModuleRuntime: Send {
    /// Whether the state can be entered given the current features. Must
    /// not touch the transport.
    fn is_transition_possible<C: TransportConnector>(&self, ctx: &ConnectionContext<C>) -> Feasibility;

    fn transition_into<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> impl Future<Output = TransitionOutcome> + Send;

    /// Forget per-walk data before a new connect attempt.
    fn reset_state(&mut self);
}

#[derive(Debug)]
pub enum RuntimeState {
    Marker(Marker),
    Connect(Connect),
    StartTls(StartTls),
    Sasl(SaslAuthentication),
    Compression(Compression),
    ResourceBinding(ResourceBinding),
    StreamResumption(StreamResumption),
    EnableStreamManagement(EnableStreamManagement),
    Established(Established),
}

impl RuntimeState {
    pub fn marker() -> Self {
        RuntimeState::Marker(Marker)
    }

    pub fn connect() -> Self {
        RuntimeState::Connect(Connect::default())
    }

    pub fn start_tls() -> Self {
        RuntimeState::StartTls(StartTls)
    }

    pub fn sasl() -> Self {
        RuntimeState::Sasl(SaslAuthentication::default())
    }

    pub fn compression() -> Self {
        RuntimeState::Compression(Compression::default())
    }

    pub fn resource_binding() -> Self {
        RuntimeState::ResourceBinding(ResourceBinding::default())
    }

    pub fn stream_resumption() -> Self {
        RuntimeState::StreamResumption(StreamResumption::default())
    }

    pub fn enable_stream_management() -> Self {
        RuntimeState::EnableStreamManagement(EnableStreamManagement)
    }

    pub fn established() -> Self {
        RuntimeState::Established(Established)
    }
}

impl ModuleRuntime for RuntimeState {
    fn is_transition_possible<C: TransportConnector>(&self, ctx: &ConnectionContext<C>) -> Feasibility {
        match self {
            RuntimeState::Marker(state) => state.is_transition_possible(ctx),
            RuntimeState::Connect(state) => state.is_transition_possible(ctx),
            RuntimeState::StartTls(state) => state.is_transition_possible(ctx),
            RuntimeState::Sasl(state) => state.is_transition_possible(ctx),
            RuntimeState::Compression(state) => state.is_transition_possible(ctx),
            RuntimeState::ResourceBinding(state) => state.is_transition_possible(ctx),
            RuntimeState::StreamResumption(state) => state.is_transition_possible(ctx),
            RuntimeState::EnableStreamManagement(state) => state.is_transition_possible(ctx),
            RuntimeState::Established(state) => state.is_transition_possible(ctx),
        }
    }

    async fn transition_into<C: TransportConnector>(
        &mut self,
        ctx: &mut ConnectionContext<C>,
    ) -> TransitionOutcome {
        match self {
            RuntimeState::Marker(state) => state.transition_into(ctx).await,
            RuntimeState::Connect(state) => state.transition_into(ctx).await,
            RuntimeState::StartTls(state) => state.transition_into(ctx).await,
            RuntimeState::Sasl(state) => state.transition_into(ctx).await,
            RuntimeState::Compression(state) => state.transition_into(ctx).await,
            RuntimeState::ResourceBinding(state) => state.transition_into(ctx).await,
            RuntimeState::StreamResumption(state) => state.transition_into(ctx).await,
            RuntimeState::EnableStreamManagement(state) => state.transition_into(ctx).await,
            RuntimeState::Established(state) => state.transition_into(ctx).await,
        }
    }

    fn reset_state(&mut self) {
        match self {
            RuntimeState::Marker(state) => state.reset_state(),
            RuntimeState::Connect(state) => state.reset_state(),
            RuntimeState::StartTls(state) => state.reset_state(),
            RuntimeState::Sasl(state) => state.reset_state(),
            RuntimeState::Compression(state) => state.reset_state(),
            RuntimeState::ResourceBinding(state) => state.reset_state(),
            RuntimeState::StreamResumption(state) => state.reset_state(),
            RuntimeState::EnableStreamManagement(state) => state.reset_state(),
            RuntimeState::Established(state) => state.reset_state(),
        }
    }
}
