pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod features;
pub mod fsm;
pub mod legacy_ns;
pub mod link;
pub mod modules;
pub mod stanza;
pub mod stream_management;
pub mod transport;

pub use config::{ConfigError, ConnectionConfig, ModulesConfig, StreamManagementConfig, TlsPolicy};
pub use connection::{ConnectionState, StanzaSender, XmppConnection};
pub use error::{ConnectionError, GraphError, StanzaError, StreamManagementError, WalkError};
pub use event::ConnectionEvent;
pub use features::StreamFeatures;
pub use fsm::{
    ConnectionContext, DescriptorRegistry, Feasibility, GraphOptions, GraphWalker, Property,
    StateDescriptor, StateDriver, StateGraph, StateId, TransitionOutcome, TransitionStep,
    WalkContext,
};
pub use link::Link;
pub use modules::{ModuleRuntime, RuntimeState, SelectedMechanism};
pub use stanza::{Stanza, StanzaKind};
pub use stream_management::{
    AckPolicy, AckPredicate, LossDisposition, SessionState, StanzaFilter, StreamManagementSession,
    UnackedStanza, decode_nonza, encode_nonza,
};
pub use transport::{FrameReader, FrameWriter, StreamOpened, TransportConnector, XmppTransport};
