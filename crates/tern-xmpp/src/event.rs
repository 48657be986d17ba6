use crate::fsm::{StateId, TransitionStep};
use crate::stanza::Stanza;

/// Lifecycle notifications broadcast by a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Established { jid: String, resumed: bool },
    Lost { reason: String, will_resume: bool },
    Reconnecting { attempt: u32 },
    /// A previous session was resumed and `replayed` stanzas were resent.
    Resumed { replayed: usize },
    StanzasNotDelivered { stanzas: Vec<Stanza> },
    StanzaAcknowledged { id: String },
    Disconnected { reason: String },
    /// Progress of the state graph walk during connect.
    Transition { state: StateId, step: TransitionStep },
}
