use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use xmpp_parsers::minidom::Element;
use xmpp_parsers::ns;
use xmpp_parsers::sm::Nonza;

use super::descriptor::StateDescriptor;
use super::{Feasibility, StateDriver, StateId, TransitionOutcome, TransitionStep};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::event::ConnectionEvent;
use crate::features::StreamFeatures;
use crate::link::Link;
use crate::modules::{ModuleRuntime, RuntimeState};
use crate::stanza::{Stanza, StanzaKind, parse_element, serialize_element};
use crate::stream_management::encode_nonza;
use crate::transport::{TransportConnector, XmppTransport};

/// Everything the runtime states of one connection share: the transport
/// during negotiation, what the server advertised, and the results of
/// earlier states.
pub struct ConnectionContext<C: TransportConnector> {
    config: Arc<ConnectionConfig>,
    connector: Arc<C>,
    transport: Option<C::Transport>,
    features: StreamFeatures,
    stream_id: Option<String>,
    bound_jid: Option<String>,
    compression: Option<String>,
    resumed: bool,
    link: Link,
    states: BTreeMap<StateId, RuntimeState>,
    early_inbound: Vec<Stanza>,
}

impl<C: TransportConnector> ConnectionContext<C> {
    pub fn new(config: Arc<ConnectionConfig>, connector: Arc<C>, link: Link) -> Self {
        Self {
            config,
            connector,
            transport: None,
            features: StreamFeatures::default(),
            stream_id: None,
            bound_jid: None,
            compression: None,
            resumed: false,
            link,
            states: BTreeMap::new(),
            early_inbound: Vec::new(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn features(&self) -> &StreamFeatures {
        &self.features
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn bound_jid(&self) -> Option<&str> {
        self.bound_jid.as_deref()
    }

    pub fn compression(&self) -> Option<&str> {
        self.compression.as_deref()
    }

    /// Whether the last walk resumed a previous session instead of binding.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn is_secure(&self) -> bool {
        self.transport.as_ref().is_some_and(|transport| transport.is_secure())
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn set_bound_jid(&mut self, jid: String) {
        self.bound_jid = Some(jid);
    }

    pub(crate) fn set_compression(&mut self, method: String) {
        self.compression = Some(method);
    }

    pub(crate) fn mark_resumed(&mut self) {
        self.resumed = true;
    }

    pub(crate) fn domain(&self) -> Result<String, ConnectionError> {
        Ok(self.config.domain()?)
    }

    pub(crate) fn transport_mut(&mut self) -> Result<&mut C::Transport, ConnectionError> {
        self.transport.as_mut().ok_or(ConnectionError::NotConnected)
    }

    /// Ask the connector for a transport and open the initial stream.
    pub(crate) async fn open_transport(&mut self) -> Result<(), ConnectionError> {
        let transport = self.connector.connect(&self.config).await?;
        self.transport = Some(transport);
        self.restart_stream().await
    }

    /// Open a new stream on the current transport and replace the
    /// advertised features with the fresh set.
    pub(crate) async fn restart_stream(&mut self) -> Result<(), ConnectionError> {
        let domain = self.domain()?;
        let timeout = self.config.reply_timeout();
        let transport = self.transport_mut()?;
        let opened = tokio::time::timeout(timeout, transport.open_stream(&domain))
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        self.features = StreamFeatures::parse(&opened.features)?;
        self.stream_id = opened.id;
        debug!(
            stream_id = ?self.stream_id,
            secure = self.is_secure(),
            "stream opened"
        );
        Ok(())
    }

    pub(crate) async fn start_tls(&mut self) -> Result<(), ConnectionError> {
        let domain = self.domain()?;
        self.transport_mut()?.start_tls(&domain).await
    }

    pub(crate) async fn enable_compression(&mut self, method: &str) -> Result<(), ConnectionError> {
        self.transport_mut()?.enable_compression(method).await
    }

    pub(crate) async fn send_element(&mut self, element: &Element) -> Result<(), ConnectionError> {
        let frame = serialize_element(element)?;
        self.transport_mut()?.send(&frame).await
    }

    pub(crate) async fn send_nonza(&mut self, nonza: Nonza) -> Result<(), ConnectionError> {
        let frame = encode_nonza(nonza)?;
        self.transport_mut()?.send(&frame).await
    }

    /// Next negotiation reply. Messages and presences that arrive in the
    /// meantime are kept for the application; stream errors end the
    /// negotiation.
    pub(crate) async fn next_element(&mut self) -> Result<Element, ConnectionError> {
        let timeout = self.config.reply_timeout();
        loop {
            let transport = self.transport_mut()?;
            let frame = tokio::time::timeout(timeout, transport.recv())
                .await
                .map_err(|_| ConnectionError::Timeout)??;
            let element = parse_element(&frame)?;

            if element.is("error", ns::STREAM) {
                let condition = element
                    .children()
                    .next()
                    .map(|child| child.name().to_string())
                    .unwrap_or_else(|| "undefined-condition".to_string());
                return Err(ConnectionError::StreamError(condition));
            }

            if element.ns() == ns::JABBER_CLIENT && element.name() != StanzaKind::Iq.name() {
                let stanza = Stanza::try_from(element)?;
                debug!(kind = stanza.kind().name(), "holding stanza received during negotiation");
                self.early_inbound.push(stanza);
                continue;
            }

            return Ok(element);
        }
    }

    pub(crate) fn take_transport(&mut self) -> Option<C::Transport> {
        self.transport.take()
    }

    pub(crate) fn take_early_inbound(&mut self) -> Vec<Stanza> {
        std::mem::take(&mut self.early_inbound)
    }

    /// Prepare for a new walk: forget the previous negotiation and reset
    /// every cached runtime state. The bound JID survives so a resumed
    /// session keeps its address.
    pub(crate) async fn reset_for_walk(&mut self) {
        self.close_transport().await;
        self.features = StreamFeatures::default();
        self.stream_id = None;
        self.compression = None;
        self.resumed = false;
        for state in self.states.values_mut() {
            state.reset_state();
        }
    }

    pub(crate) async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(error) = transport.close().await {
                debug!(%error, "error while closing negotiation transport");
            }
        }
    }

    /// Drop every runtime state and the transport.
    pub(crate) async fn release(&mut self) {
        self.close_transport().await;
        self.states.clear();
        self.early_inbound.clear();
    }

    fn checkout(&mut self, descriptor: &'static StateDescriptor) -> RuntimeState {
        self.states
            .remove(&descriptor.id)
            .unwrap_or_else(|| descriptor.instantiate())
    }
}

impl<C: TransportConnector> StateDriver for ConnectionContext<C> {
    fn is_transition_possible(&mut self, descriptor: &'static StateDescriptor) -> Feasibility {
        let state = self.checkout(descriptor);
        let feasibility = state.is_transition_possible(self);
        self.states.insert(descriptor.id, state);
        feasibility
    }

    async fn transition_into(&mut self, descriptor: &'static StateDescriptor) -> TransitionOutcome {
        let mut state = self.checkout(descriptor);
        let outcome = state.transition_into(self).await;
        self.states.insert(descriptor.id, state);
        outcome
    }

    fn on_transition(&mut self, state: StateId, step: TransitionStep) {
        self.link.emit(ConnectionEvent::Transition { state, step });
    }
}
