use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, TlsPolicy};
use crate::error::ConnectionError;
use crate::event::ConnectionEvent;
use crate::fsm::{ConnectionContext, DescriptorRegistry, GraphWalker, StateGraph, StateId, WalkContext};
use crate::link::{IoTasks, Link, spawn_io};
use crate::stanza::Stanza;
use crate::stream_management::{AckPredicate, SessionState, UnackedStanza};
use crate::transport::{TransportConnector, XmppTransport};

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Cloneable handle for sending stanzas from other tasks.
#[derive(Clone)]
pub struct StanzaSender {
    link: Link,
}

impl StanzaSender {
    pub fn send(&self, stanza: Stanza) -> Result<(), ConnectionError> {
        self.link.send_stanza(stanza)
    }

    pub fn send_raw(&self, raw: &[u8]) -> Result<(), ConnectionError> {
        self.link.send_stanza(Stanza::parse(raw)?)
    }
}

pub struct XmppConnection<C: TransportConnector> {
    state: ConnectionState,
    config: Arc<ConnectionConfig>,
    graph: StateGraph,
    context: ConnectionContext<C>,
    link: Link,
    io: Option<IoTasks>,
    inbound: Option<mpsc::UnboundedReceiver<Stanza>>,
    last_walk: Vec<StateId>,
    secure: bool,
}

impl<C: TransportConnector> XmppConnection<C> {
    pub fn new(config: ConnectionConfig, connector: C) -> Result<Self, ConnectionError> {
        Self::with_registry(config, connector, &DescriptorRegistry::standard())
    }

    /// Build a connection over a custom module catalog. Graph problems are
    /// reported here, before any I/O.
    pub fn with_registry(
        config: ConnectionConfig,
        connector: C,
        registry: &DescriptorRegistry,
    ) -> Result<Self, ConnectionError> {
        config.validate()?;
        let graph = StateGraph::for_config(registry, &config.modules)?;
        let config = Arc::new(config);
        let link = Link::new(&config.modules.stream_management);
        let context = ConnectionContext::new(config.clone(), Arc::new(connector), link.clone());

        Ok(Self {
            state: ConnectionState::Disconnected,
            config,
            graph,
            context,
            link,
            io: None,
            inbound: None,
            last_walk: Vec::new(),
            secure: false,
        })
    }

    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if matches!(self.state, ConnectionState::Connected) && self.link.is_attached() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let mut reconnect_attempt = 0_u32;

        loop {
            match self.walk().await {
                Ok(()) => {
                    self.establish();
                    return Ok(());
                }
                Err(error) => {
                    self.context.close_transport().await;
                    reconnect_attempt = self
                        .handle_connect_failure(error, reconnect_attempt)
                        .await?;
                }
            }
        }
    }

    /// Send a stanza. With stream management active it is tracked until
    /// acknowledged, and queued while the connection is being resumed.
    pub fn send_stanza(&self, stanza: Stanza) -> Result<(), ConnectionError> {
        self.link.send_stanza(stanza)
    }

    pub fn sender(&self) -> StanzaSender {
        StanzaSender {
            link: self.link.clone(),
        }
    }

    /// Next inbound stanza, or `None` once the current stream has ended.
    pub async fn next_stanza(&mut self) -> Option<Stanza> {
        self.inbound.as_mut()?.recv().await
    }

    pub async fn recv_stanza_with_timeout(
        &mut self,
        timeout_duration: Duration,
    ) -> Result<Option<Stanza>, ConnectionError> {
        let Some(inbound) = self.inbound.as_mut() else {
            return Ok(None);
        };
        match tokio::time::timeout(timeout_duration, inbound.recv()).await {
            Ok(stanza) => Ok(stanza),
            Err(_) => Ok(None),
        }
    }

    pub fn request_ack(&self) -> Result<(), ConnectionError> {
        self.link.request_ack()
    }

    pub fn watch_acknowledgement(
        &self,
        id: &str,
    ) -> Result<oneshot::Receiver<UnackedStanza>, ConnectionError> {
        self.link.watch_acknowledgement(id)
    }

    /// Stop waiting for the acknowledgment of `id`. Returns whether a
    /// watcher was registered.
    pub fn unwatch_acknowledgement(&self, id: &str) -> bool {
        self.link.unwatch_acknowledgement(id)
    }

    pub fn add_ack_predicate(&self, predicate: AckPredicate) {
        self.link
            .with_session(|session| session.policy_mut().add(predicate));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.link.subscribe()
    }

    /// Tear down whatever is left of the current stream and walk the graph
    /// again. A resumable session is resumed rather than rebound.
    pub async fn recover_after_network_interruption(
        &mut self,
        reason: String,
    ) -> Result<(), ConnectionError> {
        if let Some(io) = self.io.take() {
            let epoch = io.epoch;
            io.abort();
            self.link.on_transport_lost(epoch, &reason);
        }
        self.inbound = None;
        self.state = ConnectionState::Disconnected;

        self.connect().await
    }

    /// Close the stream and forget the session. Unconfirmed stanzas are
    /// reported as undelivered.
    pub async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        let was_connected = !matches!(self.state, ConnectionState::Disconnected);

        self.link.close_gracefully();
        self.context.release().await;
        if let Some(io) = self.io.take() {
            if tokio::time::timeout(self.config.reply_timeout(), io.finish())
                .await
                .is_err()
            {
                debug!("writer did not finish closing in time");
            }
        }
        self.inbound = None;
        self.state = ConnectionState::Disconnected;

        if was_connected {
            info!("disconnected on request");
            self.link.emit(ConnectionEvent::Disconnected {
                reason: "user requested disconnect".to_string(),
            });
        }
        Ok(())
    }

    /// Drop the transport immediately without closing the stream. The
    /// session stays resumable.
    pub async fn instant_shutdown(&mut self) {
        if let Some(io) = self.io.take() {
            io.abort();
        }
        self.link.detach();
        self.context.close_transport().await;
        self.inbound = None;
        self.state = ConnectionState::Disconnected;
    }

    pub fn state(&self) -> ConnectionState {
        self.state.clone()
    }

    pub fn graph(&self) -> &StateGraph {
        &self.graph
    }

    /// States entered by the most recent successful walk.
    pub fn walk_path(&self) -> &[StateId] {
        &self.last_walk
    }

    /// Resumption id the server granted for the current session.
    pub fn stream_id(&self) -> Option<String> {
        self.link
            .with_session(|session| session.stream_id().map(str::to_string))
    }

    pub fn bound_jid(&self) -> Option<&str> {
        self.context.bound_jid()
    }

    pub fn stream_management_state(&self) -> SessionState {
        self.link.with_session(|session| session.state())
    }

    /// Stanzas sent but not yet confirmed by the server.
    pub fn unacked_count(&self) -> usize {
        self.link.with_session(|session| session.queue().len())
    }

    /// Whether the established stream was encrypted.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    async fn walk(&mut self) -> Result<(), ConnectionError> {
        self.link.expire_if_due(Instant::now());
        self.context.reset_for_walk().await;

        let mut walk = WalkContext::new(StateId::ESTABLISHED);
        if self.config.modules.tls == TlsPolicy::Required && self.graph.contains(StateId::StartTls) {
            walk = walk.with_mandatory(StateId::StartTls);
        }

        let result = GraphWalker::new(&self.graph)
            .walk(&mut self.context, &mut walk)
            .await;
        match result {
            Ok(()) => {
                debug!(path = ?walk.path(), "negotiation complete");
                self.last_walk = walk.path().to_vec();
                Ok(())
            }
            Err(error) => {
                warn!(%error, "negotiation failed");
                Err(error.into())
            }
        }
    }

    fn establish(&mut self) {
        let resumed = self.context.resumed();
        if !resumed {
            // Bound afresh without enabling stream management.
            self.link.abandon_resumable();
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        for stanza in self.context.take_early_inbound() {
            if let Err(error) = inbound_tx.send(stanza) {
                debug!(id = ?error.0.id(), "dropping stanza received during negotiation");
            }
        }
        self.inbound = Some(inbound_rx);

        self.secure = self.context.is_secure();
        if let Some(transport) = self.context.take_transport() {
            let (reader, writer) = transport.into_split();
            let io = spawn_io(
                self.link.clone(),
                reader,
                writer,
                inbound_tx,
                self.config.idle_timeout(),
            );
            if resumed {
                self.link.emit(ConnectionEvent::Resumed {
                    replayed: io.replayed,
                });
            }
            self.io = Some(io);
        }

        self.state = ConnectionState::Connected;
        let jid = self
            .context
            .bound_jid()
            .unwrap_or(&self.config.jid)
            .to_string();
        info!(%jid, resumed, "connection established");
        self.link
            .emit(ConnectionEvent::Established { jid, resumed });
    }

    async fn handle_connect_failure(
        &mut self,
        error: ConnectionError,
        reconnect_attempt: u32,
    ) -> Result<u32, ConnectionError> {
        let next_attempt = reconnect_attempt.saturating_add(1);
        let will_retry = error.is_retryable() && self.should_retry(next_attempt);

        if !will_retry {
            self.state = ConnectionState::Disconnected;
            self.link.emit(ConnectionEvent::Disconnected {
                reason: error.to_string(),
            });
            return Err(error);
        }

        warn!(%error, attempt = next_attempt, "connect attempt failed, retrying");
        self.state = ConnectionState::Reconnecting {
            attempt: next_attempt,
        };
        self.link.emit(ConnectionEvent::Reconnecting {
            attempt: next_attempt,
        });

        tokio::time::sleep(reconnect_delay(next_attempt)).await;
        self.state = ConnectionState::Connecting;
        Ok(next_attempt)
    }

    fn should_retry(&self, attempt: u32) -> bool {
        self.config.max_reconnect_attempts == 0 || attempt <= self.config.max_reconnect_attempts
    }
}

const INITIAL_RECONNECT_DELAY_SECONDS: u64 = 1;
const MAX_RECONNECT_DELAY_SECONDS: u64 = 60;

fn reconnect_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1);
    let seconds = 1_u64
        .checked_shl(shift)
        .unwrap_or(u64::MAX)
        .clamp(INITIAL_RECONNECT_DELAY_SECONDS, MAX_RECONNECT_DELAY_SECONDS);
    Duration::from_secs(seconds)
}
