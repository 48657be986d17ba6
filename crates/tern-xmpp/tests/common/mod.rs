//! Scripted in-memory XMPP server for the integration tests.
//!
//! The fake answers negotiation requests synchronously from the frame the
//! client just wrote, so a walk never waits on a timer.

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tern_xmpp::{
    ConnectionConfig, ConnectionError, ConnectionEvent, FrameReader, FrameWriter, Stanza, StateId,
    StreamOpened, TransitionStep, TransportConnector, XmppTransport, legacy_ns,
};
use xmpp_parsers::minidom::Element;
use xmpp_parsers::ns;

pub const JID: &str = "alice@example.com";
pub const RESOURCE: &str = "tests";
pub const SM_ID: &str = "sm-1";

/// What the fake offers and how it reacts.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub offer_starttls: bool,
    pub require_starttls: bool,
    pub refuse_starttls: bool,
    pub mechanisms: Vec<&'static str>,
    pub accept_auth: bool,
    pub compression: Vec<&'static str>,
    pub offer_sm: bool,
    pub grant_resumption: bool,
    pub accept_resume: bool,
    pub require_session: bool,
    /// How long each `<stream:features/>` takes to arrive.
    pub features_delay: Duration,
    /// Push a message ahead of the bind result.
    pub message_before_bind: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            offer_starttls: true,
            require_starttls: false,
            refuse_starttls: false,
            mechanisms: vec!["PLAIN"],
            accept_auth: true,
            compression: Vec::new(),
            offer_sm: true,
            grant_resumption: true,
            accept_resume: true,
            require_session: false,
            features_delay: Duration::ZERO,
            message_before_bind: false,
        }
    }
}

#[derive(Default)]
struct Slot {
    sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
    secure: bool,
    authenticated: bool,
    compressed: bool,
}

struct ServerState {
    options: ServerOptions,
    slots: Vec<Slot>,
    refuse_connections: u32,
    connect_attempts: u32,
    frames: Vec<String>,
    received: Vec<String>,
    handled: u32,
}

#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                options,
                slots: Vec::new(),
                refuse_connections: 0,
                connect_attempts: 0,
                frames: Vec::new(),
                received: Vec::new(),
                handled: 0,
            })),
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            server: self.clone(),
        }
    }

    pub fn set_options(&self, update: impl FnOnce(&mut ServerOptions)) {
        update(&mut self.state.lock().options);
    }

    pub fn refuse_next_connections(&self, count: u32) {
        self.state.lock().refuse_connections = count;
    }

    /// Every call to the connector, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Transports handed out to the client.
    pub fn connections(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Every frame the client wrote, in order.
    pub fn frames(&self) -> Vec<String> {
        self.state.lock().frames.clone()
    }

    /// Ids of the stanzas the server counted as handled.
    pub fn received_ids(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    /// `h` values of the `<a/>` answers the client sent.
    pub fn client_acks(&self) -> Vec<u32> {
        self.frames()
            .iter()
            .filter_map(|frame| Element::from_str(frame).ok())
            .filter(|element| element.is("a", ns::SM))
            .filter_map(|element| element.attr("h").and_then(|h| h.parse().ok()))
            .collect()
    }

    pub fn sent_frame_named(&self, name: &str) -> bool {
        self.frames()
            .iter()
            .filter_map(|frame| Element::from_str(frame).ok())
            .any(|element| element.name() == name)
    }

    /// Push a frame to the client on the current connection.
    pub fn inject(&self, xml: &str) {
        let state = self.state.lock();
        if let Some(sender) = state.slots.last().and_then(|slot| slot.sender.as_ref()) {
            let _ = sender.send(xml.as_bytes().to_vec());
        }
    }

    /// Cut the current connection without closing the stream.
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.last_mut() {
            slot.sender = None;
        }
    }

    fn accept(&self) -> Result<(usize, mpsc::UnboundedReceiver<Vec<u8>>), ConnectionError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            return Err(ConnectionError::TransportError("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.slots.push(Slot {
            sender: Some(tx),
            ..Slot::default()
        });
        Ok((state.slots.len() - 1, rx))
    }

    fn features(&self, id: usize) -> Element {
        let state = self.state.lock();
        let options = &state.options;
        let slot = &state.slots[id];
        let mut features = Element::builder("features", ns::STREAM);

        if !slot.authenticated {
            if options.offer_starttls && !slot.secure {
                let mut starttls = Element::builder("starttls", ns::TLS);
                if options.require_starttls {
                    starttls = starttls.append(Element::builder("required", ns::TLS).build());
                }
                features = features.append(starttls.build());
            }
            let mut mechanisms = Element::builder("mechanisms", ns::SASL);
            for mechanism in &options.mechanisms {
                mechanisms = mechanisms.append(
                    Element::builder("mechanism", ns::SASL)
                        .append(mechanism.to_string())
                        .build(),
                );
            }
            return features.append(mechanisms.build()).build();
        }

        if !options.compression.is_empty() && !slot.compressed {
            let mut compression = Element::builder("compression", legacy_ns::COMPRESS_FEATURE);
            for method in &options.compression {
                compression = compression.append(
                    Element::builder("method", legacy_ns::COMPRESS_FEATURE)
                        .append(method.to_string())
                        .build(),
                );
            }
            features = features.append(compression.build());
        }
        features = features.append(Element::builder("bind", ns::BIND).build());
        if options.require_session {
            features = features.append(Element::builder("session", legacy_ns::SESSION).build());
        }
        if options.offer_sm {
            features = features.append(Element::builder("sm", ns::SM).build());
        }
        features.build()
    }

    fn handle(&self, id: usize, data: &[u8]) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if state.slots[id].sender.is_none() {
            return Err(ConnectionError::TransportError(
                "connection reset by peer".to_string(),
            ));
        }

        let text = String::from_utf8_lossy(data).to_string();
        state.frames.push(text.clone());
        let Ok(element) = Element::from_str(&text) else {
            return Ok(());
        };

        let replies = respond(&mut state, id, &element);
        if let Some(sender) = state.slots[id].sender.as_ref() {
            for reply in replies {
                let _ = sender.send(reply.into_bytes());
            }
        }
        Ok(())
    }

    fn close(&self, id: usize) {
        let mut state = self.state.lock();
        state.frames.push("</stream:stream>".to_string());
        state.slots[id].sender = None;
    }

    fn is_secure(&self, id: usize) -> bool {
        self.state.lock().slots[id].secure
    }
}

fn respond(state: &mut ServerState, id: usize, element: &Element) -> Vec<String> {
    let options = state.options.clone();
    let namespace = element.ns();

    match (element.name(), namespace.as_str()) {
        ("starttls", ns::TLS) if options.refuse_starttls => {
            vec![format!("<failure xmlns='{}'/>", ns::TLS)]
        }
        ("starttls", ns::TLS) => vec![format!("<proceed xmlns='{}'/>", ns::TLS)],
        ("auth", ns::SASL) if options.accept_auth => {
            state.slots[id].authenticated = true;
            vec![format!("<success xmlns='{}'/>", ns::SASL)]
        }
        ("auth", ns::SASL) => vec![format!(
            "<failure xmlns='{}'><not-authorized/></failure>",
            ns::SASL
        )],
        ("compress", legacy_ns::COMPRESS_PROTOCOL) => {
            vec![format!("<compressed xmlns='{}'/>", legacy_ns::COMPRESS_PROTOCOL)]
        }
        ("enable", ns::SM) => {
            state.handled = 0;
            let wants_resume = matches!(element.attr("resume"), Some("true") | Some("1"));
            if wants_resume && options.grant_resumption {
                vec![format!(
                    "<enabled xmlns='{}' id='{SM_ID}' resume='true'/>",
                    ns::SM
                )]
            } else {
                vec![format!("<enabled xmlns='{}'/>", ns::SM)]
            }
        }
        ("resume", ns::SM) => {
            let h = state.handled;
            if options.accept_resume && element.attr("previd") == Some(SM_ID) {
                vec![format!(
                    "<resumed xmlns='{}' previd='{SM_ID}' h='{h}'/>",
                    ns::SM
                )]
            } else {
                vec![format!(
                    "<failed xmlns='{}' h='{h}'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></failed>",
                    ns::SM
                )]
            }
        }
        ("r", ns::SM) => vec![format!("<a xmlns='{}' h='{}'/>", ns::SM, state.handled)],
        ("a", ns::SM) => Vec::new(),
        ("iq", ns::JABBER_CLIENT) if element.has_child("bind", ns::BIND) => {
            let request_id = element.attr("id").unwrap_or_default();
            let mut replies = Vec::new();
            if options.message_before_bind {
                replies.push(
                    "<message xmlns='jabber:client' id='early' from='bob@example.com/phone'><body>hi</body></message>"
                        .to_string(),
                );
            }
            replies.push(format!(
                "<iq xmlns='jabber:client' type='result' id='{request_id}'><bind xmlns='{}'><jid>{JID}/{RESOURCE}</jid></bind></iq>",
                ns::BIND
            ));
            replies
        }
        ("iq", ns::JABBER_CLIENT) if element.has_child("session", legacy_ns::SESSION) => {
            let request_id = element.attr("id").unwrap_or_default();
            vec![format!(
                "<iq xmlns='jabber:client' type='result' id='{request_id}'/>"
            )]
        }
        ("message" | "presence" | "iq", ns::JABBER_CLIENT) => {
            state.handled = state.handled.wrapping_add(1);
            state
                .received
                .push(element.attr("id").unwrap_or_default().to_string());
            Vec::new()
        }
        _ => Vec::new(),
    }
}

pub struct FakeConnector {
    server: FakeServer,
}

impl TransportConnector for FakeConnector {
    type Transport = FakeTransport;

    async fn connect(&self, _config: &ConnectionConfig) -> Result<FakeTransport, ConnectionError> {
        let (id, incoming) = self.server.accept()?;
        Ok(FakeTransport {
            id,
            server: self.server.clone(),
            incoming,
        })
    }
}

pub struct FakeTransport {
    id: usize,
    server: FakeServer,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl XmppTransport for FakeTransport {
    type Reader = FakeReader;
    type Writer = FakeWriter;

    async fn open_stream(&mut self, _domain: &str) -> Result<StreamOpened, ConnectionError> {
        let delay = self.server.state.lock().options.features_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(StreamOpened {
            id: Some(format!("stream-{}", self.id)),
            features: self.server.features(self.id),
        })
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.server.handle(self.id, data)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| ConnectionError::TransportError("connection closed".to_string()))
    }

    async fn start_tls(&mut self, _domain: &str) -> Result<(), ConnectionError> {
        self.server.state.lock().slots[self.id].secure = true;
        Ok(())
    }

    async fn enable_compression(&mut self, _method: &str) -> Result<(), ConnectionError> {
        self.server.state.lock().slots[self.id].compressed = true;
        Ok(())
    }

    fn is_secure(&self) -> bool {
        self.server.is_secure(self.id)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.server.close(self.id);
        Ok(())
    }

    fn into_split(self) -> (FakeReader, FakeWriter) {
        (
            FakeReader {
                incoming: self.incoming,
            },
            FakeWriter {
                id: self.id,
                server: self.server,
            },
        )
    }
}

pub struct FakeReader {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl FrameReader for FakeReader {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        Ok(self.incoming.recv().await)
    }
}

pub struct FakeWriter {
    id: usize,
    server: FakeServer,
}

impl FrameWriter for FakeWriter {
    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.server.handle(self.id, data)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.server.close(self.id);
        Ok(())
    }
}

pub fn config() -> ConnectionConfig {
    ConnectionConfig::new(JID, "secret").with_resource(RESOURCE)
}

pub fn message(id: &str) -> Stanza {
    format!("<message xmlns='jabber:client' id='{id}' to='bob@example.com' type='chat'><body>{id}</body></message>")
        .parse()
        .unwrap()
}

/// Poll `condition` until it holds, yielding to the connection tasks.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not reached in time");
}

/// Next lifecycle event, skipping walk progress.
pub async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no connection event in time")
            .expect("event channel closed");
        if !matches!(event, ConnectionEvent::Transition { .. }) {
            return event;
        }
    }
}

/// Walk progress already broadcast, in order.
pub fn walk_steps(events: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<(StateId, TransitionStep)> {
    let mut steps = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ConnectionEvent::Transition { state, step } = event {
            steps.push((state, step));
        }
    }
    steps
}
