//! The established phase of a connection: one session behind one mutex,
//! shared by application senders, the inbound reader task and the outbound
//! writer task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use xmpp_parsers::ns;
use xmpp_parsers::sm::{Nonza, R};

use crate::config::StreamManagementConfig;
use crate::error::{ConnectionError, StreamManagementError};
use crate::event::ConnectionEvent;
use crate::stanza::{Stanza, parse_element};
use crate::stream_management::{
    LossDisposition, StreamManagementSession, UnackedStanza, decode_nonza, encode_nonza, is_nonza,
};
use crate::transport::{FrameReader, FrameWriter};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub(crate) enum WriterCommand {
    Frame(Vec<u8>),
    Close,
}

#[derive(Debug)]
struct LinkInner {
    session: StreamManagementSession,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
    epoch: u64,
}

impl LinkInner {
    /// Hand a frame to the writer task. Returns false once the writer is
    /// gone. A dead writer stays attached until `on_transport_lost` for its
    /// epoch moves the session on.
    fn write(&mut self, frame: Vec<u8>) -> bool {
        self.writer
            .as_ref()
            .is_some_and(|writer| writer.send(WriterCommand::Frame(frame)).is_ok())
    }

    fn is_live(&self) -> bool {
        self.writer.as_ref().is_some_and(|writer| !writer.is_closed())
    }

    fn write_nonza(&mut self, nonza: Nonza) -> Result<bool, ConnectionError> {
        let frame = encode_nonza(nonza)?;
        Ok(self.write(frame))
    }
}

#[derive(Clone)]
pub struct Link {
    inner: Arc<Mutex<LinkInner>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Link {
    pub fn new(config: &StreamManagementConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(LinkInner {
                session: StreamManagementSession::new(config),
                writer: None,
                epoch: 0,
            })),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn with_session<T>(&self, f: impl FnOnce(&mut StreamManagementSession) -> T) -> T {
        f(&mut self.inner.lock().session)
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().is_live()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Send one stanza. While stream management is tracking, the stanza is
    /// sequenced and queued first; if no writer is attached it stays queued
    /// until the next attach.
    pub fn send_stanza(&self, stanza: Stanza) -> Result<(), ConnectionError> {
        let frame = stanza.to_bytes()?;
        let mut inner = self.inner.lock();

        if !inner.session.is_tracking() {
            if !inner.write(frame) {
                return Err(ConnectionError::NotConnected);
            }
            return Ok(());
        }

        let live = inner.is_live() && inner.session.is_active();
        let outcome = inner.session.track_outbound(stanza, Instant::now(), live)?;
        if !live {
            debug!(sequence = outcome.sequence, "stanza queued until the stream is back");
            return Ok(());
        }

        if !inner.write(frame) {
            // Counted and queued; it goes out on resume or is reported.
            debug!(sequence = outcome.sequence, "writer closed, stanza stays queued");
            return Ok(());
        }
        if outcome.request_ack {
            inner.write_nonza(Nonza::Req(R))?;
        }
        Ok(())
    }

    pub fn request_ack(&self) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        let request = inner.session.ack_request()?;
        if !inner.write_nonza(request)? {
            return Err(ConnectionError::NotConnected);
        }
        Ok(())
    }

    /// Resolve once the peer confirms the pending stanza with `id`. An ack
    /// request goes out straight away.
    pub fn watch_acknowledgement(
        &self,
        id: &str,
    ) -> Result<oneshot::Receiver<UnackedStanza>, ConnectionError> {
        let mut inner = self.inner.lock();
        let receiver = inner.session.watch_acknowledgement(id)?;
        if inner.session.is_active() {
            inner.write_nonza(Nonza::Req(R))?;
        }
        Ok(receiver)
    }

    pub fn unwatch_acknowledgement(&self, id: &str) -> bool {
        self.with_session(|session| session.unwatch_acknowledgement(id))
    }

    /// Process one inbound frame from the reader of `epoch`. Returns the
    /// stanza to hand to the application, if the frame was one.
    pub fn handle_inbound(
        &self,
        epoch: u64,
        frame: &[u8],
    ) -> Result<Option<Stanza>, ConnectionError> {
        let element = parse_element(frame)?;

        if element.is("error", ns::STREAM) {
            let condition = element
                .children()
                .next()
                .map(|child| child.name().to_string())
                .unwrap_or_else(|| "undefined-condition".to_string());
            return Err(ConnectionError::StreamError(condition));
        }

        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            debug!(epoch, current = inner.epoch, "dropping frame from a stale transport");
            return Ok(None);
        }

        if is_nonza(&element) {
            match decode_nonza(element)? {
                Nonza::Ack(ack) => {
                    let acknowledged = inner.session.on_ack(ack.h)?;
                    drop(inner);
                    for entry in acknowledged {
                        if let Some(id) = entry.stanza.id() {
                            self.emit(ConnectionEvent::StanzaAcknowledged { id: id.to_string() });
                        }
                    }
                }
                Nonza::Req(_) => {
                    let answer = inner.session.answer_request()?;
                    inner.write_nonza(answer)?;
                }
                other => {
                    warn!(nonza = ?other, "ignoring stream management element outside negotiation");
                }
            }
            return Ok(None);
        }

        let stanza = Stanza::try_from(element)?;
        inner.session.mark_inbound_handled();
        Ok(Some(stanza))
    }

    /// Attach a fresh writer. Stanzas queued while detached are flushed in
    /// order, followed by an ack request. Returns the new epoch and how many
    /// stanzas were replayed.
    pub(crate) fn attach(&self, writer: mpsc::UnboundedSender<WriterCommand>) -> (u64, usize) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.writer = Some(writer);

        let replay = inner.session.take_unflushed();
        let mut replayed = 0;
        for stanza in &replay {
            let frame = match stanza.to_bytes() {
                Ok(frame) => frame,
                Err(error) => {
                    warn!(%error, "skipping unserializable queued stanza");
                    continue;
                }
            };
            if !inner.write(frame) {
                break;
            }
            replayed += 1;
        }
        if replayed > 0 {
            if let Err(error) = inner.write_nonza(Nonza::Req(R)) {
                warn!(%error, "failed to request ack after replay");
            }
        }

        (inner.epoch, replayed)
    }

    /// React to the transport of `epoch` going away. Ignored if that
    /// transport was already replaced or detached.
    pub fn on_transport_lost(&self, epoch: u64, reason: &str) -> Option<LossDisposition> {
        let disposition = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch || inner.writer.is_none() {
                return None;
            }
            inner.writer = None;
            inner.session.on_transport_lost(Instant::now())
        };

        let will_resume = disposition.will_resume();
        info!(%reason, will_resume, "connection lost");
        self.emit(ConnectionEvent::Lost {
            reason: reason.to_string(),
            will_resume,
        });
        if let LossDisposition::Terminated { undelivered } = &disposition {
            self.report_undelivered(undelivered.clone());
        }
        Some(disposition)
    }

    /// Terminate a resumable session whose window elapsed.
    pub fn expire_if_due(&self, now: Instant) {
        let expired = self.with_session(|session| session.expire_if_due(now));
        if let Some(undelivered) = expired {
            self.report_undelivered(undelivered);
        }
    }

    /// Terminate a session still waiting to resume and report its queue.
    pub(crate) fn abandon_resumable(&self) {
        let abandoned = self.with_session(|session| session.abandon_resumable());
        if let Some(undelivered) = abandoned {
            debug!(count = undelivered.len(), "abandoning resumable session");
            self.report_undelivered(undelivered);
        }
    }

    pub(crate) fn report_undelivered(&self, undelivered: Vec<UnackedStanza>) {
        if undelivered.is_empty() {
            return;
        }
        warn!(count = undelivered.len(), "stanzas were not delivered");
        self.emit(ConnectionEvent::StanzasNotDelivered {
            stanzas: undelivered.into_iter().map(|entry| entry.stanza).collect(),
        });
    }

    /// Detach the writer and ask it to close the stream. The session is
    /// reset; anything still unconfirmed is reported.
    pub fn close_gracefully(&self) {
        let undelivered = {
            let mut inner = self.inner.lock();
            if let Some(writer) = inner.writer.take() {
                let _ = writer.send(WriterCommand::Close);
            }
            inner.epoch += 1;
            inner.session.reset()
        };
        self.report_undelivered(undelivered);
    }

    /// Drop the writer without closing the stream. The session is left as a
    /// network loss would leave it.
    pub fn detach(&self) -> Option<LossDisposition> {
        let epoch = self.epoch();
        self.on_transport_lost(epoch, "shut down")
    }
}

/// Handles of the reader and writer tasks for one attached transport.
#[derive(Debug)]
pub struct IoTasks {
    pub epoch: u64,
    pub replayed: usize,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl IoTasks {
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }

    /// Wait for the writer to drain and close the stream, then stop the
    /// reader.
    pub async fn finish(self) {
        if let Err(error) = self.writer.await {
            debug!(%error, "writer task ended abnormally");
        }
        self.reader.abort();
    }
}

/// Attach `writer` to `link` and start both halves of the transport.
pub(crate) fn spawn_io<R, W>(
    link: Link,
    mut reader: R,
    mut writer: W,
    inbound: mpsc::UnboundedSender<Stanza>,
    idle_timeout: Option<Duration>,
) -> IoTasks
where
    R: FrameReader,
    W: FrameWriter,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (epoch, replayed) = link.attach(tx);

    let writer_link = link.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                WriterCommand::Frame(frame) => {
                    if let Err(error) = writer.send(&frame).await {
                        writer_link.on_transport_lost(epoch, &error.to_string());
                        break;
                    }
                }
                WriterCommand::Close => {
                    if let Err(error) = writer.close().await {
                        debug!(%error, "error while closing stream");
                    }
                    break;
                }
            }
        }
    });

    let reader_task = tokio::spawn(async move {
        loop {
            let next = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, reader.recv()).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectionError::Timeout),
                },
                None => reader.recv().await,
            };

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    link.on_transport_lost(epoch, "stream closed by peer");
                    break;
                }
                Err(error) => {
                    link.on_transport_lost(epoch, &error.to_string());
                    break;
                }
            };

            match link.handle_inbound(epoch, &frame) {
                Ok(Some(stanza)) => {
                    if inbound.send(stanza).is_err() {
                        debug!("inbound receiver dropped, stopping reader");
                        break;
                    }
                }
                Ok(None) => {}
                Err(ConnectionError::StreamError(condition)) => {
                    link.on_transport_lost(epoch, &format!("stream error: {condition}"));
                    break;
                }
                Err(ConnectionError::StreamManagement(
                    error @ StreamManagementError::CounterMismatch { .. },
                )) => {
                    link.on_transport_lost(epoch, &error.to_string());
                    break;
                }
                Err(error) => warn!(%error, "discarding inbound frame"),
            }
        }
    });

    IoTasks {
        epoch,
        replayed,
        reader: reader_task,
        writer: writer_task,
    }
}
