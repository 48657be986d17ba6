//! XEP-0198 stream management: sequence counters, the unacknowledged queue
//! and resumption bookkeeping for one logical session.

pub mod ack_policy;
pub mod unacked_queue;

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use xmpp_parsers::{
    minidom::Element,
    ns,
    sm::{A, Enable, Enabled, Nonza, R, Resume, Resumed, StreamId},
};

pub use ack_policy::{AckPolicy, AckPredicate, AfterXStanzas, ForMatchingOrAfterXStanzas, StanzaFilter};
pub use unacked_queue::{UnackedQueue, UnackedStanza};

use crate::config::StreamManagementConfig;
use crate::error::{StanzaError, StreamManagementError};
use crate::stanza::{Stanza, serialize_element};
use unacked_queue::sequence_gt;

/// Resumption window assumed when neither side states a maximum.
pub const DEFAULT_RESUMPTION_SECONDS: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Inactive,
    Negotiating,
    Active,
    MayResume {
        deadline: Instant,
    },
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackOutcome {
    pub sequence: u32,
    pub request_ack: bool,
}

#[derive(Debug)]
pub enum LossDisposition {
    MayResume { deadline: Instant, pending: usize },
    Terminated { undelivered: Vec<UnackedStanza> },
    NotEnabled,
}

impl LossDisposition {
    pub fn will_resume(&self) -> bool {
        matches!(self, LossDisposition::MayResume { .. })
    }
}

#[derive(Debug)]
pub struct StreamManagementSession {
    state: SessionState,
    h_out: u32,
    h_in: u32,
    last_acked: u32,
    flushed_through: u32,
    queue: UnackedQueue,
    stream_id: Option<String>,
    server_max: Option<u32>,
    preferred_max: Option<u32>,
    resumption_allowed: bool,
    policy: AckPolicy,
    watchers: HashMap<String, Vec<oneshot::Sender<UnackedStanza>>>,
}

impl StreamManagementSession {
    pub fn new(config: &StreamManagementConfig) -> Self {
        Self {
            state: SessionState::Inactive,
            h_out: 0,
            h_in: 0,
            last_acked: 0,
            flushed_through: 0,
            queue: UnackedQueue::new(config.unacked_queue_capacity),
            stream_id: None,
            server_max: None,
            preferred_max: config.preferred_resumption_seconds,
            resumption_allowed: config.resumption,
            policy: AckPolicy::from_config(config),
            watchers: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn h_out(&self) -> u32 {
        self.h_out
    }

    pub fn h_in(&self) -> u32 {
        self.h_in
    }

    /// Highest `h` the peer has confirmed.
    pub fn last_acked(&self) -> u32 {
        self.last_acked
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn queue(&self) -> &UnackedQueue {
        &self.queue
    }

    pub fn policy_mut(&mut self) -> &mut AckPolicy {
        &mut self.policy
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Outbound stanzas are sequenced while active and while waiting to
    /// resume.
    pub fn is_tracking(&self) -> bool {
        matches!(
            self.state,
            SessionState::Active | SessionState::MayResume { .. }
        )
    }

    pub fn can_resume(&self, now: Instant) -> bool {
        match self.state {
            SessionState::MayResume { deadline } => now < deadline && self.stream_id.is_some(),
            _ => false,
        }
    }

    /// Seconds the session stays resumable: the smaller of the client
    /// preference and the server maximum.
    pub fn resumption_window(&self) -> Duration {
        let seconds = match (self.preferred_max, self.server_max) {
            (Some(preferred), Some(server)) => preferred.min(server),
            (Some(preferred), None) => preferred,
            (None, Some(server)) => server,
            (None, None) => DEFAULT_RESUMPTION_SECONDS,
        };
        Duration::from_secs(u64::from(seconds))
    }

    pub fn request_enable(&mut self) -> Result<Nonza, StreamManagementError> {
        match self.state {
            SessionState::Inactive | SessionState::Terminated => {}
            SessionState::Negotiating => return Err(StreamManagementError::AlreadyEnabled("negotiating")),
            SessionState::Active | SessionState::MayResume { .. } => {
                return Err(StreamManagementError::AlreadyEnabled("enabled"));
            }
        }

        self.clear_counters();
        self.state = SessionState::Negotiating;

        let mut enable = Enable::new();
        if self.resumption_allowed {
            enable = enable.with_resume();
            if let Some(max) = self.preferred_max {
                enable = enable.with_max(max);
            }
        }
        Ok(Nonza::Enable(enable))
    }

    pub fn on_enabled(&mut self, enabled: Enabled) -> Result<(), StreamManagementError> {
        if self.state != SessionState::Negotiating {
            return Err(StreamManagementError::UnexpectedNonza("enabled".to_string()));
        }

        self.stream_id = if enabled.resume && self.resumption_allowed {
            enabled.id.map(|id| id.0)
        } else {
            None
        };
        self.server_max = enabled.max;
        self.state = SessionState::Active;
        debug!(
            resumable = self.stream_id.is_some(),
            max = ?self.server_max,
            "stream management enabled"
        );
        Ok(())
    }

    pub fn on_enable_failed(&mut self) {
        if self.state == SessionState::Negotiating {
            self.state = SessionState::Inactive;
        }
    }

    /// Assign the next sequence number to `stanza` and queue it. `written`
    /// says whether the stanza is handed to a live writer right now; queued
    /// but unwritten stanzas go out on the next attach.
    pub fn track_outbound(
        &mut self,
        stanza: Stanza,
        now: Instant,
        written: bool,
    ) -> Result<TrackOutcome, StreamManagementError> {
        if !self.is_tracking() {
            return Err(StreamManagementError::NotEnabled);
        }
        if self.queue.is_full() {
            return Err(StreamManagementError::QueueFull {
                capacity: self.queue.capacity(),
            });
        }

        let mut request_ack = self.is_active() && self.policy.on_outbound(&stanza);
        let sequence = self.h_out.wrapping_add(1);
        self.queue.push(sequence, stanza, now)?;
        self.h_out = sequence;
        if written {
            self.flushed_through = sequence;
        }

        if self.is_active() && self.queue.len() >= self.queue.high_water_mark() {
            request_ack = true;
        }

        Ok(TrackOutcome {
            sequence,
            request_ack,
        })
    }

    pub fn mark_inbound_handled(&mut self) {
        if self.is_active() {
            self.h_in = self.h_in.wrapping_add(1);
        }
    }

    /// Apply an `<a h='…'/>` from the peer, returning the newly confirmed
    /// stanzas.
    pub fn on_ack(&mut self, h: u32) -> Result<Vec<UnackedStanza>, StreamManagementError> {
        if !self.is_tracking() {
            return Err(StreamManagementError::NotEnabled);
        }
        self.prune(h)
    }

    fn prune(&mut self, h: u32) -> Result<Vec<UnackedStanza>, StreamManagementError> {
        if !sequence_gt(h, self.last_acked) {
            return Ok(Vec::new());
        }
        if sequence_gt(h, self.h_out) {
            return Err(StreamManagementError::CounterMismatch {
                acked: h,
                sent: self.h_out,
            });
        }

        let acked = self.queue.acknowledge(h);
        self.last_acked = h;

        for entry in &acked {
            let Some(id) = entry.stanza.id() else {
                continue;
            };
            if let Some(watchers) = self.watchers.remove(id) {
                for watcher in watchers {
                    let _ = watcher.send(entry.clone());
                }
            }
        }

        Ok(acked)
    }

    /// Answer to an inbound `<r/>`.
    pub fn answer_request(&self) -> Result<Nonza, StreamManagementError> {
        if !self.is_active() {
            return Err(StreamManagementError::NotEnabled);
        }
        Ok(Nonza::Ack(A::new(self.h_in)))
    }

    pub fn ack_request(&self) -> Result<Nonza, StreamManagementError> {
        if !self.is_active() {
            return Err(StreamManagementError::NotEnabled);
        }
        Ok(Nonza::Req(R))
    }

    pub fn on_transport_lost(&mut self, now: Instant) -> LossDisposition {
        match self.state {
            SessionState::Active if self.stream_id.is_some() => {
                let deadline = now + self.resumption_window();
                self.state = SessionState::MayResume { deadline };
                LossDisposition::MayResume {
                    deadline,
                    pending: self.queue.len(),
                }
            }
            SessionState::Active => LossDisposition::Terminated {
                undelivered: self.terminate(),
            },
            SessionState::MayResume { deadline } => LossDisposition::MayResume {
                deadline,
                pending: self.queue.len(),
            },
            SessionState::Negotiating => {
                self.state = SessionState::Inactive;
                LossDisposition::NotEnabled
            }
            SessionState::Inactive | SessionState::Terminated => LossDisposition::NotEnabled,
        }
    }

    /// Terminate a resumable session whose window has passed.
    pub fn expire_if_due(&mut self, now: Instant) -> Option<Vec<UnackedStanza>> {
        match self.state {
            SessionState::MayResume { deadline } if now >= deadline => {
                debug!("stream resumption window elapsed");
                Some(self.terminate())
            }
            _ => None,
        }
    }

    pub fn resume_request(&self, now: Instant) -> Result<Nonza, StreamManagementError> {
        if !self.can_resume(now) {
            return Err(StreamManagementError::NotEnabled);
        }
        let previd = self.stream_id.clone().ok_or(StreamManagementError::NotEnabled)?;
        Ok(Nonza::Resume(Resume {
            h: self.h_in,
            previd: StreamId(previd),
        }))
    }

    /// Apply `<resumed/>`. Returns how many queued stanzas are left for
    /// replay; they are handed out by [`Self::take_unflushed`].
    pub fn on_resumed(&mut self, resumed: Resumed) -> Result<usize, StreamManagementError> {
        if !matches!(self.state, SessionState::MayResume { .. }) {
            return Err(StreamManagementError::UnexpectedNonza("resumed".to_string()));
        }

        let expected = self.stream_id.clone().unwrap_or_default();
        if resumed.previd.0 != expected {
            return Err(StreamManagementError::StreamIdMismatch {
                expected,
                received: resumed.previd.0,
            });
        }

        self.prune(resumed.h)?;
        self.flushed_through = self.last_acked;
        self.state = SessionState::Active;
        Ok(self.queue.len())
    }

    /// Apply `<failed/>` in reply to `<resume/>`. Stanzas the peer still
    /// confirmed through `h` are pruned first; everything else is returned
    /// as undelivered.
    pub fn on_resume_failed(&mut self, h: Option<u32>) -> Vec<UnackedStanza> {
        if let Some(h) = h {
            if let Err(error) = self.prune(h) {
                warn!(%error, "ignoring handled count in <failed/>");
            }
        }
        self.terminate()
    }

    /// Give up on a session that is still waiting to resume, typically
    /// because a fresh resource was bound instead. Returns its queue.
    pub fn abandon_resumable(&mut self) -> Option<Vec<UnackedStanza>> {
        matches!(self.state, SessionState::MayResume { .. }).then(|| self.terminate())
    }

    /// Queued stanzas not yet handed to a writer, oldest first.
    pub fn take_unflushed(&mut self) -> Vec<Stanza> {
        if !self.is_active() {
            return Vec::new();
        }
        let unflushed = self
            .queue
            .unacked_after(self.flushed_through)
            .map(|entry| entry.stanza.clone())
            .collect();
        self.flushed_through = self.h_out;
        unflushed
    }

    /// Register a one-shot listener for the acknowledgment of a pending
    /// stanza. The receiver errors if the session terminates first.
    pub fn watch_acknowledgement(
        &mut self,
        id: &str,
    ) -> Result<oneshot::Receiver<UnackedStanza>, StreamManagementError> {
        if !self.is_tracking() {
            return Err(StreamManagementError::NotEnabled);
        }
        if !self.queue.contains_id(id) {
            return Err(StreamManagementError::NotPending(id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        self.watchers.entry(id.to_string()).or_default().push(tx);
        Ok(rx)
    }

    /// Drop every watcher registered for `id`. Their receivers error.
    /// Returns whether any was registered.
    pub fn unwatch_acknowledgement(&mut self, id: &str) -> bool {
        self.watchers.remove(id).is_some()
    }

    /// Forget everything after a graceful close. Returns what was still
    /// unconfirmed.
    pub fn reset(&mut self) -> Vec<UnackedStanza> {
        let undelivered = self.queue.drain();
        self.clear_counters();
        self.state = SessionState::Inactive;
        undelivered
    }

    fn terminate(&mut self) -> Vec<UnackedStanza> {
        self.state = SessionState::Terminated;
        self.stream_id = None;
        self.watchers.clear();
        self.queue.drain()
    }

    fn clear_counters(&mut self) {
        self.h_out = 0;
        self.h_in = 0;
        self.last_acked = 0;
        self.flushed_through = 0;
        self.stream_id = None;
        self.server_max = None;
        self.queue.clear();
        self.watchers.clear();
    }
}

pub fn is_nonza(element: &Element) -> bool {
    element.ns() == ns::SM
}

pub fn decode_nonza(element: Element) -> Result<Nonza, StreamManagementError> {
    let name = element.name().to_string();
    Nonza::try_from(element).map_err(|_| StreamManagementError::UnexpectedNonza(name))
}

pub fn encode_nonza(nonza: Nonza) -> Result<Vec<u8>, StanzaError> {
    let element: Element = nonza.into();
    serialize_element(&element)
}

/// Name of the defined condition carried by `<failed/>`, if any.
pub fn failure_condition(element: &Element) -> Option<String> {
    element.children().next().map(|child| child.name().to_string())
}
