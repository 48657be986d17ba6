use std::fmt;
use std::sync::Arc;

use crate::config::StreamManagementConfig;
use crate::stanza::Stanza;

/// Decides whether a stanza that matches it needs an immediate ack request.
#[derive(Clone)]
pub struct StanzaFilter {
    name: &'static str,
    matches: Arc<dyn Fn(&Stanza) -> bool + Send + Sync>,
}

impl StanzaFilter {
    pub fn new(name: &'static str, matches: impl Fn(&Stanza) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name,
            matches: Arc::new(matches),
        }
    }

    pub fn iq_requests() -> Self {
        Self::new("iq-requests", Stanza::is_iq_request)
    }

    pub fn matches(&self, stanza: &Stanza) -> bool {
        (self.matches)(stanza)
    }
}

impl fmt::Debug for StanzaFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StanzaFilter").field(&self.name).finish()
    }
}

/// Fires on every `threshold`-th send.
#[derive(Debug, Clone)]
pub struct AfterXStanzas {
    threshold: u32,
    sent_since_request: u32,
}

impl AfterXStanzas {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            sent_since_request: 0,
        }
    }

    pub fn on_outbound(&mut self) -> bool {
        self.sent_since_request += 1;
        if self.sent_since_request >= self.threshold {
            self.sent_since_request = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.sent_since_request = 0;
    }

    pub fn pending(&self) -> u32 {
        self.sent_since_request
    }
}

/// Fires at once for stanzas matching the filter, otherwise falls back to
/// counting. A match also restarts the count.
#[derive(Debug, Clone)]
pub struct ForMatchingOrAfterXStanzas {
    filter: StanzaFilter,
    fallback: AfterXStanzas,
}

impl ForMatchingOrAfterXStanzas {
    pub fn new(filter: StanzaFilter, threshold: u32) -> Self {
        Self {
            filter,
            fallback: AfterXStanzas::new(threshold),
        }
    }

    pub fn on_outbound(&mut self, stanza: &Stanza) -> bool {
        if self.filter.matches(stanza) {
            self.fallback.reset();
            return true;
        }
        self.fallback.on_outbound()
    }
}

#[derive(Debug, Clone)]
pub enum AckPredicate {
    AfterXStanzas(AfterXStanzas),
    ForMatchingOrAfterXStanzas(ForMatchingOrAfterXStanzas),
    ForMatching(StanzaFilter),
}

impl AckPredicate {
    pub fn after_x_stanzas(threshold: u32) -> Self {
        AckPredicate::AfterXStanzas(AfterXStanzas::new(threshold))
    }

    pub fn for_matching_or_after_x_stanzas(filter: StanzaFilter, threshold: u32) -> Self {
        AckPredicate::ForMatchingOrAfterXStanzas(ForMatchingOrAfterXStanzas::new(filter, threshold))
    }

    fn on_outbound(&mut self, stanza: &Stanza) -> bool {
        match self {
            AckPredicate::AfterXStanzas(predicate) => predicate.on_outbound(),
            AckPredicate::ForMatchingOrAfterXStanzas(predicate) => predicate.on_outbound(stanza),
            AckPredicate::ForMatching(filter) => filter.matches(stanza),
        }
    }
}

/// The OR of every registered predicate. All predicates see every send so
/// their counters stay in step.
#[derive(Debug, Clone, Default)]
pub struct AckPolicy {
    predicates: Vec<AckPredicate>,
}

impl AckPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &StreamManagementConfig) -> Self {
        let predicate = if config.ack_on_iq_requests {
            AckPredicate::for_matching_or_after_x_stanzas(
                StanzaFilter::iq_requests(),
                config.ack_request_interval,
            )
        } else {
            AckPredicate::after_x_stanzas(config.ack_request_interval)
        };
        Self {
            predicates: vec![predicate],
        }
    }

    pub fn with(mut self, predicate: AckPredicate) -> Self {
        self.add(predicate);
        self
    }

    pub fn add(&mut self, predicate: AckPredicate) {
        self.predicates.push(predicate);
    }

    pub fn clear(&mut self) {
        self.predicates.clear();
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn on_outbound(&mut self, stanza: &Stanza) -> bool {
        self.predicates
            .iter_mut()
            .fold(false, |fire, predicate| predicate.on_outbound(stanza) | fire)
    }
}
