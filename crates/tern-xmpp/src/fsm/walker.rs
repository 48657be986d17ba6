use std::collections::BTreeSet;

use tracing::{debug, warn};

use super::descriptor::StateDescriptor;
use super::graph::StateGraph;
use super::{Feasibility, StateDriver, StateId, TransitionOutcome, TransitionStep};
use crate::error::{ConnectionError, WalkError};

/// Bookkeeping for one connect attempt.
#[derive(Debug, Clone)]
pub struct WalkContext {
    target: StateId,
    mandatory: BTreeSet<StateId>,
    path: Vec<StateId>,
    failed: Vec<(StateId, String)>,
}

impl WalkContext {
    pub fn new(target: StateId) -> Self {
        Self {
            target,
            mandatory: BTreeSet::new(),
            path: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Require `state` on the path. If it is a candidate and cannot be
    /// entered, the walk fails instead of trying alternatives.
    pub fn with_mandatory(mut self, state: StateId) -> Self {
        self.mandatory.insert(state);
        self
    }

    pub fn target(&self) -> StateId {
        self.target
    }

    pub fn path(&self) -> &[StateId] {
        &self.path
    }

    pub fn failed(&self) -> &[(StateId, String)] {
        &self.failed
    }

    pub fn is_visited(&self, state: StateId) -> bool {
        self.path.contains(&state)
    }

    pub fn is_failed(&self, state: StateId) -> bool {
        self.failed.iter().any(|(failed, _)| *failed == state)
    }

    fn enter(&mut self, state: StateId) {
        self.path.push(state);
    }

    fn record_failure(&mut self, state: StateId, reason: String) {
        debug!(state = %state, %reason, "state ruled out for this walk");
        self.failed.push((state, reason));
    }

    fn dead_end(&self) -> WalkError {
        WalkError::DeadEnd {
            path: self.path.clone(),
            failed: self.failed.clone(),
        }
    }
}

enum Attempt {
    Entered(String),
    Rejected(String),
    Aborted(ConnectionError),
}

pub struct GraphWalker<'g> {
    graph: &'g StateGraph,
}

impl<'g> GraphWalker<'g> {
    pub fn new(graph: &'g StateGraph) -> Self {
        Self { graph }
    }

    /// Candidates reachable from `current` right now, in the order they
    /// should be attempted.
    pub fn frontier(&self, current: StateId, walk: &WalkContext) -> Vec<&'static StateDescriptor> {
        self.graph
            .successors(current)
            .iter()
            .filter(|id| !walk.is_visited(**id) && !walk.is_failed(**id))
            .filter_map(|id| self.graph.descriptor(*id))
            .filter(|descriptor| {
                descriptor
                    .predecessors
                    .iter()
                    .filter(|p| self.graph.contains(**p))
                    .all(|p| walk.is_visited(*p))
            })
            .collect()
    }

    /// Drive `driver` from the graph's initial state to `walk.target()`.
    pub async fn walk<D: StateDriver>(
        &self,
        driver: &mut D,
        walk: &mut WalkContext,
    ) -> Result<(), WalkError> {
        let mut current = self.graph.initial();
        walk.enter(current);

        loop {
            if current == walk.target {
                if let Some(missing) = walk.mandatory.iter().find(|m| !walk.is_visited(**m)) {
                    return Err(WalkError::MandatoryStateFailed {
                        state: *missing,
                        reason: "not on the negotiated path".to_string(),
                    });
                }
                debug!(path = ?walk.path, "reached target state");
                driver.on_transition(current, TransitionStep::FinalStateReached);
                return Ok(());
            }

            driver.on_transition(current, TransitionStep::DetermineNextState);
            let candidates = self.frontier(current, walk);

            if let Some(mandatory) = candidates
                .iter()
                .find(|d| walk.mandatory.contains(&d.id))
                .copied()
            {
                match self.attempt(driver, mandatory).await {
                    Attempt::Entered(description) => {
                        debug!(state = %mandatory.id, %description, "entered mandatory state");
                        walk.enter(mandatory.id);
                        current = mandatory.id;
                        continue;
                    }
                    Attempt::Rejected(reason) => {
                        warn!(state = %mandatory.id, %reason, "mandatory state failed");
                        walk.record_failure(mandatory.id, reason.clone());
                        return Err(WalkError::MandatoryStateFailed {
                            state: mandatory.id,
                            reason,
                        });
                    }
                    Attempt::Aborted(error) => {
                        return Err(WalkError::Fatal {
                            state: mandatory.id,
                            source: Box::new(error),
                        });
                    }
                }
            }

            let mut next = None;
            for candidate in candidates {
                match self.attempt(driver, candidate).await {
                    Attempt::Entered(description) => {
                        debug!(state = %candidate.id, %description, "entered state");
                        next = Some(candidate.id);
                        break;
                    }
                    Attempt::Rejected(reason) => walk.record_failure(candidate.id, reason),
                    Attempt::Aborted(error) => {
                        warn!(state = %candidate.id, %error, "transition aborted the walk");
                        return Err(WalkError::Fatal {
                            state: candidate.id,
                            source: Box::new(error),
                        });
                    }
                }
            }

            match next {
                Some(state) => {
                    walk.enter(state);
                    current = state;
                }
                None => return Err(walk.dead_end()),
            }
        }
    }

    async fn attempt<D: StateDriver>(
        &self,
        driver: &mut D,
        descriptor: &'static StateDescriptor,
    ) -> Attempt {
        let state = descriptor.id;
        let feasibility = if descriptor.is_not_implemented() {
            Feasibility::Impossible("not implemented".to_string())
        } else {
            driver.is_transition_possible(descriptor)
        };
        match feasibility {
            Feasibility::Possible => {}
            Feasibility::Impossible(reason) => {
                driver.on_transition(state, TransitionStep::NotPossible { reason: reason.clone() });
                return Attempt::Rejected(reason);
            }
            Feasibility::Fatal(error) => {
                driver.on_transition(state, TransitionStep::Aborted { error: error.to_string() });
                return Attempt::Aborted(error);
            }
        }

        driver.on_transition(state, TransitionStep::AboutToTransition);
        let (step, attempt) = match driver.transition_into(descriptor).await {
            TransitionOutcome::Success(description) => (
                TransitionStep::Entered {
                    description: description.clone(),
                },
                Attempt::Entered(description),
            ),
            TransitionOutcome::Failed(reason) => (
                TransitionStep::Failed {
                    reason: reason.clone(),
                },
                Attempt::Rejected(reason),
            ),
            TransitionOutcome::Fatal(error) => (
                TransitionStep::Aborted {
                    error: error.to_string(),
                },
                Attempt::Aborted(error),
            ),
        };
        driver.on_transition(state, step);
        attempt
    }
}
