use std::fmt;

use super::StateId;
use crate::modules::RuntimeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    /// A connection may rest in this state.
    Final,
    /// Placeholder for a capability this crate does not negotiate yet.
    NotImplemented,
}

/// Static declaration of one connection state and where it sits relative
/// to the others.
pub struct StateDescriptor {
    pub id: StateId,
    pub name: &'static str,
    pub reference: Option<&'static str>,
    pub properties: &'static [Property],
    pub predecessors: &'static [StateId],
    pub successors: &'static [StateId],
    /// Tried before these states when both are candidates.
    pub precedence_over: &'static [StateId],
    /// Tried after these states when both are candidates.
    pub inferior_to: &'static [StateId],
    pub factory: fn() -> RuntimeState,
}

impl StateDescriptor {
    pub fn has_property(&self, property: Property) -> bool {
        self.properties.contains(&property)
    }

    pub fn is_final(&self) -> bool {
        self.has_property(Property::Final)
    }

    pub fn is_not_implemented(&self) -> bool {
        self.has_property(Property::NotImplemented)
    }

    pub fn instantiate(&self) -> RuntimeState {
        (self.factory)()
    }

    /// Every state this descriptor names through a hard edge.
    pub fn structural_references(&self) -> impl Iterator<Item = StateId> + '_ {
        self.predecessors.iter().chain(self.successors.iter()).copied()
    }
}

impl fmt::Debug for StateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for StateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reference {
            Some(reference) => write!(f, "{} ({reference})", self.name),
            None => f.write_str(self.name),
        }
    }
}
