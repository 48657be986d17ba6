use std::collections::{BTreeMap, BTreeSet};

use super::descriptor::{Property, StateDescriptor};
use super::StateId;
use crate::config::{ModulesConfig, TlsPolicy};
use crate::modules::RuntimeState;

pub static DISCONNECTED: StateDescriptor = StateDescriptor {
    id: StateId::Disconnected,
    name: "Disconnected",
    reference: None,
    properties: &[],
    predecessors: &[],
    successors: &[StateId::Connect],
    precedence_over: &[],
    inferior_to: &[],
    factory: RuntimeState::marker,
};

pub static CONNECT: StateDescriptor = StateDescriptor {
    id: StateId::Connect,
    name: "Connect",
    reference: Some("RFC 6120 § 4"),
    properties: &[],
    predecessors: &[StateId::Disconnected],
    successors: &[StateId::ConnectedButUnauthenticated],
    precedence_over: &[],
    inferior_to: &[],
    factory: RuntimeState::connect,
};

pub static CONNECTED_BUT_UNAUTHENTICATED: StateDescriptor = StateDescriptor {
    id: StateId::ConnectedButUnauthenticated,
    name: "Connected but unauthenticated",
    reference: None,
    properties: &[Property::Final],
    predecessors: &[StateId::Connect],
    successors: &[StateId::SaslAuthentication],
    precedence_over: &[],
    inferior_to: &[],
    factory: RuntimeState::marker,
};

pub static START_TLS: StateDescriptor = StateDescriptor {
    id: StateId::StartTls,
    name: "STARTTLS",
    reference: Some("RFC 6120 § 5"),
    properties: &[],
    predecessors: &[StateId::ConnectedButUnauthenticated],
    successors: &[StateId::SaslAuthentication],
    precedence_over: &[StateId::SaslAuthentication],
    inferior_to: &[],
    factory: RuntimeState::start_tls,
};

pub static SASL_AUTHENTICATION: StateDescriptor = StateDescriptor {
    id: StateId::SaslAuthentication,
    name: "SASL authentication",
    reference: Some("RFC 6120 § 6"),
    properties: &[],
    predecessors: &[StateId::ConnectedButUnauthenticated],
    successors: &[StateId::AuthenticatedButUnbound],
    precedence_over: &[],
    inferior_to: &[],
    factory: RuntimeState::sasl,
};

pub static AUTHENTICATED_BUT_UNBOUND: StateDescriptor = StateDescriptor {
    id: StateId::AuthenticatedButUnbound,
    name: "Authenticated but unbound",
    reference: None,
    properties: &[],
    predecessors: &[StateId::SaslAuthentication],
    successors: &[StateId::ResourceBinding],
    precedence_over: &[],
    inferior_to: &[],
    factory: RuntimeState::marker,
};

pub static COMPRESSION: StateDescriptor = StateDescriptor {
    id: StateId::Compression,
    name: "Stream compression",
    reference: Some("XEP-0138"),
    properties: &[],
    predecessors: &[StateId::SaslAuthentication],
    successors: &[StateId::AuthenticatedButUnbound],
    precedence_over: &[StateId::AuthenticatedButUnbound],
    inferior_to: &[],
    factory: RuntimeState::compression,
};

pub static RESOURCE_BINDING: StateDescriptor = StateDescriptor {
    id: StateId::ResourceBinding,
    name: "Resource binding",
    reference: Some("RFC 6120 § 7"),
    properties: &[],
    predecessors: &[StateId::AuthenticatedButUnbound],
    successors: &[StateId::AuthenticatedAndResourceBound],
    precedence_over: &[],
    inferior_to: &[],
    factory: RuntimeState::resource_binding,
};

pub static STREAM_RESUMPTION: StateDescriptor = StateDescriptor {
    id: StateId::StreamResumption,
    name: "Stream resumption",
    reference: Some("XEP-0198 § 5"),
    properties: &[],
    predecessors: &[StateId::AuthenticatedButUnbound],
    successors: &[StateId::AuthenticatedAndResourceBound],
    precedence_over: &[StateId::ResourceBinding],
    inferior_to: &[],
    factory: RuntimeState::stream_resumption,
};

pub static STREAM_MANAGEMENT_ENABLE: StateDescriptor = StateDescriptor {
    id: StateId::StreamManagementEnable,
    name: "Enable stream management",
    reference: Some("XEP-0198 § 3"),
    properties: &[],
    predecessors: &[StateId::ResourceBinding],
    successors: &[StateId::AuthenticatedAndResourceBound],
    precedence_over: &[StateId::AuthenticatedAndResourceBound],
    inferior_to: &[],
    factory: RuntimeState::enable_stream_management,
};

pub static AUTHENTICATED_AND_RESOURCE_BOUND: StateDescriptor = StateDescriptor {
    id: StateId::AuthenticatedAndResourceBound,
    name: "Authenticated and resource bound",
    reference: None,
    properties: &[Property::Final],
    predecessors: &[],
    successors: &[],
    precedence_over: &[],
    inferior_to: &[],
    factory: RuntimeState::established,
};

pub static INSTANT_STREAM_RESUMPTION: StateDescriptor = StateDescriptor {
    id: StateId::InstantStreamResumption,
    name: "Instant stream resumption",
    reference: Some("XEP-0397"),
    properties: &[Property::NotImplemented],
    predecessors: &[StateId::ConnectedButUnauthenticated],
    successors: &[StateId::AuthenticatedAndResourceBound],
    precedence_over: &[StateId::SaslAuthentication],
    inferior_to: &[],
    factory: RuntimeState::marker,
};

static STANDARD: &[&StateDescriptor] = &[
    &DISCONNECTED,
    &CONNECT,
    &CONNECTED_BUT_UNAUTHENTICATED,
    &START_TLS,
    &SASL_AUTHENTICATION,
    &AUTHENTICATED_BUT_UNBOUND,
    &COMPRESSION,
    &RESOURCE_BINDING,
    &STREAM_RESUMPTION,
    &STREAM_MANAGEMENT_ENABLE,
    &AUTHENTICATED_AND_RESOURCE_BOUND,
    &INSTANT_STREAM_RESUMPTION,
];

/// Catalog of the descriptors a connection may use. Built explicitly and
/// handed to [`super::StateGraph::build`].
#[derive(Debug, Clone, Default)]
pub struct DescriptorRegistry {
    descriptors: BTreeMap<StateId, &'static StateDescriptor>,
}

impl DescriptorRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for descriptor in STANDARD {
            registry.register(descriptor);
        }
        registry
    }

    /// Add or replace a descriptor, returning the one it replaced.
    pub fn register(
        &mut self,
        descriptor: &'static StateDescriptor,
    ) -> Option<&'static StateDescriptor> {
        self.descriptors.insert(descriptor.id, descriptor)
    }

    pub fn get(&self, id: StateId) -> Option<&'static StateDescriptor> {
        self.descriptors.get(&id).copied()
    }

    pub fn contains(&self, id: StateId) -> bool {
        self.descriptors.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static StateDescriptor> + '_ {
        self.descriptors.values().copied()
    }

    /// The states a configuration asks for. Structural dependencies are
    /// pulled in later by graph construction.
    pub fn select(&self, modules: &ModulesConfig) -> BTreeSet<StateId> {
        let mut selected = BTreeSet::from([
            StateId::Connect,
            StateId::SaslAuthentication,
            StateId::ResourceBinding,
            StateId::AuthenticatedAndResourceBound,
        ]);

        if modules.tls != TlsPolicy::Disabled {
            selected.insert(StateId::StartTls);
        }
        if modules.compression {
            selected.insert(StateId::Compression);
        }

        let sm = &modules.stream_management;
        if sm.enabled {
            selected.insert(StateId::StreamManagementEnable);
            if sm.resumption {
                selected.insert(StateId::StreamResumption);
                selected.insert(StateId::InstantStreamResumption);
            }
        }

        selected
    }
}
