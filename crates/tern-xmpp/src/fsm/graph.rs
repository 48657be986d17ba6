use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt::Write as _;

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use tracing::debug;

use super::descriptor::StateDescriptor;
use super::registry::DescriptorRegistry;
use super::StateId;
use crate::error::GraphError;

#[derive(Debug, Clone, Copy, Default)]
pub struct GraphOptions {
    /// Reject graphs with unreachable states, dead ends or precedence
    /// declarations naming absent states.
    pub fail_on_unreachable_states: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Structural,
    Precedence,
}

/// Validated, immutable graph of the states one connection may walk.
#[derive(Debug, Clone)]
pub struct StateGraph {
    initial: StateId,
    nodes: BTreeMap<StateId, &'static StateDescriptor>,
    edges: BTreeSet<(StateId, StateId)>,
    precedence: BTreeSet<(StateId, StateId)>,
    successors: BTreeMap<StateId, Vec<StateId>>,
}

impl StateGraph {
    pub fn build(
        registry: &DescriptorRegistry,
        selected: impl IntoIterator<Item = StateId>,
        options: GraphOptions,
    ) -> Result<Self, GraphError> {
        let initial = StateId::INITIAL;
        let nodes = close_over_references(registry, initial, selected)?;

        let mut edges = BTreeSet::new();
        for descriptor in nodes.values() {
            for successor in descriptor.successors {
                edges.insert((descriptor.id, *successor));
            }
            for predecessor in descriptor.predecessors {
                edges.insert((*predecessor, descriptor.id));
            }
        }

        let mut precedence = BTreeSet::new();
        for descriptor in nodes.values() {
            let declared = descriptor
                .precedence_over
                .iter()
                .map(|target| (descriptor.id, *target, *target))
                .chain(
                    descriptor
                        .inferior_to
                        .iter()
                        .map(|superior| (*superior, descriptor.id, *superior)),
                );
            for (before, after, named) in declared {
                if nodes.contains_key(&named) {
                    precedence.insert((before, after));
                } else if options.fail_on_unreachable_states {
                    return Err(GraphError::UnknownPrecedenceTarget {
                        state: descriptor.id,
                        target: named,
                    });
                } else {
                    debug!(state = %descriptor.id, target = %named, "ignoring precedence over absent state");
                }
            }
        }

        let mut ordering: DiGraphMap<StateId, Edge> = DiGraphMap::new();
        let mut structure: DiGraphMap<StateId, ()> = DiGraphMap::new();
        for id in nodes.keys() {
            ordering.add_node(*id);
            structure.add_node(*id);
        }
        for (before, after) in &precedence {
            ordering.add_edge(*before, *after, Edge::Precedence);
        }
        for (from, to) in &edges {
            ordering.add_edge(*from, *to, Edge::Structural);
            structure.add_edge(*from, *to, ());
        }

        toposort(&ordering, None).map_err(|cycle| GraphError::Cycle {
            state: cycle.node_id(),
        })?;

        if !nodes.values().any(|d| d.is_final()) {
            return Err(GraphError::NoFinalState);
        }

        let mut reachable = BTreeSet::new();
        let mut dfs = Dfs::new(&structure, initial);
        while let Some(id) = dfs.next(&structure) {
            reachable.insert(id);
        }
        if !reachable.iter().any(|id| nodes[id].is_final()) {
            return Err(GraphError::UnreachableFinalState { initial });
        }

        if options.fail_on_unreachable_states {
            let unreachable: Vec<StateId> = nodes
                .keys()
                .filter(|id| !reachable.contains(id))
                .copied()
                .collect();
            if !unreachable.is_empty() {
                return Err(GraphError::UnreachableStates {
                    states: unreachable,
                });
            }
            if let Some(dead_end) = nodes.values().find(|d| {
                !d.is_final() && structure.neighbors(d.id).next().is_none()
            }) {
                return Err(GraphError::DeadEndState { state: dead_end.id });
            }
        }

        let successors = nodes
            .keys()
            .map(|id| {
                let siblings: Vec<StateId> = structure.neighbors(*id).collect();
                (*id, order_candidates(&ordering, siblings))
            })
            .collect();

        Ok(Self {
            initial,
            nodes,
            edges,
            precedence,
            successors,
        })
    }

    /// Graph of the standard registry for the modules `config` enables.
    pub fn for_config(
        registry: &DescriptorRegistry,
        config: &crate::config::ModulesConfig,
    ) -> Result<Self, GraphError> {
        Self::build(
            registry,
            registry.select(config),
            GraphOptions {
                fail_on_unreachable_states: config.fail_on_unreachable_states,
            },
        )
    }

    pub fn initial(&self) -> StateId {
        self.initial
    }

    pub fn contains(&self, id: StateId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn descriptor(&self, id: StateId) -> Option<&'static StateDescriptor> {
        self.nodes.get(&id).copied()
    }

    pub fn states(&self) -> impl Iterator<Item = StateId> + '_ {
        self.nodes.keys().copied()
    }

    /// Direct successors of `id` in the order the walker tries them.
    pub fn successors(&self, id: StateId) -> &[StateId] {
        self.successors.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph {\n");
        for descriptor in self.nodes.values() {
            let shape = if descriptor.is_final() {
                "doublecircle"
            } else {
                "ellipse"
            };
            let style = if descriptor.is_not_implemented() {
                ", style=dashed"
            } else {
                ""
            };
            let _ = writeln!(
                dot,
                "    {} [label=\"{}\", shape={shape}{style}];",
                descriptor.id, descriptor.name
            );
        }
        for (from, to) in &self.edges {
            let _ = writeln!(dot, "    {from} -> {to};");
        }
        for (before, after) in &self.precedence {
            let _ = writeln!(dot, "    {before} -> {after} [style=dashed, constraint=false];");
        }
        dot.push_str("}\n");
        dot
    }
}

fn close_over_references(
    registry: &DescriptorRegistry,
    initial: StateId,
    selected: impl IntoIterator<Item = StateId>,
) -> Result<BTreeMap<StateId, &'static StateDescriptor>, GraphError> {
    let mut nodes = BTreeMap::new();
    let mut pending: Vec<(StateId, StateId)> = std::iter::once(initial)
        .chain(selected)
        .map(|id| (initial, id))
        .collect();

    while let Some((referenced_by, id)) = pending.pop() {
        if nodes.contains_key(&id) {
            continue;
        }
        let descriptor = registry.get(id).ok_or(GraphError::UnknownState {
            referenced_by,
            missing: id,
        })?;
        nodes.insert(id, descriptor);
        pending.extend(
            descriptor
                .structural_references()
                .filter(|reference| !nodes.contains_key(reference))
                .map(|reference| (id, reference)),
        );
    }

    Ok(nodes)
}

/// Topological order of `candidates` under every path in `ordering`, ties
/// broken by ascending priority.
fn order_candidates(ordering: &DiGraphMap<StateId, Edge>, candidates: Vec<StateId>) -> Vec<StateId> {
    let mut in_degree: BTreeMap<StateId, usize> =
        candidates.iter().map(|id| (*id, 0)).collect();
    let mut before: BTreeMap<StateId, Vec<StateId>> = BTreeMap::new();

    for a in &candidates {
        for b in &candidates {
            if a != b && has_path_connecting(ordering, *a, *b, None) {
                before.entry(*a).or_default().push(*b);
                if let Some(degree) = in_degree.get_mut(b) {
                    *degree += 1;
                }
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<StateId>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();
    let mut ordered = Vec::with_capacity(candidates.len());

    while let Some(Reverse(id)) = ready.pop() {
        ordered.push(id);
        for next in before.get(&id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(*next));
                }
            }
        }
    }

    ordered
}
