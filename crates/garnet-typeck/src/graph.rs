//! The propagation graph: typed nodes, dependency edges and the work list.
//!
//! Every typed expression is a node. A node bound to dependencies takes the
//! type of its single dependency, or the merge of all of them. Type changes
//! are pushed through an explicit FIFO work list rather than recursive
//! notification, and each changed node is processed once per change.
//!
//! Nodes can also be observed by call sites and generic proxies. Those are
//! not recomputed here; [`TypeGraph::propagate`] returns them as [`Wake`]s
//! for the inference driver to handle.

use std::collections::VecDeque;

use tracing::trace;

use garnet_common::Location;

use crate::error::TypeError;
use crate::registry::TypeRegistry;
use crate::ty::TypeId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// A call site tracked by the inference driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Takes the (merged) type of its dependencies.
    Plain,
    /// Takes `Pointer<T>` where `T` is the merged type of its dependencies.
    PointerTo,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Observer {
    Node(NodeId),
    Call(CallId),
    Proxy(TypeId),
}

/// An observer outside the graph that must react to a change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wake {
    Call(CallId),
    Proxy(TypeId),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    ty: Option<TypeId>,
    deps: Vec<NodeId>,
    observers: Vec<Observer>,
    dirty: bool,
    location: Location,
}

#[derive(Debug)]
pub struct TypeGraph {
    nodes: Vec<Node>,
    queue: VecDeque<NodeId>,
    steps: usize,
    max_steps: usize,
}

impl TypeGraph {
    /// Create an empty graph that gives up after `max_steps` work-list steps.
    pub fn new(max_steps: usize) -> Self {
        TypeGraph {
            nodes: Vec::new(),
            queue: VecDeque::new(),
            steps: 0,
            max_steps,
        }
    }

    fn push(&mut self, kind: NodeKind, ty: Option<TypeId>, location: Location) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            ty,
            deps: Vec::new(),
            observers: Vec::new(),
            dirty: false,
            location,
        });
        id
    }

    pub fn add_node(&mut self, location: Location) -> NodeId {
        self.push(NodeKind::Plain, None, location)
    }

    pub fn add_pointer_node(&mut self, location: Location) -> NodeId {
        self.push(NodeKind::PointerTo, None, location)
    }

    /// A node that starts out with type `ty`.
    pub fn typed_node(&mut self, ty: TypeId, location: Location) -> NodeId {
        self.push(NodeKind::Plain, Some(ty), location)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn type_of(&self, node: NodeId) -> Option<TypeId> {
        self.nodes[node.0 as usize].ty
    }

    pub fn deps(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node.0 as usize].deps
    }

    pub fn location(&self, node: NodeId) -> &Location {
        &self.nodes[node.0 as usize].location
    }

    pub fn is_dirty(&self, node: NodeId) -> bool {
        self.nodes[node.0 as usize].dirty
    }

    /// Add the edge `dep -> node`. If `dep` is already typed, `node` is
    /// recomputed right away.
    pub fn bind_to(&mut self, reg: &mut TypeRegistry, node: NodeId, dep: NodeId) {
        let entry = &mut self.nodes[node.0 as usize];
        if !entry.deps.contains(&dep) {
            entry.deps.push(dep);
        }
        self.observe(dep, Observer::Node(node));
        if self.type_of(dep).is_some() {
            self.recompute(reg, node);
        }
    }

    /// Remove the edge `dep -> node` and recompute `node` from what is left.
    pub fn unbind_from(&mut self, reg: &mut TypeRegistry, node: NodeId, dep: NodeId) {
        self.nodes[node.0 as usize].deps.retain(|d| *d != dep);
        self.unobserve(dep, Observer::Node(node));
        self.recompute(reg, node);
    }

    pub fn observe(&mut self, node: NodeId, observer: Observer) {
        let observers = &mut self.nodes[node.0 as usize].observers;
        if !observers.contains(&observer) {
            observers.push(observer);
        }
    }

    pub fn unobserve(&mut self, node: NodeId, observer: Observer) {
        self.nodes[node.0 as usize]
            .observers
            .retain(|o| *o != observer);
    }

    /// Set the type of `node`. A change marks it dirty and queues it.
    ///
    /// Only identical ids short-circuit. A proxy replaced by its successor
    /// counts as a change even though both stand for related types.
    pub fn set_type(&mut self, node: NodeId, ty: TypeId) {
        let entry = &mut self.nodes[node.0 as usize];
        if entry.ty == Some(ty) {
            return;
        }
        entry.ty = Some(ty);
        if !entry.dirty {
            entry.dirty = true;
            self.queue.push_back(node);
        }
    }

    /// Overwrite the type of `node` without notifying anyone.
    pub fn replace_type(&mut self, node: NodeId, ty: TypeId) {
        self.nodes[node.0 as usize].ty = Some(ty);
    }

    /// Recompute `node` from its typed dependencies.
    fn recompute(&mut self, reg: &mut TypeRegistry, node: NodeId) {
        let entry = &self.nodes[node.0 as usize];
        let kind = entry.kind;
        let typed: Vec<TypeId> = entry
            .deps
            .iter()
            .filter_map(|dep| self.nodes[dep.0 as usize].ty)
            .collect();
        let merged = match typed.as_slice() {
            [] => return,
            [single] => Some(*single),
            _ => reg.merge(&typed),
        };
        let Some(merged) = merged else {
            return;
        };
        let ty = match kind {
            NodeKind::Plain => merged,
            NodeKind::PointerTo => reg.pointer_of(merged),
        };
        self.set_type(node, ty);
    }

    /// Drain the work list until no node is dirty.
    ///
    /// Returns the call sites and proxies observing nodes that changed, in
    /// first-notified order and without duplicates.
    pub fn propagate(&mut self, reg: &mut TypeRegistry) -> Result<Vec<Wake>, TypeError> {
        let mut wakes = Vec::new();
        while let Some(node) = self.queue.pop_front() {
            self.steps += 1;
            if self.steps > self.max_steps {
                return Err(TypeError::internal(format!(
                    "type propagation did not reach a fixpoint within {} steps",
                    self.max_steps
                )));
            }
            let entry = &mut self.nodes[node.0 as usize];
            entry.dirty = false;
            trace!(node = node.0, ty = ?entry.ty, "propagating");

            let observers = entry.observers.clone();
            for observer in observers {
                let wake = match observer {
                    Observer::Node(next) => {
                        self.recompute(reg, next);
                        continue;
                    }
                    Observer::Call(call) => Wake::Call(call),
                    Observer::Proxy(proxy) => Wake::Proxy(proxy),
                };
                if !wakes.contains(&wake) {
                    wakes.push(wake);
                }
            }
        }
        Ok(wakes)
    }

    pub fn dirty_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.dirty).count()
    }

    /// No node is dirty and nothing is queued.
    pub fn is_settled(&self) -> bool {
        self.queue.is_empty() && self.dirty_count() == 0
    }

    /// Iterate over every node and its current type.
    pub fn types(&self) -> impl Iterator<Item = (NodeId, Option<TypeId>)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeId(i as u32), node.ty))
    }
}
