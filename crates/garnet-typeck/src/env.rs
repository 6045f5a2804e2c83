//! Lexical environment with scope stack.
//!
//! The environment maps local variable names to the graph nodes holding
//! their types. It uses a scope stack so that entering a block pushes a new
//! frame and leaving pops it; lookups search from the innermost scope
//! outward. It also carries what the expression being typed needs to know
//! about its surroundings: the type of `self`, the namespace used to resolve
//! type paths, and the enclosing definition instance.

use rustc_hash::FxHashMap;

use crate::graph::NodeId;
use crate::ty::TypeId;

/// The block passed to the definition instance being typed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockCtx {
    /// One node per block parameter, bound to the `yield` arguments.
    pub params: Vec<NodeId>,
    /// The block body; each `yield` takes its type.
    pub result: NodeId,
}

/// The definition instance whose body is being typed.
#[derive(Clone, Debug)]
pub struct DefFrame {
    /// Bound to the body and to every `return` value.
    pub return_node: NodeId,
    pub block: Option<BlockCtx>,
}

pub struct TypeEnv {
    /// The scope stack. Index 0 is the outermost scope.
    scopes: Vec<FxHashMap<String, NodeId>>,
    pub self_type: TypeId,
    /// Namespace in which type paths and constants are resolved.
    pub type_scope: TypeId,
    pub frame: Option<DefFrame>,
    /// Record expression types for the result. Only set for top-level code.
    pub record: bool,
}

impl TypeEnv {
    /// Create an environment with one empty scope.
    pub fn new(self_type: TypeId, type_scope: TypeId) -> Self {
        TypeEnv {
            scopes: vec![FxHashMap::default()],
            self_type,
            type_scope,
            frame: None,
            record: false,
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    /// Pop the top scope from the stack.
    ///
    /// # Panics
    ///
    /// Panics if called when only the outermost scope remains.
    pub fn pop_scope(&mut self) {
        assert!(self.scopes.len() > 1, "cannot pop the outermost scope");
        self.scopes.pop();
    }

    /// Bind `name` in the current (topmost) scope.
    pub fn insert(&mut self, name: String, node: NodeId) {
        self.scopes
            .last_mut()
            .expect("scope stack should never be empty")
            .insert(name, node);
    }

    /// Look up a name, searching from the innermost scope outward.
    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// The block of the enclosing definition instance, if it was given one.
    pub fn block(&self) -> Option<&BlockCtx> {
        self.frame.as_ref().and_then(|frame| frame.block.as_ref())
    }
}
