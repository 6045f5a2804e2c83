//! Garnet type checker: flow-based inference for a class-based language.
//!
//! Garnet programs carry no type annotations on locals or return values.
//! This crate infers the type of every expression by propagating concrete
//! types through a dependency graph:
//!
//! - Union types built from every value a slot may hold
//! - Overloads selected by parameter restrictions, most specific first
//! - One definition instance per receiver and argument types
//! - Generic specializations bound lazily through proxies
//! - Storage descriptors for the backend
//!
//! # Architecture
//!
//! - [`ty`]: Type representation (Type, ClassInfo, unions, proxies)
//! - [`registry`]: Type registry, namespaces, hierarchy queries and display
//! - [`unify`]: Merging types into canonical unions
//! - [`graph`]: Propagation graph and its work list
//! - [`overload`]: Definition tables and overload resolution
//! - [`generic`]: Specialization cache and generic proxies
//! - [`layout`]: Storage descriptors
//! - [`env`]: Lexical environment with scope stack
//! - [`builtins`]: Built-in type and primitive method registration
//! - [`error`]: Type errors with cause chains
//! - [`infer`]: The inference driver
//! - [`ast`]: The checked syntax tree

pub mod ast;
pub mod builtins;
pub mod env;
pub mod error;
pub mod generic;
pub mod graph;
pub mod infer;
pub mod layout;
pub mod overload;
pub mod registry;
pub mod ty;
pub mod unify;

use rustc_hash::FxHashMap;

use crate::ast::{Expr, ExprId};
use crate::error::TypeError;
use crate::layout::StorageDescriptor;
use crate::registry::TypeRegistry;
use crate::ty::TypeId;

pub use crate::infer::CheckOptions;

/// A definition instance typed during checking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSummary {
    /// `Foo#bar(Int, String)`
    pub signature: String,
    /// `None` if the body never produces a value.
    pub return_type: Option<TypeId>,
}

/// The result of type checking a Garnet program.
pub struct TypeckResult {
    /// Every type created while checking, with its final instance variables.
    pub registry: TypeRegistry,
    /// Final types of top-level expressions (def bodies are typed per
    /// instance and listed in `instances`).
    pub types: FxHashMap<ExprId, TypeId>,
    /// The type of the program's last expression.
    pub result_type: Option<TypeId>,
    pub instances: Vec<InstanceSummary>,
    pub pointer_size: u32,
}

impl TypeckResult {
    pub fn type_of(&self, expr: ExprId) -> Option<TypeId> {
        self.types.get(&expr).copied()
    }

    pub fn display(&self, ty: TypeId) -> String {
        self.registry.display(ty)
    }

    /// The rendered type of an expression, `"?"` if it has none.
    pub fn display_of(&self, expr: &Expr) -> String {
        match self.type_of(expr.id) {
            Some(ty) => self.display(ty),
            None => "?".to_string(),
        }
    }

    pub fn storage(&self, ty: TypeId) -> Option<StorageDescriptor> {
        self.registry.storage(ty, self.pointer_size)
    }

    /// Summaries of the instances whose signature starts with `prefix`.
    pub fn instances_of<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a InstanceSummary> + 'a {
        self.instances
            .iter()
            .filter(move |instance| instance.signature.starts_with(prefix))
    }
}

/// Type-check a program.
///
/// This is the main entry point for the type checker. It declares every
/// type and definition, infers all expressions and drives propagation to a
/// fixpoint. The first error aborts the run.
pub fn check(program: &Expr) -> Result<TypeckResult, TypeError> {
    infer::check(program)
}

pub fn check_with_options(program: &Expr, options: CheckOptions) -> Result<TypeckResult, TypeError> {
    infer::check_with_options(program, options)
}
