//! The inference driver.
//!
//! Visits a whole program in two declaration passes and one expression
//! pass, then drives the propagation graph to a fixpoint:
//!
//! 1. Types: classes, modules, structs, includes and constants are
//!    registered in program order.
//! 2. Definitions: every `def` is indexed on its owner, so calls may
//!    precede the textual definition.
//! 3. Expressions: each expression becomes a graph node bound to its
//!    sub-expressions. A call observes its receiver and arguments and is
//!    resolved whenever all of them are typed; resolving it types the
//!    selected definition instances and binds the call to their results.
//!
//! Call sites and generic proxies woken by the work list are handled until
//! nothing changes. Any error aborts the run.

use std::rc::Rc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use tracing::{debug, instrument};

use garnet_common::Location;

use crate::ast::{AssignTarget, Block, ClassDecl, DefDecl, Expr, ExprId, ExprKind, StructDecl, TypeRef};
use crate::env::{BlockCtx, DefFrame, TypeEnv};
use crate::error::{LookupKind, TypeError, TypeErrorKind};
use crate::generic::{install_proxy, refresh_proxy};
use crate::graph::{CallId, NodeId, Observer, TypeGraph, Wake};
use crate::overload::{Def, DefBody, LookupMiss, MissKind, Param, Restriction};
use crate::registry::TypeRegistry;
use crate::ty::{DefId, Type, TypeId};
use crate::{InstanceSummary, TypeckResult};

/// Limits and target parameters of one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckOptions {
    /// Work-list steps before propagation is declared non-terminating.
    pub max_propagation_steps: usize,
    /// How many times a generic proxy may be superseded on one node.
    pub max_proxy_generations: u32,
    /// Pointer width of the target, in bytes.
    pub pointer_size: u32,
}

impl Default for CheckOptions {
    fn default() -> Self {
        CheckOptions {
            max_propagation_steps: 1_000_000,
            max_proxy_generations: 64,
            pointer_size: 8,
        }
    }
}

/// Type-check a program with default options.
pub fn check(program: &Expr) -> Result<TypeckResult, TypeError> {
    check_with_options(program, CheckOptions::default())
}

pub fn check_with_options(program: &Expr, options: CheckOptions) -> Result<TypeckResult, TypeError> {
    let mut ctx = InferCtx::new(options);
    let main = ctx.registry.builtins().main;
    ctx.declare_types(main, program)?;
    ctx.declare_defs(main, program)?;

    let mut env = TypeEnv::new(main, main);
    env.record = true;
    let root = ctx.infer_expr(&mut env, program)?;
    ctx.settle()?;
    ctx.finalize()?;
    Ok(ctx.into_result(root))
}

// ── Context ────────────────────────────────────────────────────────────

/// Instantiation frames active when a call site was created, outermost
/// first.
type Frames = Rc<Vec<(String, Location)>>;

struct CallRecord {
    name: String,
    location: Location,
    receiver: Option<NodeId>,
    args: Vec<NodeId>,
    block: Option<BlockCtx>,
    /// Receiver of a call without an explicit one.
    self_type: TypeId,
    result: NodeId,
    /// Result nodes of the instances the call is currently bound to.
    targets: Vec<NodeId>,
    context: Frames,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct InstanceKey {
    owner: TypeId,
    def: DefId,
    args: Vec<TypeId>,
    /// Calls with a block get their own instance.
    call: Option<CallId>,
}

struct Instance {
    signature: String,
    return_node: NodeId,
}

/// State of one inference run.
pub struct InferCtx {
    pub registry: TypeRegistry,
    pub graph: TypeGraph,
    options: CheckOptions,
    calls: Vec<CallRecord>,
    instance_cache: FxHashMap<InstanceKey, NodeId>,
    instances: Vec<Instance>,
    /// One node per (receiver type, instance variable).
    ivars: IndexMap<(TypeId, String), NodeId>,
    /// Holder nodes of generic objects built by `new`, per call and
    /// argument types.
    constructions: FxHashMap<(CallId, Vec<TypeId>), NodeId>,
    ivar_reads: Vec<(TypeId, String, Location)>,
    consts: FxHashMap<TypeId, NodeId>,
    /// Shared nodes of fixed type, used for literals and builtin results.
    fixed: FxHashMap<TypeId, NodeId>,
    frames: Vec<(String, Location)>,
    recorded: FxHashMap<ExprId, NodeId>,
}

impl InferCtx {
    pub fn new(options: CheckOptions) -> Self {
        InferCtx {
            registry: TypeRegistry::new(),
            graph: TypeGraph::new(options.max_propagation_steps),
            options,
            calls: Vec::new(),
            instance_cache: FxHashMap::default(),
            instances: Vec::new(),
            ivars: IndexMap::new(),
            constructions: FxHashMap::default(),
            ivar_reads: Vec::new(),
            consts: FxHashMap::default(),
            fixed: FxHashMap::default(),
            frames: Vec::new(),
            recorded: FxHashMap::default(),
        }
    }

    fn fixed_node(&mut self, ty: TypeId) -> NodeId {
        if let Some(&node) = self.fixed.get(&ty) {
            return node;
        }
        let node = self.graph.typed_node(ty, Location::synthetic());
        self.fixed.insert(ty, node);
        node
    }

    fn nil_node(&mut self) -> NodeId {
        let nil = self.registry.builtins().nil;
        self.fixed_node(nil)
    }

    fn bind(&mut self, node: NodeId, dep: NodeId) {
        self.graph.bind_to(&mut self.registry, node, dep);
    }

    // ── Declarations ───────────────────────────────────────────────────

    fn own_type(&self, scope: TypeId, name: &str) -> Option<TypeId> {
        self.registry
            .class_of(scope)
            .and_then(|class| self.registry.class(class).types.get(name).copied())
    }

    fn lookup_path(
        &self,
        path: &[String],
        scope: TypeId,
        what: LookupKind,
        location: &Location,
    ) -> Result<TypeId, TypeError> {
        self.registry.lookup_type(path, scope).ok_or_else(|| {
            TypeError::at(
                TypeErrorKind::LookupFailure {
                    what,
                    name: path.join("::"),
                },
                location,
            )
        })
    }

    /// Resolve a written type. `self` is only meaningful where a receiver
    /// type is known.
    fn resolve_type(
        &self,
        tref: &TypeRef,
        scope: TypeId,
        self_type: Option<TypeId>,
        location: &Location,
    ) -> Result<TypeId, TypeError> {
        match (tref, self_type) {
            (TypeRef::Path(path), _) => self.lookup_path(path, scope, LookupKind::Constant, location),
            (TypeRef::SelfType, Some(ty)) => Ok(ty),
            (TypeRef::SelfType, None) => Err(TypeError::at(
                TypeErrorKind::LookupFailure {
                    what: LookupKind::Constant,
                    name: "self".to_string(),
                },
                location,
            )),
        }
    }

    /// First pass: register types, includes and constants.
    fn declare_types(&mut self, scope: TypeId, expr: &Expr) -> Result<(), TypeError> {
        match &expr.kind {
            ExprKind::Expressions(list) => {
                for item in list {
                    self.declare_types(scope, item)?;
                }
            }
            ExprKind::Class(decl) => {
                let ty = self.declare_class(scope, decl, &expr.location)?;
                self.declare_types(ty, &decl.body)?;
            }
            ExprKind::Module(decl) => {
                let ty = match self.own_type(scope, &decl.name) {
                    Some(ty) => ty,
                    None => self.registry.add_module(&decl.name, Some(scope)),
                };
                self.declare_types(ty, &decl.body)?;
            }
            ExprKind::Struct(decl) => self.declare_struct(scope, decl, &expr.location)?,
            ExprKind::Include(path) => {
                let module = self.lookup_path(path, scope, LookupKind::Module, &expr.location)?;
                if !matches!(self.registry.get(module), Type::Module { .. }) {
                    return Err(TypeError::at(
                        TypeErrorKind::LookupFailure {
                            what: LookupKind::Module,
                            name: path.join("::"),
                        },
                        &expr.location,
                    ));
                }
                self.registry
                    .include(scope, module)
                    .map_err(|err| err.or_at(&expr.location))?;
            }
            ExprKind::Assign {
                target: AssignTarget::Const(name),
                value,
            } => {
                if self.own_type(scope, name).is_none() {
                    self.registry.add_const(name, Rc::new((**value).clone()), scope);
                }
            }
            ExprKind::MultiAssign { targets, values } => {
                for (i, target) in targets.iter().enumerate() {
                    if let AssignTarget::Const(name) = target {
                        if self.own_type(scope, name).is_none() {
                            let value = multi_assign_value(expr, values, i);
                            self.registry.add_const(name, Rc::new(value), scope);
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Declare a class, or return the existing type when reopening one.
    fn declare_class(
        &mut self,
        scope: TypeId,
        decl: &ClassDecl,
        location: &Location,
    ) -> Result<TypeId, TypeError> {
        if let Some(existing) = self.own_type(scope, &decl.name) {
            return Ok(existing);
        }
        let superclass = match &decl.superclass {
            Some(path) => self.lookup_path(path, scope, LookupKind::Constant, location)?,
            None => self.registry.builtins().object,
        };
        let ty = self
            .registry
            .add_object_type(&decl.name, Some(superclass), scope, decl.generic);
        debug!(class = %self.registry.full_name(ty), "declared class");
        Ok(ty)
    }

    fn declare_struct(
        &mut self,
        scope: TypeId,
        decl: &StructDecl,
        location: &Location,
    ) -> Result<(), TypeError> {
        let mut fields = IndexMap::new();
        for (name, tref) in &decl.fields {
            let ty = self.resolve_type(tref, scope, None, location)?;
            fields.insert(name.clone(), ty);
        }
        self.registry.add_struct(&decl.name, fields, scope);
        Ok(())
    }

    /// Second pass: index every definition on its owner.
    fn declare_defs(&mut self, scope: TypeId, expr: &Expr) -> Result<(), TypeError> {
        match &expr.kind {
            ExprKind::Expressions(list) => {
                for item in list {
                    self.declare_defs(scope, item)?;
                }
            }
            ExprKind::Class(ClassDecl { name, body, .. }) => {
                let ty = self.declared(scope, name)?;
                self.declare_defs(ty, body)?;
            }
            ExprKind::Module(decl) => {
                let ty = self.declared(scope, &decl.name)?;
                self.declare_defs(ty, &decl.body)?;
            }
            ExprKind::Def(decl) => self.declare_def(scope, decl, &expr.location)?,
            _ => {}
        }
        Ok(())
    }

    fn declared(&self, scope: TypeId, name: &str) -> Result<TypeId, TypeError> {
        self.own_type(scope, name).ok_or_else(|| {
            TypeError::internal(format!("`{}` was not declared in the type pass", name))
        })
    }

    fn declare_def(&mut self, scope: TypeId, decl: &DefDecl, location: &Location) -> Result<(), TypeError> {
        let owner = if decl.receiver_self {
            self.registry.metaclass_of(scope).ok_or_else(|| {
                TypeError::internal(format!("`{}` has no metaclass", self.registry.display(scope)))
            })?
        } else {
            scope
        };

        let mut params = Vec::with_capacity(decl.params.len());
        for param in &decl.params {
            let restriction = match &param.restriction {
                Some(TypeRef::SelfType) => Some(Restriction::SelfType),
                Some(tref) => Some(Restriction::Type(self.resolve_type(tref, scope, None, location)?)),
                None => None,
            };
            params.push(Param {
                name: param.name.clone(),
                restriction,
                default: param.default.clone().map(Rc::new),
            });
        }

        let def = Def {
            name: decl.name.clone(),
            owner,
            params,
            yields: decl.body.contains_yield(),
            body: DefBody::Expr(Rc::new((*decl.body).clone())),
            location: location.clone(),
        };
        let id = self.registry.add_def(def);
        debug!(def = %self.registry.def_signature(id), "declared definition");
        Ok(())
    }

    // ── Expression Inference ───────────────────────────────────────────

    fn infer_expr(&mut self, env: &mut TypeEnv, expr: &Expr) -> Result<NodeId, TypeError> {
        let node = self.infer_expr_kind(env, expr)?;
        if env.record {
            self.recorded.insert(expr.id, node);
        }
        Ok(node)
    }

    fn infer_expr_kind(&mut self, env: &mut TypeEnv, expr: &Expr) -> Result<NodeId, TypeError> {
        let b = *self.registry.builtins();
        let location = &expr.location;
        match &expr.kind {
            ExprKind::Nil => Ok(self.fixed_node(b.nil)),
            ExprKind::Bool(_) => Ok(self.fixed_node(b.bool)),
            ExprKind::Char(_) => Ok(self.fixed_node(b.char)),
            ExprKind::Int(_) => Ok(self.fixed_node(b.int)),
            ExprKind::Long(_) => Ok(self.fixed_node(b.long)),
            ExprKind::Float(_) => Ok(self.fixed_node(b.float)),
            ExprKind::Double(_) => Ok(self.fixed_node(b.double)),
            ExprKind::Str(_) => Ok(self.fixed_node(b.string)),
            ExprKind::Symbol(_) => Ok(self.fixed_node(b.symbol)),

            ExprKind::Var(name) => env.lookup(name).ok_or_else(|| {
                TypeError::at(
                    TypeErrorKind::LookupFailure {
                        what: LookupKind::Variable,
                        name: name.clone(),
                    },
                    location,
                )
            }),
            ExprKind::InstanceVar(name) => {
                let owner = env.self_type;
                self.ivar_reads.push((owner, name.clone(), location.clone()));
                Ok(self.ivar_node(owner, name))
            }
            ExprKind::SelfRef => Ok(self.fixed_node(env.self_type)),
            ExprKind::Path(path) => {
                let ty = self.lookup_path(path, env.type_scope, LookupKind::Constant, location)?;
                if matches!(self.registry.get(ty), Type::Const(_)) {
                    return self.const_node(ty);
                }
                match self.registry.metaclass_of(ty) {
                    Some(meta) => Ok(self.fixed_node(meta)),
                    None => Err(TypeError::at(
                        TypeErrorKind::LookupFailure {
                            what: LookupKind::Constant,
                            name: path.join("::"),
                        },
                        location,
                    )),
                }
            }

            ExprKind::Assign {
                target: AssignTarget::Const(name),
                value,
            } => self.const_for(env, name, (**value).clone()),
            ExprKind::Assign { target, value } => {
                let value = self.infer_expr(env, value)?;
                self.assign(env, target, value);
                Ok(value)
            }
            ExprKind::MultiAssign { targets, values } => {
                for (i, target) in targets.iter().enumerate() {
                    if let AssignTarget::Const(name) = target {
                        self.const_for(env, name, multi_assign_value(expr, values, i))?;
                        continue;
                    }
                    let value = match values.get(i) {
                        Some(value) => self.infer_expr(env, value)?,
                        None => self.nil_node(),
                    };
                    self.assign(env, target, value);
                }
                for value in values.iter().skip(targets.len()) {
                    self.infer_expr(env, value)?;
                }
                Ok(self.nil_node())
            }

            ExprKind::Expressions(list) => {
                let mut last = None;
                for item in list {
                    last = Some(self.infer_expr(env, item)?);
                }
                Ok(last.unwrap_or_else(|| self.nil_node()))
            }
            ExprKind::If {
                cond,
                then,
                otherwise,
            } => {
                self.infer_expr(env, cond)?;
                let then = self.infer_expr(env, then)?;
                let otherwise = match otherwise {
                    Some(otherwise) => self.infer_expr(env, otherwise)?,
                    None => self.nil_node(),
                };
                let node = self.graph.add_node(location.clone());
                self.bind(node, then);
                self.bind(node, otherwise);
                Ok(node)
            }
            ExprKind::While { cond, body } => {
                self.infer_expr(env, cond)?;
                self.infer_expr(env, body)?;
                Ok(self.nil_node())
            }

            ExprKind::Call {
                receiver,
                name,
                args,
                block,
            } => self.infer_call(env, expr, receiver.as_deref(), name, args, block.as_ref()),
            ExprKind::Yield(args) => self.infer_yield(env, args, location),
            ExprKind::Return(value) => {
                let value = match value {
                    Some(value) => self.infer_expr(env, value)?,
                    None => self.nil_node(),
                };
                if let Some(frame) = &env.frame {
                    let return_node = frame.return_node;
                    self.bind(return_node, value);
                }
                // Control never continues past a return, so it has no type.
                Ok(self.graph.add_node(location.clone()))
            }

            ExprKind::ArrayLiteral { elements, of } => {
                let elem = self.graph.add_node(location.clone());
                if let Some(of) = of {
                    let ty = self.resolve_type(of, env.type_scope, Some(env.self_type), location)?;
                    let declared = self.fixed_node(ty);
                    self.bind(elem, declared);
                }
                for element in elements {
                    let node = self.infer_expr(env, element)?;
                    self.bind(elem, node);
                }
                let buffer = self.graph.add_pointer_node(location.clone());
                self.bind(buffer, elem);
                let holder = self.graph.add_node(location.clone());
                install_proxy(
                    &mut self.registry,
                    &mut self.graph,
                    b.array,
                    vec![("@buffer".to_string(), buffer)],
                    holder,
                )?;
                Ok(holder)
            }
            ExprKind::PointerOf(inner) => {
                let inner = self.infer_expr(env, inner)?;
                let node = self.graph.add_pointer_node(location.clone());
                self.bind(node, inner);
                Ok(node)
            }

            ExprKind::Class(ClassDecl { name, body, .. }) => {
                let ty = self.declared(env.type_scope, name)?;
                self.infer_type_body(env, ty, body)?;
                Ok(self.nil_node())
            }
            ExprKind::Module(decl) => {
                let ty = self.declared(env.type_scope, &decl.name)?;
                self.infer_type_body(env, ty, &decl.body)?;
                Ok(self.nil_node())
            }
            ExprKind::Def(_) | ExprKind::Struct(_) | ExprKind::Include(_) => Ok(self.nil_node()),
        }
    }

    fn assign(&mut self, env: &mut TypeEnv, target: &AssignTarget, value: NodeId) {
        match target {
            AssignTarget::Var(name) => {
                let var = match env.lookup(name) {
                    Some(var) => var,
                    None => {
                        let var = self.graph.add_node(Location::synthetic());
                        env.insert(name.clone(), var);
                        var
                    }
                };
                self.bind(var, value);
            }
            AssignTarget::InstanceVar(name) => {
                let ivar = self.ivar_node(env.self_type, name);
                self.bind(ivar, value);
            }
            // Constants are typed from their declared value.
            AssignTarget::Const(_) => {}
        }
    }

    /// Expressions in a class or module body run with the type as scope
    /// and its metaclass as `self`.
    fn infer_type_body(&mut self, env: &TypeEnv, ty: TypeId, body: &Expr) -> Result<(), TypeError> {
        let self_type = self.registry.metaclass_of(ty).unwrap_or(ty);
        let mut inner = TypeEnv::new(self_type, ty);
        inner.record = env.record;
        self.infer_expr(&mut inner, body)?;
        Ok(())
    }

    fn ivar_node(&mut self, owner: TypeId, name: &str) -> NodeId {
        let key = (owner, name.to_string());
        if let Some(&node) = self.ivars.get(&key) {
            return node;
        }
        let node = self.graph.add_node(Location::synthetic());
        if let Some(Some(declared)) = self.registry.instance_var(owner, name) {
            let seed = self.fixed_node(declared);
            self.bind(node, seed);
        }
        self.ivars.insert(key, node);
        node
    }

    /// The node of constant `name` in the current namespace, declaring it
    /// with `value` if this is its first sighting.
    fn const_for(&mut self, env: &TypeEnv, name: &str, value: Expr) -> Result<NodeId, TypeError> {
        let ty = match self.own_type(env.type_scope, name) {
            Some(ty) => ty,
            None => self.registry.add_const(name, Rc::new(value), env.type_scope),
        };
        self.const_node(ty)
    }

    /// Type a constant's value once and share its node.
    fn const_node(&mut self, ty: TypeId) -> Result<NodeId, TypeError> {
        if let Some(&node) = self.consts.get(&ty) {
            return Ok(node);
        }
        let Type::Const(constant) = self.registry.get(ty) else {
            return Err(TypeError::internal(format!(
                "`{}` is not a constant",
                self.registry.display(ty)
            )));
        };
        let value = Rc::clone(&constant.value);
        let container = constant.container;

        // Cached before typing the value so a self-reference terminates.
        let node = self.graph.add_node(value.location.clone());
        self.consts.insert(ty, node);
        let main = self.registry.builtins().main;
        let mut env = TypeEnv::new(main, container);
        let value_node = self.infer_expr(&mut env, &value)?;
        self.bind(node, value_node);
        Ok(node)
    }

    fn infer_yield(
        &mut self,
        env: &mut TypeEnv,
        args: &[Expr],
        location: &Location,
    ) -> Result<NodeId, TypeError> {
        let Some(block) = env.block().cloned() else {
            return Err(TypeError::at(
                TypeErrorKind::LookupFailure {
                    what: LookupKind::Block,
                    name: "yield".to_string(),
                },
                location,
            ));
        };
        let mut arg_nodes = Vec::with_capacity(args.len());
        for arg in args {
            arg_nodes.push(self.infer_expr(env, arg)?);
        }
        for (i, param) in block.params.iter().enumerate() {
            let value = match arg_nodes.get(i) {
                Some(node) => *node,
                None => self.nil_node(),
            };
            self.bind(*param, value);
        }
        let node = self.graph.add_node(location.clone());
        self.bind(node, block.result);
        Ok(node)
    }

    // ── Calls ──────────────────────────────────────────────────────────

    fn infer_call(
        &mut self,
        env: &mut TypeEnv,
        expr: &Expr,
        receiver: Option<&Expr>,
        name: &str,
        args: &[Expr],
        block: Option<&Block>,
    ) -> Result<NodeId, TypeError> {
        let receiver = match receiver {
            Some(receiver) => Some(self.infer_expr(env, receiver)?),
            None => None,
        };
        let mut arg_nodes = Vec::with_capacity(args.len());
        for arg in args {
            arg_nodes.push(self.infer_expr(env, arg)?);
        }
        let block = match block {
            Some(block) => Some(self.infer_block(env, block, &expr.location)?),
            None => None,
        };

        let result = self.graph.add_node(expr.location.clone());
        let call = CallId(self.calls.len() as u32);
        for node in receiver.iter().chain(&arg_nodes) {
            self.graph.observe(*node, Observer::Call(call));
        }
        self.calls.push(CallRecord {
            name: name.to_string(),
            location: expr.location.clone(),
            receiver,
            args: arg_nodes,
            block,
            self_type: env.self_type,
            result,
            targets: Vec::new(),
            context: Rc::new(self.frames.clone()),
        });
        self.resolve_call(call)?;
        Ok(result)
    }

    /// Type a block body in the caller's scope, with fresh parameter nodes
    /// that `yield` will bind.
    fn infer_block(
        &mut self,
        env: &mut TypeEnv,
        block: &Block,
        location: &Location,
    ) -> Result<BlockCtx, TypeError> {
        env.push_scope();
        let mut params = Vec::with_capacity(block.params.len());
        for name in &block.params {
            let node = self.graph.add_node(location.clone());
            env.insert(name.clone(), node);
            params.push(node);
        }
        let body = self.infer_expr(env, &block.body);
        env.pop_scope();
        Ok(BlockCtx {
            params,
            result: body?,
        })
    }

    /// Resolve a call against the current types of its receiver and
    /// arguments and rebind its result. Does nothing while any of them is
    /// untyped.
    ///
    /// Union receivers and arguments dispatch once per member combination;
    /// the call's type is the merge of all results.
    #[instrument(level = "trace", skip(self))]
    fn resolve_call(&mut self, call: CallId) -> Result<(), TypeError> {
        let record = &self.calls[call.0 as usize];
        let receiver = match record.receiver {
            Some(node) => match self.graph.type_of(node) {
                Some(ty) => Some(ty),
                None => return Ok(()),
            },
            None => None,
        };
        let mut arg_types = Vec::with_capacity(record.args.len());
        for node in &record.args {
            match self.graph.type_of(*node) {
                Some(ty) => arg_types.push(self.registry.union_members(ty)),
                None => return Ok(()),
            }
        }
        let owners = match receiver {
            Some(ty) => self.registry.union_members(ty),
            None => vec![record.self_type],
        };
        let implicit = record.receiver.is_none();

        let mut targets = Vec::new();
        for owner in owners {
            for args in combinations(&arg_types) {
                let target = self.dispatch(call, owner, &args, implicit)?;
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }

        let record = &mut self.calls[call.0 as usize];
        let previous = std::mem::take(&mut record.targets);
        let result = record.result;
        for node in &previous {
            if !targets.contains(node) {
                self.graph.unbind_from(&mut self.registry, result, *node);
            }
        }
        for node in &targets {
            if !previous.contains(node) {
                self.graph.bind_to(&mut self.registry, result, *node);
            }
        }
        self.calls[call.0 as usize].targets = targets;
        Ok(())
    }

    /// Select and instantiate the definition for one receiver type and one
    /// combination of argument types.
    fn dispatch(
        &mut self,
        call: CallId,
        owner: TypeId,
        args: &[TypeId],
        implicit: bool,
    ) -> Result<NodeId, TypeError> {
        let record = &self.calls[call.0 as usize];
        let name = record.name.clone();
        let yields = record.block.is_some();
        let location = record.location.clone();

        let mut miss = match self.registry.lookup_def(owner, &name, args, yields, owner) {
            Ok(def) => return self.instantiate_def(call, owner, def, args),
            Err(miss) => miss,
        };

        // Calls without a receiver fall back to top-level definitions.
        let main = self.registry.builtins().main;
        if implicit && owner != main {
            match self.registry.lookup_def(main, &name, args, yields, main) {
                Ok(def) => return self.instantiate_def(call, main, def, args),
                Err(main_miss) => {
                    if miss.kind == MissKind::Undefined {
                        miss = main_miss;
                    }
                }
            }
        }

        if name == "new" && miss.kind == MissKind::Undefined {
            let instance = match self.registry.get(owner) {
                Type::Metaclass { instance, .. } => Some(*instance),
                _ => None,
            };
            if let Some(instance) = instance {
                if matches!(self.registry.get(instance), Type::Object(_)) {
                    return self.construct(call, instance, args);
                }
            }
        }

        Err(self.lookup_error(owner, &name, args, miss, &location))
    }

    /// `Foo.new(args)`: allocate a `Foo` and dispatch `initialize` on it.
    ///
    /// A generic `Foo` is initialized as a fresh unbound specialization, so
    /// every construction site gets its own instance-variable nodes. The
    /// result is a proxy bound by those nodes.
    fn construct(&mut self, call: CallId, instance: TypeId, args: &[TypeId]) -> Result<NodeId, TypeError> {
        let generic = matches!(self.registry.get(instance), Type::Object(obj) if obj.generic);
        if !generic {
            self.initialize(call, instance, args)?;
            return Ok(self.fixed_node(instance));
        }

        let key = (call, args.to_vec());
        if let Some(&holder) = self.constructions.get(&key) {
            return Ok(holder);
        }
        let holder = self
            .graph
            .add_node(self.calls[call.0 as usize].location.clone());
        self.constructions.insert(key, holder);

        let site = self.registry.clone_for_specialization(instance, &[]);
        self.initialize(call, site, args)?;
        let observed: Vec<(String, NodeId)> = self
            .ivars
            .iter()
            .filter(|((owner, _), _)| *owner == site)
            .map(|((_, name), node)| (name.clone(), *node))
            .collect();
        install_proxy(&mut self.registry, &mut self.graph, instance, observed, holder)?;
        Ok(holder)
    }

    fn initialize(&mut self, call: CallId, owner: TypeId, args: &[TypeId]) -> Result<(), TypeError> {
        let record = &self.calls[call.0 as usize];
        let yields = record.block.is_some();
        let location = record.location.clone();
        match self
            .registry
            .lookup_def(owner, "initialize", args, yields, owner)
        {
            Ok(def) => {
                self.instantiate_def(call, owner, def, args)?;
                Ok(())
            }
            Err(miss) if miss.kind == MissKind::Undefined && args.is_empty() => Ok(()),
            Err(miss) => Err(self.lookup_error(owner, "initialize", args, miss, &location)),
        }
    }

    fn lookup_error(
        &self,
        owner: TypeId,
        name: &str,
        args: &[TypeId],
        miss: LookupMiss,
        location: &Location,
    ) -> TypeError {
        let arg_types: Vec<String> = args.iter().map(|ty| self.registry.display(*ty)).collect();
        let candidates: Vec<String> = miss
            .candidates
            .iter()
            .map(|def| self.registry.def_signature(*def))
            .collect();
        let kind = match miss.kind {
            MissKind::Undefined => TypeErrorKind::UnknownMember {
                owner: self.registry.display(owner),
                member: name.to_string(),
            },
            MissKind::NoMatch => TypeErrorKind::RestrictionViolation {
                name: name.to_string(),
                arg_types,
                candidates,
            },
            MissKind::Ambiguous => TypeErrorKind::AmbiguousOverload {
                name: name.to_string(),
                arg_types,
                candidates,
            },
        };
        TypeError::at(kind, location)
    }

    // ── Definition Instances ───────────────────────────────────────────

    /// The result node of `def` instantiated for `owner` and `args`.
    ///
    /// Instances are memoized, and the result node is cached before the
    /// body is typed so recursive calls bind to it instead of recursing.
    fn instantiate_def(
        &mut self,
        call: CallId,
        owner: TypeId,
        def_id: DefId,
        args: &[TypeId],
    ) -> Result<NodeId, TypeError> {
        let record = &self.calls[call.0 as usize];
        let block = record.block.clone();
        let location = record.location.clone();
        let key = InstanceKey {
            owner,
            def: def_id,
            args: args.to_vec(),
            call: block.as_ref().map(|_| call),
        };
        if let Some(&node) = self.instance_cache.get(&key) {
            return Ok(node);
        }

        let def = self.registry.def(def_id).clone();
        let body = match &def.body {
            DefBody::Expr(body) => Rc::clone(body),
            builtin => {
                let ty = self.builtin_result(owner, &def.name, builtin, args, &location)?;
                let node = self.fixed_node(ty);
                self.instance_cache.insert(key, node);
                return Ok(node);
            }
        };

        let return_node = self.graph.add_node(def.location.clone());
        self.instance_cache.insert(key, return_node);
        let signature = self.instance_signature(owner, &def.name, args);
        debug!(%signature, "typing definition instance");
        self.instances.push(Instance {
            signature: signature.clone(),
            return_node,
        });

        self.frames.push((signature.clone(), location.clone()));
        let typed = self.type_instance_body(owner, &def, &body, args, return_node, block);
        self.frames.pop();
        typed.map_err(|err| TypeError::instantiating(signature, &location, err))?;
        Ok(return_node)
    }

    fn type_instance_body(
        &mut self,
        owner: TypeId,
        def: &Def,
        body: &Expr,
        args: &[TypeId],
        return_node: NodeId,
        block: Option<BlockCtx>,
    ) -> Result<(), TypeError> {
        let mut env = TypeEnv::new(owner, self.registry.instance_type(def.owner));
        env.frame = Some(DefFrame { return_node, block });

        for (i, param) in def.params.iter().enumerate() {
            let value = match (args.get(i), &param.default) {
                (Some(ty), _) => self.fixed_node(*ty),
                (None, Some(default)) => self.infer_expr(&mut env, default)?,
                (None, None) => {
                    return Err(TypeError::internal(format!(
                        "no argument for parameter `{}`",
                        param.name
                    )))
                }
            };
            let var = self.graph.add_node(def.location.clone());
            self.bind(var, value);
            env.insert(param.name.clone(), var);
        }

        let body_node = self.infer_expr(&mut env, body)?;
        self.bind(return_node, body_node);
        Ok(())
    }

    fn instance_signature(&self, owner: TypeId, name: &str, args: &[TypeId]) -> String {
        let args: Vec<String> = args.iter().map(|ty| self.registry.display(*ty)).collect();
        format!("{}({})", self.registry.qualified_method(owner, name), args.join(", "))
    }

    /// Result type of a definition implemented by the engine.
    fn builtin_result(
        &self,
        owner: TypeId,
        name: &str,
        body: &DefBody,
        args: &[TypeId],
        location: &Location,
    ) -> Result<TypeId, TypeError> {
        let b = self.registry.builtins();
        let unknown = || {
            TypeError::at(
                TypeErrorKind::UnknownMember {
                    owner: self.registry.display(owner),
                    member: name.to_string(),
                },
                location,
            )
        };
        let pointee = |ty: TypeId| match self.registry.get(self.registry.resolve(ty)) {
            Type::Pointer { pointee, .. } => *pointee,
            _ => None,
        };
        match body {
            DefBody::Primitive(ty) => Ok(*ty),
            DefBody::Allocate | DefBody::StructAlloc => Ok(self.registry.instance_type(owner)),
            DefBody::ClassName => Ok(b.string),
            DefBody::StructGet(field) | DefBody::StructSet(field) => self
                .registry
                .instance_var(owner, field)
                .flatten()
                .ok_or_else(unknown),
            DefBody::PointerGet => pointee(owner).ok_or_else(unknown),
            DefBody::PointerSet => args
                .first()
                .copied()
                .ok_or_else(|| TypeError::internal("`value=` called without a value")),
            DefBody::ArrayLength => Ok(b.int),
            DefBody::ArrayGet => self
                .registry
                .instance_var(owner, "@buffer")
                .flatten()
                .and_then(pointee)
                .ok_or_else(unknown),
            DefBody::Expr(_) => Err(TypeError::internal("user definition treated as builtin")),
        }
    }

    // ── Fixpoint ───────────────────────────────────────────────────────

    /// Drain the work list, re-resolving woken calls and refreshing woken
    /// proxies, until nothing changes.
    fn settle(&mut self) -> Result<(), TypeError> {
        loop {
            let wakes = self.graph.propagate(&mut self.registry)?;
            if wakes.is_empty() {
                return Ok(());
            }
            for wake in wakes {
                match wake {
                    Wake::Call(call) => {
                        if let Err(err) = self.resolve_call(call) {
                            return Err(self.in_context(call, err));
                        }
                    }
                    Wake::Proxy(proxy) => refresh_proxy(
                        &mut self.registry,
                        &mut self.graph,
                        proxy,
                        self.options.max_proxy_generations,
                    )?,
                }
            }
        }
    }

    /// Wrap an error raised by a re-resolved call in the instantiation
    /// frames that were active when the call was first typed.
    fn in_context(&self, call: CallId, err: TypeError) -> TypeError {
        let record = &self.calls[call.0 as usize];
        record
            .context
            .iter()
            .rev()
            .fold(err, |inner, (signature, location)| {
                TypeError::instantiating(signature.clone(), location, inner)
            })
    }

    /// Collapse live proxies, write inferred instance-variable types back
    /// into their object types and reject reads of never-assigned ones.
    fn finalize(&mut self) -> Result<(), TypeError> {
        let proxied: Vec<(NodeId, TypeId)> = self
            .graph
            .types()
            .filter_map(|(node, ty)| {
                let ty = ty?;
                self.registry.get(ty).as_proxy()?;
                Some((node, self.registry.resolve(ty)))
            })
            .collect();
        for (node, ty) in proxied {
            self.graph.replace_type(node, ty);
        }

        for ((owner, name), node) in &self.ivars {
            let Some(ty) = self.graph.type_of(*node) else {
                continue;
            };
            let plain = matches!(
                self.registry.get(*owner),
                Type::Object(obj) if !obj.generic && obj.template.is_none()
            );
            if plain {
                let ty = self.registry.resolve(ty);
                self.registry.set_instance_var(*owner, name, ty);
            }
        }

        for (owner, name, location) in &self.ivar_reads {
            let typed = self
                .ivars
                .get(&(*owner, name.clone()))
                .and_then(|node| self.graph.type_of(*node))
                .is_some();
            if !typed {
                return Err(TypeError::at(
                    TypeErrorKind::UnknownMember {
                        owner: self.registry.display(*owner),
                        member: name.clone(),
                    },
                    location,
                ));
            }
        }

        if !self.graph.is_settled() {
            return Err(TypeError::internal(format!(
                "{} nodes still dirty after the fixpoint",
                self.graph.dirty_count()
            )));
        }
        Ok(())
    }

    fn into_result(self, root: NodeId) -> TypeckResult {
        let resolved = |node: NodeId| {
            self.graph
                .type_of(node)
                .map(|ty| self.registry.resolve(ty))
        };
        let types = self
            .recorded
            .iter()
            .filter_map(|(expr, node)| resolved(*node).map(|ty| (*expr, ty)))
            .collect();
        let result_type = resolved(root);
        let instances = self
            .instances
            .iter()
            .map(|instance| InstanceSummary {
                signature: instance.signature.clone(),
                return_type: resolved(instance.return_node),
            })
            .collect();
        TypeckResult {
            registry: self.registry,
            types,
            result_type,
            instances,
            pointer_size: self.options.pointer_size,
        }
    }
}

/// The value assigned to the `i`-th target of a multiple assignment; `nil`
/// when there are fewer values than targets.
fn multi_assign_value(expr: &Expr, values: &[Expr], i: usize) -> Expr {
    values.get(i).cloned().unwrap_or_else(|| Expr {
        id: expr.id,
        location: expr.location.clone(),
        kind: ExprKind::Nil,
    })
}

/// Every way of picking one type from each list.
fn combinations(options: &[Vec<TypeId>]) -> Vec<Vec<TypeId>> {
    let mut combos = vec![Vec::new()];
    for choices in options {
        let mut next = Vec::with_capacity(combos.len() * choices.len());
        for combo in &combos {
            for &ty in choices {
                let mut extended = combo.clone();
                extended.push(ty);
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}
