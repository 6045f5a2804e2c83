//! The type registry: arena, class tables and interning tables of one run.
//!
//! A `TypeRegistry` is created once per compilation run, seeded with the
//! built-in hierarchy, and threaded explicitly through every inference
//! operation. Nothing is ever evicted; unions, pointer instances and generic
//! specializations are interned for the lifetime of the registry.

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::rc::Rc;
use tracing::debug;

use garnet_common::Location;

use crate::ast::Expr;
use crate::builtins;
use crate::error::{TypeError, TypeErrorKind};
use crate::overload::{Def, DefBody, Param, Restriction};
use crate::ty::{ClassId, ClassInfo, ConstType, DefId, ObjectType, ProxyState, Type, TypeId};

/// Ids of the types seeded at registry construction.
#[derive(Clone, Copy, Debug, Default)]
pub struct Builtins {
    pub main: TypeId,
    pub object: TypeId,
    pub value: TypeId,
    pub numeric: TypeId,
    pub void: TypeId,
    pub nil: TypeId,
    pub bool: TypeId,
    pub char: TypeId,
    pub short: TypeId,
    pub int: TypeId,
    pub long: TypeId,
    pub float: TypeId,
    pub double: TypeId,
    pub symbol: TypeId,
    pub pointer: TypeId,
    pub string: TypeId,
    pub array: TypeId,
    pub math: TypeId,
}

/// Arena and interning tables for every type of a compilation run.
#[derive(Debug)]
pub struct TypeRegistry {
    pub(crate) types: Vec<Type>,
    pub(crate) classes: Vec<ClassInfo>,
    pub(crate) defs: Vec<Def>,
    pub(crate) unions: FxHashMap<Vec<TypeId>, TypeId>,
    pub(crate) generics: FxHashMap<(TypeId, Vec<(String, TypeId)>), TypeId>,
    pointers: FxHashMap<TypeId, TypeId>,
    metaclasses: FxHashMap<TypeId, TypeId>,
    pointer_class: ClassId,
    builtins: Builtins,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create a registry seeded with the built-in types.
    pub fn new() -> Self {
        let mut registry = TypeRegistry {
            types: Vec::new(),
            classes: Vec::new(),
            defs: Vec::new(),
            unions: FxHashMap::default(),
            generics: FxHashMap::default(),
            pointers: FxHashMap::default(),
            metaclasses: FxHashMap::default(),
            pointer_class: ClassId(0),
            builtins: Builtins::default(),
        };
        registry.builtins = builtins::register_builtins(&mut registry);
        registry
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    pub fn get(&self, ty: TypeId) -> &Type {
        &self.types[ty.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, ty: TypeId) -> &mut Type {
        &mut self.types[ty.0 as usize]
    }

    pub fn class(&self, class: ClassId) -> &ClassInfo {
        &self.classes[class.0 as usize]
    }

    pub(crate) fn class_mut(&mut self, class: ClassId) -> &mut ClassInfo {
        &mut self.classes[class.0 as usize]
    }

    pub fn def(&self, def: DefId) -> &Def {
        &self.defs[def.0 as usize]
    }

    /// Number of types created so far.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub(crate) fn push_type(&mut self, ty: Type) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    pub(crate) fn push_class(&mut self, info: ClassInfo) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(info);
        id
    }

    pub(crate) fn push_def(&mut self, def: Def) -> DefId {
        let id = DefId(self.defs.len() as u32);
        self.defs.push(def);
        id
    }

    /// Class table of `ty`, looking through proxies.
    pub fn class_of(&self, ty: TypeId) -> Option<ClassId> {
        self.get(self.resolve(ty)).class()
    }

    // ── Creation ───────────────────────────────────────────────────────

    /// Register `ty` under `name` in the namespace `container`.
    pub fn define_type(&mut self, container: TypeId, name: &str, ty: TypeId) {
        if let Some(class) = self.get(container).class() {
            self.class_mut(class).types.insert(name.to_string(), ty);
        }
    }

    pub fn add_module(&mut self, name: &str, container: Option<TypeId>) -> TypeId {
        let class = self.push_class(ClassInfo::new(name, container, None));
        let ty = self.push_type(Type::Module { class });
        if let Some(container) = container {
            self.define_type(container, name, ty);
        }
        self.create_metaclass(ty);
        ty
    }

    pub fn add_primitive(
        &mut self,
        name: &str,
        superclass: TypeId,
        width: u32,
        container: TypeId,
    ) -> TypeId {
        let class = self.push_class(ClassInfo::new(name, Some(container), Some(superclass)));
        let ty = self.push_type(Type::Primitive { class, width });
        self.define_type(container, name, ty);
        self.create_metaclass(ty);
        ty
    }

    /// Declare a nominal object type. Its metaclass gets `allocate`.
    pub fn add_object_type(
        &mut self,
        name: &str,
        superclass: Option<TypeId>,
        container: TypeId,
        generic: bool,
    ) -> TypeId {
        let class = self.push_class(ClassInfo::new(name, Some(container), superclass));
        let ty = self.push_type(Type::Object(ObjectType {
            class,
            instance_vars: IndexMap::new(),
            generic,
            template: None,
        }));
        self.define_type(container, name, ty);
        let meta = self.create_metaclass(ty);
        self.add_def(Def::builtin("allocate", meta, Vec::new(), DefBody::Allocate));
        ty
    }

    /// Declare a struct. Each field gets a getter and a restricted setter;
    /// the metaclass gets `new`.
    pub fn add_struct(
        &mut self,
        name: &str,
        fields: IndexMap<String, TypeId>,
        container: TypeId,
    ) -> TypeId {
        let class = self.push_class(ClassInfo::new(name, Some(container), None));
        let ty = self.push_type(Type::Struct {
            class,
            fields: fields.clone(),
        });
        self.define_type(container, name, ty);
        for (field, field_ty) in fields {
            let setter = Param {
                name: "value".to_string(),
                restriction: Some(Restriction::Type(field_ty)),
                default: None,
            };
            self.add_def(Def::builtin(
                &format!("{}=", field),
                ty,
                vec![setter],
                DefBody::StructSet(field.clone()),
            ));
            self.add_def(Def::builtin(&field, ty, Vec::new(), DefBody::StructGet(field.clone())));
        }
        let meta = self.create_metaclass(ty);
        self.add_def(Def::builtin("new", meta, Vec::new(), DefBody::StructAlloc));
        ty
    }

    /// Declare the `Pointer` template.
    pub(crate) fn add_pointer_template(&mut self, superclass: TypeId, container: TypeId) -> TypeId {
        let class = self.push_class(ClassInfo::new("Pointer", Some(container), Some(superclass)));
        let ty = self.push_type(Type::Pointer {
            class,
            pointee: None,
        });
        self.define_type(container, "Pointer", ty);
        self.create_metaclass(ty);
        self.pointer_class = class;
        ty
    }

    pub fn add_const(&mut self, name: &str, value: Rc<Expr>, container: TypeId) -> TypeId {
        let ty = self.push_type(Type::Const(ConstType {
            name: name.to_string(),
            container,
            value,
        }));
        self.define_type(container, name, ty);
        ty
    }

    fn create_metaclass(&mut self, instance: TypeId) -> TypeId {
        let (name, container) = match self.get(instance).class() {
            Some(class) => {
                let info = self.class(class);
                (format!("{}:Class", info.name), info.container)
            }
            None => ("Class".to_string(), None),
        };
        let class = self.push_class(ClassInfo::new(name, container, None));
        let meta = self.push_type(Type::Metaclass { class, instance });
        self.metaclasses.insert(instance, meta);
        self.add_def(Def::builtin("name", meta, Vec::new(), DefBody::ClassName));
        self.add_def(Def::builtin("simple_name", meta, Vec::new(), DefBody::ClassName));
        meta
    }

    /// The metaclass of a class-like type. Specializations and pointer
    /// instances share their template's metaclass.
    pub fn metaclass_of(&self, ty: TypeId) -> Option<TypeId> {
        let ty = self.resolve(ty);
        let key = match self.get(ty) {
            Type::Object(ObjectType {
                template: Some(template),
                ..
            }) => *template,
            Type::Pointer {
                pointee: Some(_), ..
            } => self.builtins.pointer,
            _ => ty,
        };
        self.metaclasses.get(&key).copied()
    }

    /// The type a metaclass describes; any other type is its own instance.
    pub fn instance_type(&self, ty: TypeId) -> TypeId {
        let ty = self.resolve(ty);
        match self.get(ty) {
            Type::Metaclass { instance, .. } => *instance,
            _ => ty,
        }
    }

    /// The interned pointer type to `pointee`.
    pub fn pointer_of(&mut self, pointee: TypeId) -> TypeId {
        let pointee = self.resolve(pointee);
        if let Some(&ptr) = self.pointers.get(&pointee) {
            return ptr;
        }
        let ptr = self.push_type(Type::Pointer {
            class: self.pointer_class,
            pointee: Some(pointee),
        });
        self.pointers.insert(pointee, ptr);
        debug!(pointee = %self.display(pointee), "interned pointer type");
        ptr
    }

    // ── Names ──────────────────────────────────────────────────────────

    /// Fully qualified name of a class-like type or constant, e.g. `Foo::Bar`.
    pub fn full_name(&self, ty: TypeId) -> String {
        let ty = self.resolve(ty);
        let (name, container) = match self.get(ty) {
            Type::Const(c) => (c.name.clone(), Some(c.container)),
            other => match other.class() {
                Some(class) => {
                    let info = self.class(class);
                    (info.name.clone(), info.container)
                }
                None => return self.display(ty),
            },
        };
        match container {
            Some(container) if !self.is_root(container) => {
                format!("{}::{}", self.full_name(container), name)
            }
            _ => name,
        }
    }

    fn is_root(&self, ty: TypeId) -> bool {
        match self.get(ty).class() {
            Some(class) => self.class(class).container.is_none(),
            None => false,
        }
    }

    // ── Hierarchy ──────────────────────────────────────────────────────

    /// Direct ancestors in lookup order: includes, then the superclass.
    ///
    /// A metaclass's parents are the metaclasses of its instance's parents.
    /// Unions, structs and constants have none.
    pub fn parents(&self, ty: TypeId) -> Vec<TypeId> {
        let ty = self.resolve(ty);
        match self.get(ty) {
            Type::Metaclass { instance, .. } => self
                .parents(*instance)
                .into_iter()
                .filter_map(|parent| self.metaclass_of(parent))
                .collect(),
            Type::Union(_) | Type::Const(_) | Type::Proxy(_) | Type::Struct { .. } => Vec::new(),
            other => match other.class() {
                Some(class) => {
                    let info = self.class(class);
                    info.includes.iter().copied().chain(info.superclass).collect()
                }
                None => Vec::new(),
            },
        }
    }

    /// Whether `ancestor` is `ty` or reachable through its parents.
    pub fn is_ancestor(&self, ancestor: TypeId, ty: TypeId) -> bool {
        let ancestor = self.resolve(ancestor);
        let mut stack = vec![self.resolve(ty)];
        let mut seen = FxHashSet::default();
        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }
            if seen.insert(current) {
                stack.extend(self.parents(current));
            }
        }
        false
    }

    /// Include `module` into `ty`. Including a type that already has `ty`
    /// among its ancestors is rejected.
    pub fn include(&mut self, ty: TypeId, module: TypeId) -> Result<(), TypeError> {
        if self.is_ancestor(ty, module) {
            return Err(TypeError::new(
                TypeErrorKind::CyclicHierarchy {
                    ty: self.full_name(ty),
                    ancestor: self.full_name(module),
                },
                None,
            ));
        }
        let class = self
            .class_of(ty)
            .ok_or_else(|| TypeError::internal(format!("`{}` cannot include modules", self.display(ty))))?;
        let includes = &mut self.class_mut(class).includes;
        if !includes.contains(&module) {
            includes.push(module);
        }
        Ok(())
    }

    /// Resolve a type path as seen from `from`: nested types of `from`, then
    /// its ancestors depth-first, then the enclosing namespace.
    pub fn lookup_type(&self, path: &[String], from: TypeId) -> Option<TypeId> {
        let mut visited = FxHashSet::default();
        self.lookup_type_in(path, from, &mut visited)
    }

    fn lookup_type_in(
        &self,
        path: &[String],
        from: TypeId,
        visited: &mut FxHashSet<TypeId>,
    ) -> Option<TypeId> {
        let from = self.resolve(from);
        if let Type::Metaclass { instance, .. } = self.get(from) {
            return self.lookup_type_in(path, *instance, visited);
        }
        if !visited.insert(from) {
            return None;
        }

        let mut found = Some(from);
        for name in path {
            found = found
                .and_then(|ty| self.class_of(ty))
                .and_then(|class| self.class(class).types.get(name).copied());
            if found.is_none() {
                break;
            }
        }
        if found.is_some() {
            return found;
        }

        for parent in self.parents(from) {
            if let Some(hit) = self.lookup_type_in(path, parent, visited) {
                return Some(hit);
            }
        }

        let container = self.class_of(from).and_then(|class| self.class(class).container);
        container.and_then(|container| self.lookup_type_in(path, container, visited))
    }

    // ── Proxies ────────────────────────────────────────────────────────

    /// Forward through proxies to the type they currently stand for.
    pub fn resolve(&self, ty: TypeId) -> TypeId {
        let mut current = ty;
        for _ in 0..=self.types.len() {
            match &self.types[current.0 as usize] {
                Type::Proxy(proxy) => match proxy.state {
                    ProxyState::Pending { target } | ProxyState::Resolved { target } => {
                        return target
                    }
                    ProxyState::Superseded { by } => current = by,
                },
                _ => return current,
            }
        }
        current
    }

    // ── Predicates ─────────────────────────────────────────────────────

    pub fn is_nil(&self, ty: TypeId) -> bool {
        self.resolve(ty) == self.builtins.nil
    }

    pub fn is_metaclass(&self, ty: TypeId) -> bool {
        self.get(self.resolve(ty)).is_metaclass()
    }

    /// Members of a union, or the type itself.
    pub fn union_members(&self, ty: TypeId) -> Vec<TypeId> {
        let ty = self.resolve(ty);
        match self.get(ty) {
            Type::Union(union) => union.members.clone(),
            _ => vec![ty],
        }
    }

    /// The non-nil member of a nilable union: exactly two members, one of
    /// them `Nil` and the other nilable-able. Memoized per union.
    pub fn nilable_type(&self, ty: TypeId) -> Option<TypeId> {
        let ty = self.resolve(ty);
        let Type::Union(union) = self.get(ty) else {
            return None;
        };
        *union.nilable.get_or_init(|| match union.members.as_slice() {
            [a, b] if self.is_nil(*a) && self.nilable_able(*b) => Some(*b),
            [a, b] if self.is_nil(*b) && self.nilable_able(*a) => Some(*a),
            _ => None,
        })
    }

    /// Whether `ty` may be the non-nil member of a nilable union: any
    /// object, pointer, struct or primitive other than `Nil` and `Void`.
    pub fn nilable_able(&self, ty: TypeId) -> bool {
        let ty = self.resolve(ty);
        match self.get(ty) {
            Type::Object(_) | Type::Pointer { .. } | Type::Struct { .. } => true,
            Type::Primitive { .. } => ty != self.builtins.nil && ty != self.builtins.void,
            _ => false,
        }
    }

    pub fn is_nilable(&self, ty: TypeId) -> bool {
        self.nilable_type(ty).is_some()
    }

    /// Type equality: identity, except that generic specializations,
    /// pointers, structs and unions also compare structurally. Proxies are
    /// compared by what they stand for.
    pub fn types_equal(&self, a: TypeId, b: TypeId) -> bool {
        let a = self.resolve(a);
        let b = self.resolve(b);
        if a == b {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (Type::Object(x), Type::Object(y)) if x.generic && y.generic => {
                x.class == y.class
                    && x.instance_vars.len() == y.instance_vars.len()
                    && x.instance_vars.iter().all(|(name, ty)| {
                        match (ty, y.instance_vars.get(name)) {
                            (Some(s), Some(Some(o))) => self.types_equal(*s, *o),
                            (None, Some(None)) => true,
                            _ => false,
                        }
                    })
            }
            (
                Type::Pointer {
                    pointee: Some(x), ..
                },
                Type::Pointer {
                    pointee: Some(y), ..
                },
            ) => self.types_equal(*x, *y),
            (
                Type::Struct {
                    class: cx,
                    fields: fx,
                },
                Type::Struct {
                    class: cy,
                    fields: fy,
                },
            ) => {
                self.class(*cx).name == self.class(*cy).name
                    && fx.len() == fy.len()
                    && fx.iter().all(|(name, ty)| {
                        fy.get(name).is_some_and(|other| self.types_equal(*ty, *other))
                    })
            }
            (Type::Union(x), Type::Union(y)) => {
                x.members.len() == y.members.len()
                    && x
                        .members
                        .iter()
                        .all(|m| y.members.iter().any(|o| self.types_equal(*m, *o)))
            }
            _ => false,
        }
    }

    // ── Instance variables ─────────────────────────────────────────────

    /// Declared type of an instance variable or struct field.
    ///
    /// `None` if the slot does not exist, `Some(None)` if it exists but has
    /// not been typed yet.
    pub fn instance_var(&self, ty: TypeId, name: &str) -> Option<Option<TypeId>> {
        match self.get(self.resolve(ty)) {
            Type::Object(obj) => obj.instance_vars.get(name).copied(),
            Type::Struct { fields, .. } => fields.get(name).map(|ty| Some(*ty)),
            _ => None,
        }
    }

    pub fn set_instance_var(&mut self, ty: TypeId, name: &str, slot: TypeId) {
        let ty = self.resolve(ty);
        if let Type::Object(obj) = self.get_mut(ty) {
            obj.instance_vars.insert(name.to_string(), Some(slot));
        }
    }

    // ── Display ────────────────────────────────────────────────────────

    /// Render a type for diagnostics: `Int`, `(Int | Nil)`, `Array<Int>`,
    /// `Pointer<Char>`, `Foo:Class`.
    pub fn display(&self, ty: TypeId) -> String {
        let mut out = String::new();
        self.display_into(ty, &mut out, &mut Vec::new());
        out
    }

    fn display_into(&self, ty: TypeId, out: &mut String, visiting: &mut Vec<TypeId>) {
        let ty = self.resolve(ty);
        if visiting.contains(&ty) {
            out.push_str("...");
            return;
        }
        visiting.push(ty);
        match self.get(ty) {
            Type::Union(union) => {
                out.push('(');
                for (i, member) in union.members.iter().enumerate() {
                    if i > 0 {
                        out.push_str(" | ");
                    }
                    self.display_into(*member, out, visiting);
                }
                out.push(')');
            }
            Type::Metaclass { instance, .. } => {
                self.display_into(*instance, out, visiting);
                out.push_str(":Class");
            }
            Type::Pointer {
                pointee: Some(pointee),
                ..
            } => {
                out.push_str("Pointer<");
                self.display_into(*pointee, out, visiting);
                out.push('>');
            }
            Type::Object(obj) if obj.template.is_some() => {
                out.push_str(&self.full_name(ty));
                let element = self
                    .class(obj.class)
                    .element_ivar
                    .as_ref()
                    .and_then(|ivar| obj.instance_vars.get(ivar).copied().flatten())
                    .and_then(|buffer| match self.get(self.resolve(buffer)) {
                        Type::Pointer { pointee, .. } => *pointee,
                        _ => None,
                    });
                if let Some(element) = element {
                    out.push('<');
                    self.display_into(element, out, visiting);
                    out.push('>');
                } else if self.class(obj.class).element_ivar.is_none() && !obj.instance_vars.is_empty() {
                    out.push('<');
                    for (i, (name, slot)) in obj.instance_vars.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(name);
                        out.push_str(": ");
                        match slot {
                            Some(slot) => self.display_into(*slot, out, visiting),
                            None => out.push('?'),
                        }
                    }
                    out.push('>');
                }
            }
            _ => out.push_str(&self.full_name(ty)),
        }
        visiting.pop();
    }
}

impl Def {
    /// A definition whose body is implemented by the engine itself.
    pub(crate) fn builtin(name: &str, owner: TypeId, params: Vec<Param>, body: DefBody) -> Self {
        Def {
            name: name.to_string(),
            owner,
            params,
            yields: false,
            body,
            location: Location::synthetic(),
        }
    }
}
