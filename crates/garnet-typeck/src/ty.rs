//! Type values for the Garnet type system.
//!
//! Types live in the arena of a [`TypeRegistry`](crate::registry::TypeRegistry)
//! and are referred to by [`TypeId`]. The numeric value of a `TypeId` doubles
//! as the stable identifier used to order union members.
//!
//! Class-like types (primitives, objects, modules, structs, pointers and
//! metaclasses) keep their method table, nested types and ancestor links in a
//! [`ClassInfo`] referenced by [`ClassId`]. Generic specializations and
//! pointer instances point at their template's `ClassInfo`, so those tables
//! are shared rather than copied.

use std::cell::OnceCell;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::Serialize;

use crate::ast::Expr;
use crate::graph::NodeId;
use crate::overload::DefTable;

/// Identity of a type in the registry arena.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TypeId(pub u32);

/// Identity of a shared class table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Identity of a method definition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefId(pub u32);

/// Name, namespace and ancestry shared by a class-like type and all of its
/// specializations.
#[derive(Clone, Debug)]
pub struct ClassInfo {
    pub name: String,
    /// Enclosing namespace. `None` only for the program root.
    pub container: Option<TypeId>,
    pub superclass: Option<TypeId>,
    /// Included modules, in declaration order.
    pub includes: Vec<TypeId>,
    /// Nested types and constants.
    pub types: IndexMap<String, TypeId>,
    pub defs: DefTable,
    /// For generic containers: the pointer-typed instance variable whose
    /// pointee is displayed as the element type (`@buffer` for `Array`).
    pub element_ivar: Option<String>,
}

impl ClassInfo {
    pub fn new(name: impl Into<String>, container: Option<TypeId>, superclass: Option<TypeId>) -> Self {
        ClassInfo {
            name: name.into(),
            container,
            superclass,
            includes: Vec::new(),
            types: IndexMap::new(),
            defs: DefTable::default(),
            element_ivar: None,
        }
    }
}

/// A nominal object type, or a specialization of a generic one.
#[derive(Clone, Debug)]
pub struct ObjectType {
    pub class: ClassId,
    /// Slot types in declaration order. `None` until the slot is inferred.
    pub instance_vars: IndexMap<String, Option<TypeId>>,
    pub generic: bool,
    /// The template this type was specialized from.
    pub template: Option<TypeId>,
}

/// A canonical union: at least two members, flattened, sorted by id.
#[derive(Clone, Debug)]
pub struct UnionType {
    pub members: Vec<TypeId>,
    pub(crate) nilable: OnceCell<Option<TypeId>>,
}

impl UnionType {
    pub fn new(members: Vec<TypeId>) -> Self {
        UnionType {
            members,
            nilable: OnceCell::new(),
        }
    }
}

/// Where a proxy stands in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProxyState {
    /// Some observed type variables are still untyped; `target` is the
    /// specialization for the bindings known so far.
    Pending { target: TypeId },
    /// Every observed type variable has a type.
    Resolved { target: TypeId },
    /// Replaced by the proxy `by`. Every operation forwards to it.
    Superseded { by: TypeId },
}

/// A transitional identity for a generic specialization whose bindings are
/// still being inferred.
#[derive(Clone, Debug)]
pub struct ProxyType {
    pub template: TypeId,
    /// Instance-variable name and the graph node supplying its binding.
    pub observed: Vec<(String, NodeId)>,
    /// The node whose type is this proxy.
    pub holder: NodeId,
    pub state: ProxyState,
    /// Number of proxies this one superseded on the same holder.
    pub generation: u32,
}

impl ProxyType {
    pub fn is_dead(&self) -> bool {
        matches!(self.state, ProxyState::Superseded { .. })
    }

    /// The specialization this proxy currently stands for, if still live.
    pub fn target(&self) -> Option<TypeId> {
        match self.state {
            ProxyState::Pending { target } | ProxyState::Resolved { target } => Some(target),
            ProxyState::Superseded { .. } => None,
        }
    }
}

/// A named compile-time value.
#[derive(Clone, Debug)]
pub struct ConstType {
    pub name: String,
    pub container: TypeId,
    pub value: Rc<Expr>,
}

#[derive(Clone, Debug)]
pub enum Type {
    /// A fixed-width value type.
    Primitive { class: ClassId, width: u32 },
    Object(ObjectType),
    /// A namespace and includable capability set.
    Module { class: ClassId },
    /// `pointee` is `None` for the `Pointer` template itself.
    Pointer { class: ClassId, pointee: Option<TypeId> },
    Struct {
        class: ClassId,
        fields: IndexMap<String, TypeId>,
    },
    Union(UnionType),
    /// The type of a type: `Foo` used as a value has type `Foo:Class`.
    Metaclass { class: ClassId, instance: TypeId },
    Proxy(ProxyType),
    Const(ConstType),
}

impl Type {
    /// The class table of a class-like type.
    pub fn class(&self) -> Option<ClassId> {
        match self {
            Type::Primitive { class, .. }
            | Type::Module { class }
            | Type::Pointer { class, .. }
            | Type::Struct { class, .. }
            | Type::Metaclass { class, .. } => Some(*class),
            Type::Object(obj) => Some(obj.class),
            Type::Union(_) | Type::Proxy(_) | Type::Const(_) => None,
        }
    }

    pub fn is_union(&self) -> bool {
        matches!(self, Type::Union(_))
    }

    pub fn is_metaclass(&self) -> bool {
        matches!(self, Type::Metaclass { .. })
    }

    pub fn as_object(&self) -> Option<&ObjectType> {
        match self {
            Type::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&ProxyType> {
        match self {
            Type::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_state_targets() {
        let mut proxy = ProxyType {
            template: TypeId(1),
            observed: vec![("@buffer".into(), NodeId(0))],
            holder: NodeId(1),
            state: ProxyState::Pending { target: TypeId(5) },
            generation: 0,
        };
        assert_eq!(proxy.target(), Some(TypeId(5)));
        assert!(!proxy.is_dead());

        proxy.state = ProxyState::Superseded { by: TypeId(9) };
        assert_eq!(proxy.target(), None);
        assert!(proxy.is_dead());
    }

    #[test]
    fn type_ids_order_by_value() {
        let mut ids = vec![TypeId(7), TypeId(2), TypeId(5)];
        ids.sort();
        assert_eq!(ids, vec![TypeId(2), TypeId(5), TypeId(7)]);
    }
}
