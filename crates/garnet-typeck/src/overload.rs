//! Method definitions and overload resolution by restriction specificity.
//!
//! Definitions are indexed per class table by name, then by the ordered list
//! of parameter restrictions plus whether the body yields to a block. A
//! definition whose trailing parameters have defaults is also indexed under
//! each shorter restriction list, so calls may omit those arguments.

use std::rc::Rc;

use indexmap::IndexMap;

use garnet_common::Location;

use crate::ast::Expr;
use crate::registry::TypeRegistry;
use crate::ty::{DefId, Type, TypeId};

/// A declared parameter type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Restriction {
    Type(TypeId),
    /// `self`: the receiver's type at the call site.
    SelfType,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub restriction: Option<Restriction>,
    pub default: Option<Rc<Expr>>,
}

/// What a definition evaluates to when instantiated.
#[derive(Clone, Debug)]
pub enum DefBody {
    /// User code.
    Expr(Rc<Expr>),
    /// A primitive operation with a fixed result type.
    Primitive(TypeId),
    /// `Foo.allocate`: a fresh instance of the metaclass's instance type.
    Allocate,
    /// `Foo.name`
    ClassName,
    StructGet(String),
    StructSet(String),
    StructAlloc,
    PointerGet,
    PointerSet,
    ArrayLength,
    ArrayGet,
}

#[derive(Clone, Debug)]
pub struct Def {
    pub name: String,
    /// The type whose table holds this definition.
    pub owner: TypeId,
    pub params: Vec<Param>,
    pub yields: bool,
    pub body: DefBody,
    pub location: Location,
}

/// Index key of a definition within its name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DefKey {
    pub restrictions: Vec<Option<Restriction>>,
    pub yields: bool,
}

/// Definitions of one class table, by name then by key.
#[derive(Clone, Debug, Default)]
pub struct DefTable {
    by_name: IndexMap<String, IndexMap<DefKey, DefId>>,
}

impl DefTable {
    /// Index `def`. A definition with an equal key replaces the old one.
    pub fn insert(&mut self, name: &str, key: DefKey, def: DefId) {
        self.by_name
            .entry(name.to_string())
            .or_default()
            .insert(key, def);
    }

    pub fn get(&self, name: &str) -> Option<&IndexMap<DefKey, DefId>> {
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MissKind {
    /// No definition with that name on the receiver or its ancestors.
    Undefined,
    /// Definitions exist but none accepts the argument types.
    NoMatch,
    /// Several matches and none is more specific than all the others.
    Ambiguous,
}

/// Why a lookup failed, with the definitions to show in the diagnostic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupMiss {
    pub kind: MissKind,
    pub candidates: Vec<DefId>,
}

impl LookupMiss {
    fn undefined() -> Self {
        LookupMiss {
            kind: MissKind::Undefined,
            candidates: Vec::new(),
        }
    }
}

impl TypeRegistry {
    /// Register a definition on its owner's class table.
    pub fn add_def(&mut self, def: Def) -> DefId {
        let restrictions: Vec<Option<Restriction>> =
            def.params.iter().map(|param| param.restriction).collect();
        let defaults = def
            .params
            .iter()
            .rev()
            .take_while(|param| param.default.is_some())
            .count();
        let name = def.name.clone();
        let yields = def.yields;
        let owner = def.owner;
        let id = self.push_def(def);

        let Some(class) = self.class_of(owner) else {
            return id;
        };
        let table = &mut self.class_mut(class).defs;
        for cut in 0..=defaults {
            let key = DefKey {
                restrictions: restrictions[..restrictions.len() - cut].to_vec(),
                yields,
            };
            table.insert(&name, key, id);
        }
        id
    }

    /// Select the definition of `name` for a call on `owner`.
    ///
    /// `self_type` is the receiver at the call site; `self` restrictions
    /// resolve against it and it stays fixed while the search climbs to
    /// ancestors. `new` on a metaclass never climbs.
    pub fn lookup_def(
        &self,
        owner: TypeId,
        name: &str,
        args: &[TypeId],
        yields: bool,
        self_type: TypeId,
    ) -> Result<DefId, LookupMiss> {
        let owner = self.resolve(owner);
        let mut own_miss = None;

        if let Some(defs) = self
            .class_of(owner)
            .and_then(|class| self.class(class).defs.get(name))
        {
            let mut matches = Vec::new();
            for (key, def) in defs {
                if key.yields == yields
                    && key.restrictions.len() == args.len()
                    && key
                        .restrictions
                        .iter()
                        .zip(args)
                        .all(|(r, arg)| r.map_or(true, |r| self.restriction_matches(r, *arg, self_type)))
                    && !matches.contains(def)
                {
                    matches.push(*def);
                }
            }

            if matches.len() == 1 {
                return Ok(matches[0]);
            }

            if matches.len() > 1 {
                let minimals: Vec<DefId> = matches
                    .iter()
                    .copied()
                    .filter(|candidate| {
                        matches.iter().all(|other| {
                            other == candidate
                                || self.def_is_restriction_of(*other, *candidate, self_type)
                        })
                    })
                    .collect();
                if minimals.len() == 1 {
                    return Ok(minimals[0]);
                }
                own_miss = Some(LookupMiss {
                    kind: MissKind::Ambiguous,
                    candidates: if minimals.is_empty() { matches } else { minimals },
                });
            } else {
                let mut same_arity = Vec::new();
                let mut all = Vec::new();
                for (key, def) in defs {
                    if key.restrictions.len() == args.len()
                        && key.yields == yields
                        && !same_arity.contains(def)
                    {
                        same_arity.push(*def);
                    }
                    if !all.contains(def) {
                        all.push(*def);
                    }
                }
                own_miss = Some(LookupMiss {
                    kind: MissKind::NoMatch,
                    candidates: if same_arity.is_empty() { all } else { same_arity },
                });
            }
        }

        let mut parent_miss = None;
        if !(name == "new" && self.is_metaclass(self_type)) {
            for parent in self.parents(owner) {
                match self.lookup_def(parent, name, args, yields, self_type) {
                    Ok(def) => return Ok(def),
                    Err(miss) => {
                        if parent_miss.is_none() && miss.kind != MissKind::Undefined {
                            parent_miss = Some(miss);
                        }
                    }
                }
            }
        }

        Err(own_miss.or(parent_miss).unwrap_or_else(LookupMiss::undefined))
    }

    fn restriction_type(&self, restriction: Restriction, self_type: TypeId) -> TypeId {
        match restriction {
            Restriction::Type(ty) => ty,
            Restriction::SelfType => self_type,
        }
    }

    fn restriction_matches(&self, restriction: Restriction, arg: TypeId, self_type: TypeId) -> bool {
        self.is_restriction_of(self.restriction_type(restriction, self_type), arg)
    }

    /// Whether `restriction` accepts `ty`: the same type, the same class
    /// (a template and its specializations), or an ancestor of `ty`.
    /// A union is accepted when every member is.
    pub fn is_restriction_of(&self, restriction: TypeId, ty: TypeId) -> bool {
        let restriction = self.resolve(restriction);
        let ty = self.resolve(ty);
        if restriction == ty {
            return true;
        }
        if let Type::Union(union) = self.get(ty) {
            return union
                .members
                .iter()
                .all(|member| self.is_restriction_of(restriction, *member));
        }
        if let (Some(a), Some(b)) = (self.class_of(restriction), self.class_of(ty)) {
            if a == b {
                return true;
            }
        }
        self.parents(ty)
            .into_iter()
            .any(|parent| self.is_restriction_of(restriction, parent))
    }

    /// Whether definition `general` accepts everything `specific` accepts,
    /// parameter by parameter. An unrestricted parameter is more general
    /// than a restricted one.
    pub fn def_is_restriction_of(&self, general: DefId, specific: DefId, self_type: TypeId) -> bool {
        let general = self.def(general);
        let specific = self.def(specific);
        for (g, s) in general.params.iter().zip(&specific.params) {
            match (g.restriction, s.restriction) {
                (Some(_), None) => return false,
                (Some(g), Some(s)) => {
                    let g = self.restriction_type(g, self_type);
                    let s = self.restriction_type(s, self_type);
                    if !self.is_restriction_of(g, s) {
                        return false;
                    }
                }
                _ => {}
            }
        }
        true
    }

    /// Source-like rendering of a definition, e.g. `Foo#f(x : Int, y)`.
    pub fn def_signature(&self, def: DefId) -> String {
        let def = self.def(def);
        let params: Vec<String> = def
            .params
            .iter()
            .map(|param| match param.restriction {
                Some(Restriction::Type(ty)) => format!("{} : {}", param.name, self.display(ty)),
                Some(Restriction::SelfType) => format!("{} : self", param.name),
                None => param.name.clone(),
            })
            .collect();
        format!("{}({})", self.qualified_method(def.owner, &def.name), params.join(", "))
    }

    /// `f` for top-level methods, `Foo#f` for instance methods and `Foo.f`
    /// for class methods.
    pub fn qualified_method(&self, owner: TypeId, name: &str) -> String {
        let owner = self.resolve(owner);
        if owner == self.builtins().main {
            name.to_string()
        } else if let Type::Metaclass { instance, .. } = self.get(owner) {
            format!("{}.{}", self.display(*instance), name)
        } else {
            format!("{}#{}", self.display(owner), name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstBuilder;

    fn def(owner: TypeId, name: &str, params: Vec<Param>, ret: TypeId) -> Def {
        Def {
            name: name.to_string(),
            owner,
            params,
            yields: false,
            body: DefBody::Primitive(ret),
            location: Location::synthetic(),
        }
    }

    fn restricted(name: &str, ty: TypeId) -> Param {
        Param {
            name: name.to_string(),
            restriction: Some(Restriction::Type(ty)),
            default: None,
        }
    }

    fn free(name: &str) -> Param {
        Param {
            name: name.to_string(),
            restriction: None,
            default: None,
        }
    }

    #[test]
    fn picks_the_matching_overload() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let f_int = reg.add_def(def(b.main, "f", vec![restricted("x", b.int)], b.int));
        let f_float = reg.add_def(def(b.main, "f", vec![restricted("x", b.float)], b.float));

        assert_eq!(reg.lookup_def(b.main, "f", &[b.int], false, b.main), Ok(f_int));
        assert_eq!(reg.lookup_def(b.main, "f", &[b.float], false, b.main), Ok(f_float));

        let miss = reg
            .lookup_def(b.main, "f", &[b.string], false, b.main)
            .expect_err("String matches neither overload");
        assert_eq!(miss.kind, MissKind::NoMatch);
        assert_eq!(miss.candidates, vec![f_int, f_float]);
    }

    #[test]
    fn most_specific_overload_wins() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let general = reg.add_def(def(b.main, "g", vec![free("x")], b.nil));
        let numeric = reg.add_def(def(b.main, "g", vec![restricted("x", b.numeric)], b.nil));
        let int = reg.add_def(def(b.main, "g", vec![restricted("x", b.int)], b.nil));

        assert_eq!(reg.lookup_def(b.main, "g", &[b.int], false, b.main), Ok(int));
        assert_eq!(reg.lookup_def(b.main, "g", &[b.double], false, b.main), Ok(numeric));
        assert_eq!(reg.lookup_def(b.main, "g", &[b.string], false, b.main), Ok(general));
    }

    #[test]
    fn unordered_matches_are_ambiguous() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let left = reg.add_def(def(b.main, "h", vec![restricted("a", b.int), free("b")], b.nil));
        let right = reg.add_def(def(b.main, "h", vec![free("a"), restricted("b", b.int)], b.nil));

        let miss = reg
            .lookup_def(b.main, "h", &[b.int, b.int], false, b.main)
            .expect_err("neither overload is more specific");
        assert_eq!(miss.kind, MissKind::Ambiguous);
        assert_eq!(miss.candidates, vec![left, right]);
    }

    #[test]
    fn trailing_defaults_register_shorter_arities() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let mut ast = AstBuilder::new();
        let zero = ast.int(0);
        let mut second = free("b");
        second.default = Some(Rc::new(zero));
        let f = reg.add_def(def(b.main, "f", vec![free("a"), second], b.nil));

        assert_eq!(reg.lookup_def(b.main, "f", &[b.int], false, b.main), Ok(f));
        assert_eq!(reg.lookup_def(b.main, "f", &[b.int, b.int], false, b.main), Ok(f));
        let miss = reg.lookup_def(b.main, "f", &[], false, b.main).unwrap_err();
        assert_eq!(miss.kind, MissKind::NoMatch);
        assert_eq!(miss.candidates, vec![f]);
    }

    #[test]
    fn yield_shape_is_part_of_the_key() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let mut each = def(b.main, "each", Vec::new(), b.nil);
        each.yields = true;
        let each = reg.add_def(each);

        assert_eq!(reg.lookup_def(b.main, "each", &[], true, b.main), Ok(each));
        let miss = reg.lookup_def(b.main, "each", &[], false, b.main).unwrap_err();
        assert_eq!(miss.kind, MissKind::NoMatch);
    }

    #[test]
    fn lookup_climbs_to_ancestors() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let base = reg.add_object_type("Base", Some(b.object), b.main, false);
        let derived = reg.add_object_type("Derived", Some(base), b.main, false);
        let greet = reg.add_def(def(base, "greet", Vec::new(), b.string));

        assert_eq!(reg.lookup_def(derived, "greet", &[], false, derived), Ok(greet));
        let miss = reg.lookup_def(derived, "missing", &[], false, derived).unwrap_err();
        assert_eq!(miss.kind, MissKind::Undefined);
        assert!(miss.candidates.is_empty());
    }

    #[test]
    fn new_is_not_inherited_through_metaclasses() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let base = reg.add_object_type("Base", Some(b.object), b.main, false);
        let derived = reg.add_object_type("Derived", Some(base), b.main, false);
        let base_meta = reg.metaclass_of(base).unwrap();
        let derived_meta = reg.metaclass_of(derived).unwrap();
        let create = reg.add_def(def(base_meta, "create", Vec::new(), base));
        reg.add_def(def(base_meta, "new", Vec::new(), base));

        assert_eq!(
            reg.lookup_def(derived_meta, "create", &[], false, derived_meta),
            Ok(create)
        );
        let miss = reg
            .lookup_def(derived_meta, "new", &[], false, derived_meta)
            .unwrap_err();
        assert_eq!(miss.kind, MissKind::Undefined);
    }

    #[test]
    fn self_restriction_uses_the_receiver() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let point = reg.add_object_type("Point", Some(b.object), b.main, false);
        let same = reg.add_def(def(
            point,
            "same",
            vec![Param {
                name: "other".into(),
                restriction: Some(Restriction::SelfType),
                default: None,
            }],
            b.bool,
        ));
        assert_eq!(reg.lookup_def(point, "same", &[point], false, point), Ok(same));
        assert!(reg.lookup_def(point, "same", &[b.int], false, point).is_err());
    }

    #[test]
    fn restriction_relation() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        assert!(reg.is_restriction_of(b.numeric, b.int));
        assert!(reg.is_restriction_of(b.object, b.int));
        assert!(!reg.is_restriction_of(b.int, b.numeric));
        assert!(!reg.is_restriction_of(b.int, b.float));
        let ptr = reg.pointer_of(b.int);
        assert!(reg.is_restriction_of(b.pointer, ptr));
        let union = reg.merge(&[b.int, b.float]).unwrap();
        assert!(reg.is_restriction_of(b.numeric, union));
        assert!(!reg.is_restriction_of(b.int, union));
    }

    #[test]
    fn signatures() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let point = reg.add_object_type("Point", Some(b.object), b.main, false);
        let top = reg.add_def(def(b.main, "f", vec![restricted("x", b.int), free("y")], b.nil));
        let method = reg.add_def(def(point, "dist", vec![restricted("p", point)], b.double));
        let meta = reg.metaclass_of(point).unwrap();
        let class_method = reg.add_def(def(meta, "origin", Vec::new(), point));

        assert_eq!(reg.def_signature(top), "f(x : Int, y)");
        assert_eq!(reg.def_signature(method), "Point#dist(p : Point)");
        assert_eq!(reg.def_signature(class_method), "Point.origin()");
    }
}
