//! The unifier: merging candidate types into one canonical type.
//!
//! A merge never fails. It flattens unions, drops superseded proxies and
//! interns the result, so two merges over the same set of types always
//! return the same `TypeId`.

use tracing::debug;

use crate::registry::TypeRegistry;
use crate::ty::{Type, TypeId, UnionType};

impl TypeRegistry {
    /// Merge `types` into a single type.
    ///
    /// Dead proxies are dropped and live ones replaced by their target.
    /// Nested unions are flattened and members deduplicated and sorted by
    /// id. One survivor is returned as is; two or more yield the interned
    /// union for that exact member list. `None` if nothing survives.
    pub fn merge(&mut self, types: &[TypeId]) -> Option<TypeId> {
        let mut members = Vec::with_capacity(types.len());
        for &ty in types {
            if self.get(ty).as_proxy().is_some_and(|proxy| proxy.is_dead()) {
                continue;
            }
            let ty = self.resolve(ty);
            match self.get(ty) {
                Type::Union(union) => members.extend(union.members.iter().copied()),
                _ => members.push(ty),
            }
        }
        members.sort();
        members.dedup();

        match members.len() {
            0 => None,
            1 => Some(members[0]),
            _ => Some(self.intern_union(members)),
        }
    }

    /// Merge two types.
    pub fn merge2(&mut self, a: TypeId, b: TypeId) -> TypeId {
        self.merge(&[a, b]).unwrap_or(a)
    }

    fn intern_union(&mut self, members: Vec<TypeId>) -> TypeId {
        if let Some(&union) = self.unions.get(&members) {
            return union;
        }
        let union = self.push_type(Type::Union(UnionType::new(members.clone())));
        self.unions.insert(members, union);
        debug!(union = %self.display(union), "interned union");
        union
    }
}
