//! Storage descriptors handed to the backend.
//!
//! The engine does not pick a native layout; it only derives, from the
//! canonical type, the quantities a backend needs: size, alignment,
//! whether values are held through a pointer, union tag and payload sizes,
//! and field offsets for objects and structs.

use serde::Serialize;

use crate::registry::TypeRegistry;
use crate::ty::{Type, TypeId};

/// Tag width of a tagged union, in bytes.
pub const UNION_TAG_WIDTH: u32 = 4;

/// Size of a metaclass value (a type id), in bytes.
const METACLASS_SIZE: u32 = 4;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StorageDescriptor {
    pub size: u32,
    pub align: u32,
    /// Values are references to heap storage.
    pub indirect: bool,
    pub union: Option<UnionLayout>,
    /// Slot offsets within the referenced storage of an object or struct.
    pub fields: Vec<FieldOffset>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnionLayout {
    pub tag_width: u32,
    pub max_payload: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldOffset {
    pub name: String,
    pub offset: u32,
}

impl StorageDescriptor {
    fn scalar(size: u32, align: u32) -> Self {
        StorageDescriptor {
            size,
            align,
            indirect: false,
            union: None,
            fields: Vec::new(),
        }
    }

    fn reference(pointer_size: u32, fields: Vec<FieldOffset>) -> Self {
        StorageDescriptor {
            size: pointer_size,
            align: pointer_size,
            indirect: true,
            union: None,
            fields,
        }
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

impl TypeRegistry {
    /// Storage of a value of type `ty`, or `None` for types that have no
    /// runtime values (modules and constants) or an untyped slot.
    pub fn storage(&self, ty: TypeId, pointer_size: u32) -> Option<StorageDescriptor> {
        let ty = self.resolve(ty);
        match self.get(ty) {
            Type::Primitive { width, .. } => Some(StorageDescriptor::scalar(*width, *width)),
            Type::Pointer { .. } => Some(StorageDescriptor::reference(pointer_size, Vec::new())),
            Type::Object(obj) => {
                let slots = obj
                    .instance_vars
                    .iter()
                    .map(|(name, slot)| (name.as_str(), *slot));
                Some(StorageDescriptor::reference(
                    pointer_size,
                    self.field_offsets(slots, pointer_size),
                ))
            }
            Type::Struct { fields, .. } => {
                let slots = fields.iter().map(|(name, slot)| (name.as_str(), Some(*slot)));
                Some(StorageDescriptor::reference(
                    pointer_size,
                    self.field_offsets(slots, pointer_size),
                ))
            }
            Type::Metaclass { .. } => Some(StorageDescriptor::scalar(METACLASS_SIZE, METACLASS_SIZE)),
            Type::Union(union) => {
                if let Some(inner) = self.nilable_type(ty) {
                    // Nil is the null reference; value types need a tag.
                    if self.is_reference(inner) {
                        return self.storage(inner, pointer_size);
                    }
                }
                self.tagged_union(&union.members, pointer_size)
            }
            Type::Module { .. } | Type::Const(_) | Type::Proxy(_) => None,
        }
    }

    fn tagged_union(&self, members: &[TypeId], pointer_size: u32) -> Option<StorageDescriptor> {
        let mut max_payload = 0;
        let mut payload_align = 1;
        for member in members {
            let (size, align) = self.slot_layout(*member, pointer_size)?;
            max_payload = max_payload.max(size);
            payload_align = payload_align.max(align);
        }
        let align = payload_align.max(UNION_TAG_WIDTH);
        let size = align_up(align_up(UNION_TAG_WIDTH, payload_align) + max_payload, align);
        Some(StorageDescriptor {
            size,
            align,
            indirect: false,
            union: Some(UnionLayout {
                tag_width: UNION_TAG_WIDTH,
                max_payload,
            }),
            fields: Vec::new(),
        })
    }

    fn is_reference(&self, ty: TypeId) -> bool {
        matches!(
            self.get(self.resolve(ty)),
            Type::Object(_) | Type::Struct { .. } | Type::Pointer { .. }
        )
    }

    /// Size and alignment of a slot holding `ty`. A reference slot never
    /// looks at the fields of its target, so self-referential types end.
    fn slot_layout(&self, ty: TypeId, pointer_size: u32) -> Option<(u32, u32)> {
        let ty = self.resolve(ty);
        if self.is_reference(ty) {
            return Some((pointer_size, pointer_size));
        }
        match self.get(ty) {
            Type::Union(union) => match self.nilable_type(ty) {
                Some(inner) if self.is_reference(inner) => Some((pointer_size, pointer_size)),
                _ => self
                    .tagged_union(&union.members, pointer_size)
                    .map(|storage| (storage.size, storage.align)),
            },
            _ => self
                .storage(ty, pointer_size)
                .map(|storage| (storage.size, storage.align)),
        }
    }

    fn field_offsets<'a>(
        &self,
        slots: impl Iterator<Item = (&'a str, Option<TypeId>)>,
        pointer_size: u32,
    ) -> Vec<FieldOffset> {
        let mut offset = 0;
        let mut fields = Vec::new();
        for (name, slot) in slots {
            let (size, align) = slot
                .and_then(|slot| self.slot_layout(slot, pointer_size))
                .unwrap_or((pointer_size, pointer_size));
            offset = align_up(offset, align);
            fields.push(FieldOffset {
                name: name.to_string(),
                offset,
            });
            offset += size;
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn primitives_use_their_width() {
        let reg = TypeRegistry::new();
        let b = *reg.builtins();
        for (ty, width) in [(b.bool, 1), (b.short, 2), (b.int, 4), (b.long, 8), (b.double, 8)] {
            let storage = reg.storage(ty, 8).unwrap();
            assert_eq!((storage.size, storage.align), (width, width));
            assert!(!storage.indirect);
        }
        assert_eq!(reg.storage(b.math, 8), None);
    }

    #[test]
    fn unions_are_tagged() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let int_float = reg.merge2(b.int, b.float);
        let storage = reg.storage(int_float, 8).unwrap();
        assert_eq!(storage.size, 8);
        assert_eq!(
            storage.union,
            Some(UnionLayout {
                tag_width: 4,
                max_payload: 4
            })
        );

        let int_double = reg.merge2(b.int, b.double);
        let storage = reg.storage(int_double, 8).unwrap();
        assert_eq!((storage.size, storage.align), (16, 8));
    }

    #[test]
    fn nilable_references_use_the_reference_layout() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let string_nil = reg.merge2(b.string, b.nil);
        let storage = reg.storage(string_nil, 8).unwrap();
        assert!(storage.indirect);
        assert_eq!(storage.union, None);

        // A nilable value type still needs its tag.
        let int_nil = reg.merge2(b.int, b.nil);
        assert!(reg.storage(int_nil, 8).unwrap().union.is_some());
    }

    #[test]
    fn object_fields_are_laid_out_in_order() {
        let reg = TypeRegistry::new();
        let b = *reg.builtins();
        let storage = reg.storage(b.string, 8).unwrap();
        assert!(storage.indirect);
        insta::assert_snapshot!(
            serde_json::to_string(&storage).unwrap(),
            @r#"{"size":8,"align":8,"indirect":true,"union":null,"fields":[{"name":"@length","offset":0},{"name":"@c","offset":4}]}"#
        );
    }

    #[test]
    fn struct_fields_respect_alignment() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let mut fields = IndexMap::new();
        fields.insert("flag".to_string(), b.bool);
        fields.insert("value".to_string(), b.double);
        fields.insert("next".to_string(), b.char);
        let point = reg.add_struct("Cell", fields, b.main);
        let offsets: Vec<u32> = reg
            .storage(point, 8)
            .unwrap()
            .fields
            .iter()
            .map(|f| f.offset)
            .collect();
        assert_eq!(offsets, vec![0, 8, 16]);
    }

    #[test]
    fn self_referential_objects_terminate() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let node = reg.add_object_type("Node", Some(b.object), b.main, false);
        let next = reg.merge2(node, b.nil);
        reg.set_instance_var(node, "@value", b.int);
        reg.set_instance_var(node, "@next", next);
        reg.set_instance_var(node, "@me", node);

        let storage = reg.storage(node, 8).unwrap();
        let offsets: Vec<(&str, u32)> = storage
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.offset))
            .collect();
        assert_eq!(offsets, vec![("@value", 0), ("@next", 8), ("@me", 16)]);

        let nilable = reg.storage(next, 8).unwrap();
        assert!(nilable.indirect);
        assert_eq!(nilable.fields.len(), 3);
    }

    #[test]
    fn unions_of_objects_use_reference_payloads() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let node = reg.add_object_type("Node", Some(b.object), b.main, false);
        let mixed = reg.merge2(node, b.int);
        reg.set_instance_var(node, "@either", mixed);

        let storage = reg.storage(mixed, 8).unwrap();
        assert_eq!((storage.size, storage.align), (16, 8));
        assert_eq!(reg.storage(node, 8).unwrap().fields[0].offset, 0);
    }
}
