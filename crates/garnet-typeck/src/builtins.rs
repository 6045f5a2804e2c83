//! Built-in types and their primitive methods.
//!
//! Seeds the registry with the root module `main`, the
//! `Object > Value > Numeric` hierarchy, the fixed-width primitives,
//! `Pointer`, `String`, the generic `Array` and the `Math` module, and
//! registers the operations implemented by the engine itself.

use crate::overload::{Def, DefBody, Param, Restriction};
use crate::registry::{Builtins, TypeRegistry};
use crate::ty::{Type, TypeId};

/// Register all built-in types into `reg` and return their ids.
pub fn register_builtins(reg: &mut TypeRegistry) -> Builtins {
    let main = reg.add_module("main", None);

    let object = reg.add_object_type("Object", None, main, false);
    let value = reg.add_object_type("Value", Some(object), main, false);
    let numeric = reg.add_object_type("Numeric", Some(value), main, false);

    let void = reg.add_primitive("Void", value, 1, main);
    let nil = reg.add_primitive("Nil", value, 1, main);
    let bool = reg.add_primitive("Bool", value, 1, main);
    let char = reg.add_primitive("Char", value, 1, main);
    let short = reg.add_primitive("Short", value, 2, main);
    let int = reg.add_primitive("Int", numeric, 4, main);
    let long = reg.add_primitive("Long", numeric, 8, main);
    let float = reg.add_primitive("Float", numeric, 4, main);
    let double = reg.add_primitive("Double", numeric, 8, main);
    let symbol = reg.add_primitive("Symbol", value, 4, main);
    let pointer = reg.add_pointer_template(value, main);

    let string = reg.add_object_type("String", Some(object), main, false);
    declare_slot(reg, string, "@length", int);
    declare_slot(reg, string, "@c", char);

    let array = reg.add_object_type("Array", Some(object), main, true);
    declare_slot(reg, array, "@length", int);
    declare_slot(reg, array, "@capacity", int);
    if let Some(class) = reg.class_of(array) {
        reg.class_mut(class).element_ivar = Some("@buffer".to_string());
    }

    let math = reg.add_module("Math", Some(main));

    let builtins = Builtins {
        main,
        object,
        value,
        numeric,
        void,
        nil,
        bool,
        char,
        short,
        int,
        long,
        float,
        double,
        symbol,
        pointer,
        string,
        array,
        math,
    };
    define_primitives(reg, &builtins);
    builtins
}

fn declare_slot(reg: &mut TypeRegistry, ty: TypeId, name: &str, slot: TypeId) {
    if let Type::Object(obj) = reg.get_mut(ty) {
        obj.instance_vars.insert(name.to_string(), Some(slot));
    }
}

fn arg(name: &str, ty: TypeId) -> Param {
    Param {
        name: name.to_string(),
        restriction: Some(Restriction::Type(ty)),
        default: None,
    }
}

fn primitive(reg: &mut TypeRegistry, owner: TypeId, name: &str, params: Vec<Param>, body: DefBody) {
    reg.add_def(Def::builtin(name, owner, params, body));
}

fn define_primitives(reg: &mut TypeRegistry, b: &Builtins) {
    // Ordered by width: an operation yields the wider of its operands.
    let numbers = [b.int, b.long, b.float, b.double];
    for (i, &lhs) in numbers.iter().enumerate() {
        for (j, &rhs) in numbers.iter().enumerate() {
            let wider = numbers[i.max(j)];
            for op in ["+", "-", "*", "/"] {
                primitive(reg, lhs, op, vec![arg("other", rhs)], DefBody::Primitive(wider));
            }
            for op in ["<", "<=", ">", ">=", "==", "!="] {
                primitive(reg, lhs, op, vec![arg("other", rhs)], DefBody::Primitive(b.bool));
            }
        }
    }
    for ty in [b.bool, b.char] {
        for op in ["==", "!="] {
            primitive(reg, ty, op, vec![arg("other", ty)], DefBody::Primitive(b.bool));
        }
    }

    primitive(reg, b.string, "length", Vec::new(), DefBody::Primitive(b.int));

    primitive(reg, b.pointer, "value", Vec::new(), DefBody::PointerGet);
    let value = Param {
        name: "value".to_string(),
        restriction: None,
        default: None,
    };
    primitive(reg, b.pointer, "value=", vec![value], DefBody::PointerSet);

    primitive(reg, b.array, "length", Vec::new(), DefBody::ArrayLength);
    primitive(reg, b.array, "[]", vec![arg("index", b.int)], DefBody::ArrayGet);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_resolve_from_main() {
        let reg = TypeRegistry::new();
        let b = *reg.builtins();
        for (name, ty) in [("Int", b.int), ("Pointer", b.pointer), ("Array", b.array), ("Math", b.math)] {
            assert_eq!(reg.lookup_type(&[name.to_string()], b.main), Some(ty));
            assert_eq!(reg.full_name(ty), name);
        }
    }

    #[test]
    fn arithmetic_widens() {
        let reg = TypeRegistry::new();
        let b = *reg.builtins();
        let cases = [
            (b.int, b.int, b.int),
            (b.int, b.long, b.long),
            (b.float, b.int, b.float),
            (b.long, b.double, b.double),
        ];
        for (lhs, rhs, expected) in cases {
            let def = reg.lookup_def(lhs, "+", &[rhs], false, lhs).unwrap();
            assert!(matches!(reg.def(def).body, DefBody::Primitive(ty) if ty == expected));
        }
        let cmp = reg.lookup_def(b.int, "<", &[b.double], false, b.int).unwrap();
        assert!(matches!(reg.def(cmp).body, DefBody::Primitive(ty) if ty == b.bool));
        assert!(reg.lookup_def(b.int, "+", &[b.string], false, b.int).is_err());
    }

    #[test]
    fn metaclasses_answer_name() {
        let reg = TypeRegistry::new();
        let b = *reg.builtins();
        let meta = reg.metaclass_of(b.string).unwrap();
        let name = reg.lookup_def(meta, "name", &[], false, meta).unwrap();
        assert!(matches!(reg.def(name).body, DefBody::ClassName));
        let allocate = reg.lookup_def(meta, "allocate", &[], false, meta).unwrap();
        assert!(matches!(reg.def(allocate).body, DefBody::Allocate));
    }
}
