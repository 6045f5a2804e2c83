//! Tests for Garnet type errors and the diagnostics built from them.
//!
//! Each test triggers a specific type error and checks its kind, its
//! rendered message and where it points. Messages are snapshotted with
//! insta; cause chains are checked through the serialized `Diagnostic`.

use garnet_typeck::ast::{param, typed_param, AstBuilder, Expr};
use garnet_typeck::error::{LookupKind, TypeError, TypeErrorKind};

// ── Helpers ────────────────────────────────────────────────────────────

/// Run the type checker, failing the test if the program checks.
fn check_err(program: &Expr) -> TypeError {
    match garnet_typeck::check(program) {
        Ok(result) => panic!(
            "expected a type error, got result type {:?}",
            result.result_type.map(|ty| result.display(ty))
        ),
        Err(err) => err,
    }
}

// ── Lookup Failures ────────────────────────────────────────────────────

#[test]
fn test_diag_undefined_variable() {
    let mut b = AstBuilder::new();
    b.at(3, 5);
    let program = b.var("missing");

    let err = check_err(&program);
    assert_eq!(
        err.kind,
        TypeErrorKind::LookupFailure {
            what: LookupKind::Variable,
            name: "missing".into(),
        }
    );
    insta::assert_snapshot!(err.to_diagnostic().to_string(), @"line 3:5: undefined local variable `missing`");
}

#[test]
fn test_diag_undefined_constant() {
    let mut b = AstBuilder::new();
    b.at(1, 1);
    let path = b.path(&["Nowhere", "Thing"]);
    let program = b.send(path, "new", Vec::new());

    let err = check_err(&program);
    insta::assert_snapshot!(err.to_string(), @"undefined constant `Nowhere::Thing`");
}

#[test]
fn test_diag_unknown_restriction_type() {
    let mut b = AstBuilder::new();
    b.at(2, 1);
    let body = b.nil();
    let program = b.def("f", vec![typed_param("x", &["Missing"])], body);

    let err = check_err(&program);
    assert!(matches!(
        err.kind,
        TypeErrorKind::LookupFailure {
            what: LookupKind::Constant,
            ..
        }
    ));
    assert_eq!(err.location.map(|l| l.line), Some(2));
}

#[test]
fn test_diag_include_of_a_class() {
    let mut b = AstBuilder::new();
    b.at(4, 3);
    let include = b.include(&["Int"]);
    let program = b.class("Holder", None, vec![include]);

    let err = check_err(&program);
    insta::assert_snapshot!(err.to_string(), @"undefined module `Int`");
}

#[test]
fn test_diag_yield_without_block() {
    let mut b = AstBuilder::new();
    let one = b.int(1);
    let program = b.yield_(vec![one]);

    let err = check_err(&program);
    insta::assert_snapshot!(err.to_string(), @"no block given for `yield`");
}

// ── Overload Resolution ────────────────────────────────────────────────

#[test]
fn test_diag_restriction_violation_lists_candidates() {
    let mut b = AstBuilder::new();
    let int_body = b.int(1);
    let f_int = b.def("f", vec![typed_param("x", &["Int"])], int_body);
    let float_body = b.int(2);
    let f_float = b.def("f", vec![typed_param("x", &["Float"])], float_body);
    b.at(7, 1);
    let text = b.string("s");
    let call = b.call("f", vec![text]);
    let program = b.seq(vec![f_int, f_float, call]);

    let err = check_err(&program);
    match &err.kind {
        TypeErrorKind::RestrictionViolation { candidates, .. } => assert_eq!(candidates.len(), 2),
        other => panic!("expected a restriction violation, got {:?}", other),
    }
    insta::assert_snapshot!(
        err.to_string(),
        @"no overload of `f` matches argument types (String); candidates: f(x : Int), f(x : Float)"
    );
}

#[test]
fn test_diag_wrong_arity() {
    let mut b = AstBuilder::new();
    let body = b.nil();
    let def = b.def("g", vec![param("a")], body);
    let one = b.int(1);
    let two = b.int(2);
    let call = b.call("g", vec![one, two]);
    let program = b.seq(vec![def, call]);

    let err = check_err(&program);
    insta::assert_snapshot!(
        err.to_string(),
        @"no overload of `g` matches argument types (Int, Int); candidates: g(a)"
    );
}

#[test]
fn test_diag_ambiguous_overload_lists_every_tie() {
    let mut b = AstBuilder::new();
    let first_body = b.int(1);
    let first = b.def("f", vec![typed_param("x", &["Int"]), param("y")], first_body);
    let second_body = b.int(2);
    let second = b.def("f", vec![param("x"), typed_param("y", &["Int"])], second_body);
    let one = b.int(1);
    let two = b.int(2);
    let call = b.call("f", vec![one, two]);
    let program = b.seq(vec![first, second, call]);

    let err = check_err(&program);
    insta::assert_snapshot!(
        err.to_string(),
        @"ambiguous call to `f` with argument types (Int, Int); tied candidates: f(x : Int, y), f(x, y : Int)"
    );
}

#[test]
fn test_diag_struct_setter_checks_field_type() {
    let mut b = AstBuilder::new();
    let decl = b.struct_("Pair", &[("left", "Int")]);
    let path = b.path(&["Pair"]);
    let new = b.send(path, "new", Vec::new());
    let c = b.char('c');
    let set = b.send(new, "left=", vec![c]);
    let program = b.seq(vec![decl, set]);

    let err = check_err(&program);
    insta::assert_snapshot!(
        err.to_string(),
        @"no overload of `left=` matches argument types (Char); candidates: Pair#left=(value : Int)"
    );
}

// ── Members ────────────────────────────────────────────────────────────

#[test]
fn test_diag_unknown_method() {
    let mut b = AstBuilder::new();
    b.at(2, 7);
    let one = b.int(1);
    let program = b.send(one, "frobnicate", Vec::new());

    let err = check_err(&program);
    assert_eq!(
        err.kind,
        TypeErrorKind::UnknownMember {
            owner: "Int".into(),
            member: "frobnicate".into(),
        }
    );
    insta::assert_snapshot!(err.to_diagnostic().to_string(), @"line 2:7: undefined member `frobnicate` for `Int`");
}

#[test]
fn test_diag_unassigned_instance_variable() {
    let mut b = AstBuilder::new();
    b.at(3, 5);
    let read = b.ivar("@ghost");
    b.at(1, 1);
    let get = b.def("ghost", Vec::new(), read);
    let class = b.class("Haunted", None, vec![get]);
    let path = b.path(&["Haunted"]);
    let new = b.send(path, "new", Vec::new());
    let call = b.send(new, "ghost", Vec::new());
    let program = b.seq(vec![class, call]);

    let err = check_err(&program);
    assert_eq!(err.location.as_ref().map(|l| (l.line, l.column)), Some((3, 5)));
    insta::assert_snapshot!(err.to_string(), @"undefined member `@ghost` for `Haunted`");
}

#[test]
fn test_diag_new_with_arguments_needs_initialize() {
    let mut b = AstBuilder::new();
    let class = b.class("Plain", None, Vec::new());
    let path = b.path(&["Plain"]);
    let one = b.int(1);
    let new = b.send(path, "new", vec![one]);
    let program = b.seq(vec![class, new]);

    let err = check_err(&program);
    insta::assert_snapshot!(err.to_string(), @"undefined member `initialize` for `Plain`");
}

// ── Hierarchy ──────────────────────────────────────────────────────────

#[test]
fn test_diag_cyclic_include() {
    let mut b = AstBuilder::new();
    let a = b.module("A", Vec::new());
    let include_a = b.include(&["A"]);
    let module_b = b.module("B", vec![include_a]);
    b.at(5, 3);
    let include_b = b.include(&["B"]);
    let reopen_a = b.module("A", vec![include_b]);
    let program = b.seq(vec![a, module_b, reopen_a]);

    let err = check_err(&program);
    assert_eq!(err.location.as_ref().map(|l| l.line), Some(5));
    insta::assert_snapshot!(
        err.to_string(),
        @"`A` cannot inherit from or include `B`: the hierarchy would be cyclic"
    );
}

// ── Cause Chains ───────────────────────────────────────────────────────

#[test]
fn test_diag_error_inside_instance_is_chained() {
    let mut b = AstBuilder::new();
    b.at(2, 3);
    let x = b.var("x");
    let body = b.send(x, "foo", Vec::new());
    b.at(1, 1);
    let def = b.def("g", vec![param("x")], body);
    b.at(4, 1);
    let one = b.int(1);
    let call = b.call("g", vec![one]);
    let program = b.seq(vec![def, call]);

    let err = check_err(&program);
    assert!(matches!(
        err.root_cause().kind,
        TypeErrorKind::UnknownMember { .. }
    ));
    insta::assert_snapshot!(
        serde_json::to_string(&err.to_diagnostic()).unwrap(),
        @r#"{"message":"instantiating `g(Int)`","filename":null,"line":4,"column":1,"span_length":null,"cause":{"message":"undefined member `foo` for `Int`","filename":null,"line":2,"column":3,"span_length":null,"cause":null}}"#
    );
}

#[test]
fn test_diag_nested_instances_chain_outermost_first() {
    let mut b = AstBuilder::new();
    let x = b.var("x");
    let inner_body = b.send(x, "missing", Vec::new());
    let inner = b.def("inner", vec![param("x")], inner_body);
    let y = b.var("y");
    let outer_body = b.call("inner", vec![y]);
    let outer = b.def("outer", vec![param("y")], outer_body);
    let c = b.char('c');
    let call = b.call("outer", vec![c]);
    let program = b.seq(vec![inner, outer, call]);

    let err = check_err(&program);
    let messages: Vec<String> = err
        .to_diagnostic()
        .chain()
        .map(|diag| diag.message.clone())
        .collect();
    assert_eq!(
        messages,
        vec![
            "instantiating `outer(Char)`",
            "instantiating `inner(Char)`",
            "undefined member `missing` for `Char`",
        ]
    );
}

#[test]
fn test_diag_deferred_call_keeps_its_context() {
    // `f(x).bar` is only resolved once the recursive result is known.
    let mut b = AstBuilder::new();
    let x = b.var("x");
    let rec = b.call("f", vec![x]);
    b.at(2, 3);
    let bar = b.send(rec, "bar", Vec::new());
    let one = b.int(1);
    let body = b.seq(vec![bar, one]);
    let def = b.def("f", vec![param("x")], body);
    b.at(6, 1);
    let arg = b.int(0);
    let call = b.call("f", vec![arg]);
    let program = b.seq(vec![def, call]);

    let err = check_err(&program);
    assert_eq!(
        err.kind,
        TypeErrorKind::Instantiation {
            signature: "f(Int)".into()
        }
    );
    assert_eq!(err.location.as_ref().map(|l| l.line), Some(6));
    let cause = err.cause.as_deref().expect("instantiation frames carry a cause");
    assert_eq!(cause.to_string(), "undefined member `bar` for `Int`");
    assert_eq!(cause.location.as_ref().map(|l| l.line), Some(2));
}

#[test]
fn test_diag_internal_errors_are_flagged() {
    let mut b = AstBuilder::new();
    let one = b.int(1);
    let program = b.assign("a", one);
    let options = garnet_typeck::CheckOptions {
        max_propagation_steps: 0,
        ..Default::default()
    };
    let err = match garnet_typeck::check_with_options(&program, options) {
        Ok(_) => panic!("expected the step bound to trip"),
        Err(err) => err,
    };
    assert!(err.is_internal());
    assert!(err.to_string().starts_with("internal invariant violated"));
}
