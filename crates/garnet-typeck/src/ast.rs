//! The whole-program AST handed to the engine by the front-end.
//!
//! Parsing is not part of this crate. A front-end lowers its syntax tree into
//! these nodes, giving each one a unique [`ExprId`] and a [`Location`] for
//! diagnostics. [`AstBuilder`] does the id bookkeeping for front-ends that
//! construct trees programmatically.

use garnet_common::Location;

/// Front-end assigned identity of an expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

#[derive(Clone, Debug)]
pub struct Expr {
    pub id: ExprId,
    pub location: Location,
    pub kind: ExprKind,
}

/// A type written in source: a (possibly qualified) path or `self`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeRef {
    Path(Vec<String>),
    SelfType,
}

#[derive(Clone, Debug)]
pub enum AssignTarget {
    Var(String),
    InstanceVar(String),
    Const(String),
}

#[derive(Clone, Debug)]
pub struct ParamDecl {
    pub name: String,
    pub restriction: Option<TypeRef>,
    pub default: Option<Expr>,
}

#[derive(Clone, Debug)]
pub struct DefDecl {
    pub name: String,
    /// `def self.name`: the definition lives on the metaclass.
    pub receiver_self: bool,
    pub params: Vec<ParamDecl>,
    pub body: Box<Expr>,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub params: Vec<String>,
    pub body: Box<Expr>,
}

#[derive(Clone, Debug)]
pub struct ClassDecl {
    pub name: String,
    pub superclass: Option<Vec<String>>,
    pub generic: bool,
    pub body: Box<Expr>,
}

#[derive(Clone, Debug)]
pub struct ModuleDecl {
    pub name: String,
    pub body: Box<Expr>,
}

#[derive(Clone, Debug)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<(String, TypeRef)>,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Nil,
    Bool(bool),
    Char(char),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Symbol(String),
    Var(String),
    InstanceVar(String),
    SelfRef,
    Path(Vec<String>),
    Assign {
        target: AssignTarget,
        value: Box<Expr>,
    },
    MultiAssign {
        targets: Vec<AssignTarget>,
        values: Vec<Expr>,
    },
    Expressions(Vec<Expr>),
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
    While {
        cond: Box<Expr>,
        body: Box<Expr>,
    },
    Call {
        receiver: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
        block: Option<Block>,
    },
    Yield(Vec<Expr>),
    Return(Option<Box<Expr>>),
    ArrayLiteral {
        elements: Vec<Expr>,
        of: Option<TypeRef>,
    },
    PointerOf(Box<Expr>),
    Def(DefDecl),
    Class(ClassDecl),
    Module(ModuleDecl),
    Struct(StructDecl),
    Include(Vec<String>),
}

impl Expr {
    /// Whether this expression, outside of nested definitions, yields to a block.
    pub fn contains_yield(&self) -> bool {
        match &self.kind {
            ExprKind::Yield(_) => true,
            ExprKind::Def(_) | ExprKind::Class(_) | ExprKind::Module(_) => false,
            ExprKind::Assign { value, .. } => value.contains_yield(),
            ExprKind::MultiAssign { values, .. } => values.iter().any(Expr::contains_yield),
            ExprKind::Expressions(list) => list.iter().any(Expr::contains_yield),
            ExprKind::If {
                cond,
                then,
                otherwise,
            } => {
                cond.contains_yield()
                    || then.contains_yield()
                    || otherwise.as_ref().is_some_and(|e| e.contains_yield())
            }
            ExprKind::While { cond, body } => cond.contains_yield() || body.contains_yield(),
            ExprKind::Call {
                receiver,
                args,
                block,
                ..
            } => {
                receiver.as_ref().is_some_and(|r| r.contains_yield())
                    || args.iter().any(Expr::contains_yield)
                    || block.as_ref().is_some_and(|b| b.body.contains_yield())
            }
            ExprKind::Return(value) => value.as_ref().is_some_and(|v| v.contains_yield()),
            ExprKind::ArrayLiteral { elements, .. } => elements.iter().any(Expr::contains_yield),
            ExprKind::PointerOf(inner) => inner.contains_yield(),
            _ => false,
        }
    }
}

// ── Builder ────────────────────────────────────────────────────────────

/// Hands out sequential [`ExprId`]s while building a tree.
///
/// Every node gets the builder's current location, which callers move with
/// [`AstBuilder::at`].
#[derive(Debug, Default)]
pub struct AstBuilder {
    next_id: u32,
    location: Location,
}

impl AstBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the location attached to subsequently built nodes.
    pub fn at(&mut self, line: u32, column: u32) -> &mut Self {
        self.location = Location::new(line, column);
        self
    }

    pub fn expr(&mut self, kind: ExprKind) -> Expr {
        let id = ExprId(self.next_id);
        self.next_id += 1;
        Expr {
            id,
            location: self.location.clone(),
            kind,
        }
    }

    pub fn nil(&mut self) -> Expr {
        self.expr(ExprKind::Nil)
    }

    pub fn bool(&mut self, value: bool) -> Expr {
        self.expr(ExprKind::Bool(value))
    }

    pub fn char(&mut self, value: char) -> Expr {
        self.expr(ExprKind::Char(value))
    }

    pub fn int(&mut self, value: i32) -> Expr {
        self.expr(ExprKind::Int(value))
    }

    pub fn long(&mut self, value: i64) -> Expr {
        self.expr(ExprKind::Long(value))
    }

    pub fn float(&mut self, value: f32) -> Expr {
        self.expr(ExprKind::Float(value))
    }

    pub fn double(&mut self, value: f64) -> Expr {
        self.expr(ExprKind::Double(value))
    }

    pub fn string(&mut self, value: &str) -> Expr {
        self.expr(ExprKind::Str(value.to_string()))
    }

    pub fn var(&mut self, name: &str) -> Expr {
        self.expr(ExprKind::Var(name.to_string()))
    }

    pub fn ivar(&mut self, name: &str) -> Expr {
        self.expr(ExprKind::InstanceVar(name.to_string()))
    }

    pub fn self_ref(&mut self) -> Expr {
        self.expr(ExprKind::SelfRef)
    }

    pub fn path(&mut self, path: &[&str]) -> Expr {
        self.expr(ExprKind::Path(names(path)))
    }

    pub fn assign(&mut self, name: &str, value: Expr) -> Expr {
        self.expr(ExprKind::Assign {
            target: AssignTarget::Var(name.to_string()),
            value: Box::new(value),
        })
    }

    pub fn assign_ivar(&mut self, name: &str, value: Expr) -> Expr {
        self.expr(ExprKind::Assign {
            target: AssignTarget::InstanceVar(name.to_string()),
            value: Box::new(value),
        })
    }

    pub fn assign_const(&mut self, name: &str, value: Expr) -> Expr {
        self.expr(ExprKind::Assign {
            target: AssignTarget::Const(name.to_string()),
            value: Box::new(value),
        })
    }

    pub fn multi_assign(&mut self, targets: &[&str], values: Vec<Expr>) -> Expr {
        let targets = targets
            .iter()
            .map(|t| AssignTarget::Var(t.to_string()))
            .collect();
        self.expr(ExprKind::MultiAssign { targets, values })
    }

    pub fn seq(&mut self, exprs: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Expressions(exprs))
    }

    pub fn if_(&mut self, cond: Expr, then: Expr, otherwise: Option<Expr>) -> Expr {
        self.expr(ExprKind::If {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: otherwise.map(Box::new),
        })
    }

    pub fn while_(&mut self, cond: Expr, body: Expr) -> Expr {
        self.expr(ExprKind::While {
            cond: Box::new(cond),
            body: Box::new(body),
        })
    }

    /// A call without a receiver.
    pub fn call(&mut self, name: &str, args: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Call {
            receiver: None,
            name: name.to_string(),
            args,
            block: None,
        })
    }

    pub fn send(&mut self, receiver: Expr, name: &str, args: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Call {
            receiver: Some(Box::new(receiver)),
            name: name.to_string(),
            args,
            block: None,
        })
    }

    pub fn call_with_block(
        &mut self,
        receiver: Option<Expr>,
        name: &str,
        args: Vec<Expr>,
        params: &[&str],
        body: Expr,
    ) -> Expr {
        self.expr(ExprKind::Call {
            receiver: receiver.map(Box::new),
            name: name.to_string(),
            args,
            block: Some(Block {
                params: names(params),
                body: Box::new(body),
            }),
        })
    }

    pub fn yield_(&mut self, args: Vec<Expr>) -> Expr {
        self.expr(ExprKind::Yield(args))
    }

    pub fn return_(&mut self, value: Option<Expr>) -> Expr {
        self.expr(ExprKind::Return(value.map(Box::new)))
    }

    pub fn array(&mut self, elements: Vec<Expr>) -> Expr {
        self.expr(ExprKind::ArrayLiteral { elements, of: None })
    }

    pub fn array_of(&mut self, elements: Vec<Expr>, of: &[&str]) -> Expr {
        self.expr(ExprKind::ArrayLiteral {
            elements,
            of: Some(TypeRef::Path(names(of))),
        })
    }

    pub fn pointerof(&mut self, inner: Expr) -> Expr {
        self.expr(ExprKind::PointerOf(Box::new(inner)))
    }

    pub fn def(&mut self, name: &str, params: Vec<ParamDecl>, body: Expr) -> Expr {
        self.expr(ExprKind::Def(DefDecl {
            name: name.to_string(),
            receiver_self: false,
            params,
            body: Box::new(body),
        }))
    }

    pub fn def_self(&mut self, name: &str, params: Vec<ParamDecl>, body: Expr) -> Expr {
        self.expr(ExprKind::Def(DefDecl {
            name: name.to_string(),
            receiver_self: true,
            params,
            body: Box::new(body),
        }))
    }

    pub fn class(&mut self, name: &str, superclass: Option<&[&str]>, body: Vec<Expr>) -> Expr {
        self.class_decl(name, superclass, false, body)
    }

    /// A class whose objects are specialized by their instance-variable
    /// types.
    pub fn generic_class(&mut self, name: &str, body: Vec<Expr>) -> Expr {
        self.class_decl(name, None, true, body)
    }

    fn class_decl(&mut self, name: &str, superclass: Option<&[&str]>, generic: bool, body: Vec<Expr>) -> Expr {
        let body = self.seq(body);
        self.expr(ExprKind::Class(ClassDecl {
            name: name.to_string(),
            superclass: superclass.map(names),
            generic,
            body: Box::new(body),
        }))
    }

    pub fn module(&mut self, name: &str, body: Vec<Expr>) -> Expr {
        let body = self.seq(body);
        self.expr(ExprKind::Module(ModuleDecl {
            name: name.to_string(),
            body: Box::new(body),
        }))
    }

    pub fn struct_(&mut self, name: &str, fields: &[(&str, &str)]) -> Expr {
        let fields = fields
            .iter()
            .map(|(field, ty)| (field.to_string(), TypeRef::Path(vec![ty.to_string()])))
            .collect();
        self.expr(ExprKind::Struct(StructDecl {
            name: name.to_string(),
            fields,
        }))
    }

    pub fn include(&mut self, path: &[&str]) -> Expr {
        self.expr(ExprKind::Include(names(path)))
    }
}

/// An unrestricted parameter.
pub fn param(name: &str) -> ParamDecl {
    ParamDecl {
        name: name.to_string(),
        restriction: None,
        default: None,
    }
}

/// A parameter restricted to the type at `path`.
pub fn typed_param(name: &str, path: &[&str]) -> ParamDecl {
    ParamDecl {
        name: name.to_string(),
        restriction: Some(TypeRef::Path(names(path))),
        default: None,
    }
}

/// A parameter restricted to the receiver's own type.
pub fn self_param(name: &str) -> ParamDecl {
    ParamDecl {
        name: name.to_string(),
        restriction: Some(TypeRef::SelfType),
        default: None,
    }
}

/// An unrestricted parameter with a default value.
pub fn default_param(name: &str, default: Expr) -> ParamDecl {
    ParamDecl {
        name: name.to_string(),
        restriction: None,
        default: Some(default),
    }
}

fn names(path: &[&str]) -> Vec<String> {
    path.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assigns_sequential_ids() {
        let mut b = AstBuilder::new();
        let one = b.int(1);
        let assign = b.assign("a", one);
        let read = b.var("a");
        let program = b.seq(vec![assign, read]);
        assert_eq!(program.id, ExprId(3));
        match &program.kind {
            ExprKind::Expressions(list) => {
                assert_eq!(list[0].id, ExprId(1));
                assert_eq!(list[1].id, ExprId(2));
            }
            other => panic!("expected Expressions, got {:?}", other),
        }
    }

    #[test]
    fn builder_tracks_location() {
        let mut b = AstBuilder::new();
        b.at(4, 7);
        let e = b.nil();
        assert_eq!(e.location, Location::new(4, 7));
    }

    #[test]
    fn yield_detection_skips_nested_defs() {
        let mut b = AstBuilder::new();
        let y = b.yield_(vec![]);
        let inner = b.def("inner", vec![], y);
        assert!(!inner.contains_yield());

        let y = b.yield_(vec![]);
        let one = b.int(1);
        let body = b.if_(one, y, None);
        assert!(body.contains_yield());
    }
}
