//! Type error types with source locations and cause chains.
//!
//! Every failure of the engine aborts the enclosing inference pass. An error
//! raised while typing the body of a definition instance is wrapped in an
//! [`TypeErrorKind::Instantiation`] frame at the call site, so the final
//! error reads outermost-first down to the construct that actually failed.

use std::fmt;

use garnet_common::{Diagnostic, Location};

/// What kind of name a failed lookup was looking for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKind {
    Variable,
    Constant,
    Module,
    Block,
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupKind::Variable => write!(f, "local variable"),
            LookupKind::Constant => write!(f, "constant"),
            LookupKind::Module => write!(f, "module"),
            LookupKind::Block => write!(f, "block"),
        }
    }
}

/// The specific kind of type error.
///
/// Types and candidates are carried pre-rendered so an error outlives the
/// registry that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeErrorKind {
    /// An identifier, type name or constant is not visible from the scope.
    LookupFailure { what: LookupKind, name: String },
    /// No declared parameter restriction accepts the argument types.
    RestrictionViolation {
        name: String,
        arg_types: Vec<String>,
        candidates: Vec<String>,
    },
    /// More than one equally specific definition matches.
    AmbiguousOverload {
        name: String,
        arg_types: Vec<String>,
        candidates: Vec<String>,
    },
    /// Access to an undeclared method or instance variable.
    UnknownMember { owner: String, member: String },
    /// An include or superclass that would make the ancestor graph cyclic.
    CyclicHierarchy { ty: String, ancestor: String },
    /// Context frame: the `cause` was raised while typing this instance.
    Instantiation { signature: String },
    /// A defect in the engine itself (fixpoint or proxy bound exceeded).
    InternalInvariantViolation { reason: String },
}

impl fmt::Display for TypeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeErrorKind::LookupFailure {
                what: LookupKind::Block,
                ..
            } => write!(f, "no block given for `yield`"),
            TypeErrorKind::LookupFailure { what, name } => {
                write!(f, "undefined {} `{}`", what, name)
            }
            TypeErrorKind::RestrictionViolation {
                name,
                arg_types,
                candidates,
            } => {
                write!(
                    f,
                    "no overload of `{}` matches argument types ({})",
                    name,
                    arg_types.join(", ")
                )?;
                if !candidates.is_empty() {
                    write!(f, "; candidates: {}", candidates.join(", "))?;
                }
                Ok(())
            }
            TypeErrorKind::AmbiguousOverload {
                name,
                arg_types,
                candidates,
            } => write!(
                f,
                "ambiguous call to `{}` with argument types ({}); tied candidates: {}",
                name,
                arg_types.join(", "),
                candidates.join(", ")
            ),
            TypeErrorKind::UnknownMember { owner, member } => {
                write!(f, "undefined member `{}` for `{}`", member, owner)
            }
            TypeErrorKind::CyclicHierarchy { ty, ancestor } => write!(
                f,
                "`{}` cannot inherit from or include `{}`: the hierarchy would be cyclic",
                ty, ancestor
            ),
            TypeErrorKind::Instantiation { signature } => {
                write!(f, "instantiating `{}`", signature)
            }
            TypeErrorKind::InternalInvariantViolation { reason } => {
                write!(f, "internal invariant violated: {}", reason)
            }
        }
    }
}

/// A type error with its source location and optional underlying cause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeError {
    pub kind: TypeErrorKind,
    pub location: Option<Location>,
    pub cause: Option<Box<TypeError>>,
}

impl TypeError {
    pub fn new(kind: TypeErrorKind, location: Option<Location>) -> Self {
        TypeError {
            kind,
            location,
            cause: None,
        }
    }

    pub fn at(kind: TypeErrorKind, location: &Location) -> Self {
        Self::new(kind, Some(location.clone()))
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(
            TypeErrorKind::InternalInvariantViolation {
                reason: reason.into(),
            },
            None,
        )
    }

    /// Attach `location` unless the error already has one.
    pub fn or_at(mut self, location: &Location) -> Self {
        if self.location.is_none() {
            self.location = Some(location.clone());
        }
        self
    }

    /// Wrap `inner` in an instantiation frame located at the call site.
    pub fn instantiating(signature: String, location: &Location, inner: TypeError) -> Self {
        TypeError {
            kind: TypeErrorKind::Instantiation { signature },
            location: Some(location.clone()),
            cause: Some(Box::new(inner)),
        }
    }

    /// The innermost error of the cause chain.
    pub fn root_cause(&self) -> &TypeError {
        let mut err = self;
        while let Some(cause) = &err.cause {
            err = cause;
        }
        err
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self.root_cause().kind,
            TypeErrorKind::InternalInvariantViolation { .. }
        )
    }

    /// Convert into the structured record consumed by external formatters.
    pub fn to_diagnostic(&self) -> Diagnostic {
        let location = self.location.clone().unwrap_or_default();
        let diag = Diagnostic::new(self.kind.to_string(), &location);
        match &self.cause {
            Some(cause) => diag.with_cause(cause.to_diagnostic()),
            None => diag,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for TypeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_match() -> TypeError {
        TypeError::at(
            TypeErrorKind::RestrictionViolation {
                name: "f".into(),
                arg_types: vec!["String".into()],
                candidates: vec!["f(x : Int)".into(), "f(x : Float)".into()],
            },
            &Location::new(3, 1).with_length(1),
        )
    }

    #[test]
    fn restriction_violation_lists_candidates() {
        insta::assert_snapshot!(
            no_match().to_string(),
            @"no overload of `f` matches argument types (String); candidates: f(x : Int), f(x : Float)"
        );
    }

    #[test]
    fn lookup_failure_messages() {
        let err = TypeError::new(
            TypeErrorKind::LookupFailure {
                what: LookupKind::Constant,
                name: "Foo::Bar".into(),
            },
            None,
        );
        assert_eq!(err.to_string(), "undefined constant `Foo::Bar`");

        let err = TypeError::new(
            TypeErrorKind::LookupFailure {
                what: LookupKind::Block,
                name: "yield".into(),
            },
            None,
        );
        assert_eq!(err.to_string(), "no block given for `yield`");
    }

    #[test]
    fn root_cause_and_diagnostic_chain() {
        let outer = TypeError::instantiating("g(Int)".into(), &Location::new(7, 2), no_match());
        assert!(matches!(
            outer.root_cause().kind,
            TypeErrorKind::RestrictionViolation { .. }
        ));
        assert!(!outer.is_internal());

        let diag = outer.to_diagnostic();
        assert_eq!(diag.message, "instantiating `g(Int)`");
        assert_eq!(diag.line, 7);
        let cause = diag.cause.as_deref().expect("cause should be chained");
        assert_eq!(cause.line, 3);
        assert_eq!(cause.span_length, Some(1));
    }

    #[test]
    fn internal_errors_are_flagged() {
        let err = TypeError::internal("fixpoint not reached");
        assert!(err.is_internal());
        assert_eq!(err.to_string(), "internal invariant violated: fixpoint not reached");
    }

    #[test]
    fn error_source_follows_cause() {
        use std::error::Error;
        let outer = TypeError::instantiating("g(Int)".into(), &Location::new(7, 2), no_match());
        assert!(outer.source().is_some());
        assert!(no_match().source().is_none());
    }
}
