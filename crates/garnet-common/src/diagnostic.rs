use std::fmt;

use serde::Serialize;

use crate::span::Location;

/// The structured error record handed to an external formatter.
///
/// The compiler core never lays out source text; it only fills in this
/// record. `cause` links to the error that triggered this one, innermost
/// last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub message: String,
    pub filename: Option<String>,
    pub line: u32,
    pub column: u32,
    pub span_length: Option<u32>,
    pub cause: Option<Box<Diagnostic>>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>, location: &Location) -> Self {
        Diagnostic {
            message: message.into(),
            filename: location.filename.as_deref().map(str::to_owned),
            line: location.line,
            column: location.column,
            span_length: location.length,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: Diagnostic) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Iterate this diagnostic and every cause below it, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &Diagnostic> {
        std::iter::successors(Some(self), |d| d.cause.as_deref())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filename {
            Some(file) => write!(f, "{}:{}:{}: {}", file, self.line, self.column, self.message),
            None => write!(f, "line {}:{}: {}", self.line, self.column, self.message),
        }
    }
}
