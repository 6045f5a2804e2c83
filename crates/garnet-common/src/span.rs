use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Byte-offset span into source text. Start is inclusive, end is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end, "span start ({start}) must be <= end ({end})");
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Line start offsets of one source file, for offset -> (line, column) lookups.
///
/// The type checker never reads source text itself; front-ends build one of
/// these per file and hand the engine finished [`Location`]s.
#[derive(Debug)]
pub struct LineIndex {
    line_starts: Vec<u32>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0u32];
        for (i, byte) in source.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push((i + 1) as u32);
            }
        }
        Self { line_starts }
    }

    /// Convert a byte offset to a 1-based (line, column) pair.
    fn line_col(&self, offset: u32) -> (u32, u32) {
        let line_idx = self
            .line_starts
            .partition_point(|&start| start <= offset)
            .saturating_sub(1);
        let line = (line_idx as u32) + 1;
        let col = offset - self.line_starts[line_idx] + 1;
        (line, col)
    }

    /// Build the [`Location`] of `span`, optionally tagged with a file name.
    pub fn locate(&self, span: Span, filename: Option<Arc<str>>) -> Location {
        let (line, column) = self.line_col(span.start);
        Location {
            filename,
            line,
            column,
            length: (!span.is_empty()).then(|| span.len()),
        }
    }
}

/// Source position of an AST node, as supplied by the front-end.
///
/// Only used for diagnostics. `line` and `column` are 1-based; `0` means
/// "synthesized by the compiler, no source position".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Location {
    pub filename: Option<Arc<str>>,
    pub line: u32,
    pub column: u32,
    pub length: Option<u32>,
}

impl Location {
    pub fn new(line: u32, column: u32) -> Self {
        Location {
            filename: None,
            line,
            column,
            length: None,
        }
    }

    /// A location with no source position.
    pub fn synthetic() -> Self {
        Location::default()
    }

    pub fn with_file(mut self, filename: impl Into<Arc<str>>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn is_synthetic(&self) -> bool {
        self.line == 0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filename {
            Some(file) => write!(f, "{}:{}:{}", file, self.line, self.column),
            None => write!(f, "line {}:{}", self.line, self.column),
        }
    }
}
