//! Shared types for the Garnet compiler: byte spans, source locations and
//! the structured diagnostic record produced by every compiler stage.

pub mod diagnostic;
pub mod span;

pub use diagnostic::Diagnostic;
pub use span::{LineIndex, Location, Span};
