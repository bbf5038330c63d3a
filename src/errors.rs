//! Error taxonomy for the compiler pipeline and host surface.
//!
//! Everything inside a compile session propagates a `SyntaxError` out to
//! the protected `load` boundary; nothing recovers locally. The other
//! variants exist for the runtime collaborators that share this error
//! channel (the VM raises them, we only define them).

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

/// Malformed input detected by the lexer, parser or undumper. Fatal for
/// the current chunk; never retried.
#[derive(Debug, Clone)]
pub struct SyntaxError {
    pub chunk: String,
    /// Source line, or 0 when no line applies (binary chunks).
    pub line: u32,
    /// Byte offset range in the source, when known.
    pub span: Option<(usize, usize)>,
    pub msg: String,
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line > 0 {
            write!(f, "{}:{}: {}", self.chunk, self.line, self.msg)
        } else {
            write!(f, "{}: {}", self.chunk, self.msg)
        }
    }
}

impl std::error::Error for SyntaxError {}

/// Top-level error type surfaced by the embedding API.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    /// Raised by the VM collaborator (tag mismatch, stack overflow, ...).
    #[error("runtime error: {0}")]
    Runtime(String),
    /// Allocation failure; carries no payload so propagation itself
    /// cannot allocate.
    #[error("not enough memory")]
    Memory,
    /// A message handler faulted while handling an error.
    #[error("error in error handling")]
    ErrorInErrorHandler,
}

/// `SyntaxError` rendered against its source text for terminal output,
/// with the offending range labelled.
#[derive(Debug, Error, Diagnostic)]
#[error("{msg}")]
pub struct SyntaxReport {
    pub msg: String,
    #[source_code]
    pub src: NamedSource,
    #[label("here")]
    pub at: Option<SourceSpan>,
}

impl SyntaxError {
    /// Attach the source text to produce a rich report.
    pub fn into_report(self, source: &str) -> SyntaxReport {
        let at = self
            .span
            .map(|(start, end)| SourceSpan::from(start..end.max(start + 1)));
        SyntaxReport {
            msg: self.to_string(),
            src: NamedSource::new(self.chunk, source.to_string()),
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_chunk_and_line() {
        let e = SyntaxError {
            chunk: "demo.toku".into(),
            line: 7,
            span: None,
            msg: "unexpected symbol".into(),
        };
        assert_eq!(e.to_string(), "demo.toku:7: unexpected symbol");
    }

    #[test]
    fn binary_errors_have_no_line() {
        let e = SyntaxError {
            chunk: "binary string".into(),
            line: 0,
            span: None,
            msg: "bad binary format (truncated chunk)".into(),
        };
        assert_eq!(
            e.to_string(),
            "binary string: bad binary format (truncated chunk)"
        );
    }
}
