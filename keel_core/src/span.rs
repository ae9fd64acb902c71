//! Source position tracking.
//!
//! Spans record where a node came from in the original source: a start
//! line/column and an end line/column. Lines are 1-indexed, columns are
//! 0-indexed byte offsets into the line. Line 0 marks a span that carries no
//! position (a node synthesized without a location).

use std::fmt;

/// A source region covered by an AST node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    /// First line (1-indexed, 0 = no position).
    pub line: u32,
    /// Column on the first line.
    pub column: u32,
    /// Last line (inclusive).
    pub end_line: u32,
    /// Column just past the node on the last line.
    pub end_column: u32,
}

impl Span {
    /// Create a span covering `line:column` to `end_line:end_column`.
    #[inline]
    #[must_use]
    pub const fn new(line: u32, column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            line,
            column,
            end_line,
            end_column,
        }
    }

    /// Create a zero-width span at a position.
    #[inline]
    #[must_use]
    pub const fn point(line: u32, column: u32) -> Self {
        Self::new(line, column, line, column)
    }

    /// Create a span covering a whole line, starting at column 0.
    #[inline]
    #[must_use]
    pub const fn line(line: u32) -> Self {
        Self::point(line, 0)
    }

    /// A span with no position, for generated code.
    #[inline]
    #[must_use]
    pub const fn dummy() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Check if this span carries no position.
    #[inline]
    #[must_use]
    pub const fn is_dummy(&self) -> bool {
        self.line == 0
    }

    /// Return `self`, or `fallback` when `self` carries no position.
    #[inline]
    #[must_use]
    pub const fn or(self, fallback: Span) -> Span {
        if self.is_dummy() { fallback } else { self }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}..{}:{}",
            self.line, self.column, self.end_line, self.end_column
        )
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dummy() {
            f.write_str("<unknown>")
        } else {
            write!(f, "line {}, column {}", self.line, self.column)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_point() {
        let span = Span::point(3, 4);
        assert_eq!(span.line, 3);
        assert_eq!(span.end_line, 3);
        assert_eq!(span.column, 4);
    }

    #[test]
    fn test_span_dummy() {
        let span = Span::dummy();
        assert!(span.is_dummy());
        assert_eq!(Span::default(), span);
    }

    #[test]
    fn test_span_or_prefers_real_position() {
        let real = Span::line(7);
        assert_eq!(Span::dummy().or(real), real);
        assert_eq!(Span::line(2).or(real).line, 2);
    }

    #[test]
    fn test_span_display() {
        assert_eq!(Span::point(4, 2).to_string(), "line 4, column 2");
        assert_eq!(Span::dummy().to_string(), "<unknown>");
    }
}
