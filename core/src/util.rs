//! Small helpers shared across the crate: source spans for the listing
//! parser and the error types, plus the `debug!` tracing macro.

use nom_locate::LocatedSpan;
use serde::Serialize;
use std::fmt::{self, Formatter};

/// The raw input type used by the parser. Wraps the source text and tracks
/// position info as the parser consumes it.
pub type RawSpan<'a> = LocatedSpan<&'a str>;

/// A range of source code, in both byte and line/column terms. Copied out of
/// the parser input so it can outlive the source string.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Span {
    /// Byte offset of the start of the range, 0-based
    pub offset: usize,
    /// Length of the range, in bytes
    pub length: usize,
    /// Line of the first character, 1-based
    pub start_line: u32,
    /// Column of the first character, 1-based
    pub start_col: usize,
}

impl Span {
    /// Build a span from a slice of parser input. The slice should cover
    /// exactly the text of interest.
    pub fn from_raw_span(raw_span: &RawSpan<'_>) -> Self {
        Self {
            offset: raw_span.location_offset(),
            length: raw_span.fragment().len(),
            start_line: raw_span.location_line(),
            start_col: raw_span.get_column(),
        }
    }

    /// Get the slice of source code that this span points to. `src` must be
    /// the same source string the span was created from.
    pub fn get_source_slice<'a>(&self, src: &'a str) -> &'a str {
        &src[self.offset..self.offset + self.length]
    }
}

/// Write the source line a span points at, with a caret marker underneath.
/// Used by the alternate error formatter.
pub fn fmt_src_highlights(
    f: &mut Formatter<'_>,
    span: &Span,
    src: &str,
) -> fmt::Result {
    let line = match src.lines().nth(span.start_line as usize - 1) {
        Some(line) => line,
        // Spans always come from the source, but don't panic while
        // formatting an error for the user
        None => return Ok(()),
    };
    writeln!(f)?;
    writeln!(f, " {} | {}", span.start_line, line)?;
    let line_num_width = span.start_line.to_string().len();
    write!(
        f,
        " {:width$} | {:>col$}",
        "",
        "^",
        width = line_num_width,
        col = span.start_col,
    )
}

/// Macro that can wrap any body, and only executes the body if we are running
/// in debug mode. Debug mode is enabled by setting the environment variable
/// DEBUG=true. This compiles away to nothing when --release is used.
///
/// Example:
/// ```
/// use boxvm::debug;
/// debug!(println!("Hello!"));
/// ```
#[macro_export]
macro_rules! debug {
    ($arg:expr) => {
        #[cfg(debug_assertions)]
        {
            if let Ok(debug_val) = std::env::var("DEBUG") {
                if debug_val.to_lowercase().as_str() == "true" {
                    $arg
                }
            }
        }
    };
}
