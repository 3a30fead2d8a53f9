//! The error-format mini-language for parsing tool output.
//!
//! A format is a line template with printf-style directives:
//!
//! | directive | matches |
//! |---|---|
//! | `%f` | file name (optionally with a drive prefix) |
//! | `%l` | line number |
//! | `%c` | column number |
//! | `%t` | single type letter (`E`, `W`, `I`, `N`, ...) |
//! | `%m` | message text |
//! | `%n` | numeric error code |
//! | `%r` | rest of the line |
//! | `%%` | a literal `%` |
//!
//! Each output line is tried against the patterns in order; the first
//! match yields an [`Entry`], lines matching nothing are discarded.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ErrorFormatError {
    #[error("invalid error-format {format:?}: unknown directive %{directive}")]
    UnknownDirective { format: String, directive: char },

    #[error("invalid error-format {format:?}: trailing %")]
    TrailingPercent { format: String },

    #[error("invalid error-format {format:?}")]
    Regex {
        format: String,
        #[source]
        source: regex::Error,
    },
}

/// One parsed line of tool output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub filename: String,
    /// One-based line number, 0 when the pattern captured none.
    pub lnum: u32,
    /// One-based column number, 0 meaning "whole line".
    pub col: u32,
    /// Type letter, when the pattern carries `%t`.
    pub kind: Option<char>,
    /// Numeric code from `%n`, 0 when absent.
    pub number: u32,
    pub message: String,
    /// Remainder captured by `%r`.
    pub rest: String,
}

/// A compiled set of error-format patterns.
#[derive(Debug, Clone)]
pub struct ErrorFormat {
    patterns: Vec<Regex>,
}

impl ErrorFormat {
    pub fn parse(formats: &[String]) -> Result<Self, ErrorFormatError> {
        let patterns = formats
            .iter()
            .map(|f| compile(f))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ErrorFormat { patterns })
    }

    /// Scan tool output line by line, producing an entry per matching line.
    pub fn scan(&self, output: &str) -> Vec<Entry> {
        output
            .lines()
            .filter_map(|line| self.match_line(line))
            .collect()
    }

    fn match_line(&self, line: &str) -> Option<Entry> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        for pattern in &self.patterns {
            if let Some(caps) = pattern.captures(line) {
                let group = |name: &str| caps.name(name).map(|m| m.as_str());
                let number = |name: &str| {
                    group(name)
                        .and_then(|s| s.parse::<u32>().ok())
                        .unwrap_or(0)
                };
                return Some(Entry {
                    filename: group("f").unwrap_or("").to_string(),
                    lnum: number("l"),
                    col: number("c"),
                    kind: group("t").and_then(|s| s.chars().next()),
                    number: number("n"),
                    message: group("m").unwrap_or("").to_string(),
                    rest: group("r").unwrap_or("").to_string(),
                });
            }
        }
        None
    }
}

/// Compile one format string into an anchored regex with named groups.
fn compile(format: &str) -> Result<Regex, ErrorFormatError> {
    let mut pattern = String::from("^");
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            pattern.push_str(&regex::escape(&c.to_string()));
            continue;
        }
        match chars.next() {
            // A file name may carry a Windows drive prefix whose colon
            // must not terminate the match.
            Some('f') => pattern.push_str(r"(?P<f>(?:[A-Za-z]:)?[^:]*?)"),
            Some('l') => pattern.push_str(r"(?P<l>\d+)"),
            Some('c') => pattern.push_str(r"(?P<c>\d+)"),
            Some('n') => pattern.push_str(r"(?P<n>\d+)"),
            Some('t') => pattern.push_str(r"(?P<t>\S)"),
            Some('m') => pattern.push_str(r"(?P<m>.*)"),
            Some('r') => pattern.push_str(r"(?P<r>.*)"),
            Some('%') => pattern.push('%'),
            Some(other) => {
                return Err(ErrorFormatError::UnknownDirective {
                    format: format.to_string(),
                    directive: other,
                })
            }
            None => {
                return Err(ErrorFormatError::TrailingPercent {
                    format: format.to_string(),
                })
            }
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|source| ErrorFormatError::Regex {
        format: format.to_string(),
        source,
    })
}

/// Formats used when a recipe configures none.
pub static DEFAULT_FORMATS: Lazy<Vec<String>> =
    Lazy::new(|| vec!["%f:%l:%m".to_string(), "%f:%l:%c:%m".to_string()]);
