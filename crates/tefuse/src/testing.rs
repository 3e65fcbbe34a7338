//! Ordered substring matching over printed graphs, in the style of LLVM FileCheck.
//!
//! ```
//! use tefuse::testing::FileCheck;
//!
//! FileCheck::new()
//!     .check("aten::mul")
//!     .check_not("aten::add_")
//!     .check("return")
//!     .run("%a = aten::mul(%x)\nreturn (%a)\n")
//!     .expect("patterns match");
//! ```

use thiserror::Error;

use crate::ir::Graph;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileCheckError {
    #[error("expected `{pattern}` after line {line}, not found")]
    NotFound { pattern: String, line: usize },
    #[error("`{pattern}` must not appear, but found on line {line}")]
    Unexpected { pattern: String, line: usize },
    #[error("expected `{pattern}` on line {line}")]
    NotOnNextLine { pattern: String, line: usize },
    #[error("expected {expected} occurrences of `{pattern}`, found {found}")]
    Count {
        pattern: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone)]
enum Directive {
    Check(String),
    CheckNot(String),
    CheckNext(String),
    CheckCount(String, usize),
}

#[derive(Debug, Clone, Default)]
pub struct FileCheck {
    directives: Vec<Directive>,
}

impl FileCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// `pattern` must appear after the previous match.
    pub fn check(mut self, pattern: impl Into<String>) -> Self {
        self.directives.push(Directive::Check(pattern.into()));
        self
    }

    /// `pattern` must not appear between the previous match and the next positive match (or the
    /// end of input).
    pub fn check_not(mut self, pattern: impl Into<String>) -> Self {
        self.directives.push(Directive::CheckNot(pattern.into()));
        self
    }

    /// `pattern` must appear on the line following the previous match.
    pub fn check_next(mut self, pattern: impl Into<String>) -> Self {
        self.directives.push(Directive::CheckNext(pattern.into()));
        self
    }

    /// `pattern` must appear `count` more times after the previous match. A count of zero means
    /// it must not appear in the rest of the input.
    pub fn check_count(mut self, pattern: impl Into<String>, count: usize) -> Self {
        self.directives
            .push(Directive::CheckCount(pattern.into(), count));
        self
    }

    pub fn run(&self, input: &str) -> Result<(), FileCheckError> {
        let mut cursor = 0usize;
        let mut pending_not: Vec<&str> = Vec::new();

        for directive in &self.directives {
            match directive {
                Directive::CheckNot(pattern) => pending_not.push(pattern),
                Directive::Check(pattern) => {
                    let start = find_from(input, cursor, pattern).ok_or_else(|| {
                        FileCheckError::NotFound {
                            pattern: pattern.clone(),
                            line: line_of(input, cursor),
                        }
                    })?;
                    reject_any(input, cursor, start, &pending_not)?;
                    pending_not.clear();
                    cursor = start + pattern.len();
                }
                Directive::CheckNext(pattern) => {
                    let line_start = input[cursor..]
                        .find('\n')
                        .map(|offset| cursor + offset + 1)
                        .unwrap_or(input.len());
                    let line_end = input[line_start..]
                        .find('\n')
                        .map(|offset| line_start + offset)
                        .unwrap_or(input.len());
                    let start = input[line_start..line_end]
                        .find(pattern.as_str())
                        .map(|offset| line_start + offset)
                        .ok_or_else(|| FileCheckError::NotOnNextLine {
                            pattern: pattern.clone(),
                            line: line_of(input, line_start),
                        })?;
                    reject_any(input, cursor, start, &pending_not)?;
                    pending_not.clear();
                    cursor = start + pattern.len();
                }
                Directive::CheckCount(pattern, 0) => {
                    if let Some(found) = find_from(input, cursor, pattern) {
                        return Err(FileCheckError::Unexpected {
                            pattern: pattern.clone(),
                            line: line_of(input, found),
                        });
                    }
                }
                Directive::CheckCount(pattern, expected) => {
                    let mut found = 0usize;
                    let mut search = cursor;
                    let mut first = None;
                    while found < *expected {
                        let Some(start) = find_from(input, search, pattern) else {
                            break;
                        };
                        first.get_or_insert(start);
                        found += 1;
                        search = start + pattern.len().max(1);
                    }
                    if found < *expected {
                        return Err(FileCheckError::Count {
                            pattern: pattern.clone(),
                            expected: *expected,
                            found,
                        });
                    }
                    if let Some(first) = first {
                        reject_any(input, cursor, first, &pending_not)?;
                    }
                    pending_not.clear();
                    cursor = search;
                }
            }
        }
        reject_any(input, cursor, input.len(), &pending_not)
    }

    /// Runs the checks over the printed form of `graph`.
    pub fn run_graph(&self, graph: &Graph) -> Result<(), FileCheckError> {
        self.run(&graph.to_string())
    }
}

fn find_from(input: &str, from: usize, pattern: &str) -> Option<usize> {
    input
        .get(from..)
        .and_then(|rest| rest.find(pattern))
        .map(|offset| from + offset)
}

fn reject_any(input: &str, from: usize, to: usize, patterns: &[&str]) -> Result<(), FileCheckError> {
    let window = input.get(from..to).unwrap_or("");
    for pattern in patterns {
        if let Some(offset) = window.find(pattern) {
            return Err(FileCheckError::Unexpected {
                pattern: pattern.to_string(),
                line: line_of(input, from + offset),
            });
        }
    }
    Ok(())
}

/// 1-based line number of a byte offset.
fn line_of(input: &str, offset: usize) -> usize {
    input[..offset.min(input.len())].matches('\n').count() + 1
}
