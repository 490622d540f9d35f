//! Typed errors for the pattern registry and input opening.
//!
//! Everything else in the agent propagates `anyhow::Error` with context; these
//! enums exist where callers (and tests) need to tell failure kinds apart.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("no pattern found for %{{{0}}}")]
    UnknownReference(String),

    #[error("pattern {0:?} is already registered")]
    Duplicate(String),

    #[error("pattern reference %{{{0}}} is nested too deeply (recursive definition?)")]
    Recursive(String),

    #[error("invalid regular expression for pattern {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("cannot parse patterns in {path:?} (line {line})")]
    MalformedLine { path: PathBuf, line: usize },

    #[error("empty pattern definition in {path:?} (line {line})")]
    EmptyDefinition { path: PathBuf, line: usize },

    #[error("input has no patterns configured")]
    NoPatterns,

    #[error("failed to read pattern file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("directory paths are not allowed: {0:?}")]
    IsDirectory(PathBuf),

    #[error("failed to open input {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
