//! Grok-style pattern registry.
//!
//! Patterns are plain regular expressions that may refer to other registered
//! patterns with `%{NAME}`, `%{NAME:field}` or `%{NAME:field:type}`. A
//! reference carrying a field name becomes a capture group, everything else is
//! spliced in as a non-capturing group. The registry is filled once at startup
//! (built-ins, then user pattern files) and only read afterwards.

mod defaults;

pub use defaults::DEFAULT_PATTERNS;

use crate::error::PatternError;
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

/// Extracted fields, keyed by field name.
pub type Fields = BTreeMap<String, String>;

const MAX_NESTING: usize = 64;
const REGEX_SIZE_LIMIT: usize = 64 * (1 << 20);
const BUILTIN_ORIGIN: &str = "<builtin>";

lazy_static! {
    static ref REFERENCE: Regex =
        Regex::new(r"%\{([^}:]+)(?::([^}:]+))?(?::([^}:]+))?\}").expect("reference regex");
    static ref NAMED_GROUP: Regex =
        Regex::new(r"\(\?P?<([A-Za-z_][A-Za-z0-9_]*)>").expect("named group regex");
}

#[derive(Debug, Default, Clone)]
pub struct PatternRegistry {
    definitions: HashMap<String, String>,
}

/// A compiled pattern ready for matching.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
    // (generated group name, field name), in expansion order
    groups: Vec<(String, String)>,
}

#[derive(Default)]
struct Expansion {
    regex: String,
    groups: Vec<(String, String)>,
}

impl Expansion {
    fn open_group(&mut self, field: &str) {
        let group = format!("g{}", self.groups.len());
        self.regex.push_str("(?P<");
        self.regex.push_str(&group);
        self.regex.push('>');
        self.groups.push((group, field.to_string()));
    }

    // Literal regex text; raw named groups are renamed so that the same field
    // name may appear more than once in one expression.
    fn push_literal(&mut self, literal: &str) {
        let mut last = 0;
        for caps in NAMED_GROUP.captures_iter(literal) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            self.regex.push_str(&literal[last..whole.start()]);
            self.open_group(name.as_str());
            last = whole.end();
        }
        self.regex.push_str(&literal[last..]);
    }
}

impl PatternRegistry {
    /// Empty registry without the built-in library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with [`DEFAULT_PATTERNS`].
    pub fn with_defaults() -> Result<Self, PatternError> {
        let mut registry = Self::new();
        let count = registry.load_str(DEFAULT_PATTERNS, Path::new(BUILTIN_ORIGIN))?;
        debug!(patterns = count, "loaded built-in patterns");
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Adds a named definition. Every reference in `body` must already be
    /// registered, and names can't be redefined.
    pub fn register(&mut self, name: &str, body: &str) -> Result<(), PatternError> {
        if self.definitions.contains_key(name) {
            return Err(PatternError::Duplicate(name.to_string()));
        }
        self.expand(body, 0, &mut Expansion::default())?;
        self.definitions.insert(name.to_string(), body.to_string());
        Ok(())
    }

    /// Loads a pattern file. Returns the number of definitions added.
    pub fn load_file(&mut self, path: &Path) -> Result<usize, PatternError> {
        let source = std::fs::read_to_string(path).map_err(|source| PatternError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let count = self.load_str(&source, path)?;
        info!(path = %path.display(), patterns = count, "loaded pattern file");
        Ok(count)
    }

    /// Parses `NAME body` lines. Blank lines and `#` comments are skipped.
    pub fn load_str(&mut self, source: &str, origin: &Path) -> Result<usize, PatternError> {
        let mut count = 0;
        for (index, raw) in source.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name, body)) = line.split_once(char::is_whitespace) else {
                return Err(PatternError::MalformedLine {
                    path: origin.to_path_buf(),
                    line: index + 1,
                });
            };
            let (name, body) = (name.trim(), body.trim());
            if name.is_empty() || body.is_empty() {
                return Err(PatternError::EmptyDefinition {
                    path: origin.to_path_buf(),
                    line: index + 1,
                });
            }
            self.register(name, body)?;
            count += 1;
        }
        Ok(count)
    }

    /// Compiles a pattern name or an inline pattern body.
    pub fn compile(&self, pattern: &str) -> Result<Pattern, PatternError> {
        let body = if self.definitions.contains_key(pattern) {
            format!("%{{{pattern}}}")
        } else {
            pattern.to_string()
        };

        let mut expansion = Expansion::default();
        self.expand(&body, 0, &mut expansion)?;

        let regex = RegexBuilder::new(&expansion.regex)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|source| PatternError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })?;

        Ok(Pattern {
            source: pattern.to_string(),
            regex,
            groups: expansion.groups,
        })
    }

    /// One-shot compile and match.
    pub fn parse(&self, pattern: &str, line: &str) -> Result<Option<Fields>, PatternError> {
        Ok(self.compile(pattern)?.captures(line))
    }

    fn expand(&self, body: &str, depth: usize, out: &mut Expansion) -> Result<(), PatternError> {
        let mut last = 0;
        for caps in REFERENCE.captures_iter(body) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let name = name.as_str();
            if depth >= MAX_NESTING {
                return Err(PatternError::Recursive(name.to_string()));
            }
            let definition = self
                .definitions
                .get(name)
                .ok_or_else(|| PatternError::UnknownReference(name.to_string()))?;

            out.push_literal(&body[last..whole.start()]);
            match caps.get(2) {
                Some(field) => out.open_group(field.as_str()),
                None => out.regex.push_str("(?:"),
            }
            self.expand(definition, depth + 1, out)?;
            out.regex.push(')');
            last = whole.end();
        }
        out.push_literal(&body[last..]);
        Ok(())
    }
}

impl Pattern {
    /// The pattern as configured (name or inline body).
    pub fn source(&self) -> &str {
        &self.source
    }

    /// `None` when the line doesn't match. Every named field is present on a
    /// match, empty when its group took no part; only a pattern without
    /// named fields yields an empty map.
    pub fn captures(&self, line: &str) -> Option<Fields> {
        let caps = self.regex.captures(line)?;
        let mut fields = Fields::new();
        for (group, field) in &self.groups {
            let slot = fields.entry(field.clone()).or_default();
            if slot.is_empty() {
                if let Some(value) = caps.name(group) {
                    *slot = value.as_str().to_string();
                }
            }
        }
        Some(fields)
    }
}
