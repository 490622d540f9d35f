//! Ordered pattern cascade for one input.

use crate::error::PatternError;
use crate::grok::{Fields, Pattern, PatternRegistry};

/// Something that can pull named fields out of a line.
pub trait Extractor: Send + Sync {
    /// The pattern text as configured, reported alongside events.
    fn source(&self) -> &str;

    /// `None` for no match; an empty map when it matched without fields.
    fn extract(&self, line: &str) -> Option<Fields>;
}

impl Extractor for Pattern {
    fn source(&self) -> &str {
        Pattern::source(self)
    }

    fn extract(&self, line: &str) -> Option<Fields> {
        self.captures(line)
    }
}

/// Fields from the first pattern that produced any, and which pattern it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub fields: Fields,
    pub pattern: String,
}

pub struct LineMatcher {
    extractors: Vec<Box<dyn Extractor>>,
}

impl LineMatcher {
    /// Compiles every pattern up front so that no reference can fail later.
    pub fn compile<S: AsRef<str>>(
        registry: &PatternRegistry,
        patterns: &[S],
    ) -> Result<Self, PatternError> {
        if patterns.is_empty() {
            return Err(PatternError::NoPatterns);
        }
        let extractors = patterns
            .iter()
            .map(|pattern| {
                registry
                    .compile(pattern.as_ref())
                    .map(|compiled| Box::new(compiled) as Box<dyn Extractor>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { extractors })
    }

    pub fn from_extractors(extractors: Vec<Box<dyn Extractor>>) -> Self {
        Self { extractors }
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Tries the patterns in order and stops at the first non-empty field map.
    pub fn match_line(&self, line: &str) -> Option<MatchResult> {
        self.extractors.iter().find_map(|extractor| {
            extractor
                .extract(line)
                .filter(|fields| !fields.is_empty())
                .map(|fields| MatchResult {
                    fields,
                    pattern: extractor.source().to_string(),
                })
        })
    }
}
