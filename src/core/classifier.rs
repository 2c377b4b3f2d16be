//! Classification of errors by kind.
//!
//! A classifier holds an ordered list of `(matcher, value)` entries and a
//! default value. When several entries match an error the most specific one
//! wins:
//!
//! 1. a custom predicate or a pattern without wildcard,
//! 2. the wildcard pattern with the most literal characters,
//! 3. on a tie, the entry registered first.

use std::{fmt, sync::Arc};

use crate::BatchError;

type ErrorPredicate = Arc<dyn Fn(&BatchError) -> bool + Send + Sync>;

/// Selects the errors an entry of an [`ErrorClassifier`] applies to.
#[derive(Clone)]
pub enum ErrorMatcher {
    /// Pattern over [`BatchError::kind`]. `*` matches any run of characters,
    /// `?` matches exactly one.
    Kind(String),
    /// Arbitrary predicate, ranked as an exact match.
    Custom(ErrorPredicate),
}

impl ErrorMatcher {
    pub fn kind(pattern: &str) -> Self {
        ErrorMatcher::Kind(pattern.to_string())
    }

    pub fn custom(predicate: impl Fn(&BatchError) -> bool + Send + Sync + 'static) -> Self {
        ErrorMatcher::Custom(Arc::new(predicate))
    }

    fn matches(&self, error: &BatchError) -> bool {
        match self {
            ErrorMatcher::Kind(pattern) => matches_pattern(pattern, error.kind()),
            ErrorMatcher::Custom(predicate) => predicate(error),
        }
    }

    fn specificity(&self) -> usize {
        match self {
            ErrorMatcher::Kind(pattern) if pattern.contains(['*', '?']) => {
                pattern.chars().filter(|c| *c != '*' && *c != '?').count()
            }
            _ => usize::MAX,
        }
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMatcher::Kind(pattern) => f.debug_tuple("Kind").field(pattern).finish(),
            ErrorMatcher::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Maps errors to a classification value.
#[derive(Debug, Clone)]
pub struct ErrorClassifier<C> {
    entries: Vec<(ErrorMatcher, C)>,
    default: C,
}

impl<C: Clone> ErrorClassifier<C> {
    pub fn new(default: C) -> Self {
        Self {
            entries: Vec::new(),
            default,
        }
    }

    pub fn with(mut self, matcher: ErrorMatcher, value: C) -> Self {
        self.entries.push((matcher, value));
        self
    }

    pub fn add(&mut self, matcher: ErrorMatcher, value: C) {
        self.entries.push((matcher, value));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn classify(&self, error: &BatchError) -> C {
        let mut best: Option<(usize, &C)> = None;
        for (matcher, value) in &self.entries {
            if !matcher.matches(error) {
                continue;
            }
            let specificity = matcher.specificity();
            // strictly greater keeps the first registered entry on ties
            if best.is_none_or(|(current, _)| specificity > current) {
                best = Some((specificity, value));
            }
        }
        best.map(|(_, value)| value.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

impl ErrorClassifier<bool> {
    /// Classifier answering `true` for the `included` patterns and `false`
    /// for the `excluded` ones.
    ///
    /// With no pattern at all every error is included.
    pub fn from_patterns(included: &[String], excluded: &[String]) -> Self {
        let mut classifier = ErrorClassifier::new(included.is_empty());
        for pattern in included {
            classifier.add(ErrorMatcher::kind(pattern), true);
        }
        for pattern in excluded {
            classifier.add(ErrorMatcher::kind(pattern), false);
        }
        classifier
    }
}

/// Matches `value` against a pattern where `*` is any run and `?` one char.
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    let (mut p, mut v) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, v));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            v = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
