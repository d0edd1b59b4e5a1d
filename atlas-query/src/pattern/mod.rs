//! Self-contained pattern matching for query regexes.
//!
//! Queries use `:re` and `:reic` with a bounded regex dialect. Patterns are
//! compiled into a small matcher tree (see [`matcher`]) instead of being
//! handed to a general regex engine, which keeps matching allocation-free
//! on the hot path and lets the index extract prefixes, fixed substrings
//! and trigrams for pre-filtering.
//!
//! Unanchored patterns use find semantics: the pattern may match anywhere
//! inside the probed value.

mod matcher;
mod optimize;
mod parse;

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

use matcher::{match_one, Matcher};

/// Why a pattern failed to compile.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// Syntactically valid construct this matcher deliberately does not
    /// implement (backreferences, inline flags, lookbehind, ...).
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// A quantifier with nothing to repeat.
    #[error("dangling modifier")]
    DanglingModifier,
    /// `[` without a matching `]`.
    #[error("unclosed character class")]
    UnclosedCharClass,
    /// `\Q` without a matching `\E`.
    #[error("unclosed quotation")]
    UnclosedQuotation,
    /// `(` and `)` do not balance.
    #[error("unbalanced parenthesis")]
    UnbalancedParen,
    /// `\p{...}` with a property name this matcher does not know.
    #[error("unknown character property: {0}")]
    UnknownCharProperty(String),
}

/// A compiled pattern.
///
/// Equality and hashing are defined over the source pattern and the case
/// flag, so a matcher round-trips through its `Display` form.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    pattern: String,
    ignore_case: bool,
    root: Matcher,
    start_anchored: bool,
}

impl PatternMatcher {
    /// Compile a case-sensitive pattern.
    pub fn compile(pattern: &str) -> Result<PatternMatcher, PatternError> {
        Self::compile_with(pattern, false)
    }

    /// Compile a pattern that matches case-insensitively (ASCII folding).
    pub fn compile_ignore_case(pattern: &str) -> Result<PatternMatcher, PatternError> {
        Self::compile_with(pattern, true)
    }

    fn compile_with(pattern: &str, ignore_case: bool) -> Result<PatternMatcher, PatternError> {
        let mut root = parse::parse(pattern)?;
        if ignore_case {
            root = fold_case(root);
        }
        let root = optimize::optimize(root);
        let start_anchored = root.is_start_anchored();
        Ok(PatternMatcher {
            pattern: pattern.to_string(),
            ignore_case,
            root,
            start_anchored,
        })
    }

    /// The source pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// True when matching ignores ASCII case.
    pub fn is_ignore_case(&self) -> bool {
        self.ignore_case
    }

    /// True when a match can only start at the beginning of the value.
    pub fn is_start_anchored(&self) -> bool {
        self.start_anchored
    }

    /// True when the pattern matches every value.
    pub fn always_matches(&self) -> bool {
        self.root.always_matches()
    }

    /// Find semantics: true when the pattern matches anywhere in `value`.
    pub fn matches(&self, value: &str) -> bool {
        let chars: Vec<char> = if self.ignore_case {
            value.chars().map(|c| c.to_ascii_lowercase()).collect()
        } else {
            value.chars().collect()
        };
        if self.start_anchored {
            match_one(&self.root, &chars, 0).is_some()
        } else {
            (0..=chars.len()).any(|i| match_one(&self.root, &chars, i).is_some())
        }
    }

    /// Longest fixed prefix of matched values. Only start-anchored
    /// patterns have one.
    pub fn prefix(&self) -> Option<&str> {
        match self.root.as_items().first() {
            Some(Matcher::StartsWith(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Longest run of characters guaranteed to appear in every matched
    /// value.
    pub fn contained_string(&self) -> Option<String> {
        self.root.contained_string()
    }

    /// Trigrams guaranteed to appear in every matched value.
    pub fn trigrams(&self) -> BTreeSet<String> {
        self.root.trigrams()
    }

    /// Equivalent SQL LIKE pattern, when the matcher tree only uses
    /// constructs LIKE can express.
    pub fn to_sql_pattern(&self) -> Option<String> {
        fn escape_into(s: &str, out: &mut String) {
            for c in s.chars() {
                if matches!(c, '%' | '_' | '\\') {
                    out.push('\\');
                }
                out.push(c);
            }
        }

        let items = self.root.as_items();
        let mut out = String::new();
        let mut end_anchored = false;
        for (i, item) in items.iter().enumerate() {
            match item {
                Matcher::True => {}
                Matcher::Start if i == 0 => {}
                Matcher::StartsWith(s) if i == 0 => escape_into(s, &mut out),
                Matcher::CharSeq(s) => escape_into(s, &mut out),
                Matcher::Any => out.push('_'),
                Matcher::ZeroOrMore(inner) if **inner == Matcher::Any => out.push('%'),
                Matcher::IndexOf(s) => {
                    out.push('%');
                    escape_into(s, &mut out);
                }
                Matcher::End if i == items.len() - 1 => end_anchored = true,
                _ => return None,
            }
        }
        if !self.start_anchored && !out.starts_with('%') {
            out.insert(0, '%');
        }
        if !end_anchored && !out.ends_with('%') {
            out.push('%');
        }
        Some(out)
    }
}

/// Lowercase literals and fold classes so matching against lowercased
/// input is case-insensitive for ASCII.
fn fold_case(m: Matcher) -> Matcher {
    match m {
        Matcher::CharSeq(s) => Matcher::CharSeq(s.to_ascii_lowercase()),
        Matcher::StartsWith(s) => Matcher::StartsWith(s.to_ascii_lowercase()),
        Matcher::IndexOf(s) => Matcher::IndexOf(s.to_ascii_lowercase()),
        Matcher::Class(c) => Matcher::Class(c.to_ascii_lowercase()),
        Matcher::Seq(items) => Matcher::Seq(items.into_iter().map(fold_case).collect()),
        Matcher::Or(items) => Matcher::Or(items.into_iter().map(fold_case).collect()),
        Matcher::ZeroOrMore(inner) => Matcher::ZeroOrMore(Box::new(fold_case(*inner))),
        Matcher::ZeroOrOne(inner) => Matcher::ZeroOrOne(Box::new(fold_case(*inner))),
        Matcher::Repeat { min, max, matcher } => Matcher::Repeat {
            min,
            max,
            matcher: Box::new(fold_case(*matcher)),
        },
        Matcher::NegLookahead(inner) => Matcher::NegLookahead(Box::new(fold_case(*inner))),
        Matcher::PosLookahead(inner) => Matcher::PosLookahead(Box::new(fold_case(*inner))),
        other => other,
    }
}

impl fmt::Display for PatternMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

impl PartialEq for PatternMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.ignore_case == other.ignore_case
    }
}

impl Eq for PatternMatcher {}

impl Hash for PatternMatcher {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
        self.ignore_case.hash(state);
    }
}
