//! Query language and matching machinery for streaming subscriptions.
//!
//! Subscriptions arrive as postfix expressions over the tags of a
//! measurement id, e.g. `name,server.requests,:eq,status,5xx,:eq,:and,:sum`.
//! This crate parses them into [`Query`] and [`DataExpr`] values, matches
//! ids against thousands of subscribed queries in sub-linear time through
//! the [`QueryIndex`], and evaluates the data-expression layer that groups
//! and aggregates matching observations.
//!
//! Regular expressions inside queries are handled by a small self-contained
//! pattern matcher rather than a general regex engine, so the supported
//! feature set stays deliberately bounded and compilation can extract
//! prefixes and trigrams for index pre-filtering.

#![warn(missing_debug_implementations)]

pub mod expr;
pub mod index;
pub mod parser;
pub mod pattern;
pub mod prefix_tree;
pub mod query;

pub use expr::{AggregationType, DataExpr};
pub use index::QueryIndex;
pub use parser::{parse, parse_data_expr, parse_query, Expr, ParseError};
pub use pattern::{PatternError, PatternMatcher};
pub use prefix_tree::PrefixTree;
pub use query::{KeyMatcher, KeyQuery, Query};
