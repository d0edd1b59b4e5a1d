//! Interpreter for the postfix expression language.
//!
//! Tokens are comma separated. Plain tokens push strings onto a stack,
//! `(`/`)` delimit list literals, and words starting with `:` pop their
//! operands and push the result. `name,up,:eq,:sum` selects the `up`
//! metric and sums it.

use thiserror::Error;

use crate::expr::{AggregationType, DataExpr};
use crate::pattern::PatternError;
use crate::query::Query;

/// Result of parsing an expression: either a plain query or a full data
/// expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A boolean query with no aggregation layer.
    Query(Query),
    /// A query plus aggregation, grouping or rollup.
    Data(DataExpr),
}

/// Why an expression failed to parse.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// A `:word` that is not part of the language.
    #[error("unknown word '{0}'")]
    UnknownWord(String),
    /// An operator needed more items than the stack holds.
    #[error("unexpected end of stack while reading operand {operand} of '{op}'")]
    UnexpectedEndOfStack {
        /// The operator being applied.
        op: String,
        /// Which operand was missing.
        operand: &'static str,
    },
    /// An operator popped an item of the wrong kind.
    #[error("operator '{op}' expected {expected}")]
    UnexpectedItem {
        /// The operator being applied.
        op: String,
        /// What the operator needed.
        expected: &'static str,
    },
    /// `(` without a closing `)`.
    #[error("unmatched opening parenthesis")]
    UnmatchedParen,
    /// More than one item left when the input was exhausted.
    #[error("expected a single expression, {0} items remain on the stack")]
    TrailingItems(usize),
    /// Empty input.
    #[error("empty expression")]
    EmptyExpression,
    /// A `:re`/`:reic` pattern failed to compile.
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// The compile failure.
        source: PatternError,
    },
}

#[derive(Debug)]
enum Item {
    Str(String),
    List(Vec<String>),
    Query(Query),
    Data(DataExpr),
}

/// Parse a postfix expression.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    if input.trim().is_empty() {
        return Err(ParseError::EmptyExpression);
    }
    let mut stack: Vec<Item> = Vec::new();
    let mut list: Option<Vec<String>> = None;

    for token in input.split(',') {
        match (token, &mut list) {
            ("(", None) => list = Some(Vec::new()),
            ("(", Some(_)) => {
                return Err(ParseError::UnexpectedItem {
                    op: "(".to_string(),
                    expected: "no nested lists",
                })
            }
            (")", Some(items)) => {
                stack.push(Item::List(std::mem::take(items)));
                list = None;
            }
            (")", None) => return Err(ParseError::UnmatchedParen),
            (token, Some(items)) => items.push(token.to_string()),
            (token, None) => {
                if let Some(word) = token.strip_prefix(':') {
                    apply(&mut stack, word)?;
                } else {
                    stack.push(Item::Str(token.to_string()));
                }
            }
        }
    }
    if list.is_some() {
        return Err(ParseError::UnmatchedParen);
    }
    match stack.len() {
        0 => Err(ParseError::EmptyExpression),
        1 => match stack.pop().expect("single item") {
            Item::Query(q) => Ok(Expr::Query(q)),
            Item::Data(d) => Ok(Expr::Data(d)),
            item => Err(ParseError::UnexpectedItem {
                op: "end of input".to_string(),
                expected: if matches!(item, Item::Str(_)) {
                    "a query or data expression, found a string"
                } else {
                    "a query or data expression, found a list"
                },
            }),
        },
        n => Err(ParseError::TrailingItems(n)),
    }
}

/// Parse an expression that must be a plain query.
pub fn parse_query(input: &str) -> Result<Query, ParseError> {
    match parse(input)? {
        Expr::Query(q) => Ok(q),
        Expr::Data(_) => Err(ParseError::UnexpectedItem {
            op: "end of input".to_string(),
            expected: "a query without aggregation",
        }),
    }
}

/// Parse an expression used as a subscription. A bare query is treated as
/// `:sum`, the implicit aggregation of the backend.
pub fn parse_data_expr(input: &str) -> Result<DataExpr, ParseError> {
    match parse(input)? {
        Expr::Data(d) => Ok(d),
        Expr::Query(q) => Ok(DataExpr::Aggregate(AggregationType::Sum, q)),
    }
}

fn apply(stack: &mut Vec<Item>, word: &str) -> Result<(), ParseError> {
    let op = |w: &str| format!(":{w}");
    match word {
        "true" => stack.push(Item::Query(Query::True)),
        "false" => stack.push(Item::Query(Query::False)),
        "eq" | "lt" | "le" | "gt" | "ge" => {
            let value = pop_str(stack, word, "value")?;
            let key = pop_str(stack, word, "key")?;
            let q = match word {
                "eq" => Query::equal(key, value),
                "lt" => Query::lt(key, value),
                "le" => Query::le(key, value),
                "gt" => Query::gt(key, value),
                _ => Query::ge(key, value),
            };
            stack.push(Item::Query(q));
        }
        "has" => {
            let key = pop_str(stack, word, "key")?;
            stack.push(Item::Query(Query::has(key)));
        }
        "in" => {
            let values = pop_list(stack, word)?;
            let key = pop_str(stack, word, "key")?;
            stack.push(Item::Query(Query::in_values(key, values)));
        }
        "re" | "reic" => {
            let pattern = pop_str(stack, word, "pattern")?;
            let key = pop_str(stack, word, "key")?;
            let result = if word == "re" {
                Query::re(key, &pattern)
            } else {
                Query::reic(key, &pattern)
            };
            match result {
                Ok(q) => stack.push(Item::Query(q)),
                Err(source) => return Err(ParseError::InvalidPattern { pattern, source }),
            }
        }
        "and" | "or" => {
            let b = pop_query(stack, word)?;
            let a = pop_query(stack, word)?;
            stack.push(Item::Query(if word == "and" { a.and(b) } else { a.or(b) }));
        }
        "not" => {
            let q = pop_query(stack, word)?;
            stack.push(Item::Query(q.not()));
        }
        "sum" | "min" | "max" | "count" => {
            let q = pop_query(stack, word)?;
            let af = match word {
                "sum" => AggregationType::Sum,
                "min" => AggregationType::Min,
                "max" => AggregationType::Max,
                _ => AggregationType::Count,
            };
            stack.push(Item::Data(DataExpr::Aggregate(af, q)));
        }
        "all" => {
            let q = pop_query(stack, word)?;
            stack.push(Item::Data(DataExpr::All(q)));
        }
        "by" => {
            let keys = pop_list(stack, word)?;
            let expr = pop_data_expr(stack, word)?;
            stack.push(Item::Data(DataExpr::GroupBy {
                keys,
                expr: Box::new(expr),
            }));
        }
        "rollup-keep" | "rollup-drop" => {
            let keys = pop_list(stack, word)?;
            let expr = pop_data_expr(stack, word)?;
            stack.push(Item::Data(DataExpr::Rollup {
                keep: word == "rollup-keep",
                keys,
                expr: Box::new(expr),
            }));
        }
        _ => return Err(ParseError::UnknownWord(op(word))),
    }
    Ok(())
}

fn pop(stack: &mut Vec<Item>, op: &str, operand: &'static str) -> Result<Item, ParseError> {
    stack.pop().ok_or_else(|| ParseError::UnexpectedEndOfStack {
        op: format!(":{op}"),
        operand,
    })
}

fn pop_str(stack: &mut Vec<Item>, op: &str, operand: &'static str) -> Result<String, ParseError> {
    match pop(stack, op, operand)? {
        Item::Str(s) => Ok(s),
        _ => Err(ParseError::UnexpectedItem {
            op: format!(":{op}"),
            expected: "a string operand",
        }),
    }
}

fn pop_list(stack: &mut Vec<Item>, op: &str) -> Result<Vec<String>, ParseError> {
    match pop(stack, op, "list")? {
        Item::List(l) => Ok(l),
        _ => Err(ParseError::UnexpectedItem {
            op: format!(":{op}"),
            expected: "a list operand",
        }),
    }
}

fn pop_query(stack: &mut Vec<Item>, op: &str) -> Result<Query, ParseError> {
    match pop(stack, op, "query")? {
        Item::Query(q) => Ok(q),
        _ => Err(ParseError::UnexpectedItem {
            op: format!(":{op}"),
            expected: "a query operand",
        }),
    }
}

/// A query in data-expression position takes the implicit `:sum`.
fn pop_data_expr(stack: &mut Vec<Item>, op: &str) -> Result<DataExpr, ParseError> {
    match pop(stack, op, "expression")? {
        Item::Data(d) => Ok(d),
        Item::Query(q) => Ok(DataExpr::Aggregate(AggregationType::Sum, q)),
        _ => Err(ParseError::UnexpectedItem {
            op: format!(":{op}"),
            expected: "a query or data expression operand",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;

    #[test]
    fn parses_simple_conjunction() {
        let q = parse_query("name,up,:eq,node,i-1,:eq,:and").unwrap();
        assert_eq!(
            q,
            Query::equal("name", "up").and(Query::equal("node", "i-1"))
        );
    }

    #[test]
    fn parses_in_list() {
        let q = parse_query("name,(,a,b,),:in").unwrap();
        assert_eq!(q, Query::in_values("name", vec!["a".into(), "b".into()]));
    }

    #[test]
    fn parses_data_expr_with_group_by() {
        let d = parse_data_expr("name,up,:eq,:sum,(,node,),:by").unwrap();
        assert_eq!(
            d,
            DataExpr::GroupBy {
                keys: vec!["node".to_string()],
                expr: Box::new(DataExpr::Aggregate(
                    AggregationType::Sum,
                    Query::equal("name", "up")
                )),
            }
        );
    }

    #[test]
    fn bare_query_takes_implicit_sum() {
        let d = parse_data_expr("name,up,:eq").unwrap();
        assert_eq!(
            d,
            DataExpr::Aggregate(AggregationType::Sum, Query::equal("name", "up"))
        );
    }

    #[test]
    fn group_by_over_bare_query() {
        let d = parse_data_expr("name,up,:eq,(,node,),:by").unwrap();
        assert!(matches!(d, DataExpr::GroupBy { .. }));
    }

    #[test]
    fn rollup_operators() {
        let d = parse_data_expr("name,up,:eq,:sum,(,node,),:rollup-drop").unwrap();
        assert!(matches!(d, DataExpr::Rollup { keep: false, .. }));
        let d = parse_data_expr("name,up,:eq,:sum,(,name,status,),:rollup-keep").unwrap();
        assert!(matches!(d, DataExpr::Rollup { keep: true, .. }));
    }

    #[test]
    fn rejects_unknown_word() {
        assert_eq!(
            parse("name,up,:eq,:frobnicate"),
            Err(ParseError::UnknownWord(":frobnicate".into()))
        );
    }

    #[test]
    fn rejects_stack_underflow() {
        assert!(matches!(
            parse("name,:eq"),
            Err(ParseError::UnexpectedEndOfStack { .. })
        ));
    }

    #[test]
    fn rejects_trailing_items() {
        assert_eq!(parse("a,b,c"), Err(ParseError::TrailingItems(3)));
    }

    #[test]
    fn rejects_unmatched_parens() {
        assert_eq!(parse("(,a,b"), Err(ParseError::UnmatchedParen));
        assert_eq!(parse("a,)"), Err(ParseError::UnmatchedParen));
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(parse(""), Err(ParseError::EmptyExpression));
        assert_eq!(parse("  "), Err(ParseError::EmptyExpression));
    }

    #[test]
    fn invalid_regex_reports_pattern() {
        match parse("name,[abc,:re") {
            Err(ParseError::InvalidPattern { pattern, .. }) => assert_eq!(pattern, "[abc"),
            other => panic!("expected invalid pattern, got {other:?}"),
        }
    }

    #[test]
    fn query_round_trips_through_display() {
        for expr in [
            "name,up,:eq",
            "name,up,:eq,node,i-1,:eq,:and",
            "name,(,a,b,),:in",
            "name,up,:eq,:not",
            "cluster,c1,:eq,zone,:has,:or",
        ] {
            let q = parse_query(expr).unwrap();
            let q2 = parse_query(&q.to_string()).unwrap();
            assert_eq!(q, q2, "round trip failed for {expr}");
        }
    }

    #[test]
    fn data_expr_round_trips_through_display() {
        for expr in [
            "name,up,:eq,:sum",
            "name,up,:eq,:max,(,node,),:by",
            "name,up,:eq,:all",
            "name,up,:eq,:sum,(,node,),:rollup-drop",
        ] {
            let d = parse_data_expr(expr).unwrap();
            let d2 = parse_data_expr(&d.to_string()).unwrap();
            assert_eq!(d, d2, "round trip failed for {expr}");
        }
    }
}
