//! Query model over the tags of a measurement id.

use std::collections::BTreeMap;
use std::fmt;

use atlas_metrics::Id;

use crate::pattern::{PatternError, PatternMatcher};

/// Condition on a single tag key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyQuery {
    pub(crate) key: String,
    pub(crate) matcher: KeyMatcher,
}

/// How a [`KeyQuery`] matches the tag value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyMatcher {
    /// Value equals the literal.
    Eq(String),
    /// Key is present with any value.
    Has,
    /// Value is one of the listed literals. Kept sorted and de-duplicated
    /// so equal queries have equal representations.
    In(Vec<String>),
    /// Value sorts lexically before the literal.
    Lt(String),
    /// Value sorts lexically before or equal to the literal.
    Le(String),
    /// Value sorts lexically after the literal.
    Gt(String),
    /// Value sorts lexically after or equal to the literal.
    Ge(String),
    /// Value matches the pattern.
    Re(PatternMatcher),
    /// Value matches the pattern ignoring case.
    ReIc(PatternMatcher),
}

impl KeyQuery {
    /// Tag key this condition applies to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value condition.
    pub fn matcher(&self) -> &KeyMatcher {
        &self.matcher
    }

    /// Check the condition against a present tag value.
    pub fn matches_value(&self, value: &str) -> bool {
        match &self.matcher {
            KeyMatcher::Eq(v) => value == v,
            KeyMatcher::Has => true,
            KeyMatcher::In(vs) => vs.binary_search_by(|probe| probe.as_str().cmp(value)).is_ok(),
            KeyMatcher::Lt(v) => value < v.as_str(),
            KeyMatcher::Le(v) => value <= v.as_str(),
            KeyMatcher::Gt(v) => value > v.as_str(),
            KeyMatcher::Ge(v) => value >= v.as_str(),
            KeyMatcher::Re(p) | KeyMatcher::ReIc(p) => p.matches(value),
        }
    }
}

impl fmt::Display for KeyQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            KeyMatcher::Eq(v) => write!(f, "{},{},:eq", self.key, v),
            KeyMatcher::Has => write!(f, "{},:has", self.key),
            KeyMatcher::In(vs) => {
                write!(f, "{},(", self.key)?;
                for v in vs {
                    write!(f, ",{v}")?;
                }
                write!(f, ",),:in")
            }
            KeyMatcher::Lt(v) => write!(f, "{},{},:lt", self.key, v),
            KeyMatcher::Le(v) => write!(f, "{},{},:le", self.key, v),
            KeyMatcher::Gt(v) => write!(f, "{},{},:gt", self.key, v),
            KeyMatcher::Ge(v) => write!(f, "{},{},:ge", self.key, v),
            KeyMatcher::Re(p) => write!(f, "{},{},:re", self.key, p),
            KeyMatcher::ReIc(p) => write!(f, "{},{},:reic", self.key, p),
        }
    }
}

/// Boolean expression over tag conditions.
///
/// The combinators simplify on construction so that equal queries have a
/// canonical structure: constants fold away, double negation cancels, and
/// an or of equality checks on the same key becomes an in-clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    /// Matches every id.
    True,
    /// Matches nothing.
    False,
    /// A single tag condition.
    KeyQuery(KeyQuery),
    /// Both sides must match.
    And(Box<Query>, Box<Query>),
    /// Either side must match.
    Or(Box<Query>, Box<Query>),
    /// The inner query must not match.
    Not(Box<Query>),
}

impl Query {
    /// `key,value,:eq`
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Query {
        Query::KeyQuery(KeyQuery {
            key: key.into(),
            matcher: KeyMatcher::Eq(value.into()),
        })
    }

    /// `key,:has`
    pub fn has(key: impl Into<String>) -> Query {
        Query::KeyQuery(KeyQuery {
            key: key.into(),
            matcher: KeyMatcher::Has,
        })
    }

    /// `key,(,v1,v2,),:in`
    pub fn in_values(key: impl Into<String>, values: Vec<String>) -> Query {
        let mut values = values;
        values.sort_unstable();
        values.dedup();
        match values.len() {
            0 => Query::False,
            1 => Query::equal(key, values.pop().expect("single value")),
            _ => Query::KeyQuery(KeyQuery {
                key: key.into(),
                matcher: KeyMatcher::In(values),
            }),
        }
    }

    /// `key,value,:lt`
    pub fn lt(key: impl Into<String>, value: impl Into<String>) -> Query {
        Query::KeyQuery(KeyQuery {
            key: key.into(),
            matcher: KeyMatcher::Lt(value.into()),
        })
    }

    /// `key,value,:le`
    pub fn le(key: impl Into<String>, value: impl Into<String>) -> Query {
        Query::KeyQuery(KeyQuery {
            key: key.into(),
            matcher: KeyMatcher::Le(value.into()),
        })
    }

    /// `key,value,:gt`
    pub fn gt(key: impl Into<String>, value: impl Into<String>) -> Query {
        Query::KeyQuery(KeyQuery {
            key: key.into(),
            matcher: KeyMatcher::Gt(value.into()),
        })
    }

    /// `key,value,:ge`
    pub fn ge(key: impl Into<String>, value: impl Into<String>) -> Query {
        Query::KeyQuery(KeyQuery {
            key: key.into(),
            matcher: KeyMatcher::Ge(value.into()),
        })
    }

    /// `key,pattern,:re`. A pattern that matches every value is the same
    /// condition as `:has`.
    pub fn re(key: impl Into<String>, pattern: &str) -> Result<Query, PatternError> {
        let matcher = PatternMatcher::compile(pattern)?;
        Ok(if matcher.always_matches() {
            Query::has(key)
        } else {
            Query::KeyQuery(KeyQuery {
                key: key.into(),
                matcher: KeyMatcher::Re(matcher),
            })
        })
    }

    /// `key,pattern,:reic`
    pub fn reic(key: impl Into<String>, pattern: &str) -> Result<Query, PatternError> {
        let matcher = PatternMatcher::compile_ignore_case(pattern)?;
        Ok(if matcher.always_matches() {
            Query::has(key)
        } else {
            Query::KeyQuery(KeyQuery {
                key: key.into(),
                matcher: KeyMatcher::ReIc(matcher),
            })
        })
    }

    /// Conjunction with constant folding.
    pub fn and(self, other: Query) -> Query {
        match (self, other) {
            (Query::True, q) | (q, Query::True) => q,
            (Query::False, _) | (_, Query::False) => Query::False,
            (a, b) => Query::And(Box::new(a), Box::new(b)),
        }
    }

    /// Disjunction with constant folding. Equality checks on the same key
    /// merge into an in-clause.
    pub fn or(self, other: Query) -> Query {
        match (self, other) {
            (Query::True, _) | (_, Query::True) => Query::True,
            (Query::False, q) | (q, Query::False) => q,
            (Query::KeyQuery(a), Query::KeyQuery(b)) if a.key == b.key => {
                match merge_values(&a.matcher, &b.matcher) {
                    Some(values) => Query::in_values(a.key, values),
                    None => Query::Or(
                        Box::new(Query::KeyQuery(a)),
                        Box::new(Query::KeyQuery(b)),
                    ),
                }
            }
            (a, b) => Query::Or(Box::new(a), Box::new(b)),
        }
    }

    /// Negation with constant folding and double-negation elimination.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Query {
        match self {
            Query::True => Query::False,
            Query::False => Query::True,
            Query::Not(inner) => *inner,
            q => Query::Not(Box::new(q)),
        }
    }

    /// Evaluate against a meter id. The id name is visible as the `name`
    /// pseudo-tag.
    pub fn matches(&self, id: &Id) -> bool {
        self.matches_fn(&|k| id.tag_value(k))
    }

    /// Evaluate against a plain tag map.
    pub fn matches_tags(&self, tags: &BTreeMap<String, String>) -> bool {
        self.matches_fn(&|k| tags.get(k).map(String::as_str))
    }

    fn matches_fn<'v>(&self, get: &dyn Fn(&str) -> Option<&'v str>) -> bool {
        match self {
            Query::True => true,
            Query::False => false,
            Query::KeyQuery(kq) => get(&kq.key).is_some_and(|v| kq.matches_value(v)),
            Query::And(a, b) => a.matches_fn(get) && b.matches_fn(get),
            Query::Or(a, b) => a.matches_fn(get) || b.matches_fn(get),
            Query::Not(q) => !q.matches_fn(get),
        }
    }

    /// Disjunctive normal form: the list of conjunctions whose union is
    /// this query. `False` yields an empty list; `True` yields one `True`
    /// clause.
    pub fn dnf_list(&self) -> Vec<Query> {
        match self {
            Query::True => vec![Query::True],
            Query::False => Vec::new(),
            Query::KeyQuery(_) => vec![self.clone()],
            Query::And(a, b) => {
                let left = a.dnf_list();
                let right = b.dnf_list();
                let mut out = Vec::with_capacity(left.len() * right.len());
                for ca in &left {
                    for cb in &right {
                        out.push(ca.clone().and(cb.clone()));
                    }
                }
                out
            }
            Query::Or(a, b) => {
                let mut out = a.dnf_list();
                out.extend(b.dnf_list());
                out
            }
            Query::Not(inner) => match inner.as_ref() {
                Query::KeyQuery(_) => vec![self.clone()],
                // De Morgan, recursing until negations sit on key queries.
                Query::And(a, b) => a
                    .clone()
                    .not()
                    .or(b.clone().not())
                    .dnf_list(),
                Query::Or(a, b) => a
                    .clone()
                    .not()
                    .and(b.clone().not())
                    .dnf_list(),
                Query::Not(q) => q.dnf_list(),
                Query::True => Vec::new(),
                Query::False => vec![Query::True],
            },
        }
    }

    /// The `key=value` constraints required by this query, used to label
    /// aggregated output. Only unconditional equality terms qualify.
    pub fn exact_tags(&self) -> BTreeMap<String, String> {
        fn walk(q: &Query, out: &mut BTreeMap<String, String>) {
            match q {
                Query::And(a, b) => {
                    walk(a, out);
                    walk(b, out);
                }
                Query::KeyQuery(KeyQuery {
                    key,
                    matcher: KeyMatcher::Eq(v),
                }) => {
                    out.insert(key.clone(), v.clone());
                }
                _ => {}
            }
        }
        let mut out = BTreeMap::new();
        walk(self, &mut out);
        out
    }
}

fn merge_values(a: &KeyMatcher, b: &KeyMatcher) -> Option<Vec<String>> {
    let mut out = Vec::new();
    for m in [a, b] {
        match m {
            KeyMatcher::Eq(v) => out.push(v.clone()),
            KeyMatcher::In(vs) => out.extend(vs.iter().cloned()),
            _ => return None,
        }
    }
    Some(out)
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::True => f.write_str(":true"),
            Query::False => f.write_str(":false"),
            Query::KeyQuery(kq) => kq.fmt(f),
            Query::And(a, b) => write!(f, "{a},{b},:and"),
            Query::Or(a, b) => write!(f, "{a},{b},:or"),
            Query::Not(q) => write!(f, "{q},:not"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str, tags: &[(&str, &str)]) -> Id {
        let mut id = Id::new(name.to_string());
        for (k, v) in tags {
            id = id.with_tag(k.to_string(), v.to_string());
        }
        id
    }

    #[test]
    fn constant_folding() {
        let q = Query::equal("name", "a");
        assert_eq!(Query::True.and(q.clone()), q);
        assert_eq!(q.clone().and(Query::True), q);
        assert_eq!(Query::False.and(q.clone()), Query::False);
        assert_eq!(q.clone().or(Query::False), q);
        assert_eq!(Query::True.or(q.clone()), Query::True);
        assert_eq!(Query::True.not(), Query::False);
        assert_eq!(Query::False.not(), Query::True);
        assert_eq!(q.clone().not().not(), q);
    }

    #[test]
    fn same_key_or_becomes_in() {
        let q = Query::equal("name", "a").or(Query::equal("name", "b"));
        assert_eq!(
            q,
            Query::in_values("name", vec!["a".into(), "b".into()])
        );
        // and the merge keeps values canonical
        let q2 = Query::equal("name", "b").or(Query::equal("name", "a"));
        assert_eq!(q, q2);
    }

    #[test]
    fn in_with_single_value_is_eq() {
        assert_eq!(
            Query::in_values("k", vec!["v".into(), "v".into()]),
            Query::equal("k", "v")
        );
        assert_eq!(Query::in_values("k", vec![]), Query::False);
    }

    #[test]
    fn always_matching_regex_is_has() {
        assert_eq!(Query::re("k", ".*").unwrap(), Query::has("k"));
        assert_ne!(Query::re("k", "a.*").unwrap(), Query::has("k"));
    }

    #[test]
    fn matches_id_tags() {
        let q = Query::equal("name", "a").and(Query::equal("key", "b"));
        assert!(q.matches(&id("a", &[("key", "b")])));
        assert!(!q.matches(&id("a", &[("foo", "bar")])));
        assert!(!q.matches(&id("b", &[("key", "b")])));
    }

    #[test]
    fn not_matches_missing_keys() {
        let q = Query::has("key").not();
        assert!(q.matches(&id("a", &[])));
        assert!(!q.matches(&id("a", &[("key", "x")])));
    }

    #[test]
    fn ordering_comparisons_are_lexical() {
        let q = Query::gt("v", "m");
        assert!(q.matches(&id("a", &[("v", "z")])));
        assert!(!q.matches(&id("a", &[("v", "a")])));
        assert!(!q.matches(&id("a", &[("v", "m")])));
        assert!(Query::ge("v", "m").matches(&id("a", &[("v", "m")])));
    }

    #[test]
    fn regex_match_on_tag_value() {
        let q = Query::re("name", "^server\\.").unwrap();
        assert!(q.matches(&id("server.requests", &[])));
        assert!(!q.matches(&id("client.requests", &[])));
        let qi = Query::reic("mode", "^Fast$").unwrap();
        assert!(qi.matches(&id("a", &[("mode", "fast")])));
    }

    #[test]
    fn dnf_of_or_and() {
        // (name=a or name=b) and key=c has two clauses
        let q = Query::in_values("name", vec!["a".into(), "b".into()])
            .and(Query::equal("key", "c"));
        let clauses = q.dnf_list();
        assert_eq!(clauses.len(), 1); // in-query stays one clause
        let q = Query::equal("name", "a")
            .or(Query::equal("other", "b"))
            .and(Query::equal("key", "c"));
        let clauses = q.dnf_list();
        assert_eq!(clauses.len(), 2);
        for clause in &clauses {
            assert!(matches!(clause, Query::And(_, _)));
        }
    }

    #[test]
    fn dnf_pushes_negation_inward() {
        let q = Query::equal("a", "1").and(Query::equal("b", "2")).not();
        let clauses = q.dnf_list();
        assert_eq!(clauses.len(), 2);
        assert!(clauses
            .iter()
            .all(|c| matches!(c, Query::Not(inner) if matches!(inner.as_ref(), Query::KeyQuery(_)))));
    }

    #[test]
    fn display_is_postfix() {
        let q = Query::equal("name", "a").and(Query::equal("key", "b")).not();
        assert_eq!(q.to_string(), "name,a,:eq,key,b,:eq,:and,:not");
        let q = Query::in_values("name", vec!["a".into(), "b".into()]);
        assert_eq!(q.to_string(), "name,(,a,b,),:in");
    }

    #[test]
    fn exact_tags_from_conjunction() {
        let q = Query::equal("name", "a")
            .and(Query::equal("key", "b"))
            .and(Query::has("other"));
        let tags = q.exact_tags();
        assert_eq!(tags.get("name").map(String::as_str), Some("a"));
        assert_eq!(tags.get("key").map(String::as_str), Some("b"));
        assert!(!tags.contains_key("other"));
    }
}
