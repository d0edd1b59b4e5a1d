//! Index for matching one id against many queries at once.
//!
//! Queries are normalized to disjunctive normal form and each conjunction
//! is threaded into a tree keyed on tag keys: equality terms become hash
//! lookups, everything else (has, in, regex, ordering, negations of those)
//! is kept as a residual check list per node. Matching an id walks the
//! tree guided by the id's tag values and collects every fully satisfied
//! query, so the cost scales with the matching subtrees rather than the
//! total number of subscriptions.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use atlas_metrics::{atlas_log, Id};

use crate::prefix_tree::PrefixTree;
use crate::query::{KeyMatcher, KeyQuery, Query};

// Bound on the per-node memo table; full, it is cleared rather than grown.
const MAX_CACHE_ENTRIES: usize = 10_000;

/// A residual, non-equality check on a single key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Term {
    Kq(KeyQuery),
    NotKq(KeyQuery),
}

impl Term {
    fn key(&self) -> &str {
        match self {
            Term::Kq(kq) | Term::NotKq(kq) => kq.key(),
        }
    }

    fn matches_value(&self, value: &str) -> bool {
        match self {
            Term::Kq(kq) => kq.matches_value(value),
            Term::NotKq(kq) => !kq.matches_value(value),
        }
    }

    /// Literal prefix usable to pre-filter candidate values, available for
    /// start-anchored case-sensitive regex checks.
    fn prefix(&self) -> Option<String> {
        match self {
            Term::Kq(kq) => match kq.matcher() {
                KeyMatcher::Re(p) => p.prefix().map(str::to_owned),
                _ => None,
            },
            Term::NotKq(_) => None,
        }
    }
}

/// One term of a normalized conjunction.
#[derive(Debug, Clone)]
enum ClauseTerm {
    Eq { key: String, value: String },
    Other(Term),
}

impl ClauseTerm {
    fn key(&self) -> &str {
        match self {
            ClauseTerm::Eq { key, .. } => key,
            ClauseTerm::Other(t) => t.key(),
        }
    }
}

struct OtherCheck<V> {
    term: Term,
    prefix: Option<String>,
    node: Node<V>,
}

struct Node<V> {
    key: String,
    equal_checks: HashMap<String, Node<V>>,
    other_checks: Vec<OtherCheck<V>>,
    other_keys: HashMap<String, Node<V>>,
    matches: Vec<V>,
    /// Indices into `other_checks` whose term has a literal prefix; probed
    /// through the prefix tree instead of being tested one by one.
    prefixed: PrefixTree<usize>,
    /// Memo of which residual checks matched a given value. A key query
    /// shared by thousands of conjunctions is evaluated once per value.
    cache: RwLock<HashMap<String, Vec<usize>>>,
}

impl<V> Node<V> {
    fn new(key: String) -> Self {
        Node {
            key,
            equal_checks: HashMap::new(),
            other_checks: Vec::new(),
            other_keys: HashMap::new(),
            matches: Vec::new(),
            prefixed: PrefixTree::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn is_empty(&self) -> bool {
        self.matches.is_empty()
            && self.equal_checks.is_empty()
            && self.other_checks.is_empty()
            && self.other_keys.is_empty()
    }

    fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }
}

/// Index from queries to caller-supplied values.
///
/// Reads are lock-free apart from the per-node memo table; mutation takes
/// `&mut self`, so the intended concurrent usage is to build a new index
/// and swap it in behind a single shared reference.
pub struct QueryIndex<V> {
    root: Node<V>,
}

impl<V> QueryIndex<V> {
    /// An index matching nothing.
    pub fn new() -> Self {
        QueryIndex {
            root: Node::new("name".to_string()),
        }
    }

    /// True when no queries are registered.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl<V: Clone> QueryIndex<V> {
    /// Register `value` under every DNF clause of `query`. Matching an id
    /// that satisfies the query will yield the value once per satisfied
    /// clause.
    pub fn add(&mut self, query: &Query, value: V) {
        for clause in query.dnf_list() {
            match clause_terms(&clause) {
                Some(mut terms) => {
                    sort_terms(&mut terms);
                    insert(&mut self.root, &terms, value.clone());
                }
                None => {
                    atlas_log!(warn,
                        name: "QueryIndex.add",
                        query = clause.to_string(),
                        message = "clause is not a flat conjunction, skipped"
                    );
                }
            }
        }
    }

    /// Values of every registered query that matches `id`. Never fails; a
    /// malformed check simply does not match.
    pub fn find_matches(&self, id: &Id) -> Vec<V> {
        let mut out = Vec::new();
        find(&self.root, id, &mut out);
        out
    }
}

impl<V: PartialEq> QueryIndex<V> {
    /// Remove one occurrence of `value` per DNF clause of `query`.
    /// Returns true if anything was removed.
    pub fn remove(&mut self, query: &Query, value: &V) -> bool {
        let mut removed = false;
        for clause in query.dnf_list() {
            if let Some(mut terms) = clause_terms(&clause) {
                sort_terms(&mut terms);
                removed |= remove_terms(&mut self.root, &terms, value);
            }
        }
        removed
    }
}

impl<V> Default for QueryIndex<V> {
    fn default() -> Self {
        QueryIndex::new()
    }
}

impl<V> fmt::Debug for QueryIndex<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryIndex")
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// Flatten a DNF clause into terms. Returns `None` when the clause is not
/// the flat conjunction the normalization should have produced.
fn clause_terms(clause: &Query) -> Option<Vec<ClauseTerm>> {
    fn walk(q: &Query, out: &mut Vec<ClauseTerm>) -> bool {
        match q {
            Query::True => true,
            Query::And(a, b) => walk(a, out) && walk(b, out),
            Query::KeyQuery(KeyQuery {
                key,
                matcher: KeyMatcher::Eq(v),
            }) => {
                out.push(ClauseTerm::Eq {
                    key: key.clone(),
                    value: v.clone(),
                });
                true
            }
            Query::KeyQuery(kq) => {
                out.push(ClauseTerm::Other(Term::Kq(kq.clone())));
                true
            }
            Query::Not(inner) => match inner.as_ref() {
                Query::KeyQuery(kq) => {
                    out.push(ClauseTerm::Other(Term::NotKq(kq.clone())));
                    true
                }
                _ => false,
            },
            Query::False | Query::Or(_, _) => false,
        }
    }
    let mut out = Vec::new();
    walk(clause, &mut out).then_some(out)
}

/// Name first, then equality keys in lexicographic order, then the rest.
fn sort_terms(terms: &mut [ClauseTerm]) {
    terms.sort_by(|a, b| {
        let rank = |t: &ClauseTerm| {
            let name = if t.key() == "name" { 0u8 } else { 1 };
            let eq = match t {
                ClauseTerm::Eq { .. } => 0u8,
                ClauseTerm::Other(_) => 1,
            };
            (name, eq)
        };
        rank(a)
            .cmp(&rank(b))
            .then_with(|| a.key().cmp(b.key()))
    });
}

fn next_key(rest: &[ClauseTerm]) -> String {
    rest.first().map(|t| t.key().to_string()).unwrap_or_default()
}

fn insert<V>(node: &mut Node<V>, terms: &[ClauseTerm], value: V) {
    let Some((term, rest)) = terms.split_first() else {
        node.matches.push(value);
        return;
    };
    if node.key == term.key() {
        match term {
            ClauseTerm::Eq { value: v, .. } => {
                let child = node
                    .equal_checks
                    .entry(v.clone())
                    .or_insert_with(|| Node::new(next_key(rest)));
                insert(child, rest, value);
            }
            ClauseTerm::Other(t) => {
                let pos = node.other_checks.iter().position(|c| c.term == *t);
                let pos = match pos {
                    Some(pos) => pos,
                    None => {
                        let prefix = t.prefix();
                        node.other_checks.push(OtherCheck {
                            term: t.clone(),
                            prefix: prefix.clone(),
                            node: Node::new(next_key(rest)),
                        });
                        let pos = node.other_checks.len() - 1;
                        if let Some(prefix) = prefix {
                            node.prefixed.put(&prefix, pos);
                        }
                        node.clear_cache();
                        pos
                    }
                };
                insert(&mut node.other_checks[pos].node, rest, value);
            }
        }
    } else {
        let child = node
            .other_keys
            .entry(term.key().to_string())
            .or_insert_with(|| Node::new(term.key().to_string()));
        insert(child, terms, value);
    }
}

fn find<V: Clone>(node: &Node<V>, id: &Id, out: &mut Vec<V>) {
    out.extend(node.matches.iter().cloned());
    if !node.key.is_empty() {
        if let Some(value) = id.tag_value(&node.key) {
            if let Some(child) = node.equal_checks.get(value) {
                find(child, id, out);
            }
            if !node.other_checks.is_empty() {
                for i in matching_checks(node, value) {
                    find(&node.other_checks[i].node, id, out);
                }
            }
        }
    }
    for child in node.other_keys.values() {
        find(child, id, out);
    }
}

/// Indices of the residual checks matching `value`, memoized per value.
fn matching_checks<V>(node: &Node<V>, value: &str) -> Vec<usize> {
    if let Ok(cache) = node.cache.read() {
        if let Some(hit) = cache.get(value) {
            return hit.clone();
        }
    }
    let mut out = Vec::new();
    for (i, check) in node.other_checks.iter().enumerate() {
        if check.prefix.is_none() && check.term.matches_value(value) {
            out.push(i);
        }
    }
    node.prefixed.for_each_match(value, |&i| {
        if node.other_checks[i].term.matches_value(value) {
            out.push(i);
        }
    });
    out.sort_unstable();
    if let Ok(mut cache) = node.cache.write() {
        if cache.len() >= MAX_CACHE_ENTRIES {
            cache.clear();
        }
        cache.insert(value.to_string(), out.clone());
    }
    out
}

fn remove_terms<V: PartialEq>(node: &mut Node<V>, terms: &[ClauseTerm], value: &V) -> bool {
    let Some((term, rest)) = terms.split_first() else {
        if let Some(i) = node.matches.iter().position(|v| v == value) {
            node.matches.remove(i);
            return true;
        }
        return false;
    };
    if node.key == term.key() {
        match term {
            ClauseTerm::Eq { value: v, .. } => {
                let Some(child) = node.equal_checks.get_mut(v) else {
                    return false;
                };
                let removed = remove_terms(child, rest, value);
                if removed && child.is_empty() {
                    node.equal_checks.remove(v);
                }
                removed
            }
            ClauseTerm::Other(t) => {
                let Some(pos) = node.other_checks.iter().position(|c| c.term == *t) else {
                    return false;
                };
                let removed = remove_terms(&mut node.other_checks[pos].node, rest, value);
                if removed && node.other_checks[pos].node.is_empty() {
                    node.other_checks.remove(pos);
                    // Indices into the check list shifted; rebuild the
                    // prefix lookup.
                    node.prefixed = PrefixTree::new();
                    for (i, c) in node.other_checks.iter().enumerate() {
                        if let Some(p) = &c.prefix {
                            node.prefixed.put(p, i);
                        }
                    }
                }
                if removed {
                    node.clear_cache();
                }
                removed
            }
        }
    } else {
        let Some(child) = node.other_keys.get_mut(term.key()) else {
            return false;
        };
        let removed = remove_terms(child, terms, value);
        if removed && child.is_empty() {
            node.other_keys.remove(term.key());
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_query;

    fn id(name: &str, tags: &[(&str, &str)]) -> Id {
        let mut id = Id::new(name.to_string());
        for (k, v) in tags {
            id = id.with_tag(k.to_string(), v.to_string());
        }
        id
    }

    fn index_of(exprs: &[(&str, i32)]) -> QueryIndex<i32> {
        let mut index = QueryIndex::new();
        for (expr, v) in exprs {
            index.add(&parse_query(expr).unwrap(), *v);
        }
        index
    }

    #[test]
    fn match_iff_query_matches() {
        let q = parse_query("name,a,:eq,key,b,:eq,:and").unwrap();
        let mut index = QueryIndex::new();
        index.add(&q, 1);
        let yes = id("a", &[("key", "b")]);
        let no = id("a", &[("foo", "bar")]);
        assert!(q.matches(&yes));
        assert_eq!(index.find_matches(&yes), vec![1]);
        assert!(!q.matches(&no));
        assert!(index.find_matches(&no).is_empty());
    }

    #[test]
    fn dnf_clauses_share_one_value() {
        // (name=a or name=b) and key=c
        let q = parse_query("name,a,:eq,name,b,:eq,:or,key,c,:eq,:and").unwrap();
        let mut index = QueryIndex::new();
        index.add(&q, 7);
        assert_eq!(index.find_matches(&id("a", &[("key", "c")])), vec![7]);
        assert_eq!(index.find_matches(&id("b", &[("key", "c")])), vec![7]);
        assert!(index.find_matches(&id("c", &[("key", "c")])).is_empty());
        assert!(index.find_matches(&id("a", &[])).is_empty());

        assert!(index.remove(&q, &7));
        assert!(index.is_empty());
        assert!(!index.remove(&q, &7));
    }

    #[test]
    fn true_query_matches_everything() {
        let mut index = QueryIndex::new();
        index.add(&Query::True, 1);
        assert_eq!(index.find_matches(&id("anything", &[])), vec![1]);
    }

    #[test]
    fn false_query_registers_nothing() {
        let mut index = QueryIndex::new();
        index.add(&Query::False, 1);
        assert!(index.is_empty());
    }

    #[test]
    fn residual_checks_on_name() {
        let index = index_of(&[
            ("name,server_,:re", 1),
            ("name,client_,:re", 2),
            ("name,:has", 3),
        ]);
        let m = index.find_matches(&id("server_requests", &[]));
        assert!(m.contains(&1) && m.contains(&3) && !m.contains(&2));
    }

    #[test]
    fn prefixed_regex_checks_share_a_prefix_tree() {
        let index = index_of(&[
            ("name,^server\\.,:re", 1),
            ("name,^server\\.req,:re", 2),
            ("name,^client\\.,:re", 3),
        ]);
        let m = index.find_matches(&id("server.requests", &[]));
        assert_eq!(m.len(), 2);
        assert!(m.contains(&1) && m.contains(&2));
        // memoized second lookup returns the same result
        let m2 = index.find_matches(&id("server.requests", &[]));
        assert_eq!(m.len(), m2.len());
    }

    #[test]
    fn in_query_branches() {
        let index = index_of(&[("name,(,a,b,),:in,key,c,:eq,:and", 1)]);
        assert_eq!(index.find_matches(&id("a", &[("key", "c")])), vec![1]);
        assert_eq!(index.find_matches(&id("b", &[("key", "c")])), vec![1]);
        assert!(index.find_matches(&id("x", &[("key", "c")])).is_empty());
    }

    #[test]
    fn not_of_key_query() {
        let index = index_of(&[("name,a,:eq,status,5xx,:eq,:not,:and", 1)]);
        assert_eq!(index.find_matches(&id("a", &[("status", "2xx")])), vec![1]);
        assert!(index
            .find_matches(&id("a", &[("status", "5xx")]))
            .is_empty());
    }

    #[test]
    fn multiple_values_under_same_query() {
        let q = parse_query("name,a,:eq").unwrap();
        let mut index = QueryIndex::new();
        index.add(&q, 1);
        index.add(&q, 2);
        let mut m = index.find_matches(&id("a", &[]));
        m.sort_unstable();
        assert_eq!(m, vec![1, 2]);
        assert!(index.remove(&q, &1));
        assert_eq!(index.find_matches(&id("a", &[])), vec![2]);
    }

    #[test]
    fn keys_beyond_name_use_other_key_subtrees() {
        let index = index_of(&[("zone,us-east-1a,:eq", 1), ("cluster,web,:eq", 2)]);
        let m = index.find_matches(&id("any", &[("zone", "us-east-1a"), ("cluster", "web")]));
        assert_eq!(m.len(), 2);
        let m = index.find_matches(&id("any", &[("cluster", "web")]));
        assert_eq!(m, vec![2]);
    }
}
