//! Rewrites applied to a parsed matcher tree.
//!
//! Every rewrite preserves the accepted language under the find semantics
//! used by queries: dropping a trailing `.*`, for example, changes the end
//! position of a match but never whether one exists.

use super::matcher::Matcher;

/// Optimize until a fixpoint is reached.
pub(crate) fn optimize(m: Matcher) -> Matcher {
    let mut current = m;
    loop {
        let next = rewrite(current.clone());
        if next == current {
            return next;
        }
        current = next;
    }
}

fn rewrite(m: Matcher) -> Matcher {
    match m {
        Matcher::Seq(items) => rewrite_seq(items),
        Matcher::Or(branches) => rewrite_or(branches),
        Matcher::ZeroOrMore(inner) => match rewrite(*inner) {
            // Zero repetitions always match, so a dead or empty body
            // reduces to the empty match.
            Matcher::False | Matcher::True => Matcher::True,
            inner => Matcher::ZeroOrMore(Box::new(inner)),
        },
        Matcher::ZeroOrOne(inner) => match rewrite(*inner) {
            Matcher::False | Matcher::True => Matcher::True,
            inner => Matcher::ZeroOrOne(Box::new(inner)),
        },
        Matcher::Repeat { min, max, matcher } => match rewrite(*matcher) {
            Matcher::True => Matcher::True,
            Matcher::False => {
                if min == 0 {
                    Matcher::True
                } else {
                    Matcher::False
                }
            }
            matcher => Matcher::Repeat {
                min,
                max,
                matcher: Box::new(matcher),
            },
        },
        Matcher::Class(class) => {
            if class.is_empty() {
                Matcher::False
            } else if let Some(c) = class.as_single_char() {
                Matcher::CharSeq(c.to_string())
            } else {
                Matcher::Class(class)
            }
        }
        Matcher::CharSeq(s) if s.is_empty() => Matcher::True,
        Matcher::NegLookahead(inner) => match rewrite(*inner) {
            Matcher::True => Matcher::False,
            Matcher::False => Matcher::True,
            inner => Matcher::NegLookahead(Box::new(inner)),
        },
        Matcher::PosLookahead(inner) => match rewrite(*inner) {
            Matcher::True => Matcher::True,
            Matcher::False => Matcher::False,
            inner => Matcher::PosLookahead(Box::new(inner)),
        },
        other => other,
    }
}

fn is_any_star(m: &Matcher) -> bool {
    matches!(m, Matcher::ZeroOrMore(inner) if **inner == Matcher::Any)
}

fn rewrite_seq(items: Vec<Matcher>) -> Matcher {
    // Flatten nested sequences and drop empty matches.
    let mut flat = Vec::with_capacity(items.len());
    for item in items {
        match rewrite(item) {
            Matcher::True => {}
            Matcher::False => return Matcher::False,
            Matcher::Seq(inner) => flat.extend(inner),
            item => flat.push(item),
        }
    }

    enum Action {
        Push,
        MergeLiteral,
        ReplaceWithStartsWith,
        ReplaceWithIndexOf,
        DropItem,
        DropBoth,
    }

    let mut out: Vec<Matcher> = Vec::with_capacity(flat.len());
    for item in flat {
        let action = match (out.last(), &item) {
            (None, _) => Action::Push,
            // Adjacent literals collapse into one run.
            (Some(Matcher::CharSeq(_)), Matcher::CharSeq(_))
            | (Some(Matcher::StartsWith(_)), Matcher::CharSeq(_))
            | (Some(Matcher::IndexOf(_)), Matcher::CharSeq(_)) => Action::MergeLiteral,
            // An anchor directly followed by a literal is a prefix check.
            (Some(Matcher::Start), Matcher::CharSeq(_)) => Action::ReplaceWithStartsWith,
            // A leading `^.*` constrains nothing under find semantics. A
            // start anchor later in the sequence is left alone.
            (Some(Matcher::Start), i) if is_any_star(i) && out.len() == 1 => Action::DropBoth,
            // `.*literal` scans for the literal.
            (Some(l), Matcher::CharSeq(_)) if is_any_star(l) => Action::ReplaceWithIndexOf,
            // `.*.*` is one scan.
            (Some(l), i) if is_any_star(l) && is_any_star(i) => Action::DropItem,
            // `.*$` can always run to the end of input.
            (Some(l), Matcher::End) if is_any_star(l) => Action::DropBoth,
            _ => Action::Push,
        };
        match action {
            Action::Push => out.push(item),
            Action::MergeLiteral => {
                let Matcher::CharSeq(b) = item else {
                    unreachable!("merge action only chosen for literals")
                };
                match out.last_mut() {
                    Some(Matcher::CharSeq(a))
                    | Some(Matcher::StartsWith(a))
                    | Some(Matcher::IndexOf(a)) => a.push_str(&b),
                    _ => unreachable!("merge action requires a literal tail"),
                }
            }
            Action::ReplaceWithStartsWith => {
                let Matcher::CharSeq(b) = item else {
                    unreachable!("starts-with action only chosen for literals")
                };
                *out.last_mut().expect("non-empty") = Matcher::StartsWith(b);
            }
            Action::ReplaceWithIndexOf => {
                let Matcher::CharSeq(b) = item else {
                    unreachable!("index-of action only chosen for literals")
                };
                *out.last_mut().expect("non-empty") = Matcher::IndexOf(b);
            }
            Action::DropItem => {}
            Action::DropBoth => {
                out.pop();
            }
        }
    }

    // A trailing `.*` never changes whether a match exists.
    while matches!(out.last(), Some(last) if is_any_star(last)) {
        out.pop();
    }

    match out.len() {
        0 => Matcher::True,
        1 => out.pop().expect("single item"),
        _ => Matcher::Seq(out),
    }
}

fn rewrite_or(branches: Vec<Matcher>) -> Matcher {
    // A True branch stays: it offers the empty match but other branches
    // may still consume input for the continuation.
    let mut out: Vec<Matcher> = Vec::with_capacity(branches.len());
    for branch in branches {
        match rewrite(branch) {
            Matcher::False => {}
            Matcher::Or(inner) => {
                for b in inner {
                    if !out.contains(&b) {
                        out.push(b);
                    }
                }
            }
            b => {
                if !out.contains(&b) {
                    out.push(b);
                }
            }
        }
    }
    match out.len() {
        0 => Matcher::False,
        1 => out.pop().expect("single branch"),
        _ => extract_common_prefix(out),
    }
}

/// `abc|abd` becomes `ab(c|d)` so the shared part is checked once.
fn extract_common_prefix(branches: Vec<Matcher>) -> Matcher {
    let literals: Option<Vec<&str>> = branches
        .iter()
        .map(|b| match b {
            Matcher::CharSeq(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    let Some(literals) = literals else {
        return Matcher::Or(branches);
    };
    let first = literals[0];
    let mut common = first.len();
    for other in &literals[1..] {
        common = common_prefix_len(first, other).min(common);
    }
    if common == 0 {
        return Matcher::Or(branches);
    }
    let prefix = first[..common].to_string();
    let suffixes: Vec<Matcher> = literals
        .iter()
        .map(|s| {
            let rest = &s[common..];
            if rest.is_empty() {
                Matcher::True
            } else {
                Matcher::CharSeq(rest.to_string())
            }
        })
        .collect();
    Matcher::Seq(vec![Matcher::CharSeq(prefix), rewrite_or(suffixes)])
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.len_utf8())
        .sum()
}
