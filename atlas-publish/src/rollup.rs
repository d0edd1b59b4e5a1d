//! Tag rewriting applied to measurements before publishing.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use atlas_metrics::{Id, Measurement, Tag};
use atlas_query::{DataExpr, Query};

/// What happens to the tags of a measurement matched by a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RollupAction {
    /// Keep only the listed keys (the name always survives).
    KeepKeys(Vec<String>),
    /// Drop the listed keys.
    DropKeys(Vec<String>),
    /// Leave the tags untouched.
    Preserve,
}

/// A rollup rule: the first rule whose query matches a measurement id
/// decides the action.
#[derive(Debug, Clone)]
pub struct RollupRule {
    /// Which measurements the rule applies to.
    pub query: Query,
    /// The rewrite to apply.
    pub action: RollupAction,
}

impl RollupRule {
    /// Build a rule from a parsed `:rollup-keep`/`:rollup-drop`
    /// expression. Other expressions produce a preserve rule for their
    /// query.
    pub fn from_data_expr(expr: &DataExpr) -> RollupRule {
        match expr {
            DataExpr::Rollup { keep, keys, expr } => RollupRule {
                query: expr.query().clone(),
                action: if *keep {
                    RollupAction::KeepKeys(keys.clone())
                } else {
                    RollupAction::DropKeys(keys.clone())
                },
            },
            other => RollupRule {
                query: other.query().clone(),
                action: RollupAction::Preserve,
            },
        }
    }
}

/// Ordered list of rollup rules plus common-tag injection.
#[derive(Debug, Clone, Default)]
pub struct RollupPolicy {
    rules: Vec<RollupRule>,
}

impl RollupPolicy {
    /// Policy with no rules: tags pass through unchanged.
    pub fn new(rules: Vec<RollupRule>) -> Self {
        RollupPolicy { rules }
    }

    /// Apply common tags and the first matching rule to one measurement.
    /// Common tags never override tags the measurement already carries.
    pub fn apply_one(
        &self,
        common_tags: &BTreeMap<String, String>,
        m: &Measurement,
    ) -> Measurement {
        let mut id = m.id().clone();
        for (k, v) in common_tags {
            if id.tag_value(k).is_none() {
                id = id.with_tag(k.clone(), v.clone());
            }
        }
        let action = self
            .rules
            .iter()
            .find(|r| r.query.matches(&id))
            .map(|r| &r.action)
            .unwrap_or(&RollupAction::Preserve);
        let id = match action {
            RollupAction::Preserve => id,
            RollupAction::KeepKeys(keys) => {
                let tags: Vec<Tag> = id
                    .tags()
                    .iter()
                    .filter(|t| keys.iter().any(|k| k == t.key()))
                    .cloned()
                    .collect();
                Id::with_name_and_tags(id.name().to_string(), tags)
            }
            RollupAction::DropKeys(keys) => {
                let tags: Vec<Tag> = id
                    .tags()
                    .iter()
                    .filter(|t| !keys.iter().any(|k| k == t.key()))
                    .cloned()
                    .collect();
                Id::with_name_and_tags(id.name().to_string(), tags)
            }
        };
        m.with_id(id)
    }

    /// Apply the policy to a snapshot and combine measurements whose ids
    /// collapsed to the same value: gauge-like statistics take the max,
    /// everything else sums.
    pub fn apply(
        &self,
        common_tags: &BTreeMap<String, String>,
        measurements: Vec<Measurement>,
    ) -> Vec<Measurement> {
        let rewritten = measurements.iter().map(|m| self.apply_one(common_tags, m));
        aggregate(rewritten)
    }
}

/// Group by id and combine values according to the statistic tag.
pub fn aggregate(measurements: impl Iterator<Item = Measurement>) -> Vec<Measurement> {
    let mut grouped: HashMap<Id, Measurement> = HashMap::new();
    for m in measurements {
        match grouped.get_mut(m.id()) {
            None => {
                grouped.insert(m.id().clone(), m);
            }
            Some(existing) => {
                let max_like = matches!(
                    m.id().tag_value("statistic"),
                    Some("max") | Some("gauge") | Some("duration") | Some("activeTasks")
                );
                let a = existing.value();
                let b = m.value();
                let combined = if a.is_nan() {
                    b
                } else if b.is_nan() {
                    a
                } else if max_like {
                    a.max(b)
                } else {
                    a + b
                };
                let timestamp = existing.timestamp().max(m.timestamp());
                *existing = Measurement::new(m.id().clone(), timestamp, combined);
            }
        }
    }
    grouped.into_values().collect()
}

impl fmt::Display for RollupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollupAction::KeepKeys(keys) => write!(f, "keep {keys:?}"),
            RollupAction::DropKeys(keys) => write!(f, "drop {keys:?}"),
            RollupAction::Preserve => f.write_str("preserve"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_query::parse_data_expr;

    fn m(name: &str, tags: &[(&str, &str)], stat: &str, value: f64) -> Measurement {
        let mut id = Id::new(name.to_string()).with_tag("statistic", stat.to_string());
        for (k, v) in tags {
            id = id.with_tag(k.to_string(), v.to_string());
        }
        Measurement::new(id, 0, value)
    }

    #[test]
    fn common_tags_do_not_override() {
        let policy = RollupPolicy::default();
        let mut common = BTreeMap::new();
        common.insert("app".to_string(), "www".to_string());
        common.insert("node".to_string(), "common-node".to_string());
        let out = policy.apply_one(&common, &m("req", &[("node", "i-1")], "count", 1.0));
        assert_eq!(out.id().tag_value("app"), Some("www"));
        assert_eq!(out.id().tag_value("node"), Some("i-1"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = RollupPolicy::new(vec![
            RollupRule {
                query: Query::equal("name", "req"),
                action: RollupAction::DropKeys(vec!["node".to_string()]),
            },
            RollupRule {
                query: Query::True,
                action: RollupAction::DropKeys(vec!["statistic".to_string()]),
            },
        ]);
        let common = BTreeMap::new();
        let out = policy.apply_one(&common, &m("req", &[("node", "i-1")], "count", 1.0));
        assert_eq!(out.id().tag_value("node"), None);
        // second rule did not run
        assert_eq!(out.id().tag_value("statistic"), Some("count"));
    }

    #[test]
    fn drop_rule_collapses_and_sums() {
        let policy = RollupPolicy::new(vec![RollupRule {
            query: Query::True,
            action: RollupAction::DropKeys(vec!["node".to_string()]),
        }]);
        let out = policy.apply(
            &BTreeMap::new(),
            vec![
                m("req", &[("node", "i-1")], "count", 1.0),
                m("req", &[("node", "i-2")], "count", 2.0),
            ],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value(), 3.0);
    }

    #[test]
    fn keep_rule_from_expression() {
        let expr = parse_data_expr("name,req,:eq,:sum,(,statistic,),:rollup-keep").unwrap();
        let rule = RollupRule::from_data_expr(&expr);
        assert!(matches!(rule.action, RollupAction::KeepKeys(_)));
        let policy = RollupPolicy::new(vec![rule]);
        let out = policy.apply_one(
            &BTreeMap::new(),
            &m("req", &[("node", "i-1")], "count", 1.0),
        );
        assert_eq!(out.id().tag_value("node"), None);
        assert_eq!(out.id().tag_value("statistic"), Some("count"));
        assert_eq!(out.id().name(), "req");
    }

    #[test]
    fn gauges_aggregate_by_max() {
        let out = aggregate(
            vec![
                m("mem", &[], "gauge", 5.0),
                m("mem", &[], "gauge", 9.0),
                m("mem", &[], "gauge", 7.0),
            ]
            .into_iter(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value(), 9.0);
    }

    #[test]
    fn sums_skip_nan() {
        let out = aggregate(
            vec![
                m("req", &[], "count", 2.0),
                m("req", &[], "count", f64::NAN),
            ]
            .into_iter(),
        );
        assert_eq!(out[0].value(), 2.0);
    }
}
