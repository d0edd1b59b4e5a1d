//! Data-expression layer: aggregation and grouping of matching data.

use std::collections::BTreeMap;
use std::fmt;

use atlas_metrics::Measurement;

use crate::query::Query;

/// How matching values are combined into one output value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationType {
    /// Sum of the values.
    Sum,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Number of values.
    Count,
}

impl AggregationType {
    fn operator(&self) -> &'static str {
        match self {
            AggregationType::Sum => ":sum",
            AggregationType::Min => ":min",
            AggregationType::Max => ":max",
            AggregationType::Count => ":count",
        }
    }

    fn combine(&self, values: impl Iterator<Item = f64>) -> f64 {
        let mut acc = f64::NAN;
        let mut count = 0u64;
        for v in values {
            if v.is_nan() {
                continue;
            }
            count += 1;
            acc = match self {
                AggregationType::Sum | AggregationType::Count => {
                    if acc.is_nan() {
                        v
                    } else {
                        acc + v
                    }
                }
                AggregationType::Min => {
                    if acc.is_nan() || v < acc {
                        v
                    } else {
                        acc
                    }
                }
                AggregationType::Max => {
                    if acc.is_nan() || v > acc {
                        v
                    } else {
                        acc
                    }
                }
            };
        }
        match self {
            AggregationType::Count => count as f64,
            _ => acc,
        }
    }
}

/// One labeled output value of a data expression.
#[derive(Debug, Clone, PartialEq)]
pub struct TagsValuePair {
    /// Tags identifying the output series.
    pub tags: BTreeMap<String, String>,
    /// Aggregated value.
    pub value: f64,
}

/// An expression that selects measurements with a [`Query`] and reduces
/// them to one or more labeled values.
#[derive(Debug, Clone, PartialEq)]
pub enum DataExpr {
    /// Every matching measurement passes through with its own tags.
    All(Query),
    /// Matching measurements combine into a single value labeled with the
    /// query's exact-match tags.
    Aggregate(AggregationType, Query),
    /// The inner expression is evaluated separately for each distinct
    /// combination of the listed tag values.
    GroupBy {
        /// Tag keys to group on.
        keys: Vec<String>,
        /// Expression applied to each group.
        expr: Box<DataExpr>,
    },
    /// Tag keys are kept or dropped before aggregation, collapsing series
    /// that only differed in the removed keys.
    Rollup {
        /// True keeps exactly the listed keys, false drops them.
        keep: bool,
        /// The keys the rollup acts on.
        keys: Vec<String>,
        /// Expression applied to the rewritten measurements.
        expr: Box<DataExpr>,
    },
}

impl DataExpr {
    /// The query deciding which measurements feed this expression.
    pub fn query(&self) -> &Query {
        match self {
            DataExpr::All(q) | DataExpr::Aggregate(_, q) => q,
            DataExpr::GroupBy { expr, .. } | DataExpr::Rollup { expr, .. } => expr.query(),
        }
    }

    /// Evaluate against measurements that already matched
    /// [`DataExpr::query`].
    pub fn eval(&self, measurements: &[Measurement]) -> Vec<TagsValuePair> {
        let datapoints: Vec<(BTreeMap<String, String>, f64)> = measurements
            .iter()
            .map(|m| (id_tags(m), m.value()))
            .collect();
        self.eval_datapoints(&datapoints)
    }

    fn eval_datapoints(&self, datapoints: &[(BTreeMap<String, String>, f64)]) -> Vec<TagsValuePair> {
        match self {
            DataExpr::All(_) => datapoints
                .iter()
                .map(|(tags, value)| TagsValuePair {
                    tags: tags.clone(),
                    value: *value,
                })
                .collect(),
            DataExpr::Aggregate(af, query) => {
                if datapoints.is_empty() {
                    return Vec::new();
                }
                let value = af.combine(datapoints.iter().map(|(_, v)| *v));
                vec![TagsValuePair {
                    tags: query.exact_tags(),
                    value,
                }]
            }
            DataExpr::GroupBy { keys, expr } => {
                let mut groups: BTreeMap<Vec<String>, Vec<(BTreeMap<String, String>, f64)>> =
                    BTreeMap::new();
                for (tags, value) in datapoints {
                    // Datapoints missing a group key contribute nothing.
                    let group = keys
                        .iter()
                        .map(|k| tags.get(k).cloned())
                        .collect::<Option<Vec<String>>>();
                    let Some(group) = group else {
                        continue;
                    };
                    groups
                        .entry(group)
                        .or_default()
                        .push((tags.clone(), *value));
                }
                let mut out = Vec::new();
                for (group, points) in groups {
                    for mut pair in expr.eval_datapoints(&points) {
                        for (k, v) in keys.iter().zip(group.iter()) {
                            pair.tags.insert(k.clone(), v.clone());
                        }
                        out.push(pair);
                    }
                }
                out
            }
            DataExpr::Rollup { keep, keys, expr } => {
                let rewritten: Vec<(BTreeMap<String, String>, f64)> = datapoints
                    .iter()
                    .map(|(tags, value)| {
                        let tags = tags
                            .iter()
                            .filter(|(k, _)| {
                                let listed = keys.iter().any(|key| key == *k);
                                // The name always survives a drop-rollup.
                                if *keep {
                                    listed || *k == "name"
                                } else {
                                    !listed
                                }
                            })
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        (tags, *value)
                    })
                    .collect();
                // Collapse datapoints that became identical.
                let mut groups: BTreeMap<BTreeMap<String, String>, f64> = BTreeMap::new();
                for (tags, value) in rewritten {
                    let slot = groups.entry(tags).or_insert(f64::NAN);
                    *slot = if slot.is_nan() { value } else { *slot + value };
                }
                let collapsed: Vec<(BTreeMap<String, String>, f64)> =
                    groups.into_iter().collect();
                expr.eval_datapoints(&collapsed)
            }
        }
    }
}

fn id_tags(m: &Measurement) -> BTreeMap<String, String> {
    let mut tags: BTreeMap<String, String> = m
        .id()
        .tags()
        .iter()
        .map(|t| (t.key().to_string(), t.value().to_string()))
        .collect();
    tags.insert("name".to_string(), m.id().name().to_string());
    tags
}

impl fmt::Display for DataExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataExpr::All(q) => write!(f, "{q},:all"),
            DataExpr::Aggregate(af, q) => write!(f, "{q},{}", af.operator()),
            DataExpr::GroupBy { keys, expr } => {
                write!(f, "{expr},(")?;
                for k in keys {
                    write!(f, ",{k}")?;
                }
                write!(f, ",),:by")
            }
            DataExpr::Rollup { keep, keys, expr } => {
                write!(f, "{expr},(")?;
                for k in keys {
                    write!(f, ",{k}")?;
                }
                write!(f, ",),{}", if *keep { ":rollup-keep" } else { ":rollup-drop" })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_metrics::Id;

    fn measurement(name: &str, tags: &[(&str, &str)], value: f64) -> Measurement {
        let mut id = Id::new(name.to_string());
        for (k, v) in tags {
            id = id.with_tag(k.to_string(), v.to_string());
        }
        Measurement::new(id, 0, value)
    }

    #[test]
    fn sum_labels_output_with_exact_tags() {
        let expr = DataExpr::Aggregate(
            AggregationType::Sum,
            Query::equal("name", "server.requests"),
        );
        let out = expr.eval(&[
            measurement("server.requests", &[("node", "a")], 1.0),
            measurement("server.requests", &[("node", "b")], 2.0),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 3.0);
        assert_eq!(
            out[0].tags.get("name").map(String::as_str),
            Some("server.requests")
        );
    }

    #[test]
    fn group_by_splits_on_key() {
        let expr = DataExpr::GroupBy {
            keys: vec!["node".to_string()],
            expr: Box::new(DataExpr::Aggregate(
                AggregationType::Sum,
                Query::equal("name", "req"),
            )),
        };
        let out = expr.eval(&[
            measurement("req", &[("node", "a")], 1.0),
            measurement("req", &[("node", "a")], 2.0),
            measurement("req", &[("node", "b")], 5.0),
            measurement("req", &[], 9.0), // no node tag, excluded
        ]);
        assert_eq!(out.len(), 2);
        let by_node: BTreeMap<&str, f64> = out
            .iter()
            .map(|p| (p.tags.get("node").unwrap().as_str(), p.value))
            .collect();
        assert_eq!(by_node["a"], 3.0);
        assert_eq!(by_node["b"], 5.0);
    }

    #[test]
    fn count_and_minmax() {
        let points = [
            measurement("m", &[], 4.0),
            measurement("m", &[], 1.0),
            measurement("m", &[], f64::NAN),
        ];
        let count = DataExpr::Aggregate(AggregationType::Count, Query::True).eval(&points);
        assert_eq!(count[0].value, 2.0);
        let min = DataExpr::Aggregate(AggregationType::Min, Query::True).eval(&points);
        assert_eq!(min[0].value, 1.0);
        let max = DataExpr::Aggregate(AggregationType::Max, Query::True).eval(&points);
        assert_eq!(max[0].value, 4.0);
    }

    #[test]
    fn rollup_drop_collapses_series() {
        let expr = DataExpr::Rollup {
            keep: false,
            keys: vec!["node".to_string()],
            expr: Box::new(DataExpr::All(Query::True)),
        };
        let out = expr.eval(&[
            measurement("req", &[("node", "a"), ("status", "2xx")], 1.0),
            measurement("req", &[("node", "b"), ("status", "2xx")], 2.0),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 3.0);
        assert!(!out[0].tags.contains_key("node"));
    }

    #[test]
    fn rollup_keep_retains_name() {
        let expr = DataExpr::Rollup {
            keep: true,
            keys: vec!["status".to_string()],
            expr: Box::new(DataExpr::All(Query::True)),
        };
        let out = expr.eval(&[measurement(
            "req",
            &[("node", "a"), ("status", "2xx")],
            1.0,
        )]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tags.get("name").map(String::as_str), Some("req"));
        assert_eq!(out[0].tags.get("status").map(String::as_str), Some("2xx"));
        assert!(!out[0].tags.contains_key("node"));
    }
}
