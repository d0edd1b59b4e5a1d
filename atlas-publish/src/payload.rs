//! Wire payloads for the publish, subscription and eval endpoints.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize, Serializer};

use atlas_metrics::util::AsciiSet;
use atlas_metrics::Measurement;

use crate::config::Config;

/// Non-finite values cannot be represented as JSON numbers; the backend
/// accepts the string token instead.
fn serialize_value<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    if v.is_finite() {
        s.serialize_f64(*v)
    } else {
        s.serialize_str("NaN")
    }
}

/// Body POSTed to the publish endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PublishPayload {
    /// Common tags applied by the backend to every metric in the batch.
    pub tags: BTreeMap<String, String>,
    /// The measurements.
    pub metrics: Vec<PayloadMetric>,
}

/// One measurement on the wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PayloadMetric {
    /// Tags including `name`, `statistic` and `atlas.dstype`.
    pub tags: BTreeMap<String, String>,
    /// Wall time in milliseconds.
    pub timestamp: u64,
    /// Value, `"NaN"` when not finite.
    #[serde(serialize_with = "serialize_value")]
    pub value: f64,
}

/// Subscription list fetched from the config endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Subscriptions {
    /// The subscribed expressions.
    #[serde(default)]
    pub expressions: Vec<SubscriptionDef>,
}

/// One subscribed expression.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SubscriptionDef {
    /// Backend identifier echoed in eval payloads.
    pub id: String,
    /// Postfix query expression.
    pub expression: String,
    /// Evaluation frequency in milliseconds.
    pub frequency: u64,
}

/// Partial-failure body returned by the publish endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ValidationResponse {
    /// Always `"error"`.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Number of measurements rejected.
    #[serde(rename = "errorCount")]
    pub error_count: usize,
    /// Human-readable reasons.
    #[serde(default)]
    pub message: Vec<String>,
}

/// Body POSTed to the streaming eval endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvalPayload {
    /// Publish-step timestamp shared by every batch of the tick.
    pub timestamp: u64,
    /// Aggregated values per subscription.
    pub metrics: Vec<EvalMetric>,
    /// Diagnostics, attached to the first batch only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<EvalMessage>,
}

/// One aggregated value for a subscription.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvalMetric {
    /// Subscription id.
    pub id: String,
    /// Group tags of the aggregated series.
    pub tags: BTreeMap<String, String>,
    /// Aggregated value.
    #[serde(serialize_with = "serialize_value")]
    pub value: f64,
}

/// Diagnostic attached to a subscription.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvalMessage {
    /// Subscription id.
    pub id: String,
    /// The diagnostic.
    pub message: DiagnosticMessage,
}

/// Severity plus text.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiagnosticMessage {
    /// Severity.
    #[serde(rename = "type")]
    pub level: MessageLevel,
    /// Text shown to the subscription owner.
    pub message: String,
}

/// Severity of a [`DiagnosticMessage`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    /// Informational.
    Info,
    /// Something was degraded.
    Warn,
    /// The subscription could not be evaluated.
    Error,
}

impl EvalPayload {
    /// Split into payloads of at most `batch_size` metrics. Every batch
    /// carries the same timestamp; messages ride on the first batch only.
    pub fn into_batches(self, batch_size: usize) -> Vec<EvalPayload> {
        if self.metrics.len() <= batch_size {
            return vec![self];
        }
        let EvalPayload {
            timestamp,
            metrics,
            mut messages,
        } = self;
        let mut out = Vec::with_capacity(metrics.len().div_ceil(batch_size));
        let mut metrics = metrics.into_iter().peekable();
        while metrics.peek().is_some() {
            let chunk: Vec<EvalMetric> = metrics.by_ref().take(batch_size).collect();
            out.push(EvalPayload {
                timestamp,
                metrics: chunk,
                messages: std::mem::take(&mut messages),
            });
        }
        out
    }
}

/// Applies the allowed-character policy while converting measurements to
/// their wire form.
#[derive(Debug, Clone)]
pub struct TagValidator {
    tag_chars: AsciiSet,
    value_overrides: HashMap<String, AsciiSet>,
}

impl TagValidator {
    /// Validator for the configured character sets.
    pub fn new(config: &Config) -> Self {
        TagValidator {
            tag_chars: config.valid_tag_characters,
            value_overrides: config.valid_tag_value_characters.clone(),
        }
    }

    fn sanitize_key(&self, key: &str) -> String {
        self.tag_chars.replace_non_members(key, '_')
    }

    fn sanitize_value(&self, key: &str, value: &str) -> String {
        self.value_overrides
            .get(key)
            .unwrap_or(&self.tag_chars)
            .replace_non_members(value, '_')
    }

    /// Wire form of a measurement: sanitized tags plus the `name` and
    /// `atlas.dstype` entries the backend expects.
    pub fn metric(&self, m: &Measurement) -> PayloadMetric {
        let mut tags = BTreeMap::new();
        for tag in m.id().tags() {
            tags.insert(
                self.sanitize_key(tag.key()),
                self.sanitize_value(tag.key(), tag.value()),
            );
        }
        tags.insert(
            "name".to_string(),
            self.sanitize_value("name", m.id().name()),
        );
        tags.insert("atlas.dstype".to_string(), dstype(m).to_string());
        PayloadMetric {
            tags,
            timestamp: m.timestamp(),
            value: m.value(),
        }
    }
}

/// Data-source type the backend uses to pick its own consolidation: rate
/// statistics are sums, everything else is a gauge.
fn dstype(m: &Measurement) -> &'static str {
    match m.id().tag_value("statistic") {
        Some("count") | Some("totalAmount") | Some("totalTime") | Some("totalOfSquares")
        | Some("percentile") => "sum",
        _ => "gauge",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_metrics::Id;

    fn validator() -> TagValidator {
        TagValidator::new(&Config::builder().build().unwrap())
    }

    #[test]
    fn metric_carries_name_and_dstype() {
        let m = Measurement::new(
            Id::new("server.requests").with_tag("statistic", "count"),
            60_000,
            2.0,
        );
        let metric = validator().metric(&m);
        assert_eq!(metric.tags.get("name").map(String::as_str), Some("server.requests"));
        assert_eq!(metric.tags.get("atlas.dstype").map(String::as_str), Some("sum"));
        assert_eq!(metric.timestamp, 60_000);
        assert_eq!(metric.value, 2.0);

        let g = Measurement::new(Id::new("mem").with_tag("statistic", "gauge"), 0, 1.0);
        assert_eq!(
            validator().metric(&g).tags.get("atlas.dstype").map(String::as_str),
            Some("gauge")
        );
    }

    #[test]
    fn invalid_characters_become_underscores() {
        let m = Measurement::new(
            Id::new("bad name!").with_tag("key space", "value/slash"),
            0,
            1.0,
        );
        let metric = validator().metric(&m);
        assert_eq!(metric.tags.get("name").map(String::as_str), Some("bad_name_"));
        assert_eq!(
            metric.tags.get("key_space").map(String::as_str),
            Some("value_slash")
        );
    }

    #[test]
    fn cluster_override_keeps_shard_separators() {
        let m = Measurement::new(
            Id::new("up").with_tag("cluster", "www^stack~1"),
            0,
            1.0,
        );
        let metric = validator().metric(&m);
        assert_eq!(
            metric.tags.get("cluster").map(String::as_str),
            Some("www^stack~1")
        );
        let other = Measurement::new(Id::new("up").with_tag("zone", "a^b"), 0, 1.0);
        assert_eq!(
            validator().metric(&other).tags.get("zone").map(String::as_str),
            Some("a_b")
        );
    }

    #[test]
    fn nan_serializes_as_token() {
        let payload = PublishPayload {
            tags: BTreeMap::new(),
            metrics: vec![PayloadMetric {
                tags: BTreeMap::new(),
                timestamp: 0,
                value: f64::NAN,
            }],
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"NaN\""));
    }

    #[test]
    fn subscriptions_parse() {
        let json = r#"{"expressions":[
            {"id":"s1","expression":"name,up,:eq,:sum","frequency":60000},
            {"id":"s2","expression":"name,up,:eq,:max","frequency":10000}
        ]}"#;
        let subs: Subscriptions = serde_json::from_str(json).unwrap();
        assert_eq!(subs.expressions.len(), 2);
        assert_eq!(subs.expressions[0].id, "s1");
        assert_eq!(subs.expressions[1].frequency, 10_000);
    }

    #[test]
    fn validation_response_parses() {
        let json = r#"{"type":"error","errorCount":3,"message":["bad tag"]}"#;
        let resp: ValidationResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.error_count, 3);
        assert_eq!(resp.message.len(), 1);
    }

    #[test]
    fn eval_batching_splits_and_keeps_messages_on_first() {
        let payload = EvalPayload {
            timestamp: 60_000,
            metrics: (0..5)
                .map(|i| EvalMetric {
                    id: format!("s{i}"),
                    tags: BTreeMap::new(),
                    value: i as f64,
                })
                .collect(),
            messages: vec![EvalMessage {
                id: "s0".to_string(),
                message: DiagnosticMessage {
                    level: MessageLevel::Warn,
                    message: "slow".to_string(),
                },
            }],
        };
        let batches = payload.into_batches(2);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.timestamp == 60_000));
        assert_eq!(batches[0].messages.len(), 1);
        assert!(batches[1].messages.is_empty());
        assert!(batches[2].messages.is_empty());
        assert_eq!(batches[2].metrics.len(), 1);
    }

    #[test]
    fn message_level_serializes_lowercase() {
        let json = serde_json::to_string(&MessageLevel::Warn).unwrap();
        assert_eq!(json, "\"warn\"");
    }
}
