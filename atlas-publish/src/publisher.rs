//! The periodic snapshot/rollup/consolidate/publish/evaluate pipeline.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use http::Request;

use atlas_metrics::{
    atlas_log, Counter, Id, Measurement, Registry, RepeatPolicy, Scheduler,
    SchedulerOptions, TaskHandle,
};

use crate::config::Config;
use crate::consolidator::Consolidator;
use crate::http::{send_with_retry, HttpClient, HttpError, RetryPolicy};
use crate::payload::{
    EvalMetric, EvalPayload, PublishPayload, TagValidator, ValidationResponse,
};
use crate::rollup::RollupPolicy;
use crate::subscriptions::{Subscription, SubscriptionManager};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct ConsolidatorEntry {
    consolidator: Consolidator,
    last_update: u64,
}

/// Drives the publish pipeline for one registry.
///
/// A tick runs on every primary step: it snapshots the registry, applies
/// the rollup policy and feeds the per-meter consolidators. When the tick
/// crosses a publish step boundary the consolidated values are aggregated,
/// POSTed to the publish endpoint and evaluated against the subscribed
/// streaming expressions.
pub struct Publisher {
    registry: Registry,
    config: Config,
    client: Arc<dyn HttpClient>,
    retry: RetryPolicy,
    validator: TagValidator,
    rollup: RollupPolicy,
    subscriptions: SubscriptionManager,
    consolidators: Mutex<HashMap<Id, ConsolidatorEntry>>,
    last_publish_index: AtomicU64,
    sent: Counter,
    dropped_http: Counter,
    dropped_validation: Counter,
    dropped_other: Counter,
}

impl Publisher {
    /// Create a publisher. The registry must use the same primary step as
    /// the config so snapshots line up with consolidation windows.
    pub fn new(registry: Registry, config: Config, client: Arc<dyn HttpClient>) -> Publisher {
        let base = Id::new("atlas.client.measurements");
        let sent = registry.counter(base.with_tag("id", "sent"));
        let dropped = base.with_tag("id", "dropped");
        let dropped_http = registry.counter(dropped.with_tag("error", "http"));
        let dropped_validation = registry.counter(dropped.with_tag("error", "validation"));
        let dropped_other = registry.counter(dropped.with_tag("error", "other"));
        let subscriptions =
            SubscriptionManager::new(config.config_uri.clone(), config.lwc_step.as_millis() as u64);
        Publisher {
            validator: TagValidator::new(&config),
            subscriptions,
            registry,
            config,
            client,
            retry: RetryPolicy::default(),
            rollup: RollupPolicy::default(),
            consolidators: Mutex::new(HashMap::new()),
            last_publish_index: AtomicU64::new(0),
            sent,
            dropped_http,
            dropped_validation,
            dropped_other,
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Publisher {
        self.retry = retry;
        self
    }

    /// Replace the rollup policy.
    pub fn with_rollup_policy(mut self, rollup: RollupPolicy) -> Publisher {
        self.rollup = rollup;
        self
    }

    /// The subscription manager driving streaming evaluation.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Schedule the pipeline: the per-primary-step tick and the
    /// subscription refresh. Returns the task handles for cancellation.
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler) -> Vec<TaskHandle> {
        let mut handles = Vec::new();
        if self.config.enabled || self.config.lwc_enabled {
            let publisher = self.clone();
            handles.push(scheduler.schedule(
                SchedulerOptions::new(RepeatPolicy::FixedRateSkip(self.config.step))
                    .with_initial_delay(self.config.step),
                move || publisher.tick(),
            ));
        }
        if self.config.lwc_enabled {
            let publisher = self.clone();
            handles.push(scheduler.schedule(
                SchedulerOptions::new(RepeatPolicy::FixedRateSkip(
                    self.config.config_refresh_frequency,
                ))
                .with_initial_delay(self.config.config_refresh_frequency),
                move || {
                    publisher
                        .subscriptions
                        .refresh(publisher.client.as_ref(), &publisher.retry)
                },
            ));
        }
        handles
    }

    /// One primary-step tick. Public so embedders with their own timing
    /// can drive the pipeline directly.
    pub fn tick(&self) {
        let now = self.registry.clock().wall_time();
        let swept = self.registry.remove_expired();
        if swept > 0 {
            atlas_log!(debug, name: "Publisher.sweep", removed = swept);
        }
        let snapshot: Vec<Measurement> = self.registry.measurements().collect();
        let rolled = self
            .rollup
            .apply(&self.config.common_tags, snapshot);

        let primary_ms = self.config.step.as_millis() as u64;
        let publish_ms = self.config.lwc_step.as_millis() as u64;
        let multiple = self.config.consolidation_multiple();
        {
            let mut consolidators = lock(&self.consolidators);
            for m in &rolled {
                consolidators
                    .entry(m.id().clone())
                    .or_insert_with(|| ConsolidatorEntry {
                        consolidator: Consolidator::for_statistic(
                            m.id().tag_value("statistic"),
                            primary_ms,
                            multiple,
                        ),
                        last_update: now,
                    })
                    .update(m, now);
            }
        }

        let publish_index = now / publish_ms;
        let last = self.last_publish_index.load(Ordering::Acquire);
        if publish_index <= last
            || self
                .last_publish_index
                .compare_exchange(last, publish_index, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }
        let boundary = publish_index * publish_ms;
        let consolidated = self.collect_consolidated(boundary, publish_ms);

        if self.config.enabled {
            self.publish(&consolidated);
        }
        if self.config.lwc_enabled {
            self.evaluate(boundary, &consolidated);
        }
    }

    /// Values for the publish interval ending at `boundary`, stamped with
    /// the interval start. Empty consolidators are skipped; entries idle
    /// for more than two publish steps are reclaimed.
    fn collect_consolidated(&self, boundary: u64, publish_ms: u64) -> Vec<Measurement> {
        let mut out = Vec::new();
        let mut consolidators = lock(&self.consolidators);
        consolidators.retain(|id, entry| {
            if entry.consolidator.is_empty() {
                return false;
            }
            let value = entry.consolidator.value(boundary);
            if !value.is_nan() {
                out.push(Measurement::new(
                    id.clone(),
                    boundary.saturating_sub(publish_ms),
                    value,
                ));
            }
            boundary.saturating_sub(entry.last_update) <= 2 * publish_ms
        });
        out
    }

    fn publish(&self, measurements: &[Measurement]) {
        for batch in measurements.chunks(self.config.batch_size) {
            let payload = PublishPayload {
                tags: self.config.common_tags.clone(),
                metrics: batch.iter().map(|m| self.validator.metric(m)).collect(),
            };
            let body = match serde_json::to_vec(&payload) {
                Ok(body) => body,
                Err(e) => {
                    atlas_log!(warn, name: "Publisher.encode", error = e.to_string());
                    self.dropped_other.add(batch.len() as f64);
                    continue;
                }
            };
            let result = send_with_retry(
                self.client.as_ref(),
                std::slice::from_ref(&self.config.uri),
                &self.retry,
                |uri| {
                    Request::builder()
                        .method(http::Method::POST)
                        .uri(uri)
                        .header(http::header::CONTENT_TYPE, "application/json")
                        .body(body.clone())
                        .map_err(|e| HttpError::InvalidRequest(e.to_string()))
                },
            );
            self.record_publish_result(result, batch.len());
        }
    }

    fn record_publish_result(
        &self,
        result: Result<http::Response<bytes::Bytes>, HttpError>,
        batch_len: usize,
    ) {
        match result {
            Err(e) => {
                atlas_log!(warn, name: "Publisher.post", error = e.to_string(), dropped = batch_len);
                self.dropped_http.add(batch_len as f64);
            }
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    match serde_json::from_slice::<ValidationResponse>(response.body()) {
                        Ok(validation) => {
                            let dropped = validation.error_count.min(batch_len);
                            if dropped > 0 {
                                atlas_log!(debug,
                                    name: "Publisher.validation",
                                    dropped = dropped,
                                    messages = format!("{:?}", validation.message)
                                );
                            }
                            self.dropped_validation.add(dropped as f64);
                            self.sent.add((batch_len - dropped) as f64);
                        }
                        Err(_) => self.sent.add(batch_len as f64),
                    }
                } else if status == http::StatusCode::BAD_REQUEST {
                    // The backend rejected the whole batch as invalid.
                    atlas_log!(warn, name: "Publisher.rejected", dropped = batch_len);
                    self.dropped_validation.add(batch_len as f64);
                } else {
                    atlas_log!(warn,
                        name: "Publisher.post",
                        status = status.as_u16(),
                        dropped = batch_len
                    );
                    self.dropped_http.add(batch_len as f64);
                }
            }
        }
    }

    fn evaluate(&self, boundary: u64, measurements: &[Measurement]) {
        let index = self.subscriptions.index();
        if index.is_empty() {
            return;
        }
        let mut per_sub: HashMap<String, (Arc<Subscription>, Vec<Measurement>)> = HashMap::new();
        for m in measurements {
            for sub in index.find_matches(m.id()) {
                per_sub
                    .entry(sub.id.clone())
                    .or_insert_with(|| (sub.clone(), Vec::new()))
                    .1
                    .push(m.clone());
            }
        }
        for (_, (sub, matched)) in per_sub {
            let metrics: Vec<EvalMetric> = sub
                .expr
                .eval(&matched)
                .into_iter()
                .filter(|pair| !pair.value.is_nan())
                .map(|pair| EvalMetric {
                    id: sub.id.clone(),
                    tags: pair.tags,
                    value: pair.value,
                })
                .collect();
            if metrics.is_empty() {
                continue;
            }
            let payload = EvalPayload {
                timestamp: boundary,
                metrics,
                messages: Vec::new(),
            };
            for batch in payload.into_batches(self.config.batch_size) {
                let body = match serde_json::to_vec(&batch) {
                    Ok(body) => body,
                    Err(e) => {
                        atlas_log!(warn, name: "Publisher.evalEncode", error = e.to_string());
                        continue;
                    }
                };
                let result = send_with_retry(
                    self.client.as_ref(),
                    std::slice::from_ref(&self.config.eval_uri),
                    &self.retry,
                    |uri| {
                        Request::builder()
                            .method(http::Method::POST)
                            .uri(uri)
                            .header(http::header::CONTENT_TYPE, "application/json")
                            .body(body.clone())
                            .map_err(|e| HttpError::InvalidRequest(e.to_string()))
                    },
                );
                if let Err(e) = result {
                    atlas_log!(debug, name: "Publisher.eval", error = e.to_string());
                }
            }
        }
    }
}

impl ConsolidatorEntry {
    fn update(&mut self, m: &Measurement, now: u64) {
        self.consolidator.update_measurement(m);
        self.last_update = now;
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("uri", &self.config.uri)
            .field("enabled", &self.config.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use atlas_metrics::ManualClock;
    use bytes::Bytes;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingClient {
        responses: StdMutex<Vec<http::Response<Bytes>>>,
        requests: StdMutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send(
            &self,
            request: Request<Vec<u8>>,
        ) -> Result<http::Response<Bytes>, HttpError> {
            self.requests
                .lock()
                .unwrap()
                .push((request.uri().to_string(), request.body().clone()));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(http::Response::builder()
                    .status(200)
                    .body(Bytes::new())
                    .unwrap())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn setup(config: Config) -> (Arc<ManualClock>, Registry, Arc<RecordingClient>, Publisher) {
        let clock = Arc::new(ManualClock::new());
        let registry = Registry::builder()
            .with_clock(clock.clone())
            .with_step(config.step.as_millis() as u64)
            .with_meter_ttl(config.meter_ttl.as_millis() as u64)
            .build();
        let client = Arc::new(RecordingClient::default());
        let publisher = Publisher::new(registry.clone(), config, client.clone());
        (clock, registry, client, publisher)
    }

    fn pass_through_config() -> Config {
        Config::builder()
            .with_step(Duration::from_secs(5))
            .with_lwc_step(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn publish_requests(client: &RecordingClient, uri_part: &str) -> Vec<Value> {
        client
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(uri, _)| uri.contains(uri_part))
            .map(|(_, body)| serde_json::from_slice(body).unwrap())
            .collect()
    }

    #[test]
    fn publishes_counter_rates_at_the_boundary() {
        let (clock, registry, client, publisher) = setup(pass_through_config());
        let counter = registry.counter(Id::new("server.requests"));
        for _ in 0..10 {
            counter.increment();
        }
        clock.set_wall_time(5_000);
        publisher.tick();

        let payloads = publish_requests(&client, "/publish");
        assert_eq!(payloads.len(), 1);
        let metrics = payloads[0]["metrics"].as_array().unwrap();
        let m = metrics
            .iter()
            .find(|m| m["tags"]["name"] == "server.requests")
            .expect("counter metric present");
        assert_eq!(m["value"].as_f64().unwrap(), 2.0);
        assert_eq!(m["tags"]["statistic"], "count");
        assert_eq!(m["tags"]["atlas.dstype"], "sum");
        assert_eq!(m["timestamp"].as_u64().unwrap(), 0);
    }

    #[test]
    fn no_publish_before_the_boundary() {
        let (clock, registry, client, publisher) = setup(pass_through_config());
        registry.counter(Id::new("x")).increment();
        clock.set_wall_time(3_000);
        publisher.tick();
        assert!(publish_requests(&client, "/publish").is_empty());
    }

    #[test]
    fn validation_errors_split_the_accounting() {
        let (clock, registry, client, publisher) = setup(pass_through_config());
        for i in 0..42 {
            registry.counter(Id::new(format!("metric.{i}"))).increment();
        }
        client.responses.lock().unwrap().push(
            http::Response::builder()
                .status(202)
                .body(Bytes::from_static(
                    br#"{"type":"error","errorCount":3,"message":["bad tag"]}"#,
                ))
                .unwrap(),
        );
        clock.set_wall_time(5_000);
        publisher.tick();

        let payloads = publish_requests(&client, "/publish");
        let batch_len = payloads[0]["metrics"].as_array().unwrap().len();
        // 42 counters plus the publisher's own accounting counters
        assert!(batch_len >= 42);
        assert_eq!(publisher.dropped_validation.actual_count(), 3.0);
        assert_eq!(publisher.sent.actual_count(), (batch_len - 3) as f64);
    }

    #[test]
    fn http_400_drops_the_whole_batch_as_invalid() {
        let (clock, registry, client, publisher) = setup(pass_through_config());
        registry.counter(Id::new("x")).increment();
        client.responses.lock().unwrap().push(
            http::Response::builder()
                .status(400)
                .body(Bytes::from_static(
                    br#"{"type":"error","errorCount":1,"message":[]}"#,
                ))
                .unwrap(),
        );
        clock.set_wall_time(5_000);
        publisher.tick();
        let payloads = publish_requests(&client, "/publish");
        let batch_len = payloads[0]["metrics"].as_array().unwrap().len();
        assert_eq!(publisher.dropped_validation.actual_count(), batch_len as f64);
        assert_eq!(publisher.sent.actual_count(), 0.0);
    }

    #[test]
    fn transport_failure_counts_dropped_http() {
        let (clock, registry, client, publisher) = setup(pass_through_config());
        let publisher = publisher.with_retry_policy(RetryPolicy {
            max_retries: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            jitter: Duration::ZERO,
        });
        registry.counter(Id::new("x")).increment();
        client.responses.lock().unwrap().push(
            http::Response::builder()
                .status(503)
                .body(Bytes::new())
                .unwrap(),
        );
        clock.set_wall_time(5_000);
        publisher.tick();
        assert!(publisher.dropped_http.actual_count() >= 1.0);
    }

    #[test]
    fn evaluates_matching_subscriptions() {
        let (clock, registry, client, publisher) = setup(pass_through_config());
        publisher.subscriptions().update(vec![
            crate::payload::SubscriptionDef {
                id: "s1".to_string(),
                expression: "name,server.requests,:eq,statistic,count,:eq,:and,:sum".to_string(),
                frequency: 5_000,
            },
            crate::payload::SubscriptionDef {
                id: "other".to_string(),
                expression: "name,nomatch,:eq,:sum".to_string(),
                frequency: 5_000,
            },
        ]);
        let counter = registry.counter(Id::new("server.requests"));
        for _ in 0..10 {
            counter.increment();
        }
        clock.set_wall_time(5_000);
        publisher.tick();

        let evals = publish_requests(&client, "/evaluate");
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0]["timestamp"].as_u64().unwrap(), 5_000);
        let metrics = evals[0]["metrics"].as_array().unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0]["id"], "s1");
        assert_eq!(metrics[0]["value"].as_f64().unwrap(), 2.0);
    }

    #[test]
    fn consolidates_to_the_publish_step() {
        let config = Config::builder()
            .with_step(Duration::from_secs(5))
            .with_lwc_step(Duration::from_secs(60))
            .build()
            .unwrap();
        let (clock, registry, client, publisher) = setup(config);
        let counter = registry.counter(Id::new("req"));
        // One increment per primary step for a full publish interval.
        for i in 1..=12u64 {
            counter.increment();
            clock.set_wall_time(i * 5_000);
            publisher.tick();
        }
        let payloads = publish_requests(&client, "/publish");
        assert_eq!(payloads.len(), 1);
        let metrics = payloads[0]["metrics"].as_array().unwrap();
        let m = metrics
            .iter()
            .find(|m| m["tags"]["name"] == "req")
            .expect("consolidated metric present");
        // 1 increment per 5s bucket is a rate of 0.2/s in every bucket.
        let value = m["value"].as_f64().unwrap();
        assert!((value - 0.2).abs() < 1e-9, "value={value}");
        assert_eq!(m["timestamp"].as_u64().unwrap(), 0);
    }

    #[test]
    fn disabled_publisher_still_evaluates() {
        let config = Config::builder()
            .with_step(Duration::from_secs(5))
            .with_lwc_step(Duration::from_secs(5))
            .with_enabled(false)
            .build()
            .unwrap();
        let (clock, registry, client, publisher) = setup(config);
        publisher.subscriptions().update(vec![crate::payload::SubscriptionDef {
            id: "s1".to_string(),
            expression: "name,x,:eq,:sum".to_string(),
            frequency: 5_000,
        }]);
        registry.counter(Id::new("x")).increment();
        clock.set_wall_time(5_000);
        publisher.tick();
        assert!(publish_requests(&client, "/publish").is_empty());
        assert_eq!(publish_requests(&client, "/evaluate").len(), 1);
    }
}
