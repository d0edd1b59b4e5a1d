//! Subscription list management for streaming evaluation.

use std::fmt;
use std::sync::{Arc, RwLock};

use http::Request;

use atlas_metrics::atlas_log;
use atlas_query::{parse_data_expr, DataExpr, QueryIndex};

use crate::http::{send_with_retry, HttpClient, HttpError, RetryPolicy};
use crate::payload::{SubscriptionDef, Subscriptions};

/// A validated streaming subscription.
#[derive(Debug)]
pub struct Subscription {
    /// Backend identifier echoed in eval payloads.
    pub id: String,
    /// Evaluation frequency in milliseconds.
    pub frequency: u64,
    /// The parsed expression.
    pub expr: DataExpr,
}

/// Holds the current [`QueryIndex`] over subscriptions and rebuilds it
/// when the backend's expression list changes.
///
/// The index is replaced wholesale behind one reference swap, so a
/// publish tick observes either the old or the new subscription set,
/// never a mix.
pub struct SubscriptionManager {
    config_uri: String,
    publish_step_ms: u64,
    index: RwLock<Arc<QueryIndex<Arc<Subscription>>>>,
}

impl SubscriptionManager {
    /// Manager with an empty subscription set.
    pub fn new(config_uri: impl Into<String>, publish_step_ms: u64) -> Self {
        SubscriptionManager {
            config_uri: config_uri.into(),
            publish_step_ms,
            index: RwLock::new(Arc::new(QueryIndex::new())),
        }
    }

    /// Current index. Cheap to call on every evaluation tick.
    pub fn index(&self) -> Arc<QueryIndex<Arc<Subscription>>> {
        self.index
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Fetch the expression list and rebuild the index. Keeps the current
    /// index when the fetch or parse of the whole document fails.
    pub fn refresh(&self, client: &dyn HttpClient, retry: &RetryPolicy) {
        let response = send_with_retry(
            client,
            std::slice::from_ref(&self.config_uri),
            retry,
            |uri| {
                Request::builder()
                    .method(http::Method::GET)
                    .uri(uri)
                    .header(http::header::ACCEPT, "application/json")
                    .body(Vec::new())
                    .map_err(|e| HttpError::InvalidRequest(e.to_string()))
            },
        );
        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                atlas_log!(warn,
                    name: "SubscriptionManager.refresh",
                    uri = self.config_uri.clone(),
                    status = r.status().as_u16()
                );
                return;
            }
            Err(e) => {
                atlas_log!(warn,
                    name: "SubscriptionManager.refresh",
                    uri = self.config_uri.clone(),
                    error = e.to_string()
                );
                return;
            }
        };
        match serde_json::from_slice::<Subscriptions>(response.body()) {
            Ok(subs) => self.update(subs.expressions),
            Err(e) => {
                atlas_log!(warn,
                    name: "SubscriptionManager.refresh",
                    uri = self.config_uri.clone(),
                    error = e.to_string()
                );
            }
        }
    }

    /// Validate definitions and swap in a freshly built index. Expressions
    /// that fail to parse, or whose frequency is not a positive multiple
    /// of the publish step, are dropped with a warning.
    pub fn update(&self, defs: Vec<SubscriptionDef>) {
        let mut index = QueryIndex::new();
        let mut accepted = 0usize;
        for def in defs {
            if def.frequency == 0 || def.frequency % self.publish_step_ms != 0 {
                atlas_log!(warn,
                    name: "SubscriptionManager.invalidFrequency",
                    id = def.id.clone(),
                    frequency = def.frequency,
                    publish_step = self.publish_step_ms
                );
                continue;
            }
            let expr = match parse_data_expr(&def.expression) {
                Ok(expr) => expr,
                Err(e) => {
                    atlas_log!(warn,
                        name: "SubscriptionManager.invalidExpression",
                        id = def.id.clone(),
                        expression = def.expression.clone(),
                        error = e.to_string()
                    );
                    continue;
                }
            };
            let sub = Arc::new(Subscription {
                id: def.id,
                frequency: def.frequency,
                expr,
            });
            index.add(sub.expr.query(), sub.clone());
            accepted += 1;
        }
        atlas_log!(debug, name: "SubscriptionManager.update", accepted = accepted);
        match self.index.write() {
            Ok(mut guard) => *guard = Arc::new(index),
            Err(e) => *e.into_inner() = Arc::new(index),
        }
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("config_uri", &self.config_uri)
            .field("publish_step_ms", &self.publish_step_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_metrics::Id;

    fn def(id: &str, expression: &str, frequency: u64) -> SubscriptionDef {
        SubscriptionDef {
            id: id.to_string(),
            expression: expression.to_string(),
            frequency,
        }
    }

    #[test]
    fn update_builds_matching_index() {
        let manager = SubscriptionManager::new("http://atlas/expressions", 60_000);
        manager.update(vec![
            def("s1", "name,up,:eq,:sum", 60_000),
            def("s2", "name,down,:eq,:sum", 120_000),
        ]);
        let index = manager.index();
        let matches = index.find_matches(&Id::new("up"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "s1");
        assert_eq!(matches[0].frequency, 60_000);
    }

    #[test]
    fn invalid_frequency_is_dropped() {
        let manager = SubscriptionManager::new("http://atlas/expressions", 60_000);
        manager.update(vec![
            def("bad", "name,up,:eq,:sum", 90_000),
            def("zero", "name,up,:eq,:sum", 0),
            def("good", "name,up,:eq,:sum", 60_000),
        ]);
        let matches = manager.index().find_matches(&Id::new("up"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "good");
    }

    #[test]
    fn invalid_expression_is_dropped_but_rest_survive() {
        let manager = SubscriptionManager::new("http://atlas/expressions", 60_000);
        manager.update(vec![
            def("broken", "name,:frobnicate", 60_000),
            def("bad-re", "name,[abc,:re", 60_000),
            def("ok", "name,up,:eq,:sum", 60_000),
        ]);
        let matches = manager.index().find_matches(&Id::new("up"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "ok");
    }

    #[test]
    fn update_swaps_atomically() {
        let manager = SubscriptionManager::new("http://atlas/expressions", 60_000);
        manager.update(vec![def("s1", "name,up,:eq,:sum", 60_000)]);
        let before = manager.index();
        manager.update(vec![def("s2", "name,up,:eq,:max", 60_000)]);
        // the old snapshot still answers with the old subscriptions
        assert_eq!(before.find_matches(&Id::new("up"))[0].id, "s1");
        assert_eq!(manager.index().find_matches(&Id::new("up"))[0].id, "s2");
    }
}
