//! Inbound dispatch: one event record in, at most one response out.
//!
//! Every matching handler runs (unless its rate gate turns it away), but only
//! the first result becomes the response. Each handler is polled once inline,
//! in registration order, so handlers that finish without suspending resolve
//! in that order. Anything still pending is moved to its own task and races
//! for the response slot; losers keep running to completion and their results
//! are dropped.

use crate::constants::{ledger::UNKNOWN_SOURCE, responses};
use crate::error::HandlerError;
use crate::handler_registry::{HandlerRegistry, HandlerResult};
use crate::network::dedup_ledger::DedupLedger;
use crate::types::{error_response, rate_limit_response, HandlerInput, InboundRecord};
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    ledger: DedupLedger,
    suppress_duplicate_handlers: bool,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, ledger: DedupLedger) -> Self {
        Self {
            registry,
            ledger,
            suppress_duplicate_handlers: false,
        }
    }

    /// When set, a repeated sighting of an event id is recorded but no
    /// handler runs for it and the response is empty.
    pub fn with_duplicate_suppression(mut self, suppress: bool) -> Self {
        self.suppress_duplicate_handlers = suppress;
        self
    }

    /// Handle one inbound record from `caller` (the rate-limit key).
    /// `None` is the empty response.
    pub async fn dispatch(&self, record: InboundRecord, caller: &str) -> Option<Value> {
        let Some(event_id) = record.event_id.filter(|id| !id.is_empty()) else {
            debug!("❌ Rejected inbound event from {}: no eventId", caller);
            return Some(error_response(responses::MISSING_EVENT_ID));
        };

        let payload = match record.payload {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                debug!("❌ Rejected inbound event {} from {}: payload not an object", event_id, caller);
                return Some(error_response(responses::PAYLOAD_NOT_OBJECT));
            }
        };

        let event = record.event.unwrap_or_default();
        let source = record
            .source
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNKNOWN_SOURCE.to_string());

        let first_sighting = self.ledger.record_seen(&event_id, &source);
        if !first_sighting && self.suppress_duplicate_handlers {
            debug!("🔁 Duplicate {} ({}) from {}, handlers skipped", event, event_id, source);
            return None;
        }

        let handlers = self.registry.handlers_for(&event);
        debug!(
            "📥 {} ({}) from {} via {}: {} handler(s)",
            event,
            event_id,
            source,
            caller,
            handlers.len()
        );

        let mut response: Option<Value> = None;
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        let mut pending = 0usize;

        for registration in handlers {
            let decision = registration.check_rate(caller);

            if decision.is_limited() && !registration.options().handle_rate_limit {
                warn!(
                    "🚦 Rate limit hit for '{}' from {} (ip: {}, global: {})",
                    registration.event(),
                    caller,
                    decision.ip_rate_limited,
                    decision.rate_limited
                );
                if response.is_none() {
                    response = Some(rate_limit_response(
                        decision.ip_rate_limited,
                        decision.rate_limited,
                        caller,
                    ));
                }
                continue;
            }

            let input = HandlerInput {
                event: event.clone(),
                event_id: event_id.clone(),
                source: source.clone(),
                payload: payload.clone(),
                ip_rate_limited: decision.ip_rate_limited,
                rate_limited: decision.rate_limited,
                rate_limited_ip: caller.to_string(),
            };

            let handler = registration.handler();
            let call: BoxFuture<'static, HandlerResult> =
                Box::pin(async move { handler.handle(input).await });
            let mut guarded = AssertUnwindSafe(call).catch_unwind();

            match (&mut guarded).now_or_never() {
                Some(outcome) => {
                    let value = into_response(outcome);
                    if response.is_none() {
                        response = Some(value);
                    }
                }
                None => {
                    pending += 1;
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let value = into_response(guarded.await);
                        // Receiver is gone once someone else won; that's fine
                        let _ = tx.send(value);
                    });
                }
            }
        }
        drop(tx);

        if response.is_some() || pending == 0 {
            return response;
        }

        // First pending handler to finish wins
        rx.recv().await
    }
}

fn into_response(outcome: Result<HandlerResult, Box<dyn Any + Send>>) -> Value {
    match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!("⚠️  Handler failed: {}", e);
            error_response(e.to_string())
        }
        Err(panic) => {
            let e = HandlerError::Panicked(panic_message(panic.as_ref()));
            warn!("⚠️  {}", e);
            error_response(e.to_string())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_registry::{async_handler, callback_handler, sync_handler, HandlerOptions};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn setup() -> (Arc<HandlerRegistry>, DedupLedger) {
        (
            Arc::new(HandlerRegistry::new(Duration::from_secs(60))),
            DedupLedger::new(Duration::from_secs(60)),
        )
    }

    fn record(event: &str, id: &str) -> InboundRecord {
        InboundRecord {
            event: Some(event.to_string()),
            payload: Some(json!({ "n": 1 })),
            event_id: Some(id.to_string()),
            source: Some("http://a".to_string()),
        }
    }

    #[tokio::test]
    async fn test_missing_event_id_rejected_without_ledger_mutation() {
        let (registry, ledger) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register(
            "ping",
            HandlerOptions::new(),
            sync_handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                json!("pong")
            }),
        );
        let dispatcher = Dispatcher::new(registry, ledger.clone());

        let mut rec = record("ping", "");
        rec.event_id = None;
        let response = dispatcher.dispatch(rec, "10.0.0.1").await;
        assert_eq!(response, Some(json!({ "error": "Missing eventId" })));

        let response = dispatcher.dispatch(record("ping", ""), "10.0.0.1").await;
        assert_eq!(response, Some(json!({ "error": "Missing eventId" })));

        assert!(ledger.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_object_payload_rejected() {
        let (registry, ledger) = setup();
        let dispatcher = Dispatcher::new(registry, ledger.clone());

        let mut rec = record("ping", "e1");
        rec.payload = Some(json!([1, 2]));
        let response = dispatcher.dispatch(rec, "10.0.0.1").await;
        assert_eq!(response, Some(json!({ "error": "Payload must be an object" })));
        assert!(!ledger.contains("e1"));
    }

    #[tokio::test]
    async fn test_records_source_or_unknown() {
        let (registry, ledger) = setup();
        let dispatcher = Dispatcher::new(registry, ledger.clone());

        dispatcher.dispatch(record("ping", "e1"), "10.0.0.1").await;
        let mut anonymous = record("ping", "e1");
        anonymous.source = None;
        dispatcher.dispatch(anonymous, "10.0.0.1").await;

        assert!(ledger.has_seen_from("e1", "http://a"));
        assert!(ledger.has_seen_from("e1", "unknown"));
    }

    #[tokio::test]
    async fn test_no_handlers_gives_empty_response() {
        let (registry, ledger) = setup();
        let dispatcher = Dispatcher::new(registry, ledger);
        assert_eq!(dispatcher.dispatch(record("nobody", "e1"), "10.0.0.1").await, None);
    }

    #[tokio::test]
    async fn test_handler_sees_payload_and_flags() {
        let (registry, ledger) = setup();
        registry.register(
            "ping",
            HandlerOptions::new(),
            sync_handler(|input| input.to_value()),
        );
        let dispatcher = Dispatcher::new(registry, ledger);

        let response = dispatcher
            .dispatch(record("ping", "e1"), "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(
            response,
            json!({
                "n": 1,
                "ipRateLimited": false,
                "rateLimited": false,
                "rateLimitedIP": "10.0.0.1"
            })
        );
    }

    #[tokio::test]
    async fn test_handlers_run_on_every_delivery() {
        let (registry, ledger) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register(
            "ping",
            HandlerOptions::new(),
            sync_handler(move |_| json!(counter.fetch_add(1, Ordering::SeqCst))),
        );
        let dispatcher = Dispatcher::new(registry, ledger);

        dispatcher.dispatch(record("ping", "e1"), "10.0.0.1").await;
        dispatcher.dispatch(record("ping", "e1"), "10.0.0.1").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_suppression_opt_in() {
        let (registry, ledger) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register(
            "ping",
            HandlerOptions::new(),
            sync_handler(move |_| json!(counter.fetch_add(1, Ordering::SeqCst))),
        );
        let dispatcher = Dispatcher::new(registry, ledger.clone()).with_duplicate_suppression(true);

        assert_eq!(dispatcher.dispatch(record("ping", "e1"), "10.0.0.1").await, Some(json!(0)));
        let mut relayed = record("ping", "e1");
        relayed.source = Some("http://b".to_string());
        assert_eq!(dispatcher.dispatch(relayed, "10.0.0.2").await, None);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The repeat sighting is still recorded
        assert!(ledger.has_seen_from("e1", "http://b"));
    }

    #[tokio::test]
    async fn test_first_sync_handler_wins() {
        let (registry, ledger) = setup();
        registry.register("ping", HandlerOptions::new(), sync_handler(|_| json!("first")));
        registry.register("ping", HandlerOptions::new(), sync_handler(|_| json!("second")));
        let dispatcher = Dispatcher::new(registry, ledger);

        assert_eq!(
            dispatcher.dispatch(record("ping", "e1"), "10.0.0.1").await,
            Some(json!("first"))
        );
    }

    #[tokio::test]
    async fn test_immediate_result_beats_pending_one() {
        let (registry, ledger) = setup();
        registry.register(
            "ping",
            HandlerOptions::new(),
            async_handler(|_| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!("slow"))
            }),
        );
        registry.register(
            "ping",
            HandlerOptions::new(),
            callback_handler(|_, responder| responder.respond(json!("callback"))),
        );
        let dispatcher = Dispatcher::new(registry, ledger);

        assert_eq!(
            dispatcher.dispatch(record("ping", "e1"), "10.0.0.1").await,
            Some(json!("callback"))
        );
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_result() {
        let (registry, ledger) = setup();
        registry.register(
            "ping",
            HandlerOptions::new(),
            async_handler(|_| async move { Err(HandlerError::failed("database down")) }),
        );
        let dispatcher = Dispatcher::new(registry, ledger);

        assert_eq!(
            dispatcher.dispatch(record("ping", "e1"), "10.0.0.1").await,
            Some(json!({ "error": "database down" }))
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_others() {
        let (registry, ledger) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register(
            "ping",
            HandlerOptions::new(),
            sync_handler(|_| panic!("handler exploded")),
        );
        registry.register(
            "ping",
            HandlerOptions::new(),
            sync_handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                json!("ok")
            }),
        );
        let dispatcher = Dispatcher::new(registry, ledger);

        let response = dispatcher.dispatch(record("ping", "e1"), "10.0.0.1").await;
        assert_eq!(
            response,
            Some(json!({ "error": "Handler panicked: handler exploded" }))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_handler_skipped_and_later_handlers_run() {
        let (registry, ledger) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register(
            "ping",
            HandlerOptions::new().request_limit(1),
            sync_handler(|_| json!("limited")),
        );
        registry.register(
            "ping",
            HandlerOptions::new(),
            sync_handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                json!("open")
            }),
        );
        let dispatcher = Dispatcher::new(registry, ledger);

        assert_eq!(
            dispatcher.dispatch(record("ping", "e1"), "10.0.0.1").await,
            Some(json!("limited"))
        );
        // Rate-limit response takes the slot; the open handler still runs
        assert_eq!(
            dispatcher.dispatch(record("ping", "e2"), "10.0.0.9").await,
            Some(json!({
                "error": "Rate limit exceeded",
                "ipRateLimited": false,
                "rateLimited": true,
                "rateLimitedIP": "10.0.0.9"
            }))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handle_rate_limit_passes_flags() {
        let (registry, ledger) = setup();
        registry.register(
            "ping",
            HandlerOptions::new().ip_request_limit(1).handle_rate_limit(true),
            sync_handler(|input| {
                json!({ "limited": input.ip_rate_limited, "ip": input.rate_limited_ip })
            }),
        );
        let dispatcher = Dispatcher::new(registry, ledger);

        assert_eq!(
            dispatcher.dispatch(record("ping", "e1"), "10.0.0.1").await,
            Some(json!({ "limited": false, "ip": "10.0.0.1" }))
        );
        assert_eq!(
            dispatcher.dispatch(record("ping", "e2"), "10.0.0.1").await,
            Some(json!({ "limited": true, "ip": "10.0.0.1" }))
        );
    }
}
