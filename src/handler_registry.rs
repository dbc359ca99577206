//! Event handler registry.
//!
//! Handlers are kept per event name in registration order. Each registration
//! owns its options and its own rate gate; nothing is ever unregistered.
//!
//! A handler produces exactly one result. The three shapes a handler can take
//! (plain return value, completion callback, pending future) are all adapted
//! to [`EventHandler`] so the dispatcher only deals with one async type.

use crate::error::HandlerError;
use crate::network::rate_limiter::{RateDecision, RateGate};
use crate::types::HandlerInput;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

pub type HandlerResult = Result<Value, HandlerError>;

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, input: HandlerInput) -> HandlerResult;
}

/// Per-registration options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Max calls per caller address per window
    #[serde(default)]
    pub ip_request_limit: Option<u32>,
    /// Max calls per window across all callers
    #[serde(default)]
    pub request_limit: Option<u32>,
    /// Run the handler even when limited, passing the flags in its input
    #[serde(default)]
    pub handle_rate_limit: bool,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ip_request_limit(mut self, limit: u32) -> Self {
        self.ip_request_limit = Some(limit);
        self
    }

    pub fn request_limit(mut self, limit: u32) -> Self {
        self.request_limit = Some(limit);
        self
    }

    pub fn handle_rate_limit(mut self, handle: bool) -> Self {
        self.handle_rate_limit = handle;
        self
    }
}

/// Completion handle for callback-style handlers. Consumed on use, so a
/// handler cannot resolve twice.
pub struct Responder {
    tx: oneshot::Sender<HandlerResult>,
}

impl Responder {
    fn new() -> (Self, oneshot::Receiver<HandlerResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn respond(self, value: Value) {
        // Receiver gone means the dispatcher stopped caring; nothing to do
        let _ = self.tx.send(Ok(value));
    }

    pub fn fail(self, error: impl Into<HandlerError>) {
        let _ = self.tx.send(Err(error.into()));
    }
}

/// Pending-computation handler: `|input| async move { Ok(json!(...)) }`
pub struct AsyncFnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for AsyncFnHandler<F>
where
    F: Fn(HandlerInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, input: HandlerInput) -> HandlerResult {
        (self.0)(input).await
    }
}

/// Direct-value handler: `|input| json!(...)`
pub struct SyncFnHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for SyncFnHandler<F>
where
    F: Fn(HandlerInput) -> Value + Send + Sync + 'static,
{
    async fn handle(&self, input: HandlerInput) -> HandlerResult {
        Ok((self.0)(input))
    }
}

/// Callback handler: `|input, responder| responder.respond(json!(...))`
pub struct CallbackHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for CallbackHandler<F>
where
    F: Fn(HandlerInput, Responder) + Send + Sync + 'static,
{
    async fn handle(&self, input: HandlerInput) -> HandlerResult {
        let (responder, rx) = Responder::new();
        (self.0)(input, responder);
        rx.await.unwrap_or(Err(HandlerError::Dropped))
    }
}

pub fn async_handler<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(HandlerInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(AsyncFnHandler(f))
}

pub fn sync_handler<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(HandlerInput) -> Value + Send + Sync + 'static,
{
    Arc::new(SyncFnHandler(f))
}

pub fn callback_handler<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(HandlerInput, Responder) + Send + Sync + 'static,
{
    Arc::new(CallbackHandler(f))
}

/// One handler bound to one event name.
pub struct Registration {
    event: String,
    options: HandlerOptions,
    handler: Arc<dyn EventHandler>,
    gate: Mutex<RateGate>,
}

impl Registration {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    pub fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&self.handler)
    }

    /// Run this registration's rate gate for one call from `caller`.
    pub fn check_rate(&self, caller: &str) -> RateDecision {
        self.gate.lock().check(caller)
    }
}

pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Arc<Registration>>>>,
    rate_window: Duration,
}

impl HandlerRegistry {
    pub fn new(rate_window: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            rate_window,
        }
    }

    /// Append a handler for `event`. Identical registrations are not merged.
    pub fn register(&self, event: &str, options: HandlerOptions, handler: Arc<dyn EventHandler>) {
        let gate = RateGate::new(
            self.rate_window,
            options.ip_request_limit,
            options.request_limit,
        );
        let registration = Arc::new(Registration {
            event: event.to_string(),
            options,
            handler,
            gate: Mutex::new(gate),
        });

        let mut handlers = self.handlers.write();
        let list = handlers.entry(event.to_string()).or_default();
        list.push(registration);
        debug!("📝 Registered handler #{} for '{}'", list.len(), event);
    }

    /// Snapshot of the handlers for `event`, in registration order.
    pub fn handlers_for(&self, event: &str) -> Vec<Arc<Registration>> {
        self.handlers.read().get(event).cloned().unwrap_or_default()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(
            crate::constants::rate_limit::WINDOW_SECS,
        ))
    }
}
