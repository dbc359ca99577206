//! The node context: one object owning the handler registry, dedup ledger
//! and peer set, shared by the inbound and outbound paths.

use crate::broadcaster::{Broadcaster, DelayMode, EmitOptions, FanoutMode};
use crate::constants::{gossip, ledger, rate_limit};
use crate::dispatcher::Dispatcher;
use crate::error::SyncError;
use crate::handler_registry::{
    async_handler, callback_handler, sync_handler, EventHandler, HandlerOptions, HandlerRegistry,
    HandlerResult, Responder,
};
use crate::network::client::{HttpPeerClient, PeerTransport};
use crate::network::dedup_ledger::DedupLedger;
use crate::peer_manager::{normalize_peer_address, PeerManager};
use crate::types::{HandlerInput, InboundRecord, PeerOutcome};
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub name: String,
    pub ledger_window: Duration,
    pub rate_window: Duration,
    /// Sent as `source` instead of "self" when set
    pub advertise_address: Option<String>,
    pub delay_mode: DelayMode,
    pub fanout: FanoutMode,
    /// Overrides the adaptive pre-send delay
    pub fixed_delay: Option<Duration>,
    pub suppress_duplicate_handlers: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            name: "dsync".to_string(),
            ledger_window: Duration::from_secs(ledger::WINDOW_SECS),
            rate_window: Duration::from_secs(rate_limit::WINDOW_SECS),
            advertise_address: None,
            delay_mode: DelayMode::default(),
            fanout: FanoutMode::default(),
            fixed_delay: None,
            suppress_duplicate_handlers: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node: String,
    pub prefix: String,
    pub peers: Vec<String>,
    pub ledger_entries: usize,
    pub handlers: usize,
    pub events: Vec<String>,
}

pub struct SyncNode {
    name: String,
    prefix: String,
    registry: Arc<HandlerRegistry>,
    ledger: DedupLedger,
    peers: Arc<PeerManager>,
    dispatcher: Dispatcher,
    broadcaster: Broadcaster,
}

impl SyncNode {
    /// Build a node serving `/{prefix}` and sending through `transport`.
    pub fn new(
        prefix: &str,
        transport: Arc<dyn PeerTransport>,
        options: NodeOptions,
    ) -> Result<Self, SyncError> {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return Err(SyncError::InvalidPrefix);
        }

        let registry = Arc::new(HandlerRegistry::new(options.rate_window));
        let ledger = DedupLedger::new(options.ledger_window);
        let peers = Arc::new(PeerManager::new());

        let dispatcher = Dispatcher::new(registry.clone(), ledger.clone())
            .with_duplicate_suppression(options.suppress_duplicate_handlers);

        let mut broadcaster = Broadcaster::new(ledger.clone(), peers.clone(), transport)
            .with_delay_mode(options.delay_mode)
            .with_fanout(options.fanout);
        if let Some(address) = options.advertise_address.as_deref() {
            broadcaster = broadcaster.with_source_tag(normalize_peer_address(address));
        }
        if let Some(delay) = options.fixed_delay {
            broadcaster = broadcaster.with_fixed_delay(delay);
        }

        Ok(Self {
            name: options.name,
            prefix: prefix.to_string(),
            registry,
            ledger,
            peers,
            dispatcher,
            broadcaster,
        })
    }

    /// Node that talks to peers over HTTP.
    pub fn with_http(
        prefix: &str,
        options: NodeOptions,
        request_timeout: Option<Duration>,
    ) -> Result<Self, SyncError> {
        let timeout =
            request_timeout.unwrap_or(Duration::from_secs(gossip::REQUEST_TIMEOUT_SECS));
        let client = HttpPeerClient::new(prefix, timeout)?;
        Self::new(prefix, Arc::new(client), options)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register an async handler.
    pub fn on<F, Fut>(&self, event: &str, options: HandlerOptions, handler: F)
    where
        F: Fn(HandlerInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register(event, options, async_handler(handler));
    }

    /// Register a handler that returns its value directly.
    pub fn on_sync<F>(&self, event: &str, options: HandlerOptions, handler: F)
    where
        F: Fn(HandlerInput) -> Value + Send + Sync + 'static,
    {
        self.registry.register(event, options, sync_handler(handler));
    }

    /// Register a handler that answers through a [`Responder`].
    pub fn on_callback<F>(&self, event: &str, options: HandlerOptions, handler: F)
    where
        F: Fn(HandlerInput, Responder) + Send + Sync + 'static,
    {
        self.registry.register(event, options, callback_handler(handler));
    }

    pub fn on_handler(&self, event: &str, options: HandlerOptions, handler: Arc<dyn EventHandler>) {
        self.registry.register(event, options, handler);
    }

    pub fn add_peer(&self, address: &str) -> bool {
        self.peers.add_peer(address)
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.peers()
    }

    /// Originate an event and send it to every peer (or `options.peers`).
    pub async fn emit(
        &self,
        event: &str,
        payload: Map<String, Value>,
        options: EmitOptions,
    ) -> Vec<PeerOutcome> {
        self.broadcaster.broadcast(event, payload, options).await
    }

    /// Inbound entry point for the transport layer.
    pub async fn receive(&self, record: InboundRecord, caller: &str) -> Option<Value> {
        self.dispatcher.dispatch(record, caller).await
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn gossip_delay(&self) -> Duration {
        self.broadcaster.delay_for(self.peers.len())
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node: self.name.clone(),
            prefix: self.prefix.clone(),
            peers: self.peers.peers(),
            ledger_entries: self.ledger.len(),
            handlers: self.registry.handler_count(),
            events: self.registry.event_names(),
        }
    }
}
