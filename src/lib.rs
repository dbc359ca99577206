//! dsync: HTTP event gossip between peers.
//!
//! Every node both receives events (dispatching them to locally registered
//! handlers behind per-handler rate limits) and emits events to its peers.
//! A time-bounded dedup ledger remembers which event ids were seen from which
//! sources, so a node never sends an event back to a peer that already
//! delivered it.
//!
//! ```no_run
//! use dsync::{EmitOptions, HandlerOptions, NodeOptions, SyncNode};
//! use serde_json::{json, Map};
//!
//! # async fn demo() -> Result<(), dsync::SyncError> {
//! let node = SyncNode::with_http("dsync", NodeOptions::default(), None)?;
//! node.on_sync("ping", HandlerOptions::new().ip_request_limit(10), |_| json!("pong"));
//! node.add_peer("http://10.0.0.2:24180");
//! let outcomes = node.emit("ping", Map::new(), EmitOptions::new()).await;
//! # let _ = outcomes;
//! # Ok(())
//! # }
//! ```

pub mod broadcaster;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod handler_registry;
pub mod network;
pub mod node;
pub mod peer_manager;
pub mod shutdown;
pub mod types;

pub use broadcaster::{gossip_delay, DelayMode, EmitOptions, FanoutMode};
pub use error::{AppError, HandlerError, SyncError, TransportError};
pub use handler_registry::{EventHandler, HandlerOptions, HandlerResult, Responder};
pub use network::client::{HttpPeerClient, PeerTransport};
pub use network::dedup_ledger::DedupLedger;
pub use network::server::EventServer;
pub use node::{NodeOptions, NodeStatus, SyncNode};
pub use types::{EventRecord, HandlerInput, InboundRecord, PeerOutcome, PeerResult};
