//! Outbound fanout of locally originated events.
//!
//! An emitted event is entered in the dedup ledger as self-sourced before
//! anything is sent, then the broadcaster waits a short adaptive delay so
//! copies of the same event arriving from other peers can land in the ledger.
//! Peers the ledger already lists as a source of the event are skipped.

use crate::constants::{gossip, ledger::SELF_SOURCE};
use crate::network::client::PeerTransport;
use crate::network::dedup_ledger::DedupLedger;
use crate::peer_manager::{normalize_peer_address, PeerManager};
use crate::types::{EventRecord, PeerOutcome};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// When the adaptive delay is derived from the peer count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayMode {
    /// Once, when the node is built
    #[default]
    AtConstruction,
    /// On every emit, from the number of target peers
    PerEmit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    /// One peer at a time, in peer order
    #[default]
    Sequential,
    /// All peers at once; outcomes still come back in peer order
    Concurrent,
}

/// `min(10s, floor(200ms * ln(peers + 1)))`, with an empty peer set counted
/// as one peer.
pub fn gossip_delay(peer_count: usize) -> Duration {
    let peers = peer_count.max(1) as f64;
    let ms = (gossip::BASE_DELAY_MS * (peers + 1.0).ln()).floor() as u64;
    Duration::from_millis(ms.min(gossip::MAX_DELAY_MS))
}

type CompletionCallback = Box<dyn FnOnce(&[PeerOutcome]) + Send>;

/// Per-call knobs for [`Broadcaster::broadcast`].
#[derive(Default)]
pub struct EmitOptions {
    /// Send to these peers instead of the node's peer set
    pub peers: Option<Vec<String>>,
    /// Reuse an existing event id (relaying) instead of minting one
    pub event_id: Option<String>,
    /// Called once with every outcome after all peers were attempted
    pub on_complete: Option<CompletionCallback>,
}

impl EmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.peers = Some(
            peers
                .into_iter()
                .map(|p| normalize_peer_address(p.as_ref()))
                .collect(),
        );
        self
    }

    pub fn event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&[PeerOutcome]) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

pub struct Broadcaster {
    ledger: DedupLedger,
    peers: Arc<PeerManager>,
    transport: Arc<dyn PeerTransport>,
    source_tag: String,
    delay_mode: DelayMode,
    fanout: FanoutMode,
    construction_delay: Duration,
}

impl Broadcaster {
    pub fn new(
        ledger: DedupLedger,
        peers: Arc<PeerManager>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let construction_delay = gossip_delay(peers.len());
        Self {
            ledger,
            peers,
            transport,
            source_tag: SELF_SOURCE.to_string(),
            delay_mode: DelayMode::default(),
            fanout: FanoutMode::default(),
            construction_delay,
        }
    }

    /// Tag sent as `source` on outbound records. Receivers record it in their
    /// ledger, so an address peers know us by lets them skip sending it back.
    pub fn with_source_tag(mut self, tag: impl Into<String>) -> Self {
        self.source_tag = tag.into();
        self
    }

    pub fn with_delay_mode(mut self, mode: DelayMode) -> Self {
        self.delay_mode = mode;
        self
    }

    pub fn with_fanout(mut self, fanout: FanoutMode) -> Self {
        self.fanout = fanout;
        self
    }

    /// Pin the pre-send delay, overriding the adaptive computation.
    pub fn with_fixed_delay(mut self, delay: Duration) -> Self {
        self.construction_delay = delay;
        self.delay_mode = DelayMode::AtConstruction;
        self
    }

    /// Delay the next emit to `target_count` peers would wait.
    pub fn delay_for(&self, target_count: usize) -> Duration {
        match self.delay_mode {
            DelayMode::AtConstruction => self.construction_delay,
            DelayMode::PerEmit => gossip_delay(target_count),
        }
    }

    /// Originate `event` and fan it out. Returns one outcome per peer that was
    /// actually attempted, in peer order.
    pub async fn broadcast(
        &self,
        event: &str,
        payload: Map<String, Value>,
        options: EmitOptions,
    ) -> Vec<PeerOutcome> {
        let EmitOptions {
            peers,
            event_id,
            on_complete,
        } = options;

        let event_id = event_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        // Before the delay, so an echo of our own event is already recognised
        self.ledger.record_seen(&event_id, SELF_SOURCE);

        let targets = peers.unwrap_or_else(|| self.peers.peers());
        let delay = self.delay_for(targets.len());
        debug!(
            "📤 Emitting {} ({}) to {} peer(s) after {:?}",
            event,
            event_id,
            targets.len(),
            delay
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let record = EventRecord {
            event: event.to_string(),
            payload,
            event_id,
            source: self.source_tag.clone(),
        };

        let outcomes = match self.fanout {
            FanoutMode::Sequential => {
                let mut outcomes = Vec::with_capacity(targets.len());
                for peer in &targets {
                    if self.already_has(&record.event_id, peer) {
                        continue;
                    }
                    outcomes.push(self.send_one(peer, &record).await);
                }
                outcomes
            }
            FanoutMode::Concurrent => {
                let sends = targets
                    .iter()
                    .filter(|peer| !self.already_has(&record.event_id, peer))
                    .map(|peer| self.send_one(peer, &record));
                join_all(sends).await
            }
        };

        let failed = outcomes.iter().filter(|o| !o.is_delivered()).count();
        info!(
            "📡 {} ({}) delivered to {}/{} peer(s)",
            record.event,
            record.event_id,
            outcomes.len() - failed,
            outcomes.len()
        );

        if let Some(callback) = on_complete {
            callback(&outcomes);
        }
        outcomes
    }

    fn already_has(&self, event_id: &str, peer: &str) -> bool {
        let seen = self.ledger.has_seen_from(event_id, peer);
        if seen {
            debug!("⏭️  Skipping {} for {}: already seen from it", peer, event_id);
        }
        seen
    }

    async fn send_one(&self, peer: &str, record: &EventRecord) -> PeerOutcome {
        match self.transport.send(peer, record).await {
            Ok(data) => PeerOutcome::delivered(peer, data),
            Err(e) => {
                warn!("⚠️  Failed to send {} to {}: {}", record.event_id, peer, e);
                PeerOutcome::failed(peer, e.to_string())
            }
        }
    }
}
