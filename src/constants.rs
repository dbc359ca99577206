//! Global constants for the dsync gossip node
//!
//! Centralizes protocol magic values so the ledger, rate gate and broadcaster
//! agree on them.

/// Dedup ledger and source tags
pub mod ledger {
    /// How long an event id is remembered after first sighting (1 minute)
    pub const WINDOW_SECS: u64 = 60;

    /// Source tag recorded for events this node originated
    pub const SELF_SOURCE: &str = "self";

    /// Source tag recorded when an inbound record carries no `source`
    pub const UNKNOWN_SOURCE: &str = "unknown";
}

/// Per-handler rate gate
pub mod rate_limit {
    /// Sliding window length for both the per-source and global axes (1 minute)
    pub const WINDOW_SECS: u64 = 60;

    /// Idle per-source buckets are swept at most this often
    pub const CLEANUP_INTERVAL_SECS: u64 = 10;

    /// Key used when the transport cannot tell us who called
    pub const UNKNOWN_CALLER: &str = "unknown";
}

/// Outbound fanout
pub mod gossip {
    /// Base of the adaptive pre-send delay, scaled by ln(peers + 1)
    pub const BASE_DELAY_MS: f64 = 200.0;

    /// Upper bound on the adaptive pre-send delay
    pub const MAX_DELAY_MS: u64 = 10_000;

    /// Default per-call timeout for HTTP peer sends
    pub const REQUEST_TIMEOUT_SECS: u64 = 10;
}

/// Wire-level response messages
pub mod responses {
    pub const MISSING_EVENT_ID: &str = "Missing eventId";
    pub const PAYLOAD_NOT_OBJECT: &str = "Payload must be an object";
    pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";
}

/// HTTP endpoint defaults
pub mod network {
    pub const DEFAULT_PREFIX: &str = "dsync";
    pub const DEFAULT_PORT: u16 = 24180;
}
