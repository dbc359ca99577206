pub mod client;
pub mod dedup_ledger;
pub mod rate_limiter;
pub mod server;
