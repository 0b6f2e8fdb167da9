// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod ingest;

// ---- Re-exports for stable public API ----
pub use crate::config::geo::GeoTables;
pub use crate::config::IngestConfig;
pub use crate::ingest::fetch::{ConditionalFetcher, FetchResult, HttpTransport, ReqwestTransport};
pub use crate::ingest::quota::QuotaTracker;
pub use crate::ingest::scheduler::{IngestPipeline, PassReport, Scheduler, SourceOutcome};
pub use crate::ingest::store::{EntryFilter, EntryQuery, Store};
