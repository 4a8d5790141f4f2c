//! # Credit ingestion pipeline
//!
//! ```text
//! HistoryFetcher / BlockWatcher
//!         |
//!   AddressWorker (one per watched address)
//!         |  classify -> validate -> update history
//!   AggregationQueue (real-time or batched)
//!         |
//!   ContractUpdater --(exhausted)--> DeadLetterStore
//!         |
//!   ScoringContract
//! ```
//!
//! ## Module Organization
//!
//! - `types` - Transaction, CreditDimension, CreditDimensionUpdate
//! - `registry` - static protocol address table
//! - `classifier` - pure tx -> protocol / dimension mapping
//! - `validation` - structural checks and per-user anomaly scoring
//! - `queue` - aggregation queue and the `BatchSubmitter` seam
//! - `updater` - merge, profile check, submit, dead-letter
//! - `contract` - scoring contract interface and its ethers binding
//! - `dead_letter` - SQLite store for exhausted updates
//! - `metrics` - counters and gauges
//! - `summary` - per-address activity summary
//! - `worker` - per-address worker task
//! - `watcher` - new-block polling and dispatch

pub mod classifier;
pub mod contract;
pub mod dead_letter;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod summary;
pub mod types;
pub mod updater;
pub mod validation;
pub mod watcher;
pub mod worker;

// Re-export commonly used types
pub use classifier::{Classification, Confidence, TransactionClassifier};
pub use contract::{EthScoringContract, ScoringContract};
pub use dead_letter::{DeadLetterEntry, DeadLetterStore, SqliteDeadLetterStore};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use queue::{AggregationQueue, BatchSubmitter, QueueMode};
pub use registry::ProtocolRegistry;
pub use summary::ActivitySummary;
pub use types::{CreditDimension, CreditDimensionUpdate, Transaction};
pub use updater::ContractUpdater;
pub use validation::{ValidationConfig, ValidationGate, ValidationResult};
pub use watcher::BlockWatcher;
pub use worker::AddressWorker;
