//! credflow - resilient on-chain activity ingestion for credit scoring
//!
//! Fetches a wallet's transaction history and live blocks, classifies and
//! validates each transaction, and pushes batched credit-dimension updates to
//! a scoring contract. Upstream providers are rate limited, cached and put
//! behind a circuit breaker; failed contract writes end up in a dead-letter
//! store instead of being dropped.

pub mod config;
pub mod error;
pub mod health;
pub mod history;
pub mod pipeline;
pub mod provider;

pub use error::{PipelineError, PipelineResult};
