//! Upstream provider access
//!
//! Everything that talks to an RPC node goes through these pieces:
//!
//! - `rate_limiter` - sliding-window throttle, one per provider
//! - `cache` - TTL request cache
//! - `pool` - primary/fallback selection behind a circuit breaker
//! - `rpc` - ethers-backed `ChainRpc` and the rate-limited transport
//! - `backoff` - bounded exponential retry

pub mod backoff;
pub mod cache;
pub mod pool;
pub mod rate_limiter;
pub mod rpc;

pub use backoff::{retry_with_backoff, ExponentialBackoff};
pub use cache::{CacheStats, RequestCache};
pub use pool::{ProviderPool, ProviderRole, ProviderState, SelectedProvider};
pub use rate_limiter::RateLimiter;
pub use rpc::{ChainRpc, EthRpcProvider, HttpRpcProvider, RateLimited, RpcBlock};
