//! Transaction history retrieval
//!
//! - `indexer` - block-explorer `txlist` client behind the `IndexerApi` trait
//! - `fetcher` - paginated, cached, deduplicated fetch with RPC fallback

pub mod fetcher;
pub mod indexer;

pub use fetcher::{FetchResult, FetchSource, HistoryFetcher};
pub use indexer::{EtherscanIndexer, IndexerApi, PageQuery, SortOrder};
