//! Chain RPC access
//!
//! `ChainRpc` is the seam the `ProviderPool` and the RPC-fallback scan work
//! against. `EthRpcProvider` implements it on an ethers `Provider`, and
//! `RateLimited` wraps any ethers transport so every JSON-RPC request it
//! carries takes a slot from a shared `RateLimiter`.
//!
//! ## Methods used
//!
//! - `eth_blockNumber` - liveness check and scan anchor
//! - `eth_getBlockByNumber(number, true)` - fallback history scan and live blocks
//! - `eth_getBalance(address, "latest")`

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::types::Transaction;
use crate::provider::rate_limiter::RateLimiter;
use async_trait::async_trait;
use ethers::providers::{Http, JsonRpcClient, Middleware, Provider, ProviderError};
use ethers::types::{Address, Block, U256};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Human-readable label for logs (never the full URL, it may carry a key)
    fn name(&self) -> &str;

    async fn get_block_number(&self) -> PipelineResult<u64>;

    async fn get_block_with_txs(&self, number: u64) -> PipelineResult<Option<RpcBlock>>;

    async fn get_balance(&self, address: &str) -> PipelineResult<u128>;
}

/// Block with its transactions already in pipeline form
#[derive(Debug, Clone, Default)]
pub struct RpcBlock {
    pub number: u64,
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
}

impl RpcBlock {
    /// Blocks do not carry receipts, so gas used is the gas limit here
    pub fn from_ethers(requested: u64, block: &Block<ethers::types::Transaction>) -> Self {
        let number = block.number.map(|n| n.as_u64()).unwrap_or(requested);
        let timestamp = i64::try_from(block.timestamp.low_u64()).unwrap_or(i64::MAX);

        let transactions = block
            .transactions
            .iter()
            .map(|tx| {
                let to = tx.to.map(|to| format!("{:?}", to));
                Transaction::new(
                    &format!("{:?}", tx.hash),
                    &format!("{:?}", tx.from),
                    to.as_deref(),
                    saturating_u128(tx.value),
                    tx.gas_price.map(saturating_u128).unwrap_or(0),
                    tx.gas.min(U256::from(u64::MAX)).as_u64(),
                    timestamp,
                    number,
                )
                .with_input(&tx.input.to_string())
            })
            .collect();

        Self {
            number,
            timestamp,
            transactions,
        }
    }
}

/// Wei amounts never reach 2^128 in practice; clamp rather than fail
pub fn saturating_u128(value: U256) -> u128 {
    if value.bits() > 128 {
        u128::MAX
    } else {
        value.as_u128()
    }
}

/// ethers transport that waits on a shared limiter before every request,
/// including the gas estimation and receipt polling ethers does internally
#[derive(Debug, Clone)]
pub struct RateLimited<P> {
    inner: P,
    limiter: Arc<RateLimiter>,
}

impl<P> RateLimited<P> {
    pub fn new(inner: P, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl<P: JsonRpcClient> JsonRpcClient for RateLimited<P> {
    type Error = P::Error;

    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, Self::Error>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned + Send,
    {
        self.limiter.wait_if_needed().await;
        self.inner.request(method, params).await
    }
}

/// `ChainRpc` over an ethers provider. Every call is bounded by `timeout`.
pub struct EthRpcProvider<P: JsonRpcClient = Http> {
    name: String,
    provider: Provider<P>,
    timeout: Duration,
}

pub type HttpRpcProvider = EthRpcProvider<Http>;

impl EthRpcProvider<Http> {
    pub fn new(name: impl Into<String>, url: &str, timeout: Duration) -> PipelineResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| PipelineError::Config(format!("rpc url: {}", e)))?;
        Ok(Self::with_provider(name, provider, timeout))
    }
}

impl<P: JsonRpcClient> EthRpcProvider<P> {
    pub fn with_provider(name: impl Into<String>, provider: Provider<P>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            provider,
            timeout,
        }
    }

    async fn timed<T>(&self, what: &str, call: impl Future<Output = Result<T, ProviderError>>) -> PipelineResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(_) => Err(PipelineError::TransientNetwork(format!(
                "{} {} timed out after {}ms",
                self.name,
                what,
                self.timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> ChainRpc for EthRpcProvider<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_block_number(&self) -> PipelineResult<u64> {
        let head = self.timed("eth_blockNumber", self.provider.get_block_number()).await?;
        Ok(head.as_u64())
    }

    async fn get_block_with_txs(&self, number: u64) -> PipelineResult<Option<RpcBlock>> {
        let block = self
            .timed("eth_getBlockByNumber", self.provider.get_block_with_txs(number))
            .await?;
        Ok(block.map(|b| RpcBlock::from_ethers(number, &b)))
    }

    async fn get_balance(&self, address: &str) -> PipelineResult<u128> {
        let address: Address = address
            .parse()
            .map_err(|e| PipelineError::Validation(vec![format!("bad address {}: {}", address, e)]))?;
        let balance = self.timed("eth_getBalance", self.provider.get_balance(address, None)).await?;
        Ok(saturating_u128(balance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::MockProvider;
    use ethers::types::{Bytes, H256, U64};

    fn mocked(limiter: Arc<RateLimiter>) -> (EthRpcProvider<RateLimited<MockProvider>>, MockProvider) {
        let mock = MockProvider::new();
        let provider = Provider::new(RateLimited::new(mock.clone(), limiter));
        (EthRpcProvider::with_provider("mock", provider, Duration::from_secs(1)), mock)
    }

    #[test]
    fn test_block_converts_to_pipeline_transactions() {
        let from: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let tx = ethers::types::Transaction {
            hash: H256::repeat_byte(0xaa),
            from,
            to: None,
            value: U256::exp10(18),
            gas_price: Some(U256::from(1_000_000_000u64)),
            gas: U256::from(21_000),
            input: Bytes::from(vec![0xa9, 0x05, 0x9c, 0xbb, 0x00]),
            ..Default::default()
        };
        let block = Block {
            number: Some(U64::from(1_234_567)),
            timestamp: U256::from(1_700_000_000u64),
            transactions: vec![tx],
            ..Default::default()
        };

        let converted = RpcBlock::from_ethers(1_234_567, &block);
        assert_eq!(converted.number, 1_234_567);
        assert_eq!(converted.timestamp, 1_700_000_000);

        let tx = &converted.transactions[0];
        assert_eq!(tx.hash, format!("0x{}", "aa".repeat(32)));
        assert_eq!(tx.from, "0x1111111111111111111111111111111111111111");
        assert_eq!(tx.to, None);
        assert_eq!(tx.value, 1_000_000_000_000_000_000);
        assert_eq!(tx.gas_price, 1_000_000_000);
        assert_eq!(tx.gas_used, 21_000);
        assert_eq!(tx.block_number, 1_234_567);
        assert_eq!(tx.method_id.as_deref(), Some("0xa9059cbb"));
    }

    #[test]
    fn test_eip1559_tx_without_gas_price() {
        let block = Block {
            transactions: vec![ethers::types::Transaction::default()],
            ..Default::default()
        };
        let converted = RpcBlock::from_ethers(7, &block);
        // Pending blocks have no number, fall back to the one asked for
        assert_eq!(converted.number, 7);
        assert_eq!(converted.transactions[0].gas_price, 0);
        assert_eq!(converted.transactions[0].method_id, None);
    }

    #[test]
    fn test_saturating_u128() {
        assert_eq!(saturating_u128(U256::from(42)), 42);
        assert_eq!(saturating_u128(U256::from(u128::MAX)), u128::MAX);
        assert_eq!(saturating_u128(U256::MAX), u128::MAX);
    }

    #[tokio::test]
    async fn test_each_request_takes_a_limiter_slot() {
        let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
        let (provider, mock) = mocked(limiter.clone());

        mock.push::<U64, _>(U64::from(100)).unwrap();
        assert_eq!(provider.get_block_number().await.unwrap(), 100);

        mock.push::<U256, _>(U256::exp10(18)).unwrap();
        let balance = provider
            .get_balance("0x1111111111111111111111111111111111111111")
            .await
            .unwrap();
        assert_eq!(balance, 1_000_000_000_000_000_000);

        assert_eq!(limiter.current_load().await, 2);
    }

    #[tokio::test]
    async fn test_bad_address_rejected_before_any_request() {
        let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
        let (provider, _mock) = mocked(limiter.clone());

        let err = provider.get_balance("0x1234").await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(limiter.current_load().await, 0);
    }
}
