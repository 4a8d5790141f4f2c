//! Downstream scoring contract
//!
//! `ScoringContract` is the seam the updater works against. `EthScoringContract`
//! binds the deployed contract with `abigen!` over any ethers middleware:
//!
//! - reads (`getProfile`, `getDimension`) are plain `eth_call`s
//! - writes (`createProfile`, `updateDimension`) go out via
//!   `eth_sendTransaction` from a node-managed submitter account and are
//!   awaited until the receipt shows up or the confirmation timeout elapses
//!
//! The binary hands it a `Provider<RateLimited<Http>>` sharing the RPC
//! limiter, so contract traffic counts against the same per-provider budget
//! as history scans.

use super::types::{CreditDimension, CreditDimensionUpdate};
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use ethers::contract::{abigen, ContractCall, ContractError};
use ethers::providers::Middleware;
use ethers::types::{Address, U256, U64};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

abigen!(
    CreditScoring,
    r#"[
        function getProfile(address user) external view returns (bool exists)
        function createProfile(address user) external
        function updateDimension(address user, uint8 dimensionIndex, uint256[] rawDataPoints, uint256[] weights) external
        function getDimension(address user, uint8 dimensionIndex) external view returns (uint256 score, uint256 confidence, uint256 dataPoints)
    ]"#,
);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DimensionScore {
    pub score: U256,
    pub confidence: U256,
    pub data_points: U256,
}

#[async_trait]
pub trait ScoringContract: Send + Sync {
    /// Whether a profile exists for `user`
    async fn get_profile(&self, user: &str) -> PipelineResult<bool>;

    /// Returns the confirmed transaction hash
    async fn create_profile(&self, user: &str) -> PipelineResult<String>;

    /// Returns the confirmed transaction hash
    async fn update_dimension(&self, update: &CreditDimensionUpdate) -> PipelineResult<String>;

    async fn get_dimension(&self, user: &str, dimension: CreditDimension) -> PipelineResult<DimensionScore>;
}

pub struct EthScoringContract<M: Middleware> {
    contract: CreditScoring<M>,
    submitter: Address,
    confirmation_timeout: Duration,
}

impl<M: Middleware + 'static> EthScoringContract<M> {
    pub fn new(
        client: Arc<M>,
        contract_address: &str,
        submitter_address: &str,
        confirmation_timeout: Duration,
    ) -> PipelineResult<Self> {
        Ok(Self {
            contract: CreditScoring::new(parse_address(contract_address)?, client),
            submitter: parse_address(submitter_address)?,
            confirmation_timeout,
        })
    }

    /// `updateDimension` call for one update, not yet sent
    pub fn update_dimension_call(&self, update: &CreditDimensionUpdate) -> PipelineResult<ContractCall<M, ()>> {
        let to_words = |values: &[u128]| values.iter().map(|v| U256::from(*v)).collect::<Vec<_>>();
        Ok(self.contract.update_dimension(
            parse_address(update.user_address())?,
            update.dimension().index(),
            to_words(update.raw_data_points()),
            to_words(update.weights()),
        ))
    }

    /// Send a write and wait for its receipt
    async fn transact(&self, what: &str, call: ContractCall<M, ()>) -> PipelineResult<String> {
        let call = call.from(self.submitter);
        let pending = call.send().await.map_err(|e| write_error(what, e))?;
        let tx_hash = format!("{:?}", pending.tx_hash());

        log::debug!("📤 {} sent: {}", what, tx_hash);

        let receipt = match timeout(self.confirmation_timeout, pending.interval(RECEIPT_POLL_INTERVAL)).await {
            Ok(receipt) => receipt.map_err(PipelineError::from)?,
            Err(_) => {
                return Err(PipelineError::ContractSubmission(format!(
                    "{} {} not confirmed within {}ms",
                    what,
                    tx_hash,
                    self.confirmation_timeout.as_millis()
                )))
            }
        };

        match receipt {
            None => Err(PipelineError::ContractSubmission(format!("{} {} dropped", what, tx_hash))),
            Some(receipt) if receipt.status == Some(U64::zero()) => {
                Err(PipelineError::ContractSubmission(format!("{} {} reverted", what, tx_hash)))
            }
            Some(receipt) => {
                log::debug!(
                    "✅ {} confirmed in block {}",
                    what,
                    receipt.block_number.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string())
                );
                Ok(tx_hash)
            }
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ScoringContract for EthScoringContract<M> {
    async fn get_profile(&self, user: &str) -> PipelineResult<bool> {
        self.contract
            .get_profile(parse_address(user)?)
            .call()
            .await
            .map_err(read_error)
    }

    async fn create_profile(&self, user: &str) -> PipelineResult<String> {
        let call = self.contract.create_profile(parse_address(user)?);
        self.transact("createProfile", call).await
    }

    async fn update_dimension(&self, update: &CreditDimensionUpdate) -> PipelineResult<String> {
        let call = self.update_dimension_call(update)?;
        self.transact("updateDimension", call).await
    }

    async fn get_dimension(&self, user: &str, dimension: CreditDimension) -> PipelineResult<DimensionScore> {
        let (score, confidence, data_points) = self
            .contract
            .get_dimension(parse_address(user)?, dimension.index())
            .call()
            .await
            .map_err(read_error)?;
        Ok(DimensionScore {
            score,
            confidence,
            data_points,
        })
    }
}

fn parse_address(address: &str) -> PipelineResult<Address> {
    address
        .parse()
        .map_err(|e| PipelineError::Validation(vec![format!("bad address {}: {}", address, e)]))
}

fn read_error<M: Middleware>(err: ContractError<M>) -> PipelineError {
    if err.is_revert() {
        PipelineError::Decode(format!("call reverted: {}", err))
    } else {
        PipelineError::TransientNetwork(err.to_string())
    }
}

/// Reverts during gas estimation are submission failures, the rest is transport
fn write_error<M: Middleware>(what: &str, err: ContractError<M>) -> PipelineError {
    if err.is_revert() {
        PipelineError::ContractSubmission(format!("{}: {}", what, err))
    } else {
        PipelineError::TransientNetwork(format!("{}: {}", what, err))
    }
}
