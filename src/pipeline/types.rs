//! Core pipeline types
//!
//! `Transaction` is created by the history fetcher (or block watcher),
//! enriched by the classifier, then turned into `CreditDimensionUpdate`s once
//! it passes validation.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

pub const WEI_PER_ETHER: f64 = 1e18;
pub const WEI_PER_GWEI: u128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFlags {
    pub is_staking: bool,
    pub is_defi: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    /// None for contract creation
    pub to: Option<String>,
    /// Wei
    pub value: u128,
    /// Wei
    pub gas_price: u128,
    pub gas_used: u64,
    /// Unix seconds
    pub timestamp: i64,
    pub block_number: u64,
    /// First 4 bytes of call data, `0x`-prefixed; None for plain transfers
    pub method_id: Option<String>,
    pub is_error: bool,
    pub protocol_name: Option<String>,
    pub flags: TxFlags,
}

impl Transaction {
    /// Build a transaction with normalized (lowercase) hash and addresses
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hash: &str,
        from: &str,
        to: Option<&str>,
        value: u128,
        gas_price: u128,
        gas_used: u64,
        timestamp: i64,
        block_number: u64,
    ) -> Self {
        Self {
            hash: hash.trim().to_lowercase(),
            from: from.trim().to_lowercase(),
            to: to
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty()),
            value,
            gas_price,
            gas_used,
            timestamp,
            block_number,
            method_id: None,
            is_error: false,
            protocol_name: None,
            flags: TxFlags::default(),
        }
    }

    /// Attach call data; only the 4-byte selector is kept
    pub fn with_input(mut self, input: &str) -> Self {
        self.method_id = method_id_from_input(input);
        self
    }

    pub fn has_call_data(&self) -> bool {
        self.method_id.is_some()
    }

    pub fn value_ether(&self) -> f64 {
        self.value as f64 / WEI_PER_ETHER
    }

    pub fn gas_price_gwei(&self) -> f64 {
        self.gas_price as f64 / WEI_PER_GWEI as f64
    }

    /// Does this transaction touch `address` (already lowercase)?
    pub fn involves(&self, address: &str) -> bool {
        self.from == address || self.to.as_deref() == Some(address)
    }
}

pub fn method_id_from_input(input: &str) -> Option<String> {
    input
        .trim()
        .trim_start_matches("0x")
        .get(..8)
        .filter(|d| d.chars().all(|c| c.is_ascii_hexdigit()))
        .map(|d| format!("0x{}", d.to_lowercase()))
}

/// One scored axis of on-chain behaviour. The discriminant is the
/// contract's `dimensionIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditDimension {
    DefiReliability = 0,
    TradingConsistency = 1,
    StakingCommitment = 2,
    GovernanceParticipation = 3,
    LiquidityProvision = 4,
}

impl CreditDimension {
    pub const ALL: [CreditDimension; 5] = [
        CreditDimension::DefiReliability,
        CreditDimension::TradingConsistency,
        CreditDimension::StakingCommitment,
        CreditDimension::GovernanceParticipation,
        CreditDimension::LiquidityProvision,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }
}

impl std::fmt::Display for CreditDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CreditDimension::DefiReliability => "defi_reliability",
            CreditDimension::TradingConsistency => "trading_consistency",
            CreditDimension::StakingCommitment => "staking_commitment",
            CreditDimension::GovernanceParticipation => "governance_participation",
            CreditDimension::LiquidityProvision => "liquidity_provision",
        };
        f.write_str(s)
    }
}

/// Pending write for one (user, dimension). `raw_data_points` and `weights`
/// always have the same length; fields are private to keep it that way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditDimensionUpdate {
    user_address: String,
    dimension: CreditDimension,
    raw_data_points: Vec<u128>,
    weights: Vec<u128>,
}

impl CreditDimensionUpdate {
    pub fn new(
        user_address: &str,
        dimension: CreditDimension,
        raw_data_points: Vec<u128>,
        weights: Vec<u128>,
    ) -> PipelineResult<Self> {
        if raw_data_points.len() != weights.len() {
            return Err(PipelineError::Validation(vec![format!(
                "raw_data_points ({}) and weights ({}) length mismatch",
                raw_data_points.len(),
                weights.len()
            )]));
        }
        Ok(Self {
            user_address: user_address.to_lowercase(),
            dimension,
            raw_data_points,
            weights,
        })
    }

    pub fn single(user_address: &str, dimension: CreditDimension, raw: u128, weight: u128) -> Self {
        Self {
            user_address: user_address.to_lowercase(),
            dimension,
            raw_data_points: vec![raw],
            weights: vec![weight],
        }
    }

    pub fn user_address(&self) -> &str {
        &self.user_address
    }

    pub fn dimension(&self) -> CreditDimension {
        self.dimension
    }

    pub fn raw_data_points(&self) -> &[u128] {
        &self.raw_data_points
    }

    pub fn weights(&self) -> &[u128] {
        &self.weights
    }

    pub fn key(&self) -> (String, CreditDimension) {
        (self.user_address.clone(), self.dimension)
    }

    pub fn len(&self) -> usize {
        self.raw_data_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_data_points.is_empty()
    }

    /// Append `other`'s points after ours, preserving arrival order
    pub fn merge(&mut self, other: &CreditDimensionUpdate) {
        debug_assert_eq!(self.key(), other.key());
        self.raw_data_points.extend_from_slice(&other.raw_data_points);
        self.weights.extend_from_slice(&other.weights);
    }
}

pub fn is_valid_address(s: &str) -> bool {
    is_hex_of_len(s, 40)
}

pub fn is_valid_tx_hash(s: &str) -> bool {
    is_hex_of_len(s, 64)
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.strip_prefix("0x")
        .map(|d| d.len() == len && d.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
