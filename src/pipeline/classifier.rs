//! Transaction classifier
//!
//! Pure and deterministic: no I/O, same input gives same output.
//!
//! Two separate paths, never mixed:
//! 1. `Matched` - recipient is in the protocol registry
//! 2. `Inferred` - no registry hit, but call-data heuristics suggest DeFi use
//!
//! Anything else is `Unclassified` and contributes nothing.

use super::registry::ProtocolRegistry;
use super::types::{CreditDimension, Transaction, TxFlags, WEI_PER_GWEI};
use serde::Serialize;

/// Weight applied to registry-matched contributions
pub const MATCHED_WEIGHT: u128 = 100;
/// Inferred contributions count for half
pub const INFERRED_WEIGHT: u128 = MATCHED_WEIGHT / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Matched,
    Inferred,
    Unclassified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DimensionContribution {
    pub dimension: CreditDimension,
    pub raw_value: u128,
    pub weight: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub protocol_name: Option<String>,
    pub is_staking: bool,
    pub is_defi: bool,
    pub contributions: Vec<DimensionContribution>,
    pub confidence: Confidence,
}

impl Classification {
    fn unclassified() -> Self {
        Self {
            protocol_name: None,
            is_staking: false,
            is_defi: false,
            contributions: Vec::new(),
            confidence: Confidence::Unclassified,
        }
    }

    /// Copy protocol tag and flags onto the transaction
    pub fn apply_to(&self, tx: &mut Transaction) {
        tx.protocol_name = self.protocol_name.clone();
        tx.flags = TxFlags {
            is_staking: self.is_staking,
            is_defi: self.is_defi,
        };
    }
}

/// Thresholds for the inferred path
#[derive(Debug, Clone, Copy)]
pub struct HeuristicConfig {
    /// Contract calls carrying less than this are treated as token/DeFi ops
    pub small_value_wei: u128,
    /// Contract calls priced above this look like competitive DeFi activity
    pub high_gas_price_wei: u128,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            small_value_wei: 10_000_000_000_000_000, // 0.01 ETH
            high_gas_price_wei: 100 * WEI_PER_GWEI,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionClassifier {
    registry: ProtocolRegistry,
    heuristics: HeuristicConfig,
}

impl TransactionClassifier {
    pub fn new(registry: ProtocolRegistry, heuristics: HeuristicConfig) -> Self {
        Self { registry, heuristics }
    }

    pub fn classify(&self, tx: &Transaction) -> Classification {
        // Reverted calls are not protocol activity
        if tx.is_error {
            return Classification::unclassified();
        }

        let Some(to) = tx.to.as_deref() else {
            return Classification::unclassified();
        };

        if let Some(info) = self.registry.lookup(to) {
            return Classification {
                protocol_name: Some(info.name.to_string()),
                is_staking: info.category.is_staking(),
                is_defi: info.category.is_defi(),
                contributions: vec![DimensionContribution {
                    dimension: info.category.dimension(),
                    raw_value: data_point(tx),
                    weight: MATCHED_WEIGHT,
                }],
                confidence: Confidence::Matched,
            };
        }

        if self.looks_like_defi(tx) {
            return Classification {
                protocol_name: None,
                is_staking: false,
                is_defi: true,
                contributions: vec![DimensionContribution {
                    dimension: CreditDimension::DefiReliability,
                    raw_value: data_point(tx),
                    weight: INFERRED_WEIGHT,
                }],
                confidence: Confidence::Inferred,
            };
        }

        Classification::unclassified()
    }

    fn looks_like_defi(&self, tx: &Transaction) -> bool {
        if !tx.has_call_data() {
            return false;
        }
        tx.value < self.heuristics.small_value_wei || tx.gas_price > self.heuristics.high_gas_price_wei
    }
}

impl Default for TransactionClassifier {
    fn default() -> Self {
        Self::new(ProtocolRegistry::mainnet(), HeuristicConfig::default())
    }
}

/// Value in gwei, floored at 1 so zero-value interactions still register
fn data_point(tx: &Transaction) -> u128 {
    (tx.value / WEI_PER_GWEI).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::registry::ProtocolCategory;

    const USER: &str = "0x9999999999999999999999999999999999999999";
    const UNKNOWN: &str = "0x1234567890123456789012345678901234567890";

    fn tx_to(to: &str, value: u128, gas_price_gwei: u128, input: &str) -> Transaction {
        Transaction::new(
            &format!("0x{}", "ab".repeat(32)),
            USER,
            Some(to),
            value,
            gas_price_gwei * WEI_PER_GWEI,
            100_000,
            1_700_000_000,
            18_000_000,
        )
        .with_input(input)
    }

    #[test]
    fn test_every_registry_entry_matches() {
        let classifier = TransactionClassifier::default();
        let registry = ProtocolRegistry::mainnet();

        for (address, info) in registry.iter() {
            let c = classifier.classify(&tx_to(address, 0, 20, "0xdeadbeef"));
            assert_eq!(c.confidence, Confidence::Matched, "{}", address);
            assert_eq!(c.protocol_name.as_deref(), Some(info.name));
            assert_eq!(c.is_staking, info.category == ProtocolCategory::Staking);
            assert_eq!(c.contributions.len(), 1);
            assert_eq!(c.contributions[0].dimension, info.category.dimension());
            assert_eq!(c.contributions[0].weight, MATCHED_WEIGHT);
        }
    }

    #[test]
    fn test_staking_deposit_value_in_gwei() {
        let classifier = TransactionClassifier::default();
        let tx = tx_to(
            "0x00000000219AB540356cBB839Cbe05303d7705Fa",
            32_000_000_000_000_000_000,
            20,
            "0x22895118",
        );
        let c = classifier.classify(&tx);
        assert!(c.is_staking && c.is_defi);
        assert_eq!(c.contributions[0].raw_value, 32_000_000_000);
    }

    #[test]
    fn test_small_value_contract_call_is_inferred() {
        let classifier = TransactionClassifier::default();
        let c = classifier.classify(&tx_to(UNKNOWN, 0, 20, "0xa9059cbb"));
        assert_eq!(c.confidence, Confidence::Inferred);
        assert!(c.is_defi);
        assert!(c.protocol_name.is_none());
        assert_eq!(c.contributions[0].weight, INFERRED_WEIGHT);
        assert_eq!(c.contributions[0].raw_value, 1);
    }

    #[test]
    fn test_high_gas_contract_call_is_inferred() {
        let classifier = TransactionClassifier::default();
        let c = classifier.classify(&tx_to(UNKNOWN, 5_000_000_000_000_000_000, 250, "0x12345678"));
        assert_eq!(c.confidence, Confidence::Inferred);
    }

    #[test]
    fn test_plain_transfer_is_unclassified() {
        let classifier = TransactionClassifier::default();
        let c = classifier.classify(&tx_to(UNKNOWN, 0, 500, "0x"));
        assert_eq!(c.confidence, Confidence::Unclassified);
        assert!(c.contributions.is_empty());
        assert!(!c.is_defi && !c.is_staking);
    }

    #[test]
    fn test_failed_and_creation_txs_are_unclassified() {
        let classifier = TransactionClassifier::default();
        let mut failed = tx_to("0x7a250d5630b4cf539739df2c5dacb4c659f2488d", 0, 20, "0x38ed1739");
        failed.is_error = true;
        assert_eq!(classifier.classify(&failed).confidence, Confidence::Unclassified);

        let mut creation = tx_to(UNKNOWN, 0, 20, "0x60806040");
        creation.to = None;
        assert_eq!(classifier.classify(&creation).confidence, Confidence::Unclassified);
    }

    #[test]
    fn test_registry_hit_never_falls_through_to_heuristics() {
        // Matches both the registry and the small-value heuristic
        let classifier = TransactionClassifier::default();
        let c = classifier.classify(&tx_to("0xbebc44782c7db0a1a60cb6fe97d0b483032ff1c7", 0, 300, "0x4515cef3"));
        assert_eq!(c.confidence, Confidence::Matched);
        assert_eq!(c.contributions.len(), 1);
        assert_eq!(c.contributions[0].dimension, CreditDimension::LiquidityProvision);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = TransactionClassifier::default();
        let tx = tx_to(UNKNOWN, 1, 20, "0xa9059cbb");
        assert_eq!(classifier.classify(&tx), classifier.classify(&tx));
    }

    #[test]
    fn test_apply_sets_tx_fields() {
        let classifier = TransactionClassifier::default();
        let mut tx = tx_to("0xae7ab96520de3a18e5e111b5eaab095312d7fe84", 1, 20, "0xa1903eab");
        let c = classifier.classify(&tx);
        c.apply_to(&mut tx);
        assert_eq!(tx.protocol_name.as_deref(), Some("Lido"));
        assert!(tx.flags.is_staking);
    }
}
