//! Per-address activity summary
//!
//! Aggregate metrics over a user's (backfilled) history, the shape the
//! scoring side consumes. An empty history short-circuits to all-zero
//! metrics without running any protocol detection.

use super::classifier::{Classification, Confidence, TransactionClassifier};
use super::types::{CreditDimension, Transaction};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivitySummary {
    pub address: String,
    pub total_transactions: usize,
    pub failed_transactions: usize,
    /// Wei sent by the address
    pub total_value_sent: u128,
    /// Wei spent on gas (gas_used * gas_price) by the address
    pub total_gas_spent: u128,
    pub first_seen: Option<i64>,
    pub last_seen: Option<i64>,
    /// Distinct UTC days with at least one transaction
    pub active_days: usize,
    pub account_age_days: i64,
    pub staking_transactions: usize,
    pub defi_transactions: usize,
    pub inferred_transactions: usize,
    pub protocols_used: BTreeSet<String>,
    /// Matched/inferred contributions per dimension
    pub dimension_counts: BTreeMap<CreditDimension, usize>,
}

impl ActivitySummary {
    pub fn empty(address: &str) -> Self {
        Self {
            address: address.to_lowercase(),
            ..Self::default()
        }
    }
}

pub fn summarize(address: &str, transactions: &[Transaction], classifier: &TransactionClassifier) -> ActivitySummary {
    summarize_with(address, transactions, |tx| classifier.classify(tx))
}

/// Same as `summarize` with the classification step supplied by the caller
pub fn summarize_with<F>(address: &str, transactions: &[Transaction], mut classify: F) -> ActivitySummary
where
    F: FnMut(&Transaction) -> Classification,
{
    let mut summary = ActivitySummary::empty(address);
    if transactions.is_empty() {
        return summary;
    }

    let address = summary.address.clone();
    let mut days = HashSet::new();

    for tx in transactions {
        summary.total_transactions += 1;
        days.insert(tx.timestamp.div_euclid(SECONDS_PER_DAY));
        summary.first_seen = Some(summary.first_seen.map_or(tx.timestamp, |t| t.min(tx.timestamp)));
        summary.last_seen = Some(summary.last_seen.map_or(tx.timestamp, |t| t.max(tx.timestamp)));

        if tx.from == address {
            summary.total_value_sent = summary.total_value_sent.saturating_add(tx.value);
            summary.total_gas_spent = summary
                .total_gas_spent
                .saturating_add(tx.gas_price.saturating_mul(tx.gas_used as u128));
        }

        if tx.is_error {
            summary.failed_transactions += 1;
            continue;
        }

        let classification = classify(tx);
        if classification.is_staking {
            summary.staking_transactions += 1;
        }
        if classification.is_defi {
            summary.defi_transactions += 1;
        }
        if classification.confidence == Confidence::Inferred {
            summary.inferred_transactions += 1;
        }
        if let Some(name) = classification.protocol_name {
            summary.protocols_used.insert(name);
        }
        for contribution in &classification.contributions {
            *summary.dimension_counts.entry(contribution.dimension).or_default() += 1;
        }
    }

    summary.active_days = days.len();
    if let (Some(first), Some(last)) = (summary.first_seen, summary.last_seen) {
        summary.account_age_days = (last - first) / SECONDS_PER_DAY;
    }
    summary
}
