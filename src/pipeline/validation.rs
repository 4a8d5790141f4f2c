//! Validation gate
//!
//! Structural checks plus a statistical anomaly score per user. The running
//! mean/variance are kept incrementally (Welford), so each call is O(1)
//! regardless of how long the user's history is.

use super::types::{current_timestamp, is_valid_address, is_valid_tx_hash, Transaction, WEI_PER_GWEI};
use serde::Serialize;
use std::collections::HashMap;

/// Below this many samples the anomaly score is 0
pub const MIN_SAMPLES_FOR_SCORING: u64 = 5;

#[derive(Debug, Clone, Copy)]
pub struct ValidationConfig {
    pub max_gas_price_wei: u128,
    pub max_gas_used: u64,
    /// Allowed clock skew for timestamps in the future (seconds)
    pub max_future_skew_secs: i64,
    /// z-score that maps to an anomaly score of 1.0
    pub z_cap: f64,
    pub anomaly_threshold: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_gas_price_wei: 100_000 * WEI_PER_GWEI,
            max_gas_used: 30_000_000,
            max_future_skew_secs: 300,
            z_cap: 4.0,
            anomaly_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// In [0, 1]
    pub anomaly_score: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_anomalous(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Welford running mean / variance
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// |z| of `x`; a flat history treats any deviation as maximal
    fn abs_z(&self, x: f64) -> f64 {
        let sd = self.std_dev();
        let diff = (x - self.mean).abs();
        if sd > f64::EPSILON {
            diff / sd
        } else if diff > f64::EPSILON {
            f64::INFINITY
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UserHistory {
    pub value_ether: RunningStats,
    pub gas_price_gwei: RunningStats,
}

#[derive(Debug, Default)]
pub struct ValidationGate {
    config: ValidationConfig,
    histories: HashMap<String, UserHistory>,
}

impl ValidationGate {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            histories: HashMap::new(),
        }
    }

    pub fn validate(&self, user: &str, tx: &Transaction) -> ValidationResult {
        self.validate_at(user, tx, current_timestamp())
    }

    pub fn validate_at(&self, user: &str, tx: &Transaction, now: i64) -> ValidationResult {
        let mut errors = Vec::new();

        if !is_valid_tx_hash(&tx.hash) {
            errors.push(format!("malformed hash: {}", tx.hash));
        }
        if !is_valid_address(&tx.from) {
            errors.push(format!("malformed sender: {}", tx.from));
        }
        if let Some(to) = &tx.to {
            if !is_valid_address(to) {
                errors.push(format!("malformed recipient: {}", to));
            }
        }
        if tx.gas_price == 0 {
            errors.push("gas price is zero".to_string());
        } else if tx.gas_price > self.config.max_gas_price_wei {
            errors.push(format!("implausible gas price: {} gwei", tx.gas_price / WEI_PER_GWEI));
        }
        if tx.gas_used > self.config.max_gas_used {
            errors.push(format!("implausible gas used: {}", tx.gas_used));
        }
        if tx.timestamp <= 0 {
            errors.push(format!("invalid timestamp: {}", tx.timestamp));
        } else if tx.timestamp > now + self.config.max_future_skew_secs {
            errors.push(format!("timestamp {} is in the future (now {})", tx.timestamp, now));
        }

        if !errors.is_empty() {
            return ValidationResult {
                is_valid: false,
                anomaly_score: 0.0,
                errors,
                warnings: Vec::new(),
            };
        }

        let anomaly_score = self.anomaly_score(user, tx);
        let mut warnings = Vec::new();
        if anomaly_score >= self.config.anomaly_threshold {
            warnings.push(format!(
                "anomalous transaction {} (score {:.2}, value {:.6} ETH, gas {:.1} gwei)",
                tx.hash,
                anomaly_score,
                tx.value_ether(),
                tx.gas_price_gwei()
            ));
        }

        ValidationResult {
            is_valid: true,
            anomaly_score,
            errors,
            warnings,
        }
    }

    /// Fold an accepted transaction into the user's running stats
    pub fn update_user_history(&mut self, user: &str, tx: &Transaction) {
        let history = self.histories.entry(user.to_lowercase()).or_default();
        history.value_ether.push(tx.value_ether());
        history.gas_price_gwei.push(tx.gas_price_gwei());
    }

    pub fn history(&self, user: &str) -> Option<&UserHistory> {
        self.histories.get(&user.to_lowercase())
    }

    fn anomaly_score(&self, user: &str, tx: &Transaction) -> f64 {
        let Some(history) = self.history(user) else {
            return 0.0;
        };
        if history.value_ether.count() < MIN_SAMPLES_FOR_SCORING {
            return 0.0;
        }

        let z = history
            .value_ether
            .abs_z(tx.value_ether())
            .max(history.gas_price_gwei.abs_z(tx.gas_price_gwei()));
        (z / self.config.z_cap).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "0x9999999999999999999999999999999999999999";
    const NOW: i64 = 1_700_000_000;

    fn tx(n: u64, value_wei: u128, gas_gwei: u128) -> Transaction {
        Transaction::new(
            &format!("0x{:064x}", n),
            USER,
            Some("0x1234567890123456789012345678901234567890"),
            value_wei,
            gas_gwei * WEI_PER_GWEI,
            21_000,
            NOW - 1_000 + n as i64,
            18_000_000 + n,
        )
    }

    #[test]
    fn test_welford_matches_direct_computation() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut stats = RunningStats::default();
        for x in xs {
            stats.push(x);
        }
        assert_eq!(stats.count(), 8);
        assert!((stats.mean() - 5.0).abs() < 1e-12);
        // sample variance = 32 / 7
        assert!((stats.variance() - 32.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_structurally_valid_tx_passes() {
        let gate = ValidationGate::default();
        let result = gate.validate_at(USER, &tx(1, 1_000, 20), NOW);
        assert!(result.is_valid);
        assert!(result.errors.is_empty());
        assert_eq!(result.anomaly_score, 0.0);
    }

    #[test]
    fn test_structural_errors_are_collected() {
        let gate = ValidationGate::default();
        let mut bad = tx(1, 1_000, 0);
        bad.hash = "0x1234".to_string();
        bad.gas_used = 40_000_000;
        bad.timestamp = NOW + 3_600;

        let result = gate.validate_at(USER, &bad, NOW);
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 4);
    }

    #[test]
    fn test_small_future_skew_allowed() {
        let gate = ValidationGate::default();
        let mut t = tx(1, 1, 20);
        t.timestamp = NOW + 60;
        assert!(gate.validate_at(USER, &t, NOW).is_valid);
    }

    #[test]
    fn test_no_score_until_enough_history() {
        let mut gate = ValidationGate::default();
        for n in 0..(MIN_SAMPLES_FOR_SCORING - 1) {
            gate.update_user_history(USER, &tx(n, 1_000_000_000_000_000, 20));
        }
        let whale = tx(99, 500_000_000_000_000_000_000, 20);
        assert_eq!(gate.validate_at(USER, &whale, NOW).anomaly_score, 0.0);
    }

    #[test]
    fn test_outlier_value_is_flagged_but_valid() {
        let mut gate = ValidationGate::default();
        for n in 0..20u64 {
            // ~0.1 ETH with a little spread, 20-22 gwei
            let value = 100_000_000_000_000_000 + (n as u128 % 3) * 1_000_000_000_000_000;
            gate.update_user_history(USER, &tx(n, value, 20 + (n as u128 % 3)));
        }

        let normal = gate.validate_at(USER, &tx(50, 101_000_000_000_000_000, 21), NOW);
        assert!(normal.is_valid);
        assert!(normal.anomaly_score < 0.8);
        assert!(!normal.is_anomalous());

        let whale = gate.validate_at(USER, &tx(51, 50_000_000_000_000_000_000, 21), NOW);
        assert!(whale.is_valid);
        assert_eq!(whale.anomaly_score, 1.0);
        assert!(whale.is_anomalous());
    }

    #[test]
    fn test_histories_are_per_user() {
        let mut gate = ValidationGate::default();
        gate.update_user_history(USER, &tx(1, 1, 20));
        assert!(gate.history(USER).is_some());
        assert!(gate.history("0x0000000000000000000000000000000000000001").is_none());
    }
}
