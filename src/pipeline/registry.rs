//! Static protocol registry (Ethereum mainnet)
//!
//! Exact-match lookup keyed by lowercase contract address. Anything not in
//! here is left to the classifier's low-confidence heuristics.

use super::types::CreditDimension;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolCategory {
    Dex,
    Lending,
    Staking,
    Liquidity,
    Governance,
}

impl ProtocolCategory {
    pub fn dimension(self) -> CreditDimension {
        match self {
            ProtocolCategory::Dex => CreditDimension::TradingConsistency,
            ProtocolCategory::Lending => CreditDimension::DefiReliability,
            ProtocolCategory::Staking => CreditDimension::StakingCommitment,
            ProtocolCategory::Liquidity => CreditDimension::LiquidityProvision,
            ProtocolCategory::Governance => CreditDimension::GovernanceParticipation,
        }
    }

    pub fn is_staking(self) -> bool {
        matches!(self, ProtocolCategory::Staking)
    }

    /// Governance calls are protocol activity but not DeFi usage
    pub fn is_defi(self) -> bool {
        !matches!(self, ProtocolCategory::Governance)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub name: &'static str,
    pub category: ProtocolCategory,
}

const MAINNET: &[(&str, &str, ProtocolCategory)] = &[
    ("0x7a250d5630b4cf539739df2c5dacb4c659f2488d", "Uniswap V2", ProtocolCategory::Dex),
    ("0xe592427a0aece92de3edee1f18e0157c05861564", "Uniswap V3", ProtocolCategory::Dex),
    ("0x3fc91a3afd70395cd496c647d5a6cc9d4b2b7fad", "Uniswap Universal Router", ProtocolCategory::Dex),
    ("0xd9e1ce17f2641f24ae83637ab66a2cca9c378b9f", "SushiSwap", ProtocolCategory::Dex),
    ("0x1111111254eeb25477b68fb85ed929f73a960582", "1inch", ProtocolCategory::Dex),
    ("0x7d2768de32b0b80b7a3454c06bdac94a69ddc7a9", "Aave V2", ProtocolCategory::Lending),
    ("0x87870bca3f3fd6335c3f4ce8392d69350b4fa4e2", "Aave V3", ProtocolCategory::Lending),
    ("0x4ddc2d193948926d02f9b1fe9e1daa0718270ed5", "Compound", ProtocolCategory::Lending),
    ("0x3d9819210a31b4961b30ef54be2aed79b9c9cd3b", "Compound", ProtocolCategory::Lending),
    ("0xae7ab96520de3a18e5e111b5eaab095312d7fe84", "Lido", ProtocolCategory::Staking),
    ("0xae78736cd615f374d3085123a210448e74fc6393", "Rocket Pool", ProtocolCategory::Staking),
    ("0x00000000219ab540356cbb839cbe05303d7705fa", "Beacon Deposit", ProtocolCategory::Staking),
    ("0xbebc44782c7db0a1a60cb6fe97d0b483032ff1c7", "Curve", ProtocolCategory::Liquidity),
    ("0xba12222222228d8ba445958a75a0704d566bf2c8", "Balancer", ProtocolCategory::Liquidity),
    ("0xc0da02939e1441f497fd74f78ce7decb17b66529", "Compound Governance", ProtocolCategory::Governance),
    ("0x408ed6354d4973f66138c91495f2f2fcbd8724c3", "Uniswap Governance", ProtocolCategory::Governance),
];

#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    entries: HashMap<String, ProtocolInfo>,
}

impl ProtocolRegistry {
    pub fn mainnet() -> Self {
        Self::from_entries(MAINNET.iter().copied())
    }

    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = (&'a str, &'static str, ProtocolCategory)>,
    ) -> Self {
        let entries = entries
            .into_iter()
            .map(|(address, name, category)| (address.to_lowercase(), ProtocolInfo { name, category }))
            .collect();
        Self { entries }
    }

    pub fn lookup(&self, address: &str) -> Option<&ProtocolInfo> {
        self.entries.get(&address.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ProtocolInfo)> {
        self.entries.iter()
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::mainnet()
    }
}
