//! Block-explorer indexer API (Etherscan-compatible `txlist`)
//!
//! ## API Reference
//!
//! `GET {base}?module=account&action=txlist&address=..&page=..&offset=..&sort=asc|desc&apikey=..`
//!
//! Returns `{status, message, result}`. All numeric fields in `result` rows
//! are decimal strings. `status == "0"` with message `No transactions found`
//! is an empty page, not an error.

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::types::Transaction;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub address: String,
    /// 1-based
    pub page: u32,
    /// Page size
    pub offset: u32,
    pub sort: SortOrder,
}

impl PageQuery {
    pub fn cache_key(&self) -> String {
        format!(
            "txlist:{}:{}:{}:{}",
            self.address,
            self.sort.as_str(),
            self.page,
            self.offset
        )
    }
}

#[async_trait]
pub trait IndexerApi: Send + Sync {
    /// One page of normal transactions. Unparseable rows are dropped.
    async fn fetch_page(&self, query: &PageQuery) -> PipelineResult<Vec<Transaction>>;
}

#[derive(Debug, Deserialize)]
struct IndexerResponse {
    status: String,
    message: String,
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexerTx {
    hash: String,
    from: String,
    #[serde(default)]
    to: String,
    value: String,
    gas_price: String,
    gas_used: String,
    time_stamp: String,
    block_number: String,
    #[serde(default)]
    input: String,
    #[serde(default)]
    is_error: String,
}

pub struct EtherscanIndexer {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl EtherscanIndexer {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> PipelineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl IndexerApi for EtherscanIndexer {
    async fn fetch_page(&self, query: &PageQuery) -> PipelineResult<Vec<Transaction>> {
        let page = query.page.to_string();
        let offset = query.offset.to_string();
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("module", "account"),
                ("action", "txlist"),
                ("address", query.address.as_str()),
                ("page", page.as_str()),
                ("offset", offset.as_str()),
                ("sort", query.sort.as_str()),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(PipelineError::TransientNetwork(format!("indexer returned {}", status)));
        }
        if !status.is_success() {
            return Err(PipelineError::Indexer(format!("indexer returned {}", status)));
        }

        let body: Value = response.json().await?;
        parse_txlist(body)
    }
}

/// Decode a `txlist` response body
pub fn parse_txlist(body: Value) -> PipelineResult<Vec<Transaction>> {
    let response: IndexerResponse = serde_json::from_value(body)?;

    if response.status != "1" {
        if response.message.starts_with("No transactions found") {
            return Ok(Vec::new());
        }
        let detail = response.result.as_str().unwrap_or_default().to_string();
        // Free-tier throttling comes back as a 200 with status 0
        if detail.to_lowercase().contains("rate limit") {
            return Err(PipelineError::TransientNetwork(detail));
        }
        return Err(PipelineError::Indexer(format!("{}: {}", response.message, detail)));
    }

    let rows = match response.result {
        Value::Array(rows) => rows,
        other => {
            return Err(PipelineError::Decode(format!(
                "txlist result is not an array: {}",
                other
            )))
        }
    };

    let mut transactions = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_value::<IndexerTx>(row) {
            Ok(raw) => match raw.into_transaction() {
                Ok(tx) => transactions.push(tx),
                Err(e) => log::warn!("⚠️  Dropping indexer row: {}", e),
            },
            Err(e) => log::warn!("⚠️  Dropping malformed indexer row: {}", e),
        }
    }
    Ok(transactions)
}

impl IndexerTx {
    fn into_transaction(self) -> PipelineResult<Transaction> {
        let value = parse_decimal::<u128>("value", &self.value, &self.hash)?;
        let gas_price = parse_decimal::<u128>("gasPrice", &self.gas_price, &self.hash)?;
        let gas_used = parse_decimal::<u64>("gasUsed", &self.gas_used, &self.hash)?;
        let timestamp = parse_decimal::<i64>("timeStamp", &self.time_stamp, &self.hash)?;
        let block_number = parse_decimal::<u64>("blockNumber", &self.block_number, &self.hash)?;

        let to = (!self.to.is_empty()).then_some(self.to.as_str());
        let mut tx = Transaction::new(
            &self.hash,
            &self.from,
            to,
            value,
            gas_price,
            gas_used,
            timestamp,
            block_number,
        )
        .with_input(&self.input);
        tx.is_error = self.is_error == "1";
        Ok(tx)
    }
}

fn parse_decimal<T: std::str::FromStr>(field: &str, raw: &str, hash: &str) -> PipelineResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| PipelineError::Decode(format!("{} {:?} in {}: {}", field, raw, hash, e)))
}
