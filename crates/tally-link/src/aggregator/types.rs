//! Wire types for the aggregation API.
//!
//! Every optional field the aggregator may omit is an explicit
//! `#[serde(default)]` option; nothing here is accessed dynamically.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Balance snapshot for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    /// Funds available for spending, if the institution reports it.
    #[serde(default)]
    pub available: Option<f64>,
    /// Current ledger balance.
    #[serde(default)]
    pub current: Option<f64>,
    /// Credit limit, only present for credit-type accounts.
    #[serde(default)]
    pub limit: Option<f64>,
}

/// Immutable snapshot of one linked account.
///
/// Refreshed wholesale on each successful fetch; never diffed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    #[serde(rename = "account_id")]
    pub id: String,
    pub name: String,
    /// Last 2-4 digits of the account number, as displayed to the user.
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(rename = "type")]
    pub account_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    pub balances: Balances,
}

/// One transaction as reported by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(rename = "transaction_id")]
    pub id: String,
    pub account_id: String,
    pub amount: f64,
    pub date: NaiveDate,
    pub name: String,
    #[serde(default)]
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub category: Option<Vec<String>>,
    #[serde(default)]
    pub pending: bool,
}

/// Response from the link-token mint endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkTokenResponse {
    pub link_token: String,
    #[serde(default)]
    pub expiration: Option<String>,
}

/// Response from the public-token exchange endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResponse {
    pub access_token: String,
    pub item_id: String,
}

/// One page of a cursor-paginated transaction sync.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionsPage {
    #[serde(default)]
    pub transactions: Vec<TransactionRecord>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// Inclusive date range for a transaction fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }
}
