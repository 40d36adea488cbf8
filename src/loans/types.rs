use crate::error::{AppError, ErrorReport};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_EMPTY_RESULT_POLICY: EmptyResultPolicy = EmptyResultPolicy::Retry;
pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 600_000;
pub const MIN_RETRY_DELAY_MS: u64 = 100;
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;
pub const MAX_RETRIES_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoanId {
    Number(i64),
    Text(String),
}

impl fmt::Display for LoanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl FromStr for LoanId {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AppError::InvalidArgument(
                "loan id must not be empty".to_string(),
            ));
        }
        Ok(match trimmed.parse::<i64>() {
            Ok(number) => Self::Number(number),
            Err(_) => Self::Text(trimmed.to_string()),
        })
    }
}

impl From<i64> for LoanId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

/// One active funding position as served by `GET /api/loans`.
///
/// Records are replaced wholesale on every refresh and never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoanRecord {
    #[serde(alias = "loan_id", alias = "credit_id")]
    pub id: LoanId,
    pub symbol: String,
    pub amount: f64,
    pub rate: f64,
    #[serde(alias = "period_days")]
    pub period_days: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, alias = "created_at")]
    pub created_at: Option<String>,
    #[serde(default, alias = "opening_date")]
    pub opening_date: Option<String>,
    #[serde(default, alias = "last_payout")]
    pub last_payout: Option<String>,
    #[serde(default, alias = "position_pair")]
    pub position_pair: Option<String>,
    #[serde(default, alias = "daily_earnings")]
    pub daily_earnings: Option<f64>,
    #[serde(default, alias = "annual_earnings")]
    pub annual_earnings: Option<f64>,
    #[serde(default, alias = "auto_renew")]
    pub auto_renew: Option<bool>,
}

/// Checks the invariants of one fetched record set: unique ids and finite
/// numeric fields.
pub fn validate_records(records: &[LoanRecord]) -> Result<(), AppError> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert(&record.id) {
            return Err(AppError::MalformedResponse(format!(
                "duplicate loan id {} in record set",
                record.id
            )));
        }
        if !record.amount.is_finite() || !record.rate.is_finite() {
            return Err(AppError::MalformedResponse(format!(
                "loan {} has a non-finite amount or rate",
                record.id
            )));
        }
        if record.amount < 0.0 {
            return Err(AppError::MalformedResponse(format!(
                "loan {} has a negative amount",
                record.id
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FundingBookEntry {
    pub rate: f64,
    pub period: u32,
    pub count: u32,
    pub amount: f64,
}

#[derive(Debug, Serialize)]
pub struct CloseLoansRequest<'a> {
    pub loan_ids: &'a [LoanId],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloseLoanResult {
    pub loan_id: LoanId,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloseLoansResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub results: Vec<CloseLoanResult>,
}

impl CloseLoansResponse {
    /// Human readable reason for a `success: false` answer.
    pub fn failure_reason(&self) -> String {
        if let Some(message) = self.message.as_ref().or(self.detail.as_ref()) {
            return message.clone();
        }

        let failed: Vec<String> = self
            .results
            .iter()
            .filter(|result| !result.success)
            .map(|result| match &result.message {
                Some(message) => format!("{}: {message}", result.loan_id),
                None => result.loan_id.to_string(),
            })
            .collect();

        if failed.is_empty() {
            "backend reported success=false".to_string()
        } else {
            format!("failed to close {}", failed.join(", "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SymbolFilter {
    #[default]
    All,
    Symbol(String),
}

impl SymbolFilter {
    pub const ALL: &'static str = "all";

    pub fn parse_str(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(Self::ALL) {
            Self::All
        } else {
            Self::Symbol(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::All => Self::ALL,
            Self::Symbol(symbol) => symbol,
        }
    }

    pub fn matches(&self, symbol: &str) -> bool {
        match self {
            Self::All => true,
            Self::Symbol(expected) => expected == symbol,
        }
    }
}

impl From<String> for SymbolFilter {
    fn from(value: String) -> Self {
        Self::parse_str(&value)
    }
}

impl From<SymbolFilter> for String {
    fn from(value: SymbolFilter) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewFilter {
    pub symbol: SymbolFilter,
    pub min_rate: Option<f64>,
}

impl ViewFilter {
    pub fn matches(&self, record: &LoanRecord) -> bool {
        self.symbol.matches(&record.symbol)
            && self.min_rate.map_or(true, |min_rate| record.rate >= min_rate)
    }
}

pub fn normalize_min_rate(min_rate: Option<f64>) -> Result<Option<f64>, AppError> {
    match min_rate {
        Some(value) if !value.is_finite() => Err(AppError::InvalidArgument(
            "minRate must be a finite number".to_string(),
        )),
        other => Ok(other),
    }
}

/// Funding symbols are case sensitive ("fUSD"), so only whitespace is trimmed.
pub fn normalize_book_symbol(symbol: &str) -> Result<String, AppError> {
    let symbol = symbol.trim();
    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(symbol.to_string())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmptyResultPolicy {
    /// Treat an empty loan list as a transient backend hiccup.
    Retry,
    /// Treat an empty loan list as "no active loans".
    Accept,
}

impl EmptyResultPolicy {
    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(Self::Retry),
            "accept" => Ok(Self::Accept),
            other => Err(AppError::InvalidArgument(format!(
                "unknown empty result policy '{other}' (expected retry or accept)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeskArgs {
    pub base_url: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub empty_result_policy: Option<EmptyResultPolicy>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub empty_result_policy: EmptyResultPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            empty_result_policy: DEFAULT_EMPTY_RESULT_POLICY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeskConfig {
    pub base_url: String,
    pub poller: PollerConfig,
}

impl DeskArgs {
    pub fn normalize(self) -> Result<DeskConfig, AppError> {
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AppError::InvalidArgument(
                "baseUrl must start with http:// or https://".to_string(),
            ));
        }

        let poll_interval_ms = self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&poll_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "pollIntervalMs must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS}"
            )));
        }

        let retry_delay_ms = self.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS);
        if !(MIN_RETRY_DELAY_MS..=MAX_RETRY_DELAY_MS).contains(&retry_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "retryDelayMs must be between {MIN_RETRY_DELAY_MS} and {MAX_RETRY_DELAY_MS}"
            )));
        }

        let max_retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        if max_retries > MAX_RETRIES_LIMIT {
            return Err(AppError::InvalidArgument(format!(
                "maxRetries must be at most {MAX_RETRIES_LIMIT}"
            )));
        }

        let empty_result_policy = self
            .empty_result_policy
            .unwrap_or(DEFAULT_EMPTY_RESULT_POLICY);

        Ok(DeskConfig {
            base_url,
            poller: PollerConfig {
                poll_interval: Duration::from_millis(poll_interval_ms),
                retry_delay: Duration::from_millis(retry_delay_ms),
                max_retries,
                empty_result_policy,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PollerState {
    Idle,
    Running,
    Stopped,
}

impl PollerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// What the poller publishes after every lifecycle change or applied
/// resolution.
#[derive(Debug, Clone)]
pub struct PollSnapshot {
    pub state: PollerState,
    pub records: Arc<Vec<LoanRecord>>,
    pub resolved_sequence: Option<u64>,
    pub error: Option<ErrorReport>,
    pub last_success_ms: Option<i64>,
}

impl PollSnapshot {
    pub fn idle() -> Self {
        Self {
            state: PollerState::Idle,
            records: Arc::new(Vec::new()),
            resolved_sequence: None,
            error: None,
            last_success_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViewSummary {
    pub count: usize,
    pub total_amount: f64,
    pub average_rate: Option<f64>,
    pub daily_earnings: f64,
    pub annual_earnings: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSnapshot {
    pub state: PollerState,
    pub filter: ViewFilter,
    pub rows: Vec<LoanRecord>,
    pub selected_ids: Vec<LoanId>,
    pub all_selected: bool,
    pub close_in_flight: bool,
    pub summary: ViewSummary,
    pub symbols: Vec<String>,
    pub fetch_error: Option<ErrorReport>,
    pub command_error: Option<ErrorReport>,
    pub resolved_sequence: Option<u64>,
    pub last_success_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViewPreferencesSnapshot {
    pub filter: ViewFilter,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveViewPreferencesArgs {
    pub symbol: String,
    pub min_rate: Option<f64>,
}

impl SaveViewPreferencesArgs {
    pub fn normalize(self) -> Result<ViewFilter, AppError> {
        Ok(ViewFilter {
            symbol: SymbolFilter::parse_str(&self.symbol),
            min_rate: normalize_min_rate(self.min_rate)?,
        })
    }
}
