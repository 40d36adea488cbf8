use crate::error::AppError;
use crate::loans::types::{
    validate_records, CloseLoansRequest, CloseLoansResponse, FundingBookEntry, LoanId, LoanRecord,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "X-API-Key";
const MAX_DETAIL_CHARS: usize = 200;

/// Source of the `X-API-Key` credential. The login flow owns the key; the
/// desk only reads it per request.
pub trait CredentialProvider: Send + Sync {
    fn api_key(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct SharedApiKey(Arc<RwLock<Option<String>>>);

impl SharedApiKey {
    pub fn new(api_key: Option<String>) -> Self {
        let key = SharedApiKey::default();
        key.set(api_key);
        key
    }

    pub fn set(&self, api_key: Option<String>) {
        let normalized = api_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        *self.0.write() = normalized;
    }
}

impl CredentialProvider for SharedApiKey {
    fn api_key(&self) -> Option<String> {
        self.0.read().clone()
    }
}

/// The REST collaborator the desk talks to.
#[async_trait]
pub trait LoanBackend: Send + Sync {
    async fn fetch_loans(&self) -> Result<Vec<LoanRecord>, AppError>;

    async fn fetch_funding_book(&self, symbol: &str) -> Result<Vec<FundingBookEntry>, AppError>;

    async fn close_loans(&self, loan_ids: &[LoanId]) -> Result<CloseLoansResponse, AppError>;
}

fn loans_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/loans")
}

fn funding_book_endpoint(base_url: &str, symbol: &str) -> String {
    format!("{base_url}/api/funding-book/{symbol}")
}

fn close_loans_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/loans/close")
}

#[derive(Debug, Deserialize)]
struct ErrorBodyWire {
    detail: Option<String>,
}

/// Pulls a readable message out of an error body: FastAPI style `detail`
/// first, raw text second, the canonical reason last.
fn error_detail(status: StatusCode, mut body: Vec<u8>) -> String {
    let raw_text = String::from_utf8_lossy(&body).trim().to_string();
    if let Ok(ErrorBodyWire {
        detail: Some(detail),
    }) = simd_json::serde::from_slice::<ErrorBodyWire>(&mut body)
    {
        return detail;
    }

    if !raw_text.is_empty() {
        return raw_text.chars().take(MAX_DETAIL_CHARS).collect();
    }

    status
        .canonical_reason()
        .unwrap_or("no response body")
        .to_string()
}

fn status_error(status: StatusCode, body: Vec<u8>) -> AppError {
    match status {
        StatusCode::SERVICE_UNAVAILABLE => {
            AppError::ServiceUnavailable(error_detail(status, body))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::Unauthorized,
        _ => AppError::UnexpectedStatus {
            status: status.as_u16(),
            detail: error_detail(status, body),
        },
    }
}

/// Only the polled loan list retries on 503; for one-shot reads it is a
/// plain unexpected status.
fn terminal_status(error: AppError) -> AppError {
    match error {
        AppError::ServiceUnavailable(detail) => AppError::UnexpectedStatus {
            status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            detail,
        },
        other => other,
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, AppError> {
    let status = response.status();
    let mut body = response.bytes().await?.to_vec();
    if !status.is_success() {
        return Err(status_error(status, body));
    }
    Ok(simd_json::serde::from_slice::<T>(&mut body)?)
}

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpBackend {
    pub fn new(client: Client, base_url: String, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client,
            base_url,
            credentials,
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.credentials.api_key() {
            Some(api_key) => builder.header(API_KEY_HEADER, api_key),
            None => builder,
        }
    }
}

#[async_trait]
impl LoanBackend for HttpBackend {
    async fn fetch_loans(&self) -> Result<Vec<LoanRecord>, AppError> {
        let endpoint = loans_endpoint(&self.base_url);
        let response = self.authorized(self.client.get(endpoint)).send().await?;
        let records = read_json::<Vec<LoanRecord>>(response).await?;
        validate_records(&records)?;
        Ok(records)
    }

    async fn fetch_funding_book(&self, symbol: &str) -> Result<Vec<FundingBookEntry>, AppError> {
        let endpoint = funding_book_endpoint(&self.base_url, symbol);
        let response = self.authorized(self.client.get(endpoint)).send().await?;
        let mut entries = read_json::<Vec<FundingBookEntry>>(response)
            .await
            .map_err(terminal_status)?;
        entries.sort_by(|lhs, rhs| lhs.rate.total_cmp(&rhs.rate));
        Ok(entries)
    }

    async fn close_loans(&self, loan_ids: &[LoanId]) -> Result<CloseLoansResponse, AppError> {
        let endpoint = close_loans_endpoint(&self.base_url);
        let request = CloseLoansRequest { loan_ids };
        let response = self
            .authorized(self.client.post(endpoint).json(&request))
            .send()
            .await?;
        let payload = read_json::<CloseLoansResponse>(response).await?;
        if !payload.success {
            return Err(AppError::Rejected(payload.failure_reason()));
        }
        Ok(payload)
    }
}
