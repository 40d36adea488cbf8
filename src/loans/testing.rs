use crate::error::AppError;
use crate::loans::backend::LoanBackend;
use crate::loans::types::{CloseLoansResponse, FundingBookEntry, LoanId, LoanRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum ScriptedFetch {
    Records(Vec<LoanRecord>),
    Unavailable,
    Unauthorized,
}

impl ScriptedFetch {
    fn into_result(self) -> Result<Vec<LoanRecord>, AppError> {
        match self {
            Self::Records(records) => Ok(records),
            Self::Unavailable => Err(AppError::ServiceUnavailable(
                "scripted outage".to_string(),
            )),
            Self::Unauthorized => Err(AppError::Unauthorized),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedClose {
    Closed,
    Rejected,
}

/// In-memory backend answering fetches from a script, falling back to a
/// fixed answer once the script runs dry.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<(Duration, ScriptedFetch)>>,
    fallback: ScriptedFetch,
    close: ScriptedClose,
    close_delay: Mutex<Duration>,
    fetch_calls: AtomicUsize,
    close_calls: Mutex<Vec<Vec<LoanId>>>,
}

impl ScriptedBackend {
    pub fn new(fallback: ScriptedFetch) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            close: ScriptedClose::Closed,
            close_delay: Mutex::new(Duration::ZERO),
            fetch_calls: AtomicUsize::new(0),
            close_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_close(mut self, close: ScriptedClose) -> Self {
        self.close = close;
        self
    }

    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = delay;
    }

    pub fn push(&self, delay: Duration, fetch: ScriptedFetch) {
        self.script.lock().push_back((delay, fetch));
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> Vec<Vec<LoanId>> {
        self.close_calls.lock().clone()
    }
}

#[async_trait]
impl LoanBackend for ScriptedBackend {
    async fn fetch_loans(&self) -> Result<Vec<LoanRecord>, AppError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        let (delay, fetch) = next.unwrap_or((Duration::ZERO, self.fallback.clone()));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        fetch.into_result()
    }

    async fn fetch_funding_book(&self, _symbol: &str) -> Result<Vec<FundingBookEntry>, AppError> {
        Ok(vec![FundingBookEntry {
            rate: 0.0002,
            period: 2,
            count: 3,
            amount: 1_000.0,
        }])
    }

    async fn close_loans(&self, loan_ids: &[LoanId]) -> Result<CloseLoansResponse, AppError> {
        self.close_calls.lock().push(loan_ids.to_vec());
        let delay = *self.close_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.close {
            ScriptedClose::Closed => Ok(CloseLoansResponse {
                success: true,
                message: None,
                detail: None,
                results: Vec::new(),
            }),
            ScriptedClose::Rejected => Err(AppError::Rejected(
                "backend reported success=false".to_string(),
            )),
        }
    }
}

pub fn loan(id: i64, symbol: &str, rate: f64) -> LoanRecord {
    LoanRecord {
        id: LoanId::Number(id),
        symbol: symbol.to_string(),
        amount: 100.0 * id as f64,
        rate,
        period_days: 2,
        status: "ACTIVE".to_string(),
        side: Some("borrower".to_string()),
        created_at: None,
        opening_date: None,
        last_payout: None,
        position_pair: None,
        daily_earnings: Some(rate * id as f64),
        annual_earnings: Some(rate * id as f64 * 365.0),
        auto_renew: Some(false),
    }
}
