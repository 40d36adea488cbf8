use crate::error::{AppError, ErrorReport};
use crate::loans::backend::LoanBackend;
use crate::loans::poller::Poller;
use crate::loans::types::{
    normalize_book_symbol, normalize_min_rate, CloseLoansResponse, FundingBookEntry, LoanId,
    PollSnapshot, PollerConfig, SymbolFilter, ViewFilter, ViewSnapshot,
};
use crate::loans::view::ViewState;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CloseOutcome {
    /// Nothing selected, or a close was already running.
    Skipped,
    Closed {
        loan_ids: Vec<LoanId>,
        response: CloseLoansResponse,
    },
}

/// Holds a started close. Dropped without `finish`, e.g. when the caller
/// stops polling the close future, it releases the in-flight flag.
struct CloseGuard<'a> {
    view: &'a Mutex<ViewState>,
    armed: bool,
}

impl CloseGuard<'_> {
    fn finish(mut self, result: Result<(), ErrorReport>) {
        self.armed = false;
        self.view.lock().complete_close(result);
    }
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("close abandoned before the backend answered");
            self.view.lock().abort_close();
        }
    }
}

/// The dashboard core: owns the poller and the view state, and routes every
/// view mutation through one lock so poll results and user commands never
/// interleave halfway.
pub struct LoanDesk {
    backend: Arc<dyn LoanBackend>,
    poller: Poller,
    view: Mutex<ViewState>,
}

impl LoanDesk {
    pub fn new(backend: Arc<dyn LoanBackend>, config: PollerConfig, filter: ViewFilter) -> Self {
        let poller = Poller::new(Arc::clone(&backend), config);
        Self {
            backend,
            poller,
            view: Mutex::new(ViewState::new(filter)),
        }
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn start(&self) -> bool {
        self.poller.start()
    }

    pub async fn stop(&self) -> bool {
        self.poller.stop().await
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.poller.subscribe()
    }

    /// Locks the view after folding in the latest published record set.
    fn reconciled_view(&self) -> (MutexGuard<'_, ViewState>, PollSnapshot) {
        let poll = self.poller.snapshot();
        let mut view = self.view.lock();
        view.sync_records(Arc::clone(&poll.records));
        (view, poll)
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        let (view, poll) = self.reconciled_view();
        view.snapshot(&poll)
    }

    pub fn set_filter(&self, filter: ViewFilter) -> Result<ViewSnapshot, AppError> {
        let min_rate = normalize_min_rate(filter.min_rate)?;
        let (mut view, poll) = self.reconciled_view();
        view.set_filter(ViewFilter {
            symbol: filter.symbol,
            min_rate,
        });
        Ok(view.snapshot(&poll))
    }

    pub fn set_symbol_filter(&self, symbol: SymbolFilter) -> ViewSnapshot {
        let (mut view, poll) = self.reconciled_view();
        view.set_symbol_filter(symbol);
        view.snapshot(&poll)
    }

    pub fn set_min_rate_filter(&self, min_rate: Option<f64>) -> Result<ViewSnapshot, AppError> {
        let min_rate = normalize_min_rate(min_rate)?;
        let (mut view, poll) = self.reconciled_view();
        view.set_min_rate_filter(min_rate);
        Ok(view.snapshot(&poll))
    }

    pub fn toggle_selection(&self, id: &LoanId) -> ViewSnapshot {
        let (mut view, poll) = self.reconciled_view();
        view.toggle_selection(id);
        view.snapshot(&poll)
    }

    pub fn select_all_or_none(&self) -> ViewSnapshot {
        let (mut view, poll) = self.reconciled_view();
        view.select_all_or_none();
        view.snapshot(&poll)
    }

    /// Closes the selected loans. On success the selection is cleared and an
    /// out-of-band refresh is requested; on failure the error is recorded on
    /// the view and returned, and the selection is left untouched.
    pub async fn close_selected(&self) -> Result<CloseOutcome, AppError> {
        let loan_ids = {
            let (mut view, _) = self.reconciled_view();
            match view.begin_close() {
                Some(loan_ids) => loan_ids,
                None => return Ok(CloseOutcome::Skipped),
            }
        };
        let guard = CloseGuard {
            view: &self.view,
            armed: true,
        };

        info!(count = loan_ids.len(), ?loan_ids, "closing selected loans");
        let result = self.backend.close_loans(&loan_ids).await;

        match result {
            Ok(response) => {
                guard.finish(Ok(()));
                self.poller.refresh_now();
                info!(count = loan_ids.len(), "loans closed, refresh requested");
                Ok(CloseOutcome::Closed { loan_ids, response })
            }
            Err(error) => {
                warn!(%error, "closing loans failed");
                guard.finish(Err(error.report()));
                Err(error)
            }
        }
    }

    pub async fn funding_book(&self, symbol: &str) -> Result<Vec<FundingBookEntry>, AppError> {
        let symbol = normalize_book_symbol(symbol)?;
        self.backend.fetch_funding_book(&symbol).await
    }
}
