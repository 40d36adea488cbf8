use crate::error::AppError;
use crate::loans::backend::CredentialProvider;
use crate::loans::desk::CloseOutcome;
use crate::loans::persistence::save_view_filter;
use crate::loans::types::{
    FundingBookEntry, LoanId, PollerState, SymbolFilter, ViewFilter, ViewSnapshot,
};
use crate::state::AppState;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingStateResult {
    pub changed: bool,
    pub state: PollerState,
}

pub fn start_polling(state: &AppState) -> PollingStateResult {
    let changed = state.desk.start();
    PollingStateResult {
        changed,
        state: state.desk.poller().state(),
    }
}

pub async fn stop_polling(state: &AppState) -> PollingStateResult {
    let changed = state.desk.stop().await;
    PollingStateResult {
        changed,
        state: state.desk.poller().state(),
    }
}

/// Replaces the credential used by subsequent requests; blank clears it.
pub fn set_api_key(state: &AppState, api_key: Option<String>) {
    state.api_key.set(api_key);
    info!(present = state.api_key.api_key().is_some(), "api key updated");
}

pub fn loans_view(state: &AppState) -> ViewSnapshot {
    state.desk.snapshot()
}

async fn persist_filter(state: &AppState, filter: &ViewFilter) -> Result<(), AppError> {
    let saved = save_view_filter(&state.db_pool, filter).await?;
    info!(
        symbol = saved.filter.symbol.as_str(),
        min_rate = ?saved.filter.min_rate,
        "view filter saved"
    );
    Ok(())
}

pub async fn set_symbol_filter(state: &AppState, symbol: String) -> Result<ViewSnapshot, AppError> {
    let snapshot = state.desk.set_symbol_filter(SymbolFilter::parse_str(&symbol));
    persist_filter(state, &snapshot.filter).await?;
    Ok(snapshot)
}

pub async fn set_min_rate_filter(
    state: &AppState,
    min_rate: Option<f64>,
) -> Result<ViewSnapshot, AppError> {
    let snapshot = state.desk.set_min_rate_filter(min_rate)?;
    persist_filter(state, &snapshot.filter).await?;
    Ok(snapshot)
}

pub fn toggle_loan_selection(state: &AppState, loan_id: LoanId) -> ViewSnapshot {
    state.desk.toggle_selection(&loan_id)
}

pub fn select_all_loans(state: &AppState) -> ViewSnapshot {
    state.desk.select_all_or_none()
}

pub async fn close_selected_loans(state: &AppState) -> Result<CloseOutcome, AppError> {
    state.desk.close_selected().await
}

pub async fn funding_book(
    state: &AppState,
    symbol: String,
) -> Result<Vec<FundingBookEntry>, AppError> {
    state.desk.funding_book(&symbol).await
}
