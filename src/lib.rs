pub mod commands;
pub mod db;
pub mod error;
pub mod loans;
pub mod state;

use commands::preferences::restore_view_preferences;
use db::initialize_pool;
use error::AppError;
use loans::backend::{CredentialProvider, HttpBackend, LoanBackend, SharedApiKey};
use loans::desk::LoanDesk;
use loans::types::{DeskConfig, ViewFilter};
use reqwest::Client;
use state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Opens the database, wires the HTTP backend into a desk and restores the
/// saved view filter. Polling is not started.
pub async fn bootstrap(
    config: DeskConfig,
    api_key: Option<String>,
    data_dir: Option<PathBuf>,
) -> Result<AppState, AppError> {
    let db_pool = initialize_pool(data_dir).await?;
    let api_key = SharedApiKey::new(api_key);
    let credentials: Arc<dyn CredentialProvider> = Arc::new(api_key.clone());
    let backend: Arc<dyn LoanBackend> = Arc::new(HttpBackend::new(
        Client::new(),
        config.base_url.clone(),
        credentials,
    ));
    let desk = LoanDesk::new(backend, config.poller, ViewFilter::default());
    let state = AppState::new(db_pool, api_key, desk);

    let restored = restore_view_preferences(&state).await?;
    info!(
        base_url = %config.base_url,
        symbol = restored.filter.symbol.as_str(),
        min_rate = ?restored.filter.min_rate,
        "loan desk ready"
    );
    Ok(state)
}

/// Polls until Ctrl-C, logging every published update, then stops the poller.
pub async fn watch(state: &AppState) -> Result<(), AppError> {
    let mut updates = state.desk.subscribe();
    state.desk.start();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("interrupt received");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = state.desk.snapshot();
                match &view.fetch_error {
                    Some(error) => warn!(
                        kind = ?error.kind,
                        message = %error.message,
                        state = view.state.as_str(),
                        "loan refresh failed"
                    ),
                    None => info!(
                        sequence = ?view.resolved_sequence,
                        records = view.summary.count,
                        total_amount = view.summary.total_amount,
                        average_rate = ?view.summary.average_rate,
                        daily_earnings = view.summary.daily_earnings,
                        state = view.state.as_str(),
                        "loan view updated"
                    ),
                }
            }
        }
    }

    state.desk.stop().await;
    Ok(())
}
