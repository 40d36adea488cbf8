use clap::{Parser, Subcommand};
use loan_desk_lib::commands::health::health;
use loan_desk_lib::commands::loans::{close_selected_loans, funding_book, toggle_loan_selection};
use loan_desk_lib::error::AppError;
use loan_desk_lib::loans::desk::CloseOutcome;
use loan_desk_lib::loans::types::{DeskArgs, EmptyResultPolicy, LoanId};
use loan_desk_lib::state::AppState;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_DIRECTIVES: &str = "loan_desk=debug,loan_desk_lib=debug,info";

#[derive(Parser, Debug)]
#[command(name = "loan-desk")]
#[command(about = "Watch and manage active funding loans through the loan REST backend")]
struct Cli {
    /// Backend base URL
    #[arg(long, env = "LOAN_DESK_BASE_URL")]
    base_url: Option<String>,

    /// Value sent as the X-API-Key header
    #[arg(long, env = "LOAN_DESK_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "LOAN_DESK_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    #[arg(long, env = "LOAN_DESK_RETRY_DELAY_MS")]
    retry_delay_ms: Option<u64>,

    #[arg(long, env = "LOAN_DESK_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// How an empty loan list is treated: retry | accept
    #[arg(long, env = "LOAN_DESK_EMPTY_RESULT_POLICY", value_parser = parse_empty_result_policy)]
    empty_result_policy: Option<EmptyResultPolicy>,

    /// Directory holding the SQLite database
    #[arg(long, env = "LOAN_DESK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the backend and log every refresh until Ctrl-C
    Watch,
    /// Report database and backend reachability after one refresh
    Health,
    /// Print the funding book for a symbol, e.g. fUSD
    Book { symbol: String },
    /// Refresh once, select the given loans and close them
    Close {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

fn parse_empty_result_policy(value: &str) -> Result<EmptyResultPolicy, String> {
    EmptyResultPolicy::parse_str(value).map_err(|error| error.to_string())
}

impl Cli {
    fn desk_args(&self) -> DeskArgs {
        DeskArgs {
            base_url: self.base_url.clone(),
            poll_interval_ms: self.poll_interval_ms,
            retry_delay_ms: self.retry_delay_ms,
            max_retries: self.max_retries,
            empty_result_policy: self.empty_result_policy,
        }
    }
}

async fn print_book(state: &AppState, symbol: String) -> Result<(), AppError> {
    let entries = funding_book(state, symbol).await?;
    println!("{:>12} {:>6} {:>6} {:>16}", "rate", "period", "count", "amount");
    for entry in entries {
        println!(
            "{:>12.8} {:>6} {:>6} {:>16.2}",
            entry.rate, entry.period, entry.count, entry.amount
        );
    }
    Ok(())
}

async fn close_loans(state: &AppState, ids: Vec<String>) -> Result<(), AppError> {
    let loan_ids = ids
        .iter()
        .map(|raw| raw.parse::<LoanId>())
        .collect::<Result<Vec<_>, _>>()?;

    let mut updates = state.desk.subscribe();
    state.desk.start();
    let resolved = updates
        .wait_for(|snapshot| snapshot.resolved_sequence.is_some())
        .await
        .map(|snapshot| snapshot.error.clone());
    let result = match resolved {
        Ok(Some(fetch_error)) => Err(AppError::Reported(fetch_error)),
        Ok(None) => {
            for loan_id in loan_ids {
                let view = toggle_loan_selection(state, loan_id.clone());
                if !view.selected_ids.contains(&loan_id) {
                    warn!(%loan_id, "loan not in the current view, skipped");
                }
            }
            close_selected_loans(state).await
        }
        Err(_) => Err(AppError::ServiceUnavailable(
            "poller stopped before the first refresh".to_string(),
        )),
    };
    state.desk.stop().await;

    match result? {
        CloseOutcome::Skipped => info!("nothing to close"),
        CloseOutcome::Closed { loan_ids, response } => {
            for item in &response.results {
                info!(
                    loan_id = %item.loan_id,
                    success = item.success,
                    message = item.message.as_deref().unwrap_or(""),
                    "close result"
                );
            }
            info!(count = loan_ids.len(), "loans closed");
        }
    }
    Ok(())
}

async fn report_health(state: &AppState) -> Result<(), AppError> {
    let mut updates = state.desk.subscribe();
    state.desk.start();
    let _ = updates
        .wait_for(|snapshot| snapshot.resolved_sequence.is_some())
        .await;
    let report = health(state).await;
    state.desk.stop().await;

    info!(
        status = report.status,
        uptime_ms = report.uptime_ms as u64,
        db = report.db,
        poller = report.poller.as_str(),
        last_success_ms = ?report.last_success_ms,
        fetch_error = report.fetch_error.as_ref().map(|error| error.message.as_str()),
        "health"
    );
    Ok(())
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = cli.desk_args().normalize()?;
    let state = loan_desk_lib::bootstrap(config, cli.api_key, cli.data_dir).await?;

    match cli.command {
        Command::Watch => loan_desk_lib::watch(&state).await,
        Command::Health => report_health(&state).await,
        Command::Book { symbol } => print_book(&state, symbol).await,
        Command::Close { ids } => close_loans(&state, ids).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES)),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(kind = ?error.kind(), %error, "loan desk failed");
            ExitCode::FAILURE
        }
    }
}
