use crate::error::AppError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_DB_FILENAME: &str = "loan-desk.db";
const DB_FILENAME_ENV: &str = "LOAN_DESK_DB_FILENAME";
const DATA_DIR_ENV: &str = "LOAN_DESK_DATA_DIR";

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_db_filename() -> String {
    non_empty_env(DB_FILENAME_ENV).unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string())
}

/// Explicit directory first, then `LOAN_DESK_DATA_DIR`, then the working
/// directory.
pub fn resolve_db_path(data_dir: Option<PathBuf>) -> Result<PathBuf, AppError> {
    let mut base_dir = data_dir
        .or_else(|| non_empty_env(DATA_DIR_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&base_dir)?;
    base_dir.push(resolve_db_filename());
    Ok(base_dir)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;
    debug!(path = %path.display(), "database ready");

    Ok(pool)
}

pub async fn initialize_pool(data_dir: Option<PathBuf>) -> Result<SqlitePool, AppError> {
    let db_path = resolve_db_path(data_dir)?;
    initialize_pool_from_path(&db_path).await
}
