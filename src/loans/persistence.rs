use crate::error::AppError;
use crate::loans::poller::now_unix_ms;
use crate::loans::types::{
    SaveViewPreferencesArgs, SymbolFilter, ViewFilter, ViewPreferencesSnapshot,
};
use sqlx::{Row, SqlitePool};

fn map_preferences_row(row: &sqlx::sqlite::SqliteRow) -> Result<ViewPreferencesSnapshot, AppError> {
    let symbol_raw: String = row.try_get("symbol_filter")?;
    let min_rate: Option<f64> = row.try_get("min_rate")?;
    let updated_at_ms: i64 = row.try_get("updated_at_ms")?;

    Ok(ViewPreferencesSnapshot {
        filter: ViewFilter {
            symbol: SymbolFilter::parse_str(&symbol_raw),
            min_rate: min_rate.filter(|value| value.is_finite()),
        },
        updated_at_ms,
    })
}

async fn ensure_view_preferences_seed(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::query(
        "INSERT OR IGNORE INTO view_preferences (id, symbol_filter, min_rate, updated_at_ms) VALUES (1, ?, NULL, ?)",
    )
    .bind(SymbolFilter::ALL)
    .bind(now_unix_ms())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_view_preferences(pool: &SqlitePool) -> Result<ViewPreferencesSnapshot, AppError> {
    ensure_view_preferences_seed(pool).await?;

    let row = sqlx::query(
        "SELECT symbol_filter, min_rate, updated_at_ms FROM view_preferences WHERE id = 1",
    )
    .fetch_one(pool)
    .await?;

    map_preferences_row(&row)
}

pub async fn save_view_filter(
    pool: &SqlitePool,
    filter: &ViewFilter,
) -> Result<ViewPreferencesSnapshot, AppError> {
    sqlx::query(
        "INSERT INTO view_preferences (id, symbol_filter, min_rate, updated_at_ms) VALUES (1, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET symbol_filter=excluded.symbol_filter, min_rate=excluded.min_rate, updated_at_ms=excluded.updated_at_ms",
    )
    .bind(filter.symbol.as_str())
    .bind(filter.min_rate)
    .bind(now_unix_ms())
    .execute(pool)
    .await?;

    get_view_preferences(pool).await
}

pub async fn save_view_preferences(
    pool: &SqlitePool,
    args: SaveViewPreferencesArgs,
) -> Result<ViewPreferencesSnapshot, AppError> {
    let filter = args.normalize()?;
    save_view_filter(pool, &filter).await
}
