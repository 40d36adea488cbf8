use crate::error::AppError;
use crate::loans::persistence::{get_view_preferences, save_view_preferences};
use crate::loans::types::{SaveViewPreferencesArgs, ViewPreferencesSnapshot};
use crate::state::AppState;

pub async fn view_preferences_get(state: &AppState) -> Result<ViewPreferencesSnapshot, AppError> {
    get_view_preferences(&state.db_pool).await
}

/// Persists the filter and applies it to the live view.
pub async fn view_preferences_save(
    state: &AppState,
    args: SaveViewPreferencesArgs,
) -> Result<ViewPreferencesSnapshot, AppError> {
    let saved = save_view_preferences(&state.db_pool, args).await?;
    state.desk.set_filter(saved.filter.clone())?;
    Ok(saved)
}

/// Applies the stored filter to the live view, typically once at startup.
pub async fn restore_view_preferences(
    state: &AppState,
) -> Result<ViewPreferencesSnapshot, AppError> {
    let stored = get_view_preferences(&state.db_pool).await?;
    state.desk.set_filter(stored.filter.clone())?;
    Ok(stored)
}
