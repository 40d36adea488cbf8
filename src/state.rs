use crate::loans::backend::SharedApiKey;
use crate::loans::desk::LoanDesk;
use sqlx::SqlitePool;
use std::time::Instant;

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub api_key: SharedApiKey,
    pub desk: LoanDesk,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, api_key: SharedApiKey, desk: LoanDesk) -> Self {
        Self {
            started_at: Instant::now(),
            db_pool,
            api_key,
            desk,
        }
    }
}
