//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;
use sqlx::PgPool;

use crate::explore::ExploreService;
use crate::identity::IdentityService;
use crate::ledger::LedgerService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub identity_service: Arc<IdentityService>,
    pub ledger_service: Arc<LedgerService>,
    pub explore_service: Arc<ExploreService>,
}

impl AppState {
    pub fn new(db_pool: PgPool) -> Self {
        let identity_service = IdentityService::new(db_pool.clone());
        let ledger_service = LedgerService::new(db_pool.clone(), identity_service.clone());
        let explore_service = ExploreService::new(db_pool.clone());

        Self {
            db_pool,
            identity_service: Arc::new(identity_service),
            ledger_service: Arc::new(ledger_service),
            explore_service: Arc::new(explore_service),
        }
    }
}

impl FromRef<AppState> for PgPool {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.db_pool.clone()
    }
}

impl FromRef<AppState> for Arc<IdentityService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.identity_service.clone()
    }
}

impl FromRef<AppState> for Arc<LedgerService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.ledger_service.clone()
    }
}

impl FromRef<AppState> for Arc<ExploreService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.explore_service.clone()
    }
}
