//! Route definitions for the lending ledger API

use axum::{
    routing::{get, post},
    Router,
};

use crate::app_state::AppState;
use crate::handlers::*;

// User routes
pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/api/register", post(register))
        .route("/api/auth/check", get(auth_check))
}

// Loan routes
pub fn loan_routes() -> Router<AppState> {
    Router::new()
        .route("/api/loans", post(create_loan).get(list_loans).patch(update_loan))
        .route("/api/loans/fund", post(fund_loan))
        .route("/api/loans/liquidate", post(liquidate_loan))
        .route("/api/loans/explore", get(explore_loans))
}

// Stats routes
pub fn stats_routes() -> Router<AppState> {
    Router::new().route("/api/stats", get(get_stats))
}
