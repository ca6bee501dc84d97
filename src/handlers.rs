//! API handlers for the lending ledger

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use validator::Validate;

use crate::app_state::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    AuthCheckQuery, AuthCheckResponse, CreateLoanRequest, ExploreLoan, ExploreQuery,
    FundLoanRequest, LiquidateLoanRequest, ListLoansQuery, LoanWithParties, PlatformStats,
    RegisterRequest, UpdateLoanRequest, User, UserLoans,
};

/// Explore listing envelope
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExploreResponse {
    pub loans: Vec<ExploreLoan>,
    pub total: usize,
}

// ===== Users =====

/// POST /api/register — explicit registration with a chosen username
pub async fn register(
    State(app_state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    request.validate()?;

    let user = app_state
        .identity_service
        .register(&request.username, &request.wallet_address)
        .await?;

    Ok((StatusCode::CREATED, Json(user)))
}

/// GET /api/auth/check — does this wallet have an identity yet?
pub async fn auth_check(
    State(app_state): State<AppState>,
    Query(query): Query<AuthCheckQuery>,
) -> ApiResult<Json<AuthCheckResponse>> {
    let wallet = query.wallet_address.ok_or_else(|| {
        ApiError::ValidationError("walletAddress query parameter is required".to_string())
    })?;

    let user = app_state.identity_service.find_by_wallet(&wallet).await?;

    Ok(Json(AuthCheckResponse {
        authenticated: user.is_some(),
        user: user.map(Into::into),
    }))
}

// ===== Loans =====

/// POST /api/loans — create a loan offer (Offer Factory)
pub async fn create_loan(
    State(app_state): State<AppState>,
    Json(request): Json<CreateLoanRequest>,
) -> ApiResult<(StatusCode, Json<LoanWithParties>)> {
    let loan = app_state.ledger_service.create_offer(request).await?;
    let body = app_state.explore_service.loan_with_parties(loan).await?;

    Ok((StatusCode::CREATED, Json(body)))
}

/// GET /api/loans — all/borrowed/lent listing for one user
pub async fn list_loans(
    State(app_state): State<AppState>,
    Query(query): Query<ListLoansQuery>,
) -> ApiResult<Json<UserLoans>> {
    let user = match (query.wallet_address, query.user_id) {
        (Some(wallet), _) => app_state.identity_service.find_by_wallet(&wallet).await?,
        (None, Some(user_id)) => app_state.identity_service.find_by_id(user_id).await?,
        (None, None) => {
            return Err(ApiError::ValidationError(
                "walletAddress or userId is required".to_string(),
            ))
        }
    };

    let user = user.ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    let loans = app_state.explore_service.loans_for_user(&user).await?;

    Ok(Json(loans))
}

/// PATCH /api/loans — limited field update from the repayment notifier
pub async fn update_loan(
    State(app_state): State<AppState>,
    Json(request): Json<UpdateLoanRequest>,
) -> ApiResult<Json<LoanWithParties>> {
    let loan = app_state.ledger_service.apply_update(request).await?;
    let body = app_state.explore_service.loan_with_parties(loan).await?;

    Ok(Json(body))
}

/// POST /api/loans/fund — fund an open offer (Funding Coordinator)
pub async fn fund_loan(
    State(app_state): State<AppState>,
    Json(request): Json<FundLoanRequest>,
) -> ApiResult<Json<LoanWithParties>> {
    let loan = app_state.ledger_service.fund_loan(request).await?;
    let body = app_state.explore_service.loan_with_parties(loan).await?;

    Ok(Json(body))
}

/// POST /api/loans/liquidate — lender seizes collateral on an overdue loan
pub async fn liquidate_loan(
    State(app_state): State<AppState>,
    Json(request): Json<LiquidateLoanRequest>,
) -> ApiResult<Json<LoanWithParties>> {
    let loan = app_state.ledger_service.liquidate(request).await?;
    let body = app_state.explore_service.loan_with_parties(loan).await?;

    Ok(Json(body))
}

/// GET /api/loans/explore — filtered, sorted, annotated offer discovery
pub async fn explore_loans(
    State(app_state): State<AppState>,
    Query(query): Query<ExploreQuery>,
) -> ApiResult<Json<ExploreResponse>> {
    let loans = app_state.explore_service.explore(query).await?;
    let total = loans.len();

    Ok(Json(ExploreResponse { loans, total }))
}

/// GET /api/stats — platform aggregates
pub async fn get_stats(State(app_state): State<AppState>) -> ApiResult<Json<PlatformStats>> {
    let stats = app_state.explore_service.stats().await?;

    Ok(Json(stats))
}
