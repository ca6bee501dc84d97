//! Data models for the NFT lending ledger

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::Validate;

/// Normalize a wallet address for storage and comparison.
///
/// Addresses arrive from clients in mixed case (EIP-55 checksummed or not);
/// the ledger stores and compares them lowercased.
pub fn normalize_wallet(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// User model
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub wallet_address: String,
    pub username: String,
    pub reputation: i32,
    pub total_borrowed: BigDecimal,
    pub total_lent: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Compact user view embedded in loan listings
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub wallet_address: String,
    pub reputation: i32,
}

impl From<User> for UserSummary {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            wallet_address: user.wallet_address,
            reputation: user.reputation,
        }
    }
}

/// Loan status enum — the sole source of truth for a loan's lifecycle state
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "loan_status", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum LoanStatus {
    Active,
    Funded,
    Repaid,
    Liquidated,
}

impl LoanStatus {
    /// Terminal states release the collateral lock
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoanStatus::Repaid | LoanStatus::Liquidated)
    }
}

/// Loan model — the state-machine entity. Rows are never deleted; a loan is
/// a financial audit record.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Loan {
    pub id: Uuid,
    pub borrower_id: Uuid,
    /// Null until funded. No sentinel encodings (lender == borrower meant
    /// "unfunded" in an earlier design and caused query bugs).
    pub lender_id: Option<Uuid>,
    pub principal: BigDecimal,
    pub interest_rate_bps: i32,
    pub duration_seconds: i64,
    pub collateral_id: Uuid,
    /// Audit copy of the loan-to-value ratio in basis points, floor division
    pub ltv_bps: i32,
    pub status: LoanStatus,
    /// Set at funding time (funded_at + duration), null before that
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub repaid_at: Option<DateTime<Utc>>,
    pub liquidated_at: Option<DateTime<Utc>>,
    pub on_chain_offer_id: Option<String>,
    pub on_chain_loan_id: Option<String>,
    pub funding_tx_hash: Option<String>,
    pub repayment_tx_hash: Option<String>,
    pub liquidation_tx_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Collateral model — one pledged NFT instance
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Collateral {
    pub id: Uuid,
    pub asset_contract: String,
    pub token_id: String,
    pub owner_id: Uuid,
    pub estimated_value: BigDecimal,
    pub is_locked: bool,
    pub locked_in_loan_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger transaction kind
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "tx_kind", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxKind {
    OfferCreated,
    Funded,
    Repaid,
    Liquidated,
}

/// Append-only event log entry, one per successful state transition.
/// Never mutated or deleted.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub loan_id: Uuid,
    pub kind: TxKind,
    pub amount: BigDecimal,
    /// Opaque idempotency key supplied by the blockchain linkage adapter.
    /// Null only for offer_created entries (anchored by on_chain_offer_id).
    pub on_chain_tx_hash: Option<String>,
    /// Backfilled by an external chain-sync process
    pub block_number: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

// ===== Request DTOs =====

/// Explicit user registration
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 64))]
    pub username: String,
    #[validate(length(min = 1))]
    pub wallet_address: String,
}

/// Request to create a loan offer (Offer Factory input)
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateLoanRequest {
    #[validate(length(min = 1))]
    pub wallet_address: String,
    /// Principal in Wei, decimal string
    #[validate(length(min = 1))]
    pub principal_wei: String,
    #[validate(range(min = 0))]
    pub interest_rate_bps: i32,
    #[validate(range(min = 1))]
    pub duration_seconds: i64,
    #[validate(length(min = 1))]
    pub asset_contract: String,
    #[validate(length(min = 1))]
    pub token_id: String,
    /// Caller-supplied collateral valuation in Wei, decimal string
    #[validate(length(min = 1))]
    pub collateral_value_wei: String,
    /// On-chain offer id; idempotency key for retried creates
    pub on_chain_offer_id: Option<String>,
    /// Offer-creation tx hash, if the chain call already happened
    pub tx_hash: Option<String>,
}

/// Request to fund an open offer (Funding Coordinator input)
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FundLoanRequest {
    pub loan_id: Uuid,
    #[validate(length(min = 1))]
    pub lender_address: String,
    /// Required: the ledger refuses to record a funding without a real
    /// chain reference
    #[validate(length(min = 1))]
    pub tx_hash: String,
    pub on_chain_loan_id: Option<String>,
}

/// Request to liquidate an overdue funded loan
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LiquidateLoanRequest {
    pub loan_id: Uuid,
    #[validate(length(min = 1))]
    pub lender_address: String,
    #[validate(length(min = 1))]
    pub tx_hash: String,
}

/// Limited field update from the external repayment notifier (PATCH /api/loans)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLoanRequest {
    pub loan_id: Uuid,
    pub status: Option<LoanStatus>,
    pub repayment_tx_hash: Option<String>,
    pub on_chain_loan_id: Option<String>,
}

/// Query for the per-user loan listing (GET /api/loans)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListLoansQuery {
    pub wallet_address: Option<String>,
    pub user_id: Option<Uuid>,
}

/// Wallet auth check query
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCheckQuery {
    pub wallet_address: Option<String>,
}

/// Sort keys accepted by the explore endpoint
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    CreatedAt,
    InterestRate,
    Amount,
    Duration,
}

/// Sort direction
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Filters for the explore endpoint (GET /api/loans/explore)
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExploreQuery {
    pub status: Option<LoanStatus>,
    pub min_interest_rate_bps: Option<i32>,
    pub max_interest_rate_bps: Option<i32>,
    /// Wei decimal strings
    pub min_amount_wei: Option<String>,
    pub max_amount_wei: Option<String>,
    /// Exclude loans whose borrower is this wallet (a lender browsing
    /// offers does not want their own)
    pub exclude_address: Option<String>,
    pub sort_by: Option<SortKey>,
    pub sort_order: Option<SortOrder>,
}

impl Default for SortKey {
    fn default() -> Self {
        SortKey::CreatedAt
    }
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Desc
    }
}

// ===== Response DTOs =====

/// Loan joined with its parties
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanWithParties {
    #[serde(flatten)]
    pub loan: Loan,
    pub borrower: UserSummary,
    pub lender: Option<UserSummary>,
}

/// Explore listing entry: loan + parties + derived presentation-only fields.
/// The derived fields are computed from stored integers on every read and
/// never persisted as authoritative.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExploreLoan {
    #[serde(flatten)]
    pub loan: Loan,
    pub borrower: UserSummary,
    pub lender: Option<UserSummary>,
    pub duration_days: i64,
    /// Simple pro-rated interest in Wei, floor division
    pub projected_interest_wei: BigDecimal,
    pub projected_return_wei: BigDecimal,
}

/// Per-user loan listing
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLoans {
    pub all_loans: Vec<LoanWithParties>,
    pub borrowed_loans: Vec<LoanWithParties>,
    pub lent_loans: Vec<LoanWithParties>,
}

/// Platform-level stats (GET /api/stats)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStats {
    pub total_loans: i64,
    /// Sum of principal over funded and repaid loans, in Wei
    pub total_issued_wei: BigDecimal,
    pub unique_borrowers: i64,
    pub total_collateralized_nfts: i64,
    pub avg_interest_rate_bps: i64,
}

/// Wallet auth check response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCheckResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
}
