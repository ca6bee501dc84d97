//! Read-only discovery queries over the ledger
//!
//! Filtering and sorting happen SQL-side; derived fields (projected interest,
//! duration in days) are computed from the stored integers on every read and
//! are presentation-only. Open offers are `status = 'active'` — there is no
//! sentinel lender encoding to filter on.

use std::collections::HashMap;

use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{
    normalize_wallet, ExploreLoan, ExploreQuery, Loan, LoanStatus, LoanWithParties, PlatformStats,
    SortKey, SortOrder, User, UserLoans, UserSummary,
};
use crate::terms;

#[derive(Clone)]
pub struct ExploreService {
    db_pool: PgPool,
}

impl ExploreService {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Browse open offers (or any status) with filters and sorting
    pub async fn explore(&self, query: ExploreQuery) -> Result<Vec<ExploreLoan>, ApiError> {
        let status = query.status.unwrap_or(LoanStatus::Active);

        let mut builder = QueryBuilder::new("SELECT * FROM loans WHERE status = ");
        builder.push_bind(status);

        if let Some(min_bps) = query.min_interest_rate_bps {
            builder.push(" AND interest_rate_bps >= ");
            builder.push_bind(min_bps);
        }
        if let Some(max_bps) = query.max_interest_rate_bps {
            builder.push(" AND interest_rate_bps <= ");
            builder.push_bind(max_bps);
        }
        if let Some(ref min_amount) = query.min_amount_wei {
            let min_amount = terms::parse_wei(min_amount)
                .map_err(|e| ApiError::ValidationError(e.to_string()))?;
            builder.push(" AND principal >= ");
            builder.push_bind(min_amount);
        }
        if let Some(ref max_amount) = query.max_amount_wei {
            let max_amount = terms::parse_wei(max_amount)
                .map_err(|e| ApiError::ValidationError(e.to_string()))?;
            builder.push(" AND principal <= ");
            builder.push_bind(max_amount);
        }
        if let Some(ref exclude) = query.exclude_address {
            builder.push(
                " AND borrower_id NOT IN (SELECT id FROM users WHERE wallet_address = ",
            );
            builder.push_bind(normalize_wallet(exclude));
            builder.push(")");
        }

        // Sort keys are a closed enum; the literal never comes from the client
        let sort_column = match query.sort_by.unwrap_or_default() {
            SortKey::CreatedAt => "created_at",
            SortKey::InterestRate => "interest_rate_bps",
            SortKey::Amount => "principal",
            SortKey::Duration => "duration_seconds",
        };
        let sort_dir = match query.sort_order.unwrap_or_default() {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        builder.push(format!(" ORDER BY {} {}", sort_column, sort_dir));

        let loans = builder
            .build_query_as::<Loan>()
            .fetch_all(&self.db_pool)
            .await?;

        let users = self.load_parties(&loans).await?;

        Ok(loans
            .into_iter()
            .map(|loan| annotate(loan, &users))
            .collect())
    }

    /// Per-user view: every loan on the platform plus the user's borrowed
    /// and lent slices
    pub async fn loans_for_user(&self, user: &User) -> Result<UserLoans, ApiError> {
        let loans = sqlx::query_as::<_, Loan>("SELECT * FROM loans ORDER BY created_at DESC")
            .fetch_all(&self.db_pool)
            .await?;

        let users = self.load_parties(&loans).await?;

        let all_loans: Vec<LoanWithParties> = loans
            .into_iter()
            .map(|loan| with_parties(loan, &users))
            .collect();

        let borrowed_loans = all_loans
            .iter()
            .filter(|l| l.loan.borrower_id == user.id)
            .map(clone_entry)
            .collect();
        let lent_loans = all_loans
            .iter()
            .filter(|l| l.loan.lender_id == Some(user.id))
            .map(clone_entry)
            .collect();

        Ok(UserLoans {
            all_loans,
            borrowed_loans,
            lent_loans,
        })
    }

    /// Single loan joined with its parties
    pub async fn loan_with_parties(&self, loan: Loan) -> Result<LoanWithParties, ApiError> {
        let users = self.load_parties(std::slice::from_ref(&loan)).await?;
        Ok(with_parties(loan, &users))
    }

    /// Platform-level aggregates
    pub async fn stats(&self) -> Result<PlatformStats, ApiError> {
        let (total_loans, total_issued_wei, unique_borrowers, avg_interest_rate_bps): (
            i64,
            sqlx::types::BigDecimal,
            i64,
            i64,
        ) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(principal) FILTER (WHERE status IN ('funded', 'repaid')), 0),
                COUNT(DISTINCT borrower_id),
                CAST(COALESCE(AVG(interest_rate_bps), 0) AS BIGINT)
            FROM loans
            "#,
        )
        .fetch_one(&self.db_pool)
        .await?;

        let total_collateralized_nfts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM collateral")
            .fetch_one(&self.db_pool)
            .await?;

        Ok(PlatformStats {
            total_loans,
            total_issued_wei,
            unique_borrowers,
            total_collateralized_nfts,
            avg_interest_rate_bps,
        })
    }

    /// Batch-load the borrower/lender summaries referenced by a slice of loans
    async fn load_parties(&self, loans: &[Loan]) -> Result<HashMap<Uuid, UserSummary>, ApiError> {
        let mut ids: Vec<Uuid> = Vec::new();
        for loan in loans {
            ids.push(loan.borrower_id);
            if let Some(lender_id) = loan.lender_id {
                ids.push(lender_id);
            }
        }
        ids.sort_unstable();
        ids.dedup();

        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let users = sqlx::query_as::<_, UserSummary>(
            "SELECT id, username, wallet_address, reputation FROM users WHERE id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(users.into_iter().map(|u| (u.id, u)).collect())
    }
}

fn with_parties(loan: Loan, users: &HashMap<Uuid, UserSummary>) -> LoanWithParties {
    let borrower = users
        .get(&loan.borrower_id)
        .cloned()
        .unwrap_or_else(|| missing_party(loan.borrower_id));
    let lender = loan.lender_id.map(|id| {
        users
            .get(&id)
            .cloned()
            .unwrap_or_else(|| missing_party(id))
    });

    LoanWithParties {
        loan,
        borrower,
        lender,
    }
}

fn annotate(loan: Loan, users: &HashMap<Uuid, UserSummary>) -> ExploreLoan {
    let entry = with_parties(loan, users);
    let projected_interest_wei = terms::projected_interest(
        &entry.loan.principal,
        entry.loan.interest_rate_bps,
        entry.loan.duration_seconds,
    );
    let projected_return_wei = &entry.loan.principal + &projected_interest_wei;

    ExploreLoan {
        duration_days: terms::duration_days(entry.loan.duration_seconds),
        projected_interest_wei,
        projected_return_wei,
        loan: entry.loan,
        borrower: entry.borrower,
        lender: entry.lender,
    }
}

fn clone_entry(entry: &LoanWithParties) -> LoanWithParties {
    LoanWithParties {
        loan: entry.loan.clone(),
        borrower: entry.borrower.clone(),
        lender: entry.lender.clone(),
    }
}

// Users are foreign keys on loans, so a miss can only follow an out-of-band
// deletion; keep the listing readable rather than failing the whole page.
fn missing_party(id: Uuid) -> UserSummary {
    UserSummary {
        id,
        username: "unknown".to_string(),
        wallet_address: String::new(),
        reputation: 0,
    }
}
