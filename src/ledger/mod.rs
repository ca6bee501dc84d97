//! Ledger service — the single owner of loan state transitions
//!
//! Every mutation of the Loan/Collateral/Transaction triple goes through this
//! module, inside one database transaction, with the status change expressed
//! as a conditional update (`UPDATE … WHERE status = …`). Callers race and
//! retry; the ledger never retries against itself. Retried requests are
//! absorbed through their chain references (`on_chain_offer_id` for offer
//! creation, tx hashes for funding, repayment and liquidation).

use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;
use validator::Validate;

use crate::error::ApiError;
use crate::identity::IdentityService;
use crate::models::{
    normalize_wallet, Collateral, CreateLoanRequest, FundLoanRequest, LedgerTransaction,
    LiquidateLoanRequest, Loan, LoanStatus, TxKind, UpdateLoanRequest,
};
use crate::terms;

#[derive(Clone)]
pub struct LedgerService {
    db_pool: PgPool,
    identity: IdentityService,
}

impl LedgerService {
    pub fn new(db_pool: PgPool, identity: IdentityService) -> Self {
        Self { db_pool, identity }
    }

    /// Get a loan by id
    pub async fn get_loan(&self, id: Uuid) -> Result<Option<Loan>, ApiError> {
        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(loan)
    }

    /// Get the collateral row backing a loan
    pub async fn get_collateral(&self, id: Uuid) -> Result<Option<Collateral>, ApiError> {
        let collateral = sqlx::query_as::<_, Collateral>("SELECT * FROM collateral WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(collateral)
    }

    // ===== Offer creation =====

    /// Create a loan offer and its collateral lock.
    ///
    /// Collateral insert, loan insert, ledger entry and borrower totals all
    /// commit together or not at all. A duplicate `on_chain_offer_id` returns
    /// the existing loan: the chain is the source of truth for the offer's
    /// existence and the ledger must not diverge from it.
    pub async fn create_offer(&self, request: CreateLoanRequest) -> Result<Loan, ApiError> {
        request.validate()?;

        let principal = terms::parse_wei(&request.principal_wei)
            .map_err(|e| ApiError::ValidationError(e.to_string()))?;
        let collateral_value = terms::parse_wei(&request.collateral_value_wei)
            .map_err(|e| ApiError::ValidationError(e.to_string()))?;
        terms::check_ltv_cap(&principal, &collateral_value)
            .map_err(|e| ApiError::ValidationError(e.to_string()))?;
        let ltv_bps = terms::ltv_bps(&principal, &collateral_value);

        // Retried create with the same on-chain offer id is a no-op
        if let Some(offer_id) = request.on_chain_offer_id.as_deref() {
            if let Some(existing) = self.find_by_offer_id(offer_id).await? {
                return Ok(existing);
            }
        }

        let borrower = self.identity.resolve_or_create(&request.wallet_address).await?;

        let mut tx = self.db_pool.begin().await?;

        // Pre-check the lock; the partial unique index backstops the race
        let locked: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM collateral
                WHERE asset_contract = $1 AND token_id = $2 AND is_locked
            )
            "#,
        )
        .bind(&request.asset_contract)
        .bind(&request.token_id)
        .fetch_one(&mut *tx)
        .await?;

        if locked {
            return Err(ApiError::CollateralAlreadyLocked(format!(
                "NFT {}/{} already backs an active loan",
                request.asset_contract, request.token_id
            )));
        }

        let collateral = sqlx::query_as::<_, Collateral>(
            r#"
            INSERT INTO collateral (
                id, asset_contract, token_id, owner_id, estimated_value, is_locked
            )
            VALUES ($1, $2, $3, $4, $5, TRUE)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.asset_contract)
        .bind(&request.token_id)
        .bind(borrower.id)
        .bind(&collateral_value)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_constraint_violation(e, &request))?;

        let loan = match sqlx::query_as::<_, Loan>(
            r#"
            INSERT INTO loans (
                id, borrower_id, principal, interest_rate_bps, duration_seconds,
                collateral_id, ltv_bps, status, on_chain_offer_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'active', $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(borrower.id)
        .bind(&principal)
        .bind(request.interest_rate_bps)
        .bind(request.duration_seconds)
        .bind(collateral.id)
        .bind(ltv_bps)
        .bind(&request.on_chain_offer_id)
        .fetch_one(&mut *tx)
        .await
        {
            Ok(loan) => loan,
            Err(err) => {
                // A concurrent create with the same on-chain offer id won the
                // insert; drop our transaction and absorb the retry like the
                // pre-read does
                if violates_constraint(&err, "loans_on_chain_offer_id_key") {
                    drop(tx);
                    if let Some(offer_id) = request.on_chain_offer_id.as_deref() {
                        if let Some(existing) = self.find_by_offer_id(offer_id).await? {
                            return Ok(existing);
                        }
                    }
                }
                return Err(map_constraint_violation(err, &request));
            }
        };

        sqlx::query("UPDATE collateral SET locked_in_loan_id = $1, updated_at = now() WHERE id = $2")
            .bind(loan.id)
            .bind(collateral.id)
            .execute(&mut *tx)
            .await?;

        record_transaction(
            &mut tx,
            loan.id,
            TxKind::OfferCreated,
            &principal,
            request.tx_hash.as_deref(),
        )
        .await?;

        sqlx::query(
            "UPDATE users SET total_borrowed = total_borrowed + $1, updated_at = now() WHERE id = $2",
        )
        .bind(&principal)
        .bind(borrower.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            loan_id = %loan.id,
            borrower = %borrower.wallet_address,
            principal = %loan.principal,
            ltv_bps = loan.ltv_bps,
            "Loan offer created"
        );

        Ok(loan)
    }

    // ===== Funding =====

    /// Fund an open offer, at most once.
    ///
    /// The transition is a compare-and-swap on `status = 'active'`; losing
    /// the swap after a pre-read that saw `active` means a concurrent funder
    /// won, which is `AlreadyFunded`, not a retry. Replaying a successful
    /// funding with the same tx hash returns the loan unchanged.
    pub async fn fund_loan(&self, request: FundLoanRequest) -> Result<Loan, ApiError> {
        request.validate()?;

        let lender = self.identity.resolve_or_create(&request.lender_address).await?;

        let mut tx = self.db_pool.begin().await?;

        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(request.loan_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Loan {} not found", request.loan_id)))?;

        // Idempotent replay of a committed funding
        if loan.status == LoanStatus::Funded
            && loan.funding_tx_hash.as_deref() == Some(request.tx_hash.as_str())
        {
            return Ok(loan);
        }

        if lender.id == loan.borrower_id {
            return Err(ApiError::Forbidden(
                "Borrower cannot fund their own loan".to_string(),
            ));
        }

        if loan.status != LoanStatus::Active {
            return Err(ApiError::InvalidState(format!(
                "Loan is not open for funding (status: {:?})",
                loan.status
            )));
        }

        let now = Utc::now();
        let due_date = now + Duration::seconds(loan.duration_seconds);

        let funded = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans
            SET status = 'funded',
                lender_id = $2,
                funded_at = $3,
                due_date = $4,
                funding_tx_hash = $5,
                on_chain_loan_id = COALESCE($6, on_chain_loan_id),
                updated_at = $3
            WHERE id = $1 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(loan.id)
        .bind(lender.id)
        .bind(now)
        .bind(due_date)
        .bind(&request.tx_hash)
        .bind(&request.on_chain_loan_id)
        .fetch_optional(&mut *tx)
        .await?;

        let funded = match funded {
            Some(loan) => loan,
            // Zero rows: a concurrent funder won between read and update
            None => {
                let current = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
                    .bind(loan.id)
                    .fetch_one(&mut *tx)
                    .await?;
                if current.status == LoanStatus::Funded
                    && current.funding_tx_hash.as_deref() == Some(request.tx_hash.as_str())
                {
                    return Ok(current);
                }
                return Err(ApiError::AlreadyFunded(format!(
                    "Loan {} was funded by a concurrent request",
                    loan.id
                )));
            }
        };

        sqlx::query(
            "UPDATE users SET total_lent = total_lent + $1, updated_at = now() WHERE id = $2",
        )
        .bind(&funded.principal)
        .bind(lender.id)
        .execute(&mut *tx)
        .await?;

        record_transaction(
            &mut tx,
            funded.id,
            TxKind::Funded,
            &funded.principal,
            Some(request.tx_hash.as_str()),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            loan_id = %funded.id,
            lender = %lender.wallet_address,
            amount = %funded.principal,
            tx_hash = %request.tx_hash,
            "Loan funded"
        );

        Ok(funded)
    }

    // ===== Liquidation =====

    /// Liquidate an overdue funded loan: the lender seizes the collateral.
    pub async fn liquidate(&self, request: LiquidateLoanRequest) -> Result<Loan, ApiError> {
        request.validate()?;

        let caller_wallet = normalize_wallet(&request.lender_address);

        let mut tx = self.db_pool.begin().await?;

        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(request.loan_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Loan {} not found", request.loan_id)))?;

        // Idempotent replay of a committed liquidation
        if loan.status == LoanStatus::Liquidated
            && loan.liquidation_tx_hash.as_deref() == Some(request.tx_hash.as_str())
        {
            return Ok(loan);
        }

        if loan.status != LoanStatus::Funded {
            return Err(ApiError::InvalidState(format!(
                "Only funded loans can be liquidated (status: {:?})",
                loan.status
            )));
        }

        let due_date = loan.due_date.ok_or_else(|| {
            ApiError::InternalError(format!("Funded loan {} has no due date", loan.id))
        })?;
        let now = Utc::now();
        if now <= due_date {
            return Err(ApiError::NotOverdue(format!(
                "Loan {} is due at {}",
                loan.id, due_date
            )));
        }

        let lender_id = loan.lender_id.ok_or_else(|| {
            ApiError::InternalError(format!("Funded loan {} has no lender", loan.id))
        })?;
        let lender_wallet: String = sqlx::query_scalar("SELECT wallet_address FROM users WHERE id = $1")
            .bind(lender_id)
            .fetch_one(&mut *tx)
            .await?;

        if caller_wallet != lender_wallet {
            return Err(ApiError::Forbidden(
                "Only the lender can liquidate this loan".to_string(),
            ));
        }

        let liquidated = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans
            SET status = 'liquidated',
                liquidated_at = $2,
                liquidation_tx_hash = $3,
                updated_at = $2
            WHERE id = $1 AND status = 'funded'
            RETURNING *
            "#,
        )
        .bind(loan.id)
        .bind(now)
        .bind(&request.tx_hash)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            ApiError::Conflict(format!(
                "Loan {} changed state during liquidation",
                loan.id
            ))
        })?;

        // Collateral ownership passes to the lender; the lock is released
        sqlx::query(
            r#"
            UPDATE collateral
            SET owner_id = $2, is_locked = FALSE, locked_in_loan_id = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(liquidated.collateral_id)
        .bind(lender_id)
        .execute(&mut *tx)
        .await?;

        record_transaction(
            &mut tx,
            liquidated.id,
            TxKind::Liquidated,
            &liquidated.principal,
            Some(request.tx_hash.as_str()),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            loan_id = %liquidated.id,
            lender = %lender_wallet,
            tx_hash = %request.tx_hash,
            "Loan liquidated, collateral transferred to lender"
        );

        Ok(liquidated)
    }

    // ===== External repayment notifier =====

    /// Limited update from the repayment notifier.
    ///
    /// The only status change accepted here is funded → repaid, and it
    /// requires the repayment tx hash. Anything else on this path is a bare
    /// `on_chain_loan_id` backfill.
    pub async fn apply_update(&self, request: UpdateLoanRequest) -> Result<Loan, ApiError> {
        match request.status {
            Some(LoanStatus::Repaid) => self.record_repayment(request).await,
            Some(other) => Err(ApiError::InvalidState(format!(
                "Status {:?} cannot be set through this endpoint",
                other
            ))),
            None => {
                let loan = sqlx::query_as::<_, Loan>(
                    r#"
                    UPDATE loans
                    SET on_chain_loan_id = COALESCE($2, on_chain_loan_id), updated_at = now()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(request.loan_id)
                .bind(&request.on_chain_loan_id)
                .fetch_optional(&self.db_pool)
                .await?
                .ok_or_else(|| {
                    ApiError::NotFound(format!("Loan {} not found", request.loan_id))
                })?;

                Ok(loan)
            }
        }
    }

    async fn record_repayment(&self, request: UpdateLoanRequest) -> Result<Loan, ApiError> {
        let tx_hash = request.repayment_tx_hash.as_deref().ok_or_else(|| {
            ApiError::ValidationError(
                "A repayment transaction hash is required to mark a loan repaid".to_string(),
            )
        })?;

        let mut tx = self.db_pool.begin().await?;

        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(request.loan_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Loan {} not found", request.loan_id)))?;

        if loan.status == LoanStatus::Repaid
            && loan.repayment_tx_hash.as_deref() == Some(tx_hash)
        {
            return Ok(loan);
        }

        if loan.status != LoanStatus::Funded {
            return Err(ApiError::InvalidState(format!(
                "Only funded loans can be repaid (status: {:?})",
                loan.status
            )));
        }

        let now = Utc::now();
        let repaid = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans
            SET status = 'repaid',
                repaid_at = $2,
                repayment_tx_hash = $3,
                on_chain_loan_id = COALESCE($4, on_chain_loan_id),
                updated_at = $2
            WHERE id = $1 AND status = 'funded'
            RETURNING *
            "#,
        )
        .bind(loan.id)
        .bind(now)
        .bind(tx_hash)
        .bind(&request.on_chain_loan_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            ApiError::Conflict(format!("Loan {} changed state during repayment", loan.id))
        })?;

        // The NFT goes back to the borrower: owner unchanged, lock released
        sqlx::query(
            r#"
            UPDATE collateral
            SET is_locked = FALSE, locked_in_loan_id = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(repaid.collateral_id)
        .execute(&mut *tx)
        .await?;

        record_transaction(&mut tx, repaid.id, TxKind::Repaid, &repaid.principal, Some(tx_hash))
            .await?;

        tx.commit().await?;

        tracing::info!(
            loan_id = %repaid.id,
            tx_hash = %tx_hash,
            "Loan repaid, collateral returned to borrower"
        );

        Ok(repaid)
    }

    /// The append-only event log for a loan, oldest first
    pub async fn transactions_for_loan(
        &self,
        loan_id: Uuid,
    ) -> Result<Vec<LedgerTransaction>, ApiError> {
        let entries = sqlx::query_as::<_, LedgerTransaction>(
            "SELECT * FROM ledger_transactions WHERE loan_id = $1 ORDER BY recorded_at",
        )
        .bind(loan_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(entries)
    }

    async fn find_by_offer_id(&self, offer_id: &str) -> Result<Option<Loan>, ApiError> {
        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE on_chain_offer_id = $1")
            .bind(offer_id)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(loan)
    }
}

/// Append one ledger transaction inside the caller's database transaction
async fn record_transaction(
    tx: &mut Transaction<'_, Postgres>,
    loan_id: Uuid,
    kind: TxKind,
    amount: &BigDecimal,
    on_chain_tx_hash: Option<&str>,
) -> Result<LedgerTransaction, ApiError> {
    let entry = sqlx::query_as::<_, LedgerTransaction>(
        r#"
        INSERT INTO ledger_transactions (id, loan_id, kind, amount, on_chain_tx_hash)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(loan_id)
    .bind(kind)
    .bind(amount)
    .bind(on_chain_tx_hash)
    .fetch_one(&mut **tx)
    .await?;

    Ok(entry)
}

/// True when the error is a unique violation on the named constraint
fn violates_constraint(err: &sqlx::Error, name: &str) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.is_unique_violation() && db.constraint() == Some(name)
    )
}

/// Translate constraint violations raised mid-create into the ledger's
/// conflict taxonomy.
fn map_constraint_violation(err: sqlx::Error, request: &CreateLoanRequest) -> ApiError {
    if let sqlx::Error::Database(ref db) = err {
        if db.is_unique_violation() {
            return match db.constraint() {
                Some("collateral_single_lock") => ApiError::CollateralAlreadyLocked(format!(
                    "NFT {}/{} already backs an active loan",
                    request.asset_contract, request.token_id
                )),
                Some("loans_on_chain_offer_id_key") => ApiError::Conflict(
                    "An offer with this on-chain id was created concurrently".to_string(),
                ),
                _ => ApiError::Conflict(db.message().to_string()),
            };
        }
    }
    ApiError::from(err)
}
