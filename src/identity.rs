//! Identity resolution — wallet address to internal user
//!
//! Wallets show up unannounced: a first-time lender has no account until the
//! moment they fund a loan. Resolution is create-on-first-sight and must
//! tolerate two requests racing to create the same identity.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{normalize_wallet, User};

#[derive(Clone)]
pub struct IdentityService {
    db_pool: PgPool,
}

impl IdentityService {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Look up a user by wallet address (case-insensitive)
    pub async fn find_by_wallet(&self, wallet_address: &str) -> Result<Option<User>, ApiError> {
        let wallet = normalize_wallet(wallet_address);
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE wallet_address = $1")
            .bind(&wallet)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(user)
    }

    /// Look up a user by internal id
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(user)
    }

    /// Resolve a wallet to its user, creating the identity on first sight.
    ///
    /// Two concurrent calls for the same unseen wallet both succeed and
    /// return the same row: the insert is `ON CONFLICT DO NOTHING` and the
    /// loser falls through to a re-read.
    pub async fn resolve_or_create(&self, wallet_address: &str) -> Result<User, ApiError> {
        let wallet = normalize_wallet(wallet_address);
        if wallet.is_empty() {
            return Err(ApiError::ValidationError(
                "Wallet address is required".to_string(),
            ));
        }

        if let Some(user) = self.find_by_wallet(&wallet).await? {
            return Ok(user);
        }

        let username = default_username(&wallet);
        let inserted = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, wallet_address, username)
            VALUES ($1, $2, $3)
            ON CONFLICT (wallet_address) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&wallet)
        .bind(&username)
        .fetch_optional(&self.db_pool)
        .await?;

        match inserted {
            Some(user) => {
                tracing::info!(user_id = %user.id, wallet = %wallet, "Created user on first sight");
                Ok(user)
            }
            // Lost the insert race; the winner's row exists now
            None => self
                .find_by_wallet(&wallet)
                .await?
                .ok_or_else(|| ApiError::InternalError("User creation race lost twice".to_string())),
        }
    }

    /// Explicit registration with a chosen username
    pub async fn register(&self, username: &str, wallet_address: &str) -> Result<User, ApiError> {
        let wallet = normalize_wallet(wallet_address);

        let existing = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE username = $1 OR wallet_address = $2",
        )
        .bind(username)
        .bind(&wallet)
        .fetch_optional(&self.db_pool)
        .await?;

        if existing.is_some() {
            return Err(ApiError::Conflict(
                "Username or wallet address already in use".to_string(),
            ));
        }

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, wallet_address, username)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&wallet)
        .bind(username)
        .fetch_one(&self.db_pool)
        .await
        .map_err(|e| match e {
            // Unique violation from a concurrent register wins the same 409
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                ApiError::Conflict("Username or wallet address already in use".to_string())
            }
            other => ApiError::from(other),
        })?;

        tracing::info!(user_id = %user.id, username = %user.username, "User registered");
        Ok(user)
    }
}

/// Generated username for first-sight identities. Built from the full
/// normalized address: wallets are unique, so a truncated prefix could
/// collide on the username unique constraint while the wallet conflict
/// target absorbs nothing.
fn default_username(wallet: &str) -> String {
    format!("user_{}", wallet.trim_start_matches("0x"))
}
