//! Postgres-backed implementation of the orchestrator's persistence seam,
//! plus grant-code consumption for the token exchange.
//!
//! Uniqueness of (tenancy, provider, provider account) is enforced by a
//! database constraint; concurrent creations surface as SQLSTATE 23505 and
//! are reported as conflicts for the orchestrator to retry, never as crashes.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::oauth::callback::{
    CallbackStore, CreateAccountOutcome, CreateUserOutcome,
};
use crate::oauth::types::{
    FederatedAccount, GrantCode, NewFederatedUser, OuterStateRow, ProviderTokenRecord, UserRecord,
};
use crate::tenancy::{self, Tenancy};

/// SQLSTATE 23505, unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

#[derive(Clone)]
pub struct PgCallbackStore {
    pool: PgPool,
}

impl PgCallbackStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl CallbackStore for PgCallbackStore {
    async fn load_outer_state(&self, inner_state: &str) -> Result<Option<OuterStateRow>> {
        let query = r"
            SELECT info, expires_at
            FROM oauth_outer_states
            WHERE inner_state = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(inner_state)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load outer OAuth state row")?;
        Ok(row.map(|row| OuterStateRow {
            info: row.get("info"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn get_tenancy(&self, tenancy_id: Uuid) -> Result<Option<Tenancy>> {
        tenancy::get_tenancy(&self.pool, tenancy_id).await
    }

    async fn get_user(&self, tenancy_id: Uuid, user_id: Uuid) -> Result<Option<UserRecord>> {
        let query = r"
            SELECT id, tenancy_id, primary_email, primary_email_auth_enabled
            FROM users
            WHERE tenancy_id = $1 AND id = $2
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(tenancy_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .with_context(|| format!("failed to load user {user_id}"))?;
        Ok(row.map(|row| UserRecord {
            id: row.get("id"),
            tenancy_id: row.get("tenancy_id"),
            primary_email: row.get("primary_email"),
            primary_email_auth_enabled: row.get("primary_email_auth_enabled"),
        }))
    }

    async fn user_oauth_account(
        &self,
        tenancy_id: Uuid,
        user_id: Uuid,
        provider_id: &str,
    ) -> Result<Option<FederatedAccount>> {
        let query = r"
            SELECT tenancy_id, provider_id, provider_account_id, user_id, email
            FROM oauth_accounts
            WHERE tenancy_id = $1 AND user_id = $2 AND provider_id = $3
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(tenancy_id)
            .bind(user_id)
            .bind(provider_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load user's provider account")?;
        Ok(row.map(account_from_row))
    }

    async fn find_oauth_account(
        &self,
        tenancy_id: Uuid,
        provider_id: &str,
        provider_account_id: &str,
    ) -> Result<Option<FederatedAccount>> {
        let query = r"
            SELECT tenancy_id, provider_id, provider_account_id, user_id, email
            FROM oauth_accounts
            WHERE tenancy_id = $1 AND provider_id = $2 AND provider_account_id = $3
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(tenancy_id)
            .bind(provider_id)
            .bind(provider_account_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up federated account")?;
        Ok(row.map(account_from_row))
    }

    async fn create_oauth_account(
        &self,
        account: &FederatedAccount,
    ) -> Result<CreateAccountOutcome> {
        let query = r"
            INSERT INTO oauth_accounts
                (tenancy_id, provider_id, provider_account_id, user_id, email)
            VALUES ($1, $2, $3, $4, $5)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(account.tenancy_id)
            .bind(&account.provider_id)
            .bind(&account.provider_account_id)
            .bind(account.user_id)
            .bind(&account.email)
            .execute(&self.pool)
            .instrument(span)
            .await;
        match result {
            Ok(_) => Ok(CreateAccountOutcome::Created),
            Err(err) if is_unique_violation(&err) => {
                debug!("federated account already exists, reporting conflict");
                Ok(CreateAccountOutcome::Conflict)
            }
            Err(err) => Err(err).context("failed to insert federated account"),
        }
    }

    async fn create_user(
        &self,
        tenancy_id: Uuid,
        user: &NewFederatedUser,
        account: &FederatedAccount,
    ) -> Result<CreateUserOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin sign-up transaction")?;

        let insert_user = r"
            INSERT INTO users
                (tenancy_id, primary_email, primary_email_verified,
                 primary_email_auth_enabled, display_name, profile_image_url)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = insert_user
        );
        let row = sqlx::query(insert_user)
            .bind(tenancy_id)
            .bind(&user.primary_email)
            .bind(user.primary_email_verified)
            .bind(user.primary_email_auth_enabled)
            .bind(&user.display_name)
            .bind(&user.profile_image_url)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert user")?;
        let user_id: Uuid = row.get("id");

        let insert_account = r"
            INSERT INTO oauth_accounts
                (tenancy_id, provider_id, provider_account_id, user_id, email)
            VALUES ($1, $2, $3, $4, $5)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = insert_account
        );
        let result = sqlx::query(insert_account)
            .bind(account.tenancy_id)
            .bind(&account.provider_id)
            .bind(&account.provider_account_id)
            .bind(user_id)
            .bind(&account.email)
            .execute(&mut *tx)
            .instrument(span)
            .await;
        match result {
            Ok(_) => {
                tx.commit().await.context("failed to commit sign-up")?;
                Ok(CreateUserOutcome::Created(user_id))
            }
            Err(err) if is_unique_violation(&err) => {
                tx.rollback()
                    .await
                    .context("failed to roll back lost sign-up race")?;
                debug!("sign-up lost the federated-account race");
                Ok(CreateUserOutcome::AccountConflict)
            }
            Err(err) => Err(err).context("failed to insert federated account during sign-up"),
        }
    }

    async fn auth_email_taken(&self, tenancy_id: Uuid, email: &str) -> Result<bool> {
        let query = r"
            SELECT EXISTS (
                SELECT 1 FROM users
                WHERE tenancy_id = $1
                  AND primary_email = $2
                  AND primary_email_verified
                  AND primary_email_auth_enabled
            ) AS taken
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(tenancy_id)
            .bind(email)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to check email auth uniqueness")?;
        Ok(row.get("taken"))
    }

    async fn store_provider_tokens(&self, record: &ProviderTokenRecord) -> Result<()> {
        // Append-only bookkeeping: historical rows are kept, the newest row
        // is the current token set.
        let insert_access = r"
            INSERT INTO oauth_access_tokens
                (tenancy_id, provider_id, provider_account_id, token, scopes, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = insert_access
        );
        sqlx::query(insert_access)
            .bind(record.tenancy_id)
            .bind(&record.provider_id)
            .bind(&record.provider_account_id)
            .bind(&record.access_token)
            .bind(&record.scopes)
            .bind(record.access_token_expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to store provider access token")?;

        if let Some(refresh_token) = &record.refresh_token {
            let insert_refresh = r"
                INSERT INTO oauth_refresh_tokens
                    (tenancy_id, provider_id, provider_account_id, token, scopes)
                VALUES ($1, $2, $3, $4, $5)
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = insert_refresh
            );
            sqlx::query(insert_refresh)
                .bind(record.tenancy_id)
                .bind(&record.provider_id)
                .bind(&record.provider_account_id)
                .bind(refresh_token)
                .bind(&record.scopes)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to store provider refresh token")?;
        }

        Ok(())
    }

    async fn insert_grant_code(&self, grant: &GrantCode) -> Result<()> {
        let query = r"
            INSERT INTO oauth_grant_codes
                (code, tenancy_id, user_id, new_user, redirect_uri, code_challenge,
                 code_challenge_method, after_callback_redirect_url, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&grant.code)
            .bind(grant.tenancy_id)
            .bind(grant.user_id)
            .bind(grant.new_user)
            .bind(&grant.redirect_uri)
            .bind(&grant.code_challenge)
            .bind(&grant.code_challenge_method)
            .bind(&grant.after_callback_redirect_url)
            .bind(grant.expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert grant code")?;
        Ok(())
    }
}

fn account_from_row(row: sqlx::postgres::PgRow) -> FederatedAccount {
    FederatedAccount {
        tenancy_id: row.get("tenancy_id"),
        provider_id: row.get("provider_id"),
        provider_account_id: row.get("provider_account_id"),
        user_id: row.get("user_id"),
        email: row.get("email"),
    }
}

/// Atomically consume a grant code. The `DELETE ... RETURNING` makes the
/// code single-use: of two racing exchanges, exactly one gets the row.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn consume_grant_code(pool: &PgPool, code: &str) -> Result<Option<GrantCode>> {
    let query = r"
        DELETE FROM oauth_grant_codes
        WHERE code = $1
        RETURNING code, tenancy_id, user_id, new_user, redirect_uri, code_challenge,
                  code_challenge_method, after_callback_redirect_url, expires_at
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(code)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to consume grant code")?;
    Ok(row.map(|row| GrantCode {
        code: row.get("code"),
        tenancy_id: row.get("tenancy_id"),
        user_id: row.get("user_id"),
        new_user: row.get("new_user"),
        redirect_uri: row.get("redirect_uri"),
        code_challenge: row.get("code_challenge"),
        code_challenge_method: row.get("code_challenge_method"),
        after_callback_redirect_url: row.get("after_callback_redirect_url"),
        expires_at: row.get("expires_at"),
    }))
}
