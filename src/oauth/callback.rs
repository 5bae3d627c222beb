//! OAuth callback orchestrator.
//!
//! Drives one callback request through the state machine: cookie
//! consumption, outer-state load and validation, tenancy resolution, expiry
//! check, provider exchange, linking/sign-up resolution, token bookkeeping,
//! grant-code issuance, and redirect emission. Known flow errors cross the
//! outer boundary as redirects only when the outer state carries an error
//! page that validates against the tenancy's trusted domains.
//!
//! The orchestrator depends only on the [`CallbackStore`],
//! [`ProviderExchange`], and [`InnerCookieJar`] seams, so the whole machine
//! is testable without Postgres or HTTP.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::oauth::error::{CallbackError, KnownOAuthError};
use crate::oauth::provider::{
    ProviderCallbackRequest, ProviderEndpoints, ProviderError, ProviderExchange,
};
use crate::oauth::redirect::{
    authorization_redirect, redirect_or_error, validate_redirect_url, CallbackRedirect,
};
use crate::oauth::resolver::{self, EmailAuthStatus, FlowIntent, Resolution, ResolveError};
use crate::oauth::types::{
    extract_scopes, FederatedAccount, FlowType, GrantCode, NewFederatedUser, OuterOAuthState,
    OuterStateRow, ProviderCallback, ProviderTokenRecord, UserRecord,
};
use crate::oauth::OAuthConfig;
use crate::tenancy::{ProviderConfig, Tenancy};
use crate::tokens::generate_opaque_secret;

/// Cookie name prefix; the inner-state value completes the name.
pub const INNER_COOKIE_PREFIX: &str = "federato-oauth-inner-";

/// Sentinel value the flow initiator sets on the inner cookie.
pub const INNER_COOKIE_VALUE: &str = "true";

/// Single-use cookie access. `take` removes the cookie so a racing request
/// observes it as absent and fails closed.
pub trait InnerCookieJar {
    fn take(&mut self, name: &str) -> Option<String>;
}

impl InnerCookieJar for HashMap<String, String> {
    fn take(&mut self, name: &str) -> Option<String> {
        self.remove(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateAccountOutcome {
    Created,
    /// Unique constraint hit: a concurrent callback created the row first.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateUserOutcome {
    Created(Uuid),
    /// The federated-account insert inside user creation hit the unique
    /// constraint; the caller re-reads the winner and degrades to sign-in.
    AccountConflict,
}

/// Persistence operations the orchestrator needs. The Postgres
/// implementation lives in [`storage`](crate::oauth::storage); tests drive
/// the machine with an in-memory fake.
#[allow(async_fn_in_trait)]
pub trait CallbackStore {
    async fn load_outer_state(&self, inner_state: &str) -> Result<Option<OuterStateRow>>;
    async fn get_tenancy(&self, tenancy_id: Uuid) -> Result<Option<Tenancy>>;
    async fn get_user(&self, tenancy_id: Uuid, user_id: Uuid) -> Result<Option<UserRecord>>;
    /// The user's existing account on a provider, regardless of provider
    /// account id. Used by the link-flow pre-check.
    async fn user_oauth_account(
        &self,
        tenancy_id: Uuid,
        user_id: Uuid,
        provider_id: &str,
    ) -> Result<Option<FederatedAccount>>;
    async fn find_oauth_account(
        &self,
        tenancy_id: Uuid,
        provider_id: &str,
        provider_account_id: &str,
    ) -> Result<Option<FederatedAccount>>;
    async fn create_oauth_account(&self, account: &FederatedAccount)
        -> Result<CreateAccountOutcome>;
    /// Create the user and its federated account in one transaction.
    async fn create_user(
        &self,
        tenancy_id: Uuid,
        user: &NewFederatedUser,
        account: &FederatedAccount,
    ) -> Result<CreateUserOutcome>;
    /// Whether any account in the tenancy already authenticates with this
    /// email.
    async fn auth_email_taken(&self, tenancy_id: Uuid, email: &str) -> Result<bool>;
    async fn store_provider_tokens(&self, record: &ProviderTokenRecord) -> Result<()>;
    async fn insert_grant_code(&self, grant: &GrantCode) -> Result<()>;
}

/// One incoming callback request, transport-independent.
pub struct CallbackRequest {
    pub provider_id: String,
    /// Merged query and body parameters.
    pub params: HashMap<String, String>,
}

struct AuthorizedUser {
    user_id: Uuid,
    new_user: bool,
}

/// Run the callback state machine to completion.
///
/// # Errors
///
/// [`CallbackError::BadRequest`] for missing/invalid cookie or unknown
/// state; [`CallbackError::Known`] for flow errors that could not be
/// redirected; [`CallbackError::InvalidScope`] for a rejected scope;
/// [`CallbackError::Assertion`] for invariant violations.
pub async fn run_callback<S, P, C>(
    store: &S,
    providers: &P,
    cookies: &mut C,
    config: &OAuthConfig,
    now: DateTime<Utc>,
    request: &CallbackRequest,
) -> Result<CallbackRedirect, CallbackError>
where
    S: CallbackStore,
    P: ProviderExchange,
    C: InnerCookieJar,
{
    // Cookie consumption comes first, before any persistence is touched.
    let state_param = request
        .params
        .get("state")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CallbackError::BadRequest("missing state parameter".to_string()))?;

    let cookie_name = format!("{INNER_COOKIE_PREFIX}{state_param}");
    if cookies.take(&cookie_name).as_deref() != Some(INNER_COOKIE_VALUE) {
        return Err(CallbackError::BadRequest(
            "inner OAuth cookie is missing; this usually means the page was refreshed during \
             the sign-in process"
                .to_string(),
        ));
    }

    let row = store
        .load_outer_state(state_param)
        .await
        .context("failed to load outer OAuth state")?
        .ok_or_else(|| {
            CallbackError::BadRequest("invalid OAuth cookie, please try signing in again".to_string())
        })?;

    // The row column is authoritative for expiry; the payload copy is not
    // consulted so the two cannot silently disagree.
    let row_expires_at = row.expires_at;

    // A row that exists but does not validate is corruption, not user input.
    let state: OuterOAuthState = serde_json::from_value(row.info)
        .map_err(|err| anyhow!("outer OAuth state failed schema validation: {err}"))?;

    let tenancy = store
        .get_tenancy(state.tenancy_id)
        .await
        .context("failed to resolve tenancy")?
        .ok_or_else(|| {
            anyhow!(
                "outer OAuth state references missing tenancy {}",
                state.tenancy_id
            )
        })?;

    match run_inner(
        store,
        providers,
        config,
        now,
        row_expires_at,
        request,
        &tenancy,
        &state,
    )
    .await
    {
        Ok(redirect) => Ok(redirect),
        Err(CallbackError::Known(known)) => {
            warn!(
                error_code = known.error_code(),
                tenancy_id = %tenancy.id,
                "OAuth callback failed with known error"
            );
            redirect_or_error(known, &tenancy, state.error_redirect_url.as_deref())
        }
        Err(other) => Err(other),
    }
}

/// Steps 4 onward, inside the outer error boundary: any `Known` error
/// returned here may be turned into an error redirect by the caller.
#[allow(clippy::too_many_arguments)]
async fn run_inner<S, P>(
    store: &S,
    providers: &P,
    config: &OAuthConfig,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    request: &CallbackRequest,
    tenancy: &Tenancy,
    state: &OuterOAuthState,
) -> Result<CallbackRedirect, CallbackError>
where
    S: CallbackStore,
    P: ProviderExchange,
{
    if expires_at <= now {
        return Err(KnownOAuthError::OuterOAuthTimeout.into());
    }

    let provider = tenancy
        .enabled_provider(&request.provider_id)
        .ok_or(KnownOAuthError::OAuthProviderNotFoundOrNotEnabled)?;

    let callback_url = config.callback_url(&request.provider_id);
    let exchange = providers
        .get_callback(
            provider,
            ProviderCallbackRequest {
                code_verifier: &state.inner_code_verifier,
                state: &state.inner_state,
                callback_url: &callback_url,
                params: &request.params,
            },
        )
        .await
        .map_err(|err| match err {
            ProviderError::AccessDenied => {
                CallbackError::Known(KnownOAuthError::OAuthProviderAccessDenied)
            }
            other => CallbackError::Assertion(anyhow::Error::new(other)),
        })?;

    // Link-flow pre-check: a different identity on the same provider must be
    // rejected before anything is persisted.
    let intent = match state.flow {
        FlowType::Authenticate => FlowIntent::Authenticate,
        FlowType::Link => {
            let project_user_id = state
                .project_user_id
                .ok_or_else(|| anyhow!("link flow outer state has no project_user_id"))?;
            let user = store
                .get_user(tenancy.id, project_user_id)
                .await
                .context("failed to load link target user")?
                .ok_or_else(|| anyhow!("link flow references missing user {project_user_id}"))?;
            if let Some(existing) = store
                .user_oauth_account(tenancy.id, user.id, &request.provider_id)
                .await
                .context("failed to check user's existing provider account")?
            {
                if existing.provider_account_id != exchange.user_info.account_id {
                    return Err(
                        KnownOAuthError::UserAlreadyConnectedToAnotherOAuthConnection.into(),
                    );
                }
            }
            FlowIntent::Link { project_user_id }
        }
    };

    authorize(
        store, config, now, request, tenancy, provider, state, intent, &exchange,
    )
    .await
}

/// Steps 8–9: redirect-parameter validation, identity resolution with race
/// handling, token bookkeeping, grant-code issuance, redirect emission.
#[allow(clippy::too_many_arguments)]
async fn authorize<S>(
    store: &S,
    config: &OAuthConfig,
    now: DateTime<Utc>,
    request: &CallbackRequest,
    tenancy: &Tenancy,
    provider: &ProviderConfig,
    state: &OuterOAuthState,
    intent: FlowIntent,
    exchange: &ProviderCallback,
) -> Result<CallbackRedirect, CallbackError>
where
    S: CallbackStore,
{
    if !validate_redirect_url(&state.redirect_uri, &tenancy.domains, tenancy.allow_localhost) {
        return Err(KnownOAuthError::RedirectUrlNotWhitelisted.into());
    }
    if !scope_is_valid(&state.scope) {
        error!(
            tenancy_id = %tenancy.id,
            scope = state.scope,
            "authorization request carries an invalid scope; client or local bug"
        );
        return Err(CallbackError::InvalidScope);
    }
    if state.response_type != "code" {
        return Err(CallbackError::Assertion(anyhow!(
            "unsupported response_type '{}' in outer OAuth state",
            state.response_type
        )));
    }

    let authorized =
        resolve_identity(store, tenancy, &request.provider_id, intent, exchange).await?;

    // Token bookkeeping runs exactly once on every successful branch so
    // provider-token freshness is uniform across link/sign-in/sign-up.
    store
        .store_provider_tokens(&ProviderTokenRecord {
            tenancy_id: tenancy.id,
            provider_id: request.provider_id.clone(),
            provider_account_id: exchange.user_info.account_id.clone(),
            access_token: exchange.token_set.access_token.clone(),
            refresh_token: exchange.token_set.refresh_token.clone(),
            scopes: provider_token_scopes(provider, state.provider_scope.as_deref()),
            access_token_expires_at: exchange.token_set.access_token_expired_at,
        })
        .await
        .context("failed to store provider tokens")?;

    let code = generate_opaque_secret()?;
    store
        .insert_grant_code(&GrantCode {
            code: code.clone(),
            tenancy_id: tenancy.id,
            user_id: authorized.user_id,
            new_user: authorized.new_user,
            redirect_uri: state.redirect_uri.clone(),
            code_challenge: state.code_challenge.clone(),
            code_challenge_method: state.code_challenge_method.clone(),
            after_callback_redirect_url: state.after_callback_redirect_url.clone(),
            expires_at: now + Duration::seconds(config.grant_code_ttl_seconds()),
        })
        .await
        .context("failed to persist grant code")?;

    info!(
        tenancy_id = %tenancy.id,
        provider_id = request.provider_id,
        new_user = authorized.new_user,
        "OAuth callback authorized"
    );

    authorization_redirect(&state.redirect_uri, &code, &state.state)
}

/// Resolve the federated identity to a local user, retrying once when a
/// concurrent callback wins the account-creation race. The unique
/// constraint on (tenancy, provider, provider account) guarantees the
/// re-read observes the winner.
async fn resolve_identity<S>(
    store: &S,
    tenancy: &Tenancy,
    provider_id: &str,
    intent: FlowIntent,
    exchange: &ProviderCallback,
) -> Result<AuthorizedUser, CallbackError>
where
    S: CallbackStore,
{
    let provider_account_id = &exchange.user_info.account_id;
    // Any provider email can become the authenticating email as long as no
    // other account in the tenancy already uses it for auth; verification
    // status is recorded on the user but does not gate this.
    let email = exchange.user_info.email.as_deref();

    for attempt in 0..2 {
        let existing = store
            .find_oauth_account(tenancy.id, provider_id, provider_account_id)
            .await
            .context("failed to look up federated account")?;

        let email_auth = match email {
            None => EmailAuthStatus::NoEmail,
            Some(email) => {
                if store
                    .auth_email_taken(tenancy.id, email)
                    .await
                    .context("failed to check email auth uniqueness")?
                {
                    EmailAuthStatus::TakenForAuth
                } else {
                    EmailAuthStatus::Available
                }
            }
        };

        let resolution = resolver::resolve(
            existing.as_ref(),
            intent,
            tenancy.sign_up_enabled,
            email_auth,
        )
        .map_err(|err| match err {
            ResolveError::AlreadyConnectedToAnotherUser => {
                CallbackError::Known(KnownOAuthError::OAuthConnectionAlreadyConnectedToAnotherUser)
            }
            ResolveError::SignUpNotEnabled => {
                CallbackError::Known(KnownOAuthError::SignUpNotEnabled)
            }
        })?;

        let account = |user_id: Uuid| FederatedAccount {
            tenancy_id: tenancy.id,
            provider_id: provider_id.to_string(),
            provider_account_id: provider_account_id.clone(),
            user_id,
            email: exchange.user_info.email.clone(),
        };

        match resolution {
            Resolution::Link {
                user_id,
                create_account: false,
            }
            | Resolution::SignIn { user_id } => {
                return Ok(AuthorizedUser {
                    user_id,
                    new_user: false,
                });
            }
            Resolution::Link {
                user_id,
                create_account: true,
            } => match store
                .create_oauth_account(&account(user_id))
                .await
                .context("failed to create federated account")?
            {
                CreateAccountOutcome::Created => {
                    return Ok(AuthorizedUser {
                        user_id,
                        new_user: false,
                    });
                }
                CreateAccountOutcome::Conflict => {
                    debug!(attempt, "lost federated-account creation race, re-reading");
                }
            },
            Resolution::SignUp { email_auth_enabled } => {
                let new_user = NewFederatedUser {
                    primary_email: exchange.user_info.email.clone(),
                    primary_email_verified: exchange.user_info.email_verified,
                    primary_email_auth_enabled: email_auth_enabled,
                    display_name: exchange.user_info.display_name.clone(),
                    profile_image_url: exchange.user_info.profile_image_url.clone(),
                };
                // The account row's user id is assigned inside the store's
                // transaction; the template carries the rest.
                match store
                    .create_user(tenancy.id, &new_user, &account(Uuid::nil()))
                    .await
                    .context("failed to create user")?
                {
                    CreateUserOutcome::Created(user_id) => {
                        return Ok(AuthorizedUser {
                            user_id,
                            new_user: true,
                        });
                    }
                    CreateUserOutcome::AccountConflict => {
                        debug!(attempt, "lost sign-up race, re-reading winner account");
                    }
                }
            }
        }
    }

    Err(CallbackError::Assertion(anyhow!(
        "federated-account creation conflicted twice for the same identity"
    )))
}

/// Scopes recorded with the provider tokens: the provider's default scope,
/// the tenancy's configured extra scope, and the per-request extra scope,
/// deduplicated in that order.
fn provider_token_scopes(provider: &ProviderConfig, requested: Option<&str>) -> Vec<String> {
    let endpoints = ProviderEndpoints::for_kind(provider.kind);
    let mut combined = endpoints.default_scope.to_string();
    for extra in [provider.scope.as_deref(), requested] {
        if let Some(extra) = extra {
            combined.push(' ');
            combined.push_str(extra);
        }
    }
    extract_scopes(&combined)
}

/// RFC 6749 scope tokens: printable ASCII except space, double quote, and
/// backslash.
fn scope_is_valid(scope: &str) -> bool {
    scope.split(' ').all(|token| {
        !token.is_empty()
            && token
                .bytes()
                .all(|b| b == 0x21 || (0x23..=0x5B).contains(&b) || (0x5D..=0x7E).contains(&b))
    })
}
