//! Account linking / sign-up policy resolver.
//!
//! Pure decision logic for step 8 of the callback: given the existing
//! federated account (if any), the flow intent, and tenant policy, choose
//! exactly one outcome. Deterministic and transport-free so it can be tested
//! without storage or HTTP.

use thiserror::Error;
use uuid::Uuid;

use crate::oauth::types::FederatedAccount;

/// Intent of the flow, with the link target when linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowIntent {
    Authenticate,
    Link { project_user_id: Uuid },
}

/// Whether the provider email can become the primary authenticating email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailAuthStatus {
    /// Provider returned no email at all.
    NoEmail,
    /// Email is free to use for authentication in this tenancy.
    Available,
    /// Another account already authenticates with this email; the new user
    /// is still created, but with email sign-in disabled.
    TakenForAuth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Attach the federated identity to the signed-in user, creating the
    /// account row iff it does not exist yet.
    Link { user_id: Uuid, create_account: bool },
    /// Existing federated account, authenticate flow.
    SignIn { user_id: Uuid },
    /// No federated account and sign-up permitted.
    SignUp { email_auth_enabled: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("federated account belongs to a different user")]
    AlreadyConnectedToAnotherUser,
    #[error("sign-up is disabled for this tenancy")]
    SignUpNotEnabled,
}

/// Decide the outcome of a federated identity arriving at the callback.
///
/// # Errors
///
/// Returns [`ResolveError::AlreadyConnectedToAnotherUser`] when a link flow
/// hits an account owned by someone else, and
/// [`ResolveError::SignUpNotEnabled`] when sign-up is required but disabled.
pub fn resolve(
    existing: Option<&FederatedAccount>,
    intent: FlowIntent,
    sign_up_enabled: bool,
    email_auth: EmailAuthStatus,
) -> Result<Resolution, ResolveError> {
    match (intent, existing) {
        (FlowIntent::Link { project_user_id }, Some(account)) => {
            if account.user_id == project_user_id {
                Ok(Resolution::Link {
                    user_id: project_user_id,
                    create_account: false,
                })
            } else {
                Err(ResolveError::AlreadyConnectedToAnotherUser)
            }
        }
        (FlowIntent::Link { project_user_id }, None) => Ok(Resolution::Link {
            user_id: project_user_id,
            create_account: true,
        }),
        (FlowIntent::Authenticate, Some(account)) => Ok(Resolution::SignIn {
            user_id: account.user_id,
        }),
        (FlowIntent::Authenticate, None) => {
            if !sign_up_enabled {
                return Err(ResolveError::SignUpNotEnabled);
            }
            Ok(Resolution::SignUp {
                email_auth_enabled: email_auth == EmailAuthStatus::Available,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(user_id: Uuid) -> FederatedAccount {
        FederatedAccount {
            tenancy_id: Uuid::new_v4(),
            provider_id: "github".to_string(),
            provider_account_id: "gh-1".to_string(),
            user_id,
            email: Some("a@x.com".to_string()),
        }
    }

    #[test]
    fn link_to_own_existing_account_does_not_recreate() {
        let user_id = Uuid::new_v4();
        let existing = account(user_id);
        let resolution = resolve(
            Some(&existing),
            FlowIntent::Link {
                project_user_id: user_id,
            },
            true,
            EmailAuthStatus::Available,
        )
        .unwrap();
        assert_eq!(
            resolution,
            Resolution::Link {
                user_id,
                create_account: false
            }
        );
    }

    #[test]
    fn link_to_foreign_account_is_rejected() {
        let existing = account(Uuid::new_v4());
        let result = resolve(
            Some(&existing),
            FlowIntent::Link {
                project_user_id: Uuid::new_v4(),
            },
            true,
            EmailAuthStatus::Available,
        );
        assert_eq!(result, Err(ResolveError::AlreadyConnectedToAnotherUser));
    }

    #[test]
    fn link_without_existing_account_creates_it() {
        let user_id = Uuid::new_v4();
        let resolution = resolve(
            None,
            FlowIntent::Link {
                project_user_id: user_id,
            },
            false, // sign-up policy is irrelevant to link flows
            EmailAuthStatus::TakenForAuth,
        )
        .unwrap();
        assert_eq!(
            resolution,
            Resolution::Link {
                user_id,
                create_account: true
            }
        );
    }

    #[test]
    fn authenticate_with_existing_account_signs_in() {
        let user_id = Uuid::new_v4();
        let existing = account(user_id);
        let resolution = resolve(
            Some(&existing),
            FlowIntent::Authenticate,
            false,
            EmailAuthStatus::NoEmail,
        )
        .unwrap();
        assert_eq!(resolution, Resolution::SignIn { user_id });
    }

    #[test]
    fn authenticate_without_account_requires_sign_up_enabled() {
        let result = resolve(None, FlowIntent::Authenticate, false, EmailAuthStatus::Available);
        assert_eq!(result, Err(ResolveError::SignUpNotEnabled));
    }

    #[test]
    fn sign_up_email_auth_follows_uniqueness() {
        let resolution =
            resolve(None, FlowIntent::Authenticate, true, EmailAuthStatus::Available).unwrap();
        assert_eq!(
            resolution,
            Resolution::SignUp {
                email_auth_enabled: true
            }
        );

        for status in [EmailAuthStatus::TakenForAuth, EmailAuthStatus::NoEmail] {
            let resolution = resolve(None, FlowIntent::Authenticate, true, status).unwrap();
            assert_eq!(
                resolution,
                Resolution::SignUp {
                    email_auth_enabled: false
                }
            );
        }
    }
}
