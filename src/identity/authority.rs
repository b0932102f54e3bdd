use super::{CredentialStore, IdentityRegistry, ServiceTicket, SessionToken};
use crate::config::Config;
use crate::error::{ProviderError, TokenError};
use crate::store::identities;
use std::sync::Arc;

/// Outcome of a successful `ensure_authorized` pass: the live session token
/// and a grant scoped to the requested target.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub token: SessionToken,
    pub ticket: ServiceTicket,
}

/// Validates and refreshes the external session token of one identity.
///
/// One call walks: load → validate against the target → on rejection, a
/// single refresh (full login handshake) → persist → one re-validation.
/// `Authorized` and `RefreshFailed` are terminal for the call; the next call
/// restarts from validation. Callers must not loop on `RefreshFailed` —
/// retry pacing belongs to the job queue, not here.
pub struct TokenAuthority {
    config: Arc<Config>,
    credentials: CredentialStore,
    providers: Arc<IdentityRegistry>,
}

impl TokenAuthority {
    pub fn new(
        config: Arc<Config>,
        credentials: CredentialStore,
        providers: Arc<IdentityRegistry>,
    ) -> Self {
        Self {
            config,
            credentials,
            providers,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub async fn ensure_authorized(
        &self,
        identity_id: &str,
        target: &str,
    ) -> Result<Authorization, TokenError> {
        let identity = identities::find_identity(&self.config, identity_id)
            .map_err(|e| TokenError::Store(e.to_string()))?
            .ok_or_else(|| TokenError::IdentityNotFound {
                identity_id: identity_id.to_string(),
            })?;

        let provider = self.providers.get(&identity.type_tag)?;

        let creds = self
            .credentials
            .get(identity_id)
            .map_err(|e| TokenError::Store(e.to_string()))?
            .ok_or_else(|| TokenError::IdentityNotFound {
                identity_id: identity_id.to_string(),
            })?;

        let Some(token) = creds.token else {
            return Err(TokenError::Unauthenticated {
                identity_id: identity_id.to_string(),
            });
        };

        // Fast path: the stored token still authorizes against the target.
        match provider.authorize_service_by_token(&token, target).await {
            Ok(ticket) => return Ok(Authorization { token, ticket }),
            Err(ProviderError::Rejected(message)) => {
                tracing::debug!(identity_id, target, "stored token rejected: {message}");
            }
            // Transport failure says nothing about the token; surface it
            // unchanged so the scheduler's retry policy can handle it.
            Err(network @ ProviderError::Network(_)) => return Err(network.into()),
        }

        // Stale: re-run the full login handshake once.
        let Some(params) = creds.params else {
            return Err(TokenError::RefreshFailed {
                identity_id: identity_id.to_string(),
                message: "login parameters unavailable".into(),
            });
        };

        let fresh = match provider.get_token_by_params(&params).await {
            Ok(fresh) => fresh,
            Err(error) => {
                // Refresh failed: the stored token is left untouched.
                return Err(TokenError::RefreshFailed {
                    identity_id: identity_id.to_string(),
                    message: error.to_string(),
                });
            }
        };

        self.credentials
            .set_token(identity_id, &fresh)
            .map_err(|e| TokenError::Store(e.to_string()))?;
        tracing::info!(identity_id, "session token refreshed");

        // Exactly one re-validation; a second rejection is terminal here.
        match provider.authorize_service_by_token(&fresh, target).await {
            Ok(ticket) => Ok(Authorization {
                token: fresh,
                ticket,
            }),
            Err(error) => Err(TokenError::RefreshFailed {
                identity_id: identity_id.to_string(),
                message: error.to_string(),
            }),
        }
    }
}
