//! External identity providers and the session-token lifecycle.

pub mod authority;
pub mod binding;
pub mod cas;
pub mod credentials;
pub mod registry;

pub use authority::{Authorization, TokenAuthority};
pub use binding::IdentityBinder;
pub use credentials::{CredentialStore, Credentials};
pub use registry::IdentityRegistry;

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Descriptor of one field a provider needs for its login form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub field_name: String,
    /// e.g. "string", "password", "email"
    pub field_type: String,
    pub display_name: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Parameter {
    pub fn required(field_name: &str, field_type: &str, display_name: &str) -> Self {
        Self {
            field_name: field_name.into(),
            field_type: field_type.into(),
            display_name: display_name.into(),
            required: true,
            description: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Opaque external session state, e.g. `{"cookie": "CASTGC=..."}`.
///
/// The shape is provider-defined; only the owning provider interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken(pub Value);

impl SessionToken {
    pub fn from_cookie(cookie: impl Into<String>) -> Self {
        Self(serde_json::json!({ "cookie": cookie.into() }))
    }

    pub fn cookie(&self) -> Option<&str> {
        self.0.get("cookie").and_then(Value::as_str)
    }
}

/// Provider-reported facts about the human behind a token.
#[derive(Debug, Clone, Default)]
pub struct IdentityInfo {
    pub attributes: BTreeMap<String, String>,
    /// Human-readable label, e.g. "J. Doe / CS Dept / 20251234".
    pub alias: Option<String>,
    /// Provider-side unique id; hashed into the dedup uuid at bind time.
    pub unique_id: Option<String>,
}

/// Single-use grant for one target resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTicket {
    pub ticket: String,
}

/// Capability set of one external identity provider.
///
/// All operations are network-bound against the remote origin and return
/// typed results: a `Rejected` error is the remote's own verdict, a
/// `Network` error says nothing about the credential.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Type tag keyed in the registry, e.g. "cas_sso".
    fn type_tag(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Fields the front end must collect for `get_token_by_params`.
    fn login_parameters(&self) -> Vec<Parameter>;

    /// Run the full external login handshake and mint a fresh token.
    async fn get_token_by_params(&self, params: &Value) -> Result<SessionToken, ProviderError>;

    /// Cheap liveness check of an existing token.
    async fn validate_token(&self, token: &SessionToken) -> Result<(), ProviderError>;

    /// Fetch user attributes for a token (used at bind time).
    async fn get_info_by_token(&self, token: &SessionToken) -> Result<IdentityInfo, ProviderError>;

    /// Exchange a token for a grant scoped to `target`.
    async fn authorize_service_by_token(
        &self,
        token: &SessionToken,
        target: &str,
    ) -> Result<ServiceTicket, ProviderError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_token_cookie_accessor() {
        let token = SessionToken::from_cookie("CASTGC=TGT-1; JSESSIONID=abc");
        assert_eq!(token.cookie(), Some("CASTGC=TGT-1; JSESSIONID=abc"));

        let bare = SessionToken(serde_json::json!({"ticket": "ST-1"}));
        assert_eq!(bare.cookie(), None);
    }

    #[test]
    fn parameter_builder_sets_description() {
        let param = Parameter::required("username", "string", "Username")
            .with_description("Your student ID or username.");
        assert!(param.required);
        assert_eq!(param.description.as_deref(), Some("Your student ID or username."));
    }
}
