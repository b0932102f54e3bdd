use super::SessionToken;
use crate::config::Config;
use crate::security::SecretCipher;
use crate::store::identities;
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;

/// Decrypted view of one identity's credential pair.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Login parameters the refresh handshake replays.
    pub params: Option<Value>,
    /// Current session token, if one was ever obtained and still decrypts.
    pub token: Option<SessionToken>,
}

/// Encrypted-at-rest access to login parameters and session tokens.
///
/// A value that fails to decrypt (re-keyed workspace, scheme change) is
/// reported as absent, never as an error; the caller's unauthenticated path
/// handles it. Every mutation stamps the identity's `last_updated`.
pub struct CredentialStore {
    config: Arc<Config>,
    cipher: Arc<SecretCipher>,
}

impl CredentialStore {
    pub fn new(config: Arc<Config>, cipher: Arc<SecretCipher>) -> Self {
        Self { config, cipher }
    }

    pub fn get(&self, identity_id: &str) -> Result<Option<Credentials>> {
        let Some(record) = identities::find_identity(&self.config, identity_id)? else {
            return Ok(None);
        };

        let params = self
            .cipher
            .try_decrypt(&record.params_enc)
            .and_then(|raw| serde_json::from_str(&raw).ok());

        let token = record
            .token_enc
            .as_deref()
            .and_then(|enc| self.cipher.try_decrypt(enc))
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .map(SessionToken);

        Ok(Some(Credentials { params, token }))
    }

    pub fn set_token(&self, identity_id: &str, token: &SessionToken) -> Result<()> {
        let raw = serde_json::to_string(&token.0).context("Failed to encode session token")?;
        let enc = self.cipher.encrypt(&raw)?;
        identities::update_token_enc(&self.config, identity_id, Some(&enc))
    }

    pub fn clear_token(&self, identity_id: &str) -> Result<()> {
        identities::update_token_enc(&self.config, identity_id, None)
    }

    pub fn set_params(&self, identity_id: &str, params: &Value) -> Result<()> {
        let raw = serde_json::to_string(params).context("Failed to encode login parameters")?;
        let enc = self.cipher.encrypt(&raw)?;
        identities::update_params_enc(&self.config, identity_id, &enc)
    }

    /// Encrypt a value for a fresh identity row (bind-time helper).
    pub(crate) fn seal(&self, value: &Value) -> Result<String> {
        let raw = serde_json::to_string(value).context("Failed to encode credential value")?;
        self.cipher.encrypt(&raw)
    }
}
