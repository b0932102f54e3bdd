use super::{CredentialStore, IdentityRegistry, Parameter};
use crate::config::Config;
use crate::queue;
use crate::store::identities::{self, IdentityRecord, NewIdentity};
use crate::store::services;
use anyhow::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Identity lifecycle: first-login binding and cascading unbind.
pub struct IdentityBinder {
    config: Arc<Config>,
    providers: Arc<IdentityRegistry>,
    credentials: CredentialStore,
}

impl IdentityBinder {
    pub fn new(
        config: Arc<Config>,
        providers: Arc<IdentityRegistry>,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            config,
            providers,
            credentials,
        }
    }

    /// Fields the front end must collect to bind an identity of `type_tag`.
    pub fn login_parameters(&self, type_tag: &str) -> Result<Vec<Parameter>> {
        Ok(self.providers.get(type_tag)?.login_parameters())
    }

    /// Bind an external account: run the login handshake, fetch the
    /// provider's view of the user, enforce the one-binding-per-account
    /// invariant, persist the encrypted credential pair.
    pub async fn bind(
        &self,
        owner: &str,
        type_tag: &str,
        params: &Value,
    ) -> Result<IdentityRecord> {
        let provider = self.providers.get(type_tag)?;

        let token = provider.get_token_by_params(params).await?;

        // Info fetch is best-effort: a binding without alias/uuid is usable,
        // it just cannot participate in dedup.
        let info = match provider.get_info_by_token(&token).await {
            Ok(info) => info,
            Err(error) => {
                tracing::warn!(type_tag, "could not fetch identity info: {error}");
                super::IdentityInfo::default()
            }
        };

        let uuid = info
            .unique_id
            .as_deref()
            .map(|uid| dedup_uuid(type_tag, uid));

        if let Some(uuid) = uuid.as_deref()
            && identities::find_by_owner_type_uuid(&self.config, owner, type_tag, uuid)?.is_some()
        {
            anyhow::bail!("This external account is already bound");
        }

        let record = identities::insert_identity(
            &self.config,
            NewIdentity {
                owner: owner.to_string(),
                type_tag: type_tag.to_string(),
                params_enc: self.credentials.seal(params)?,
                token_enc: Some(self.credentials.seal(&token.0)?),
                alias: info.alias,
                uuid,
            },
        )?;

        tracing::info!(identity_id = %record.id, type_tag, "identity bound");
        Ok(record)
    }

    /// Remove a binding and everything hanging off it: dependent services
    /// are deleted and their scheduled jobs cancelled. Returns the number of
    /// cascaded services.
    pub fn unbind(&self, owner: &str, identity_id: &str) -> Result<usize> {
        let identity = identities::find_identity(&self.config, identity_id)?
            .filter(|record| record.owner == owner)
            .ok_or_else(|| anyhow::anyhow!("Identity '{identity_id}' not found"))?;

        let dependents = services::services_for_identity(&self.config, identity_id)?;
        let cascaded = dependents.len();
        for service in dependents {
            queue::cancel(&self.config, &service.id)?;
            services::delete_service(&self.config, &service.id)?;
            tracing::info!(service_id = %service.id, "removed service with its identity");
        }

        identities::delete_identity(&self.config, &identity.id)?;
        tracing::info!(identity_id, cascaded, "identity unbound");
        Ok(cascaded)
    }

    pub fn list(&self, owner: &str) -> Result<Vec<IdentityRecord>> {
        identities::list_identities(&self.config, owner)
    }
}

fn dedup_uuid(type_tag: &str, unique_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(type_tag.as_bytes());
    hasher.update(b":");
    hasher.update(unique_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_support::StubProvider;
    use crate::security::SecretCipher;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        config: Arc<Config>,
        provider: Arc<StubProvider>,
        binder: IdentityBinder,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut config = Config {
            workspace_dir: tmp.path().to_path_buf(),
            ..Config::default()
        };
        config.secrets.secret = Some("test-secret".into());
        let config = Arc::new(config);

        let cipher = Arc::new(SecretCipher::from_config(&config).unwrap());
        let provider = Arc::new(StubProvider::accepting("campus_sso"));

        let mut registry = IdentityRegistry::new();
        registry.register(Arc::clone(&provider) as Arc<dyn crate::identity::IdentityProvider>);

        let binder = IdentityBinder::new(
            Arc::clone(&config),
            Arc::new(registry),
            CredentialStore::new(Arc::clone(&config), cipher),
        );

        Fixture {
            _tmp: tmp,
            config,
            provider,
            binder,
        }
    }

    #[tokio::test]
    async fn bind_persists_encrypted_credentials_and_alias() {
        let fx = fixture();
        let record = fx
            .binder
            .bind("user-1", "campus_sso", &json!({"username": "stu", "password": "pw"}))
            .await
            .unwrap();

        assert_eq!(record.type_tag, "campus_sso");
        assert!(record.alias.as_deref().unwrap().contains("Stub Student"));
        assert!(record.uuid.is_some());
        assert!(record.params_enc.starts_with("ENC:"));
        assert!(record.token_enc.as_deref().unwrap().starts_with("ENC:"));
    }

    #[tokio::test]
    async fn double_bind_of_same_account_is_rejected() {
        let fx = fixture();
        let params = json!({"username": "stu", "password": "pw"});

        fx.binder.bind("user-1", "campus_sso", &params).await.unwrap();
        let err = fx
            .binder
            .bind("user-1", "campus_sso", &params)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already bound"));

        // a different user may bind the same external account
        fx.binder.bind("user-2", "campus_sso", &params).await.unwrap();
    }

    #[tokio::test]
    async fn bind_fails_when_login_is_rejected() {
        let fx = fixture();
        fx.provider.reject_logins("Login Failed.");

        let err = fx
            .binder
            .bind("user-1", "campus_sso", &json!({"username": "stu", "password": "bad"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Login Failed."));
        assert!(fx.binder.list("user-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn unbind_cascades_to_services_and_jobs() {
        let fx = fixture();
        let record = fx
            .binder
            .bind("user-1", "campus_sso", &json!({"username": "stu", "password": "pw"}))
            .await
            .unwrap();

        let service = crate::store::services::insert_service(
            &fx.config,
            crate::store::services::NewService {
                owner: "user-1".into(),
                type_tag: "timetable".into(),
                identity_id: record.id.clone(),
                configuration: json!({}),
                interval_ms: 60_000,
            },
        )
        .unwrap();
        queue::schedule(&fx.config, &service.id, chrono::Duration::minutes(1)).unwrap();

        let cascaded = fx.binder.unbind("user-1", &record.id).unwrap();
        assert_eq!(cascaded, 1);
        assert!(fx.binder.list("user-1").unwrap().is_empty());
        assert!(
            crate::store::services::find_service(&fx.config, &service.id)
                .unwrap()
                .is_none()
        );
        assert!(queue::list_pending(&fx.config).unwrap().is_empty());
    }

    #[test]
    fn unbind_rejects_foreign_owner() {
        let fx = fixture();
        let err = fx.binder.unbind("user-1", "ghost").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn dedup_uuid_is_stable_and_namespaced() {
        let a = dedup_uuid("campus_sso", "user-9");
        let b = dedup_uuid("campus_sso", "user-9");
        let c = dedup_uuid("other_sso", "user-9");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
