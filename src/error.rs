use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for Campanile.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum CampanileError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Document / queue storage ────────────────────────────────────────
    #[error("store: {0}")]
    Store(#[from] StoreError),

    // ── Registries ──────────────────────────────────────────────────────
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    // ── Token lifecycle ─────────────────────────────────────────────────
    #[error("token: {0}")]
    Token(#[from] TokenError),

    // ── Identity provider I/O ───────────────────────────────────────────
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Storage errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("sqlite: {0}")]
    Sqlite(String),
}

// ─── Registry errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown service type: {type_tag}")]
    UnknownServiceType { type_tag: String },

    #[error("unknown identity type: {type_tag}")]
    UnknownIdentityType { type_tag: String },
}

// ─── Token lifecycle errors ─────────────────────────────────────────────────

/// Terminal outcomes of one `ensure_authorized` pass.
///
/// `RefreshFailed` is a dead end for the current call; callers must not loop
/// on it. A later call restarts the whole validate/refresh machine, which may
/// succeed once the user has fixed their external credentials.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("identity {identity_id} not found")]
    IdentityNotFound { identity_id: String },

    #[error("identity {identity_id} has no usable session token")]
    Unauthenticated { identity_id: String },

    #[error("token refresh failed for identity {identity_id}: {message}")]
    RefreshFailed { identity_id: String, message: String },

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("store: {0}")]
    Store(String),
}

// ─── Identity provider errors ───────────────────────────────────────────────

/// Failure surface of an external identity provider call.
///
/// `Rejected` carries the remote's own verdict (bad password, expired
/// session, missing ticket); `Network` covers transport-level failures that
/// say nothing about the credential itself.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Rejected(String),

    #[error("network: {0}")]
    Network(String),
}

impl ProviderError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        Self::Network(error.to_string())
    }
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, CampanileError>;
