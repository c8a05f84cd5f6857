//! Caller identity and the verdicts verifiers return.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Stable key derived from normalized credentials.
///
/// SHA-256 hex of the lowercased scheme and the credentials. Two keys are
/// equal exactly when scheme and credentials are.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CredentialKey(Arc<str>);

impl CredentialKey {
    pub fn derive(scheme: &str, credentials: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(scheme.to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(credentials.as_bytes());
        let hex: String = hasher.finalize().iter().map(|b| format!("{b:02x}")).collect();
        Self(Arc::from(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The resolved identity of a request's caller. Cheap to clone.
#[derive(Clone, Debug, PartialEq)]
pub struct Actor {
    principal: Arc<str>,
    scopes: Arc<[String]>,
    claims: Arc<Value>,
    key: Option<CredentialKey>,
}

impl Actor {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: Arc::from(principal.into()),
            scopes: Arc::from(Vec::new()),
            claims: Arc::new(Value::Null),
            key: None,
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_claims(mut self, claims: Value) -> Self {
        self.claims = Arc::new(claims);
        self
    }

    pub fn principal(&self) -> &str { &self.principal }
    pub fn scopes(&self) -> &[String] { &self.scopes }
    pub fn claims(&self) -> &Value { &self.claims }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Key of the credentials this actor was resolved from. Set by the
    /// built-in authenticators; `None` for actors from custom ones unless
    /// they call [`keyed`](Self::keyed).
    pub fn key(&self) -> Option<&CredentialKey> {
        self.key.as_ref()
    }

    pub fn keyed(mut self, key: CredentialKey) -> Self {
        self.key = Some(key);
        self
    }
}

/// Why a verifier refused credentials.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("insufficient scope")]
    InsufficientScope,
    /// The identity backend could not answer. Treated as an internal failure.
    #[error("identity backend unavailable: {0}")]
    Unavailable(String),
}

/// What a verifier returns.
pub type Verdict = Result<Actor, Rejection>;
