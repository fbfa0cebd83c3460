use axum::http::{HeaderMap, HeaderName, header};
use std::collections::HashSet;
use std::fmt;

pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";
pub const REALM: &str = "gateway";

/// Per-service authentication policy. Pure data, shared read-only by every
/// request to the service.
#[derive(Debug, Clone, Default)]
pub enum AuthPolicy {
    #[default]
    None,
    BearerToken {
        valid_tokens: HashSet<String>,
    },
    ApiKey {
        header: HeaderName,
        valid_keys: HashSet<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDenial {
    MissingOrInvalidBearer,
    MissingOrInvalidKey,
}

impl fmt::Display for AuthDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthDenial::MissingOrInvalidBearer => f.write_str("missing_or_invalid_bearer"),
            AuthDenial::MissingOrInvalidKey => f.write_str("missing_or_invalid_key"),
        }
    }
}

impl AuthPolicy {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthPolicy::None => "none",
            AuthPolicy::BearerToken { .. } => "bearer",
            AuthPolicy::ApiKey { .. } => "apikey",
        }
    }

    // Realm to challenge with on deny; only bearer policies send one
    pub fn challenge(&self) -> Option<&'static str> {
        match self {
            AuthPolicy::BearerToken { .. } => Some(REALM),
            _ => None,
        }
    }
}

/// Admit or deny a request against a policy. No state is touched, so this
/// is safe to call from any number of tasks at once.
pub fn authenticate(policy: &AuthPolicy, headers: &HeaderMap) -> Result<(), AuthDenial> {
    match policy {
        AuthPolicy::None => Ok(()),

        AuthPolicy::BearerToken { valid_tokens } => headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .filter(|token| valid_tokens.contains(*token))
            .map(|_| ())
            .ok_or(AuthDenial::MissingOrInvalidBearer),

        AuthPolicy::ApiKey { header, valid_keys } => headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .filter(|key| valid_keys.contains(*key))
            .map(|_| ())
            .ok_or(AuthDenial::MissingOrInvalidKey),
    }
}
