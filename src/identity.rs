//! The narrow external-collaborator surface spec.md §1 calls out: a credential-lookup callback
//! and an authenticated-user identity. Issuance, encryption at rest, and CRUD over these stay
//! out of scope per spec.md's Non-goals — this module only defines the shape the engine
//! consumes, grounded on `auth::models::User`/`Claims` for the identity struct shape, stripped
//! down to what the core actually reads.

use crate::plugin::Credentials;
use async_trait::async_trait;

/// The identity of the user driving a client session, as established by the (out-of-scope)
/// transport/auth layer before the engine ever sees a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
}

/// `(user, provider) -> credentials?` per spec.md §1. Implemented by whatever external
/// collaborator owns credential storage; the engine only ever calls through this trait.
#[async_trait]
pub trait CredentialLookup: Send + Sync {
    async fn lookup(&self, user: &UserIdentity, provider: &str) -> Option<ResolvedCredentials>;
}

/// Credentials plus the testnet flag the credential-lookup callback resolves for a given
/// `(user, provider)` pair (spec.md §1: `{api_key, secret, aux, testnet}?`).
#[derive(Debug, Clone, Default)]
pub struct ResolvedCredentials {
    pub credentials: Credentials,
    pub testnet: bool,
}

/// A [`CredentialLookup`] that never resolves any credentials, for anonymous/public-data
/// sessions and tests. Every plugin call proceeds with `credentials: None, testnet: false`.
pub struct NoCredentials;

#[async_trait]
impl CredentialLookup for NoCredentials {
    async fn lookup(&self, _user: &UserIdentity, _provider: &str) -> Option<ResolvedCredentials> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_credentials_always_resolves_to_none() {
        let lookup = NoCredentials;
        let user = UserIdentity {
            user_id: "anon".to_string(),
        };
        assert!(lookup.lookup(&user, "kraken").await.is_none());
    }
}
