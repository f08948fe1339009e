//! Authentication collaborator.
//!
//! The relay never decides trust itself. It hands a presented token to an
//! [`Authenticator`] and only learns which peer, if any, the token speaks for.

use crate::config::AuthConfig;
use async_trait::async_trait;
use axum::http::HeaderMap;
use std::collections::HashMap;
use wakelink_types::PeerId;

/// Result of checking a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The token is valid for this peer.
    Valid(PeerId),
    /// The token is unknown or revoked.
    Invalid,
}

/// Maps API tokens to peer identities.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check `token` and return the peer it authenticates as.
    async fn authenticate(&self, token: &str) -> AuthOutcome;
}

/// Authenticator backed by the `[[auth.tokens]]` table in the config file.
#[derive(Default, Clone)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, PeerId>,
}

impl std::fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenAuthenticator")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl StaticTokenAuthenticator {
    /// Create an authenticator that accepts nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration.
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut auth = Self::new();
        for entry in &config.tokens {
            auth = auth.with_token(entry.token.clone(), PeerId::new(entry.role, entry.peer.clone()));
        }
        auth
    }

    /// Accept `token` as `peer`.
    pub fn with_token(mut self, token: impl Into<String>, peer: PeerId) -> Self {
        self.tokens.insert(token.into(), peer);
        self
    }

    /// Number of accepted tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token is accepted.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> AuthOutcome {
        match self.tokens.get(token) {
            Some(peer) => AuthOutcome::Valid(peer.clone()),
            None => AuthOutcome::Invalid,
        }
    }
}

/// Pull a token from `Authorization: Bearer ...` or `X-API-Token`.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    bearer
        .or_else(|| headers.get("x-api-token").and_then(|v| v.to_str().ok()))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
