//! Authentication gating for protected routes.

use std::collections::HashSet;

use crate::http::request::Request;

/// Whether a node demands authenticated callers. Descendants inherit the
/// nearest explicit setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthRequirement {
    #[default]
    None,
    Required,
}

/// Decides whether a request carries satisfying credentials.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &Request) -> bool;

    /// Value for the `WWW-Authenticate` header on 401 responses.
    fn challenge(&self) -> Option<String> {
        None
    }
}

/// Accepts `Authorization: Bearer <token>` for any configured token.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    tokens: HashSet<String>,
    realm: String,
}

impl TokenAuthenticator {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            realm: "switchyard".to_string(),
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, request: &Request) -> bool {
        let Some(value) = request.header("Authorization") else {
            return false;
        };
        let Some((scheme, token)) = value.trim().split_once(' ') else {
            return false;
        };
        scheme.eq_ignore_ascii_case("bearer") && self.tokens.contains(token.trim())
    }

    fn challenge(&self) -> Option<String> {
        Some(format!("Bearer realm=\"{}\"", self.realm))
    }
}
