//! Token → identity resolution.

use std::collections::HashMap;

use async_trait::async_trait;
use roomcast_proto::UserId;
use thiserror::Error;

/// Why a token could not be resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Token is not known to the directory
    #[error("unknown token")]
    UnknownToken,

    /// Directory could not be reached
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// External identity provider.
#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    /// Resolve an opaque credential to a user identity.
    async fn resolve_identity(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Fixed token table, configured at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    tokens: HashMap<String, UserId>,
}

impl StaticDirectory {
    /// Empty directory; every token is rejected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `user_id`.
    pub fn insert(&mut self, token: impl Into<String>, user_id: UserId) {
        self.tokens.insert(token.into(), user_id);
    }

    /// Number of known tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token is known.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl FromIterator<(String, UserId)> for StaticDirectory {
    fn from_iter<I: IntoIterator<Item = (String, UserId)>>(iter: I) -> Self {
        Self { tokens: iter.into_iter().collect() }
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn resolve_identity(&self, token: &str) -> Result<UserId, AuthError> {
        self.tokens.get(token).copied().ok_or(AuthError::UnknownToken)
    }
}

/// Parse a `TOKEN=USER_ID` command-line pair.
pub fn parse_token_pair(raw: &str) -> Result<(String, u64), String> {
    let (token, user) =
        raw.split_once('=').ok_or_else(|| format!("expected TOKEN=USER_ID, got {raw:?}"))?;
    if token.is_empty() {
        return Err("token must not be empty".to_string());
    }
    let user = user.parse::<u64>().map_err(|e| format!("invalid user id {user:?}: {e}"))?;
    Ok((token.to_string(), user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_known_tokens() {
        let mut directory = StaticDirectory::new();
        directory.insert("alice-token", UserId(1));

        assert_eq!(directory.resolve_identity("alice-token").await, Ok(UserId(1)));
        assert_eq!(directory.resolve_identity("nope").await, Err(AuthError::UnknownToken));
    }

    #[test]
    fn token_pairs_parse() {
        assert_eq!(parse_token_pair("abc=42"), Ok(("abc".to_string(), 42)));
        assert!(parse_token_pair("abc").is_err());
        assert!(parse_token_pair("=1").is_err());
        assert!(parse_token_pair("abc=x").is_err());
    }
}
