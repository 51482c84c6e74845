use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use zonehost_common::PlayerId;
use zonehost_kernel::{AuthError, Authenticator, Identity};

/// Resolves static access tokens from the server configuration.
#[derive(Debug, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, PlayerId>,
}

impl TokenAuthenticator {
    pub fn new(tokens: &BTreeMap<String, String>) -> Self {
        Self {
            tokens: tokens
                .iter()
                .map(|(token, player)| (token.clone(), PlayerId::new(player.trim())))
                .collect(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, player: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), PlayerId::new(player));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for TokenAuthenticator {
    fn resolve<'a>(&'a self, credential: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>> {
        Box::pin(async move {
            self.tokens
                .get(credential)
                .cloned()
                .map(Identity::new)
                .ok_or(AuthError::Rejected)
        })
    }
}
