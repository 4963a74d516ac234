//! The credential state of one invocation

use crate::challenge::{AuthChallenge, DEFAULT_SERVICE};
use crate::errors::Result;
use crate::fetch::CredentialProvider;
use crate::negotiator;
use crate::secrets::{Credential, LongLivedCredential};
use async_trait::async_trait;
use tracing::{debug, info};

/// How requests get their credential
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMode {
    /// The long-lived credential (or none) goes out with every request
    Direct,
    /// Bearer tokens are fetched from the challenge's realm for `scope`
    Negotiated {
        /// Token endpoint details
        challenge: AuthChallenge,
        /// Access requested from the token endpoint
        scope: String,
    },
}

/// Optional knobs for [`AuthSession::bootstrap`]
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    /// Skip discovery and use this token endpoint
    pub realm: Option<String>,
    /// Service to request tokens for when discovery or `realm` leaves it out
    pub service: Option<String>,
    /// Never exchange tokens; send the long-lived credential as is
    pub direct_only: bool,
}

/// Holds at most one active credential and knows how to replace it.
///
/// A refresh swaps the whole credential; nothing from the old one is kept.
#[derive(Debug)]
pub struct AuthSession {
    http: reqwest::Client,
    long_lived: Option<LongLivedCredential>,
    mode: AuthMode,
    current: Option<Credential>,
    exchanges: usize,
}

impl AuthSession {
    /// A session that always sends the long-lived credential.
    pub fn direct(http: reqwest::Client, long_lived: Option<LongLivedCredential>) -> Self {
        let current = long_lived.clone().map(Credential::LongLived);
        AuthSession {
            http,
            long_lived,
            mode: AuthMode::Direct,
            current,
            exchanges: 0,
        }
    }

    /// A session that fetches bearer tokens from `challenge` on demand.
    pub fn negotiated(
        http: reqwest::Client,
        long_lived: Option<LongLivedCredential>,
        challenge: AuthChallenge,
        scope: impl Into<String>,
    ) -> Self {
        AuthSession {
            http,
            long_lived,
            mode: AuthMode::Negotiated {
                challenge,
                scope: scope.into(),
            },
            current: None,
            exchanges: 0,
        }
    }

    /// Picks the auth mode for a run: operator overrides first, then the
    /// challenge found at `probe_url`, falling back to direct mode.
    pub async fn bootstrap(
        http: reqwest::Client,
        probe_url: &str,
        long_lived: Option<LongLivedCredential>,
        scope: &str,
        options: &SessionOptions,
    ) -> Self {
        if options.direct_only {
            info!("Token exchange disabled; using the credential directly");
            return Self::direct(http, long_lived);
        }
        if let Some(realm) = &options.realm {
            debug!(%realm, "Using the configured token endpoint");
            let challenge = AuthChallenge::known(realm.clone(), options.service.clone());
            return Self::negotiated(http, long_lived, challenge, scope);
        }

        let default_service = options.service.as_deref().unwrap_or(DEFAULT_SERVICE);
        match negotiator::discover(&http, probe_url, long_lived.as_ref(), default_service).await {
            Some(challenge) => {
                info!(realm = ?challenge.realm, service = %challenge.service, %scope, "Registry requires token authentication");
                Self::negotiated(http, long_lived, challenge, scope)
            }
            None => Self::direct(http, long_lived),
        }
    }

    /// The current auth mode.
    pub fn mode(&self) -> &AuthMode {
        &self.mode
    }

    /// The credential the next request will carry, if one is held.
    pub fn current(&self) -> Option<&Credential> {
        self.current.as_ref()
    }

    /// How many token exchanges this session has performed.
    pub fn exchanges(&self) -> usize {
        self.exchanges
    }

    /// The HTTP client requests in this session go through.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

#[async_trait]
impl CredentialProvider for AuthSession {
    async fn credential(&mut self) -> Result<Option<Credential>> {
        if let AuthMode::Negotiated { challenge, scope } = &self.mode {
            if self.current.is_none() {
                let token =
                    negotiator::exchange(&self.http, challenge, self.long_lived.as_ref(), scope)
                        .await?;
                self.exchanges += 1;
                self.current = Some(Credential::ShortLived(token));
            }
        }
        Ok(self.current.clone())
    }

    fn invalidate(&mut self) -> bool {
        match self.mode {
            AuthMode::Direct => false,
            AuthMode::Negotiated { .. } => {
                debug!("Discarding the current bearer token");
                self.current = None;
                true
            }
        }
    }
}
