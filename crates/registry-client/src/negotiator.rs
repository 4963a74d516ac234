//! Token negotiation: find the token endpoint, then trade credentials for a
//! bearer token.
//!
//! The two stages are separate so either can be skipped. Anonymous-capable
//! registries never send a challenge, and operators who already know the
//! realm can hand it in without probing.

use crate::challenge::{parse_challenge, AuthChallenge};
use crate::errors::{describe_error_body, RegistryError, Result};
use crate::secrets::{Authenticable, Credential, LongLivedCredential, ShortLivedCredential};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

/// A token granted during the OAuth2-like workflow for OCI registries.
///
/// `token` takes precedence over `access_token` when both are present.
#[derive(Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum RegistryToken {
    Token { token: String },
    AccessToken { access_token: String },
}

impl RegistryToken {
    pub(crate) fn into_token(self) -> String {
        match self {
            RegistryToken::Token { token } => token,
            RegistryToken::AccessToken { access_token } => access_token,
        }
    }
}

/// Probes `probe_url` to learn whether, and where, tokens must be fetched.
///
/// Returns `None` when the long-lived credential should be used directly:
/// the endpoint answered with success, or anything went wrong along the way.
/// Nothing here is fatal.
pub async fn discover(
    http: &reqwest::Client,
    probe_url: &str,
    credential: Option<&LongLivedCredential>,
    default_service: &str,
) -> Option<AuthChallenge> {
    debug!(%probe_url, "Probing for an authentication challenge");
    let auth = credential.cloned().map(Credential::LongLived);
    let res = match http
        .get(probe_url)
        .apply_authentication(auth.as_ref())
        .send()
        .await
    {
        Ok(res) => res,
        Err(error) => {
            warn!(%probe_url, %error, "Authentication discovery failed; using the credential directly");
            return None;
        }
    };

    let status = res.status();
    if status.is_success() {
        debug!(%probe_url, %status, "No token exchange required");
        return None;
    }
    if status != StatusCode::UNAUTHORIZED {
        warn!(%probe_url, %status, "Unexpected discovery status; using the credential directly");
        return None;
    }

    let header = match res
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|h| h.to_str().ok())
    {
        Some(h) => h,
        None => {
            warn!(%probe_url, "401 without a WWW-Authenticate header; using the credential directly");
            return None;
        }
    };

    match parse_challenge(header, default_service) {
        Some(challenge) => {
            debug!(realm = ?challenge.realm, service = %challenge.service, "Found bearer challenge");
            Some(challenge)
        }
        None => {
            warn!(%probe_url, %header, "Challenge is not a bearer challenge; using the credential directly");
            None
        }
    }
}

/// Trades the long-lived credential for a bearer token at the challenge's
/// realm.
///
/// Sends Basic auth when the credential has a username, Bearer when it does
/// not, and nothing for anonymous pulls.
pub async fn exchange(
    http: &reqwest::Client,
    challenge: &AuthChallenge,
    credential: Option<&LongLivedCredential>,
    scope: &str,
) -> Result<ShortLivedCredential> {
    let realm = challenge
        .realm
        .as_deref()
        .ok_or_else(|| RegistryError::AuthExchange("challenge has no realm".to_owned()))?;
    let realm_url = Url::parse(realm).map_err(|e| {
        RegistryError::AuthExchange(format!("realm {:?} is not a valid URL: {}", realm, e))
    })?;

    debug!(%realm, service = %challenge.service, %scope, "Making authentication call");
    let auth = credential.cloned().map(Credential::LongLived);
    let res = http
        .get(realm_url)
        .query(&[("service", challenge.service.as_str()), ("scope", scope)])
        .apply_authentication(auth.as_ref())
        .send()
        .await
        .map_err(|e| RegistryError::AuthExchange(format!("realm {} unreachable: {}", realm, e)))?;

    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        debug!(%realm, %status, "Token endpoint refused the request");
        return Err(RegistryError::AuthExchange(format!(
            "{} answered {}: {}",
            realm,
            status,
            describe_error_body(&text)
        )));
    }

    let token: RegistryToken = serde_json::from_str(&text).map_err(|_| {
        RegistryError::AuthExchange(format!("{} returned no token in its response", realm))
    })?;
    let token = token.into_token();
    if token.is_empty() {
        return Err(RegistryError::AuthExchange(format!(
            "{} returned an empty token",
            realm
        )));
    }
    debug!(%realm, "Successfully obtained a bearer token");
    Ok(ShortLivedCredential { token })
}
