//! Parsing of `WWW-Authenticate` bearer challenges

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

/// The service name GitLab's registry announces; used when a challenge
/// leaves `service` out.
pub const DEFAULT_SERVICE: &str = "container_registry";

lazy_static! {
    static ref SCHEME: Regex = Regex::new(r"^\s*([A-Za-z][A-Za-z0-9_-]*)(?:\s+|$)").unwrap();
    static ref PARAM: Regex = Regex::new(r#"([A-Za-z_][A-Za-z0-9_-]*)\s*=\s*"([^"]*)""#).unwrap();
}

/// Where to get a token, as announced by the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthChallenge {
    /// URL of the token endpoint. A challenge without one cannot be exchanged.
    pub realm: Option<String>,
    /// Service name to request a token for
    pub service: String,
    /// Scope suggested by the registry, if any
    pub scope: Option<String>,
}

impl AuthChallenge {
    /// Builds a challenge without asking the registry, for operators who
    /// already know the token endpoint.
    pub fn known(realm: impl Into<String>, service: Option<String>) -> Self {
        AuthChallenge {
            realm: Some(realm.into()),
            service: service.unwrap_or_else(|| DEFAULT_SERVICE.to_owned()),
            scope: None,
        }
    }
}

/// Parses a `WWW-Authenticate` header value.
///
/// Returns `None` unless the scheme is `Bearer`: a `Basic` challenge means the
/// long-lived credential is to be sent directly. A missing `service` is
/// replaced by `default_service`.
pub fn parse_challenge(header: &str, default_service: &str) -> Option<AuthChallenge> {
    let scheme = SCHEME.captures(header)?;
    if !scheme[1].eq_ignore_ascii_case("bearer") {
        return None;
    }
    let params: HashMap<String, String> = PARAM
        .captures_iter(&header[scheme[0].len()..])
        .map(|c| (c[1].to_ascii_lowercase(), c[2].to_owned()))
        .collect();

    Some(AuthChallenge {
        realm: params.get("realm").filter(|r| !r.is_empty()).cloned(),
        service: params
            .get("service")
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| default_service.to_owned()),
        scope: params.get("scope").cloned(),
    })
}
