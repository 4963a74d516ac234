//! Credentials used to talk to a registry or the package API

use std::fmt;

/// A credential supplied by the operator: a personal, deploy or job token,
/// optionally paired with a username.
#[derive(Clone, PartialEq, Eq)]
pub struct LongLivedCredential {
    /// The secret itself
    pub token: String,
    /// When present the token is sent as the password of HTTP Basic auth
    pub username: Option<String>,
}

impl LongLivedCredential {
    /// Creates a credential, ignoring an empty username.
    pub fn new(token: impl Into<String>, username: Option<String>) -> Self {
        LongLivedCredential {
            token: token.into(),
            username: username.filter(|u| !u.is_empty()),
        }
    }
}

// Tokens never end up in logs.
impl fmt::Debug for LongLivedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongLivedCredential")
            .field("token", &"<redacted>")
            .field("username", &self.username)
            .finish()
    }
}

/// A bearer token handed out by a token endpoint.
///
/// Its lifetime is unknown to the client; it is used until a request comes
/// back unauthorized.
#[derive(Clone, PartialEq, Eq)]
pub struct ShortLivedCredential {
    /// The opaque bearer token
    pub token: String,
}

impl fmt::Debug for ShortLivedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShortLivedCredential")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// The credential attached to a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    /// The operator's own token, used as-is
    LongLived(LongLivedCredential),
    /// A token obtained from the registry's token endpoint
    ShortLived(ShortLivedCredential),
}

pub(crate) trait Authenticable {
    fn apply_authentication(self, auth: Option<&Credential>) -> Self;
}

impl Authenticable for reqwest::RequestBuilder {
    fn apply_authentication(self, auth: Option<&Credential>) -> Self {
        match auth {
            None => self,
            Some(Credential::LongLived(LongLivedCredential {
                token,
                username: Some(username),
            })) => self.basic_auth(username, Some(token)),
            Some(Credential::LongLived(LongLivedCredential { token, .. })) => {
                self.bearer_auth(token)
            }
            Some(Credential::ShortLived(ShortLivedCredential { token })) => self.bearer_auth(token),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn authorization(auth: Option<&Credential>) -> Option<String> {
        reqwest::Client::new()
            .get("https://example.com/v2/")
            .apply_authentication(auth)
            .build()
            .expect("request builds")
            .headers()
            .get("Authorization")
            .map(|v| v.to_str().expect("ascii header").to_owned())
    }

    #[test]
    fn anonymous_requests_carry_no_header() {
        assert_eq!(authorization(None), None);
    }

    #[test]
    fn long_lived_without_username_is_bearer() {
        let cred = Credential::LongLived(LongLivedCredential::new("glpat-123", None));
        assert_eq!(authorization(Some(&cred)).as_deref(), Some("Bearer glpat-123"));
    }

    #[test]
    fn long_lived_with_username_is_basic() {
        let cred = Credential::LongLived(LongLivedCredential::new(
            "secret",
            Some("deployer".to_owned()),
        ));
        // base64("deployer:secret")
        assert_eq!(
            authorization(Some(&cred)).as_deref(),
            Some("Basic ZGVwbG95ZXI6c2VjcmV0")
        );
    }

    #[test]
    fn empty_username_falls_back_to_bearer() {
        let cred = LongLivedCredential::new("secret", Some(String::new()));
        assert_eq!(cred.username, None);
    }

    #[test]
    fn short_lived_is_bearer() {
        let cred = Credential::ShortLived(ShortLivedCredential {
            token: "abc".to_owned(),
        });
        assert_eq!(authorization(Some(&cred)).as_deref(), Some("Bearer abc"));
    }

    #[test]
    fn debug_output_hides_tokens() {
        let cred = Credential::LongLived(LongLivedCredential::new("glpat-123", None));
        assert!(!format!("{:?}", cred).contains("glpat-123"));
    }
}
