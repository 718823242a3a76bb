//! Credential checking shared by the proxy (407) and handlers (401).

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// One authentication scheme: how to challenge and how to verify.
pub trait AuthScheme: Send + Sync {
    /// Scheme token as it appears in credential headers, e.g. `Basic`.
    fn scheme(&self) -> &'static str;

    /// Value for `WWW-Authenticate` / `Proxy-Authenticate`.
    fn challenge(&self) -> String;

    /// Verify the credential part of the header (after the scheme token).
    fn verify(&self, credentials: &str) -> bool;
}

/// RFC 7617 Basic authentication against one fixed credential pair.
pub struct BasicAuth {
    token: String,
}

impl BasicAuth {
    pub fn new(username: &str, password: &str) -> Self {
        BasicAuth {
            token: BASE64.encode(format!("{}:{}", username, password)),
        }
    }
}

impl AuthScheme for BasicAuth {
    fn scheme(&self) -> &'static str {
        "Basic"
    }

    fn challenge(&self) -> String {
        "Basic realm=\"harness\"".to_string()
    }

    fn verify(&self, credentials: &str) -> bool {
        credentials == self.token
    }
}

/// Verdict on one request's credentials.
pub enum AuthDecision {
    /// Credentials check out; serve the request.
    Accept,
    /// No usable credentials yet; send this challenge and keep the
    /// connection open for the retry.
    Challenge(String),
    /// Credentials were presented after a challenge and are wrong.
    Reject,
}

/// Tracks the challenge/retry exchange for one client.
///
/// The first request without valid credentials is challenged; a wrong
/// credential after the challenge is rejected outright.
pub struct AuthenticationManager {
    scheme: Arc<dyn AuthScheme>,
    challenged: bool,
}

impl AuthenticationManager {
    pub fn new(scheme: Arc<dyn AuthScheme>) -> Self {
        AuthenticationManager {
            scheme,
            challenged: false,
        }
    }

    /// A manager with the same scheme but no challenge state, for cloned
    /// handlers that must re-challenge from scratch.
    pub fn fresh(&self) -> Self {
        AuthenticationManager::new(Arc::clone(&self.scheme))
    }

    /// Judge the credential header of one request.
    pub fn evaluate(&mut self, header: Option<&str>) -> AuthDecision {
        if let Some(credentials) = header.and_then(|h| self.strip_scheme(h)) {
            if self.scheme.verify(credentials) {
                return AuthDecision::Accept;
            }
        }
        if self.challenged {
            AuthDecision::Reject
        } else {
            self.challenged = true;
            AuthDecision::Challenge(self.scheme.challenge())
        }
    }

    fn strip_scheme<'a>(&self, header: &'a str) -> Option<&'a str> {
        let rest = header.strip_prefix(self.scheme.scheme())?;
        let rest = rest.strip_prefix(' ')?;
        Some(rest.trim())
    }
}
