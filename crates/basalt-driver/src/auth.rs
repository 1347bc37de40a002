//! Authentication providers consumed at connection-establishment time.

use crate::error::{DriverError, DriverResult};

/// Produces the credentials token sent in response to a server
/// `Authenticate` challenge.
pub trait AuthProvider: Send + Sync {
    /// Initial token for the named server-side authenticator.
    fn initial_token(&self, authenticator: &str) -> DriverResult<Vec<u8>>;
}

/// Username/password provider using the SASL PLAIN token shape.
pub struct PlainTextAuthProvider {
    username: String,
    password: String,
}

impl PlainTextAuthProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl AuthProvider for PlainTextAuthProvider {
    fn initial_token(&self, _authenticator: &str) -> DriverResult<Vec<u8>> {
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        Ok(token)
    }
}

/// Used when the server demands authentication but none was configured.
pub(crate) struct NoAuthConfigured;

impl AuthProvider for NoAuthConfigured {
    fn initial_token(&self, authenticator: &str) -> DriverResult<Vec<u8>> {
        Err(DriverError::AuthenticationFailed(format!(
            "server requires {authenticator} but no credentials were configured"
        )))
    }
}
