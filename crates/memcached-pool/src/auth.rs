//! Credential providers.

use std::fmt;

/// Username that means "no authentication required".
pub const DEFAULT_USER: &str = "default";

/// Supplies the username/password pair used while establishing a connection.
pub trait AuthHandler: Send + Sync {
    fn credentials(&self) -> (String, String);
}

/// The anonymous identity; connections skip SASL entirely.
#[derive(Clone, Copy, Debug, Default)]
pub struct Anonymous;

impl AuthHandler for Anonymous {
    fn credentials(&self) -> (String, String) {
        (DEFAULT_USER.to_string(), String::new())
    }
}

/// A fixed username/password pair.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl AuthHandler for BasicAuth {
    fn credentials(&self) -> (String, String) {
        (self.username.clone(), self.password.clone())
    }
}

// Keep passwords out of logs.
impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
