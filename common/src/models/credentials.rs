// common/src/models/credentials.rs
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Login credentials captured from a successful `Admin.Login` exchange.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "AuthTag")]
    pub user: String,
    #[serde(rename = "Password")]
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Params object of an `Admin.Login` request.
    pub fn login_params(&self) -> Value {
        json!({"AuthTag": self.user, "Password": self.password})
    }
}

// Passwords must never reach the logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}
