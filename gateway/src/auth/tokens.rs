// gateway/src/auth/tokens.rs
use crate::utils::token::new_token_value;
use chrono::{DateTime, Utc};
use common::{format_time, AuthError, Credentials};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A freshly minted login token, as reported to the client.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub value: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl IssuedToken {
    /// `GUIToken` object attached to a successful login response.
    pub fn to_json(&self) -> Value {
        json!({
            "Token": self.value,
            "Created": format_time(&self.created),
            "Expires": format_time(&self.expires),
        })
    }
}

struct TokenRecord {
    credentials: Credentials,
    issued_at: Instant,
}

/// Single-use login tokens bound to the credentials they replace.
///
/// Shared by every connection. The map serializes access per token, so a
/// token is handed out at most once even under concurrent redemption.
pub struct TokenStore {
    tokens: DashMap<String, TokenRecord>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, credentials: Credentials) -> IssuedToken {
        let value = new_token_value();
        let created = Utc::now();
        let expires = created + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        self.tokens.insert(
            value.clone(),
            TokenRecord {
                credentials,
                issued_at: Instant::now(),
            },
        );
        tracing::debug!("Issued login token expiring at {}", format_time(&expires));
        IssuedToken { value, created, expires }
    }

    /// Consume a token and hand back the credentials it stands for.
    ///
    /// Unknown, already redeemed and expired tokens are indistinguishable.
    pub fn redeem(&self, token: &str) -> Result<Credentials, AuthError> {
        let (_, record) = self.tokens.remove(token).ok_or(AuthError::TokenNotFound)?;
        if self.is_expired(&record) {
            tracing::debug!("Rejected expired login token");
            return Err(AuthError::TokenNotFound);
        }
        Ok(record.credentials)
    }

    /// Drop expired tokens. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        self.tokens.retain(|_, record| {
            let keep = !self.is_expired(record);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            tracing::debug!("Swept {} expired login tokens", removed);
        }
        removed
    }

    /// Run `sweep` every `interval` until the returned task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn is_expired(&self, record: &TokenRecord) -> bool {
        record.issued_at.elapsed() >= self.ttl
    }
}
