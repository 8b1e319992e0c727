//! Operator session registry.

use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session registry is full ({0} live sessions)")]
    Full(usize),
}

/// Bounded in-memory set of session tokens, each with an expiry.
///
/// Created once at startup and only reachable through its methods.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            max_sessions,
        }
    }

    /// Issue a new token. Expired sessions are dropped first to make room.
    pub fn issue(&self) -> Result<String, SessionError> {
        let mut sessions = self.lock();
        let now = Instant::now();
        if sessions.len() >= self.max_sessions {
            sessions.retain(|_, expires_at| *expires_at > now);
        }
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::Full(sessions.len()));
        }

        let token = new_token();
        sessions.insert(token.clone(), now + self.ttl);
        Ok(token)
    }

    /// True iff `token` was issued and has not expired or been revoked.
    pub fn validate(&self, token: &str) -> bool {
        let mut sessions = self.lock();
        match sessions.get(token) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                sessions.remove(token);
                false
            }
            None => false,
        }
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.lock().remove(token).is_some()
    }

    /// Drop expired sessions, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        let now = Instant::now();
        sessions.retain(|_, expires_at| *expires_at > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// 32 random bytes, hex-encoded.
fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_validate_revoke() {
        let registry = SessionRegistry::new(Duration::from_secs(60), 4);
        let token = registry.issue().unwrap();
        assert_eq!(token.len(), 64);
        assert!(registry.validate(&token));
        assert!(!registry.validate("not-a-token"));

        assert!(registry.revoke(&token));
        assert!(!registry.validate(&token));
        assert!(!registry.revoke(&token));
    }

    #[test]
    fn test_full_registry_refuses() {
        let registry = SessionRegistry::new(Duration::from_secs(60), 2);
        registry.issue().unwrap();
        registry.issue().unwrap();
        assert_eq!(registry.issue(), Err(SessionError::Full(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_sessions_make_room() {
        let registry = SessionRegistry::new(Duration::from_secs(10), 1);
        let old = registry.issue().unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!registry.validate(&old));

        let fresh = registry.issue().unwrap();
        assert!(registry.validate(&fresh));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_counts_expired() {
        let registry = SessionRegistry::new(Duration::from_secs(10), 8);
        registry.issue().unwrap();
        registry.issue().unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        let young = registry.issue().unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(registry.sweep(), 2);
        assert!(registry.validate(&young));
    }
}
