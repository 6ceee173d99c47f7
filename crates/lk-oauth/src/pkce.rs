//! PKCE authorization context (RFC 7636, S256 challenge method)
//!
//! One [`AuthContext`] exists per authorization attempt and is owned by the
//! flow orchestrator for its lifetime. Preparing a new context while an old
//! one is in flight simply drops the old value; there is no process-wide
//! current-context state.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};

/// Default context validity window in seconds (4 minutes).
///
/// Short on purpose: provider login sessions are short-lived, and a stale
/// context means a stale browser tab.
pub const DEFAULT_CONTEXT_WINDOW_SECS: i64 = 240;

/// Cryptographic state for one authorization attempt.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// CSRF binding token round-tripped through the redirect (256 bits).
    pub state: String,
    /// PKCE code verifier, kept secret until the token exchange (384 bits).
    pub code_verifier: String,
    /// BASE64URL(SHA256(code_verifier)), sent in the authorization request.
    pub code_challenge: String,
    /// Assigned once the listener's port is known; immutable thereafter.
    pub redirect_uri: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthContext {
    /// Generate a fresh context with the default validity window.
    pub fn prepare() -> Self {
        Self::prepare_with_window(Duration::seconds(DEFAULT_CONTEXT_WINDOW_SECS))
    }

    /// Generate a fresh context with an explicit validity window.
    ///
    /// `state` and `code_verifier` come from the thread-local CSPRNG and are
    /// independent across calls. The challenge is always derived from the
    /// verifier; the two are never generated separately.
    pub fn prepare_with_window(window: Duration) -> Self {
        let state = random_urlsafe(32);
        let code_verifier = random_urlsafe(48);
        let code_challenge = code_challenge_for(&code_verifier);
        let created_at = Utc::now();

        Self {
            state,
            code_verifier,
            code_challenge,
            redirect_uri: None,
            created_at,
            expires_at: created_at + window,
        }
    }

    /// Whether the context has passed its validity window.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Compute the S256 code challenge for a verifier.
pub fn code_challenge_for(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Base64url-encode `n` random bytes from the thread-local CSPRNG.
fn random_urlsafe(n: usize) -> String {
    let mut rng = thread_rng();
    let bytes: Vec<u8> = (0..n).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_challenge_is_hash_of_verifier() {
        let ctx = AuthContext::prepare();
        assert_eq!(ctx.code_challenge, code_challenge_for(&ctx.code_verifier));
    }

    #[test]
    fn test_verifier_length_within_rfc_limits() {
        let ctx = AuthContext::prepare();
        // 48 bytes -> 64 base64url characters, within the RFC 7636 43-128 range
        assert_eq!(ctx.code_verifier.len(), 64);
        assert_eq!(ctx.state.len(), 43);
    }

    #[test]
    fn test_base64url_no_padding() {
        let ctx = AuthContext::prepare();
        for value in [&ctx.state, &ctx.code_verifier, &ctx.code_challenge] {
            assert!(!value.contains('='));
            assert!(!value.contains('+'));
            assert!(!value.contains('/'));
        }
    }

    #[test]
    fn test_uniqueness_across_contexts() {
        let mut states = HashSet::new();
        let mut verifiers = HashSet::new();
        for _ in 0..100 {
            let ctx = AuthContext::prepare();
            assert!(states.insert(ctx.state), "duplicate state generated");
            assert!(
                verifiers.insert(ctx.code_verifier),
                "duplicate code verifier generated"
            );
        }
        assert_eq!(states.len(), 100);
        assert_eq!(verifiers.len(), 100);
    }

    #[test]
    fn test_fresh_context_not_expired() {
        let ctx = AuthContext::prepare();
        assert!(!ctx.is_expired());
    }

    #[test]
    fn test_old_context_expired() {
        let mut ctx = AuthContext::prepare();
        ctx.created_at = Utc::now() - Duration::seconds(DEFAULT_CONTEXT_WINDOW_SECS + 10);
        ctx.expires_at = ctx.created_at + Duration::seconds(DEFAULT_CONTEXT_WINDOW_SECS);
        assert!(ctx.is_expired());
    }

    #[test]
    fn test_zero_window_expires_immediately() {
        let ctx = AuthContext::prepare_with_window(Duration::seconds(-1));
        assert!(ctx.is_expired());
    }

    #[test]
    fn test_challenge_deterministic() {
        let verifier = "test_verifier_12345678901234567890123456789012345678901234";
        assert_eq!(code_challenge_for(verifier), code_challenge_for(verifier));
    }
}
