//! Error types and conversions

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Port {port} is unavailable: {detail}")]
    PortUnavailable { port: u16, detail: String },

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Token exchange failed{}: {detail}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    TokenExchange { status: Option<u16>, detail: String },

    #[error("Timed out waiting for browser authorization")]
    TimedOut,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AuthResult<T> = Result<T, AuthError>;

impl From<AuthError> for String {
    fn from(err: AuthError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_exchange_display_with_status() {
        let err = AuthError::TokenExchange {
            status: Some(401),
            detail: "invalid_grant".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("HTTP 401"));
        assert!(msg.contains("invalid_grant"));
    }

    #[test]
    fn test_token_exchange_display_without_status() {
        let err = AuthError::TokenExchange {
            status: None,
            detail: "connection refused".to_string(),
        };
        assert!(!err.to_string().contains("HTTP"));
    }

    #[test]
    fn test_port_unavailable_display() {
        let err = AuthError::PortUnavailable {
            port: 1455,
            detail: "address in use".to_string(),
        };
        assert!(err.to_string().contains("1455"));
    }
}
