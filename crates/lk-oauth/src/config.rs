//! Static provider configuration for the authorization flow
//!
//! The engine never reads configuration files itself; host applications
//! construct a [`ProviderConfig`] from their own config layer (the struct is
//! serde-friendly) or use one of the built-in presets.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the callback listener chooses its local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "port", rename_all = "snake_case")]
pub enum PortPolicy {
    /// The redirect URI is pre-registered with the provider; the listener
    /// must bind exactly this port and a bind failure is fatal.
    Fixed(u16),
    /// Preferred port; on bind failure the listener falls back to an
    /// ephemeral port and the redirect URI is rebuilt before the
    /// authorization URL is shown.
    Negotiated(u16),
}

/// Static OAuth provider configuration.
///
/// Everything here is external input: endpoint URLs, the public client ID,
/// the scope string, and the redirect/port contract the provider registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Internal provider identifier (e.g., "openai-platform").
    pub provider_id: String,
    /// OAuth issuer base URL.
    pub issuer_url: String,
    /// Authorization endpoint URL.
    pub authorize_url: String,
    /// Token endpoint URL (used for both the code exchange and the
    /// token-for-API-key exchange).
    pub token_url: String,
    /// Base URL of the provider's API (used by collaborators, not by this
    /// engine).
    pub api_base_url: String,
    /// Public OAuth client ID (PKCE, no client secret).
    pub client_id: String,
    /// Space-separated scope string, sent verbatim.
    pub scope: String,
    /// Host component of the redirect URI (e.g., "localhost").
    pub redirect_host: String,
    /// Path component of the redirect URI (e.g., "/auth/callback").
    pub redirect_path: String,
    /// Port selection policy for the callback listener.
    pub port_policy: PortPolicy,
    /// How long the flow waits for the browser callback.
    pub callback_timeout_secs: u64,
    /// Prefix under which collaborators register this provider's models.
    pub model_prefix: String,
    /// Environment variable name under which the resulting API key is
    /// exposed to downstream tooling.
    pub api_key_env: String,
    /// JWT claim namespace holding the provider's identity claims
    /// (account, organization, project). `None` reads top-level claims.
    pub identity_claim: Option<String>,
    /// Extra authorization query parameters, passed through verbatim.
    #[serde(default)]
    pub extra_auth_params: Vec<(String, String)>,
}

impl ProviderConfig {
    /// Redirect URI for a concrete listener port.
    pub fn redirect_uri_for(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.redirect_host, port, self.redirect_path)
    }

    /// Callback wait deadline as a `Duration`.
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    /// OpenAI Platform preset.
    ///
    /// Uses the public Codex client ID. The redirect URI is pre-registered,
    /// so the port is fixed and a bind conflict is fatal.
    pub fn openai_platform() -> Self {
        Self {
            provider_id: "openai-platform".to_string(),
            issuer_url: "https://auth.openai.com".to_string(),
            authorize_url: "https://auth.openai.com/oauth/authorize".to_string(),
            token_url: "https://auth.openai.com/oauth/token".to_string(),
            api_base_url: "https://api.openai.com/v1".to_string(),
            client_id: "app_EMoamEEZ73f0CkXaXp7hrann".to_string(),
            scope: "openid profile email offline_access".to_string(),
            redirect_host: "localhost".to_string(),
            redirect_path: "/auth/callback".to_string(),
            port_policy: PortPolicy::Fixed(1455),
            callback_timeout_secs: 300,
            model_prefix: "openai/".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            identity_claim: Some("https://api.openai.com/auth".to_string()),
            extra_auth_params: vec![(
                "id_token_add_organizations".to_string(),
                "true".to_string(),
            )],
        }
    }
}
