//! Local-callback OAuth 2.0 authorization flow for loopkey
//!
//! Implements the Authorization Code flow with PKCE (S256) for CLI tooling:
//! a short-lived HTTP listener on a loopback port receives the provider's
//! redirect, the one-time code is exchanged for tokens (and, where the
//! provider supports it, a scoped API key), and the resulting credential
//! bundle is persisted as an owner-only JSON file.
//!
//! # Usage Example
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lk_oauth::{CredentialStore, FlowOrchestrator, ProviderConfig, TracingUi};
//!
//! # async fn run() -> lk_types::AuthResult<()> {
//! let config = ProviderConfig::openai_platform();
//! let store = CredentialStore::for_provider(&config.provider_id)?;
//! let orchestrator = FlowOrchestrator::new(store, Arc::new(TracingUi));
//! let bundle = orchestrator.run(&config, Duration::from_secs(300)).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth_url;
pub mod callback_server;
pub mod config;
pub mod flow;
pub mod pkce;
pub mod storage;
pub mod token_exchange;
pub mod ui;

// Re-export public API
pub use auth_url::build_auth_url;
pub use callback_server::{CallbackServer, ListenerHandle, ListenerResult};
pub use config::{PortPolicy, ProviderConfig};
pub use flow::FlowOrchestrator;
pub use pkce::AuthContext;
pub use storage::{CredentialBundle, CredentialStore};
pub use token_exchange::{TokenBundle, TokenExchanger};
pub use ui::{FlowUi, StatusLevel, TracingUi};
