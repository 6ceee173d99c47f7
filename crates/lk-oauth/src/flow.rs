//! Authorization flow orchestration
//!
//! Ties the pieces together in order: bind the listener, build the
//! authorization URL, hand it to the UI, wait (bounded) for the callback
//! outcome, persist the credentials. Each attempt owns a fresh context and
//! a fresh listener; nothing is shared across attempts.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth_url::build_auth_url;
use crate::callback_server::{CallbackServer, ListenerHandle};
use crate::config::ProviderConfig;
use crate::pkce::AuthContext;
use crate::storage::{CredentialBundle, CredentialStore};
use crate::token_exchange::TokenExchanger;
use crate::ui::{FlowUi, StatusLevel};
use lk_types::{AuthError, AuthResult};

pub struct FlowOrchestrator {
    store: CredentialStore,
    ui: Arc<dyn FlowUi>,
}

impl FlowOrchestrator {
    pub fn new(store: CredentialStore, ui: Arc<dyn FlowUi>) -> Self {
        Self { store, ui }
    }

    /// Run one complete authorization attempt.
    ///
    /// `timeout` bounds the wait for the browser callback; the context's own
    /// validity window is checked separately when the callback arrives. On
    /// success the persisted bundle is returned; on any failure the listener
    /// is shut down and the previous credentials (if any) are left intact.
    pub async fn run(
        &self,
        config: &ProviderConfig,
        timeout: Duration,
    ) -> AuthResult<CredentialBundle> {
        if let Some(existing) = self.store.load().await? {
            if existing.tokens.access_token.is_some() {
                self.ui.status(
                    StatusLevel::Warning,
                    "existing credentials found; they will be replaced on success",
                );
            }
        }

        let exchanger = Arc::new(TokenExchanger::new()?);
        let server = CallbackServer::bind(config.port_policy).await?;

        let mut context = AuthContext::prepare();
        context.redirect_uri = Some(config.redirect_uri_for(server.port()));

        let url = build_auth_url(&context, config)?;

        info!(provider = %config.provider_id, "starting authorization flow");
        self.ui.status(
            StatusLevel::Info,
            &format!("signing in to {}", config.provider_id),
        );

        let ListenerHandle {
            result_rx,
            shutdown,
        } = server.serve(config.clone(), context, exchanger);

        if !self.ui.open_url(&url) {
            self.ui.status(
                StatusLevel::Warning,
                &format!("could not open a browser; please open this URL manually: {}", url),
            );
        }

        let result = match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Listener dropped its sender without delivering an outcome.
                shutdown.cancel();
                return Err(AuthError::Authorization(
                    "callback listener stopped before a callback arrived".to_string(),
                ));
            }
            Err(_) => {
                warn!(provider = %config.provider_id, "timed out waiting for the browser callback");
                shutdown.cancel();
                self.ui.status(
                    StatusLevel::Error,
                    "timed out waiting for the browser callback",
                );
                return Err(AuthError::TimedOut);
            }
        };

        if let Some(error) = result.error {
            self.ui
                .status(StatusLevel::Error, &format!("authorization failed: {}", error));
            return Err(error);
        }

        let tokens = result.tokens.ok_or_else(|| {
            AuthError::Authorization("listener reported success without tokens".to_string())
        })?;

        if result.api_key.is_none() {
            self.ui.status(
                StatusLevel::Warning,
                "no API key was issued; complete organization and project setup with the provider, then sign in again",
            );
        }

        let bundle = CredentialBundle::new(tokens, result.api_key);
        self.store.save(&bundle).await?;
        self.ui.credentials_updated(&bundle);
        self.ui.status(
            StatusLevel::Success,
            &format!("signed in to {}", config.provider_id),
        );

        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortPolicy;
    use parking_lot::Mutex;

    /// UI that records every message and captured URL.
    struct RecordingUi {
        urls: Mutex<Vec<String>>,
        messages: Mutex<Vec<(StatusLevel, String)>>,
    }

    impl RecordingUi {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                urls: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
            })
        }
    }

    impl FlowUi for RecordingUi {
        fn open_url(&self, url: &str) -> bool {
            self.urls.lock().push(url.to_string());
            false
        }

        fn status(&self, level: StatusLevel, message: &str) {
            self.messages.lock().push((level, message.to_string()));
        }
    }

    fn test_config() -> ProviderConfig {
        let mut config = ProviderConfig::openai_platform();
        config.port_policy = PortPolicy::Negotiated(0);
        config
    }

    #[tokio::test]
    async fn test_timeout_returns_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::at_path(dir.path().join("creds.json"));
        let ui = RecordingUi::new();
        let orchestrator = FlowOrchestrator::new(store.clone(), ui.clone());

        let config = test_config();
        let err = orchestrator
            .run(&config, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TimedOut));

        // A URL was built and handed to the UI before the timeout.
        let urls = ui.urls.lock();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].contains("code_challenge_method=S256"));

        // Nothing was persisted.
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fixed_port_conflict_fails_before_any_url() {
        let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::at_path(dir.path().join("creds.json"));
        let ui = RecordingUi::new();
        let orchestrator = FlowOrchestrator::new(store, ui.clone());

        let mut config = test_config();
        config.port_policy = PortPolicy::Fixed(port);

        let err = orchestrator
            .run(&config, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::PortUnavailable { .. }));
        assert!(ui.urls.lock().is_empty());
    }
}
