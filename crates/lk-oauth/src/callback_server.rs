//! Loopback HTTP listener for the OAuth redirect
//!
//! One listener exists per authorization attempt. It serves exactly one
//! recognized callback (success or rejection), responds to the browser with
//! a static HTML page, delivers the outcome to the orchestrator over a
//! oneshot channel, and shuts itself down after a short grace period so the
//! browser's response is not cut off mid-flight.

use axum::{
    extract::{Query, State},
    response::Html,
    routing::get,
    Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PortPolicy, ProviderConfig};
use crate::pkce::AuthContext;
use crate::token_exchange::{TokenBundle, TokenExchanger};
use lk_types::{AuthError, AuthResult};

/// Delay between answering the browser and closing the listener socket.
const SHUTDOWN_GRACE_SECS: u64 = 2;

/// Outcome of one authorization attempt, delivered exactly once.
#[derive(Debug)]
pub struct ListenerResult {
    pub tokens: Option<TokenBundle>,
    pub api_key: Option<String>,
    pub error: Option<AuthError>,
}

impl ListenerResult {
    fn success(tokens: TokenBundle, api_key: Option<String>) -> Self {
        Self {
            tokens: Some(tokens),
            api_key,
            error: None,
        }
    }

    fn failure(error: AuthError) -> Self {
        Self {
            tokens: None,
            api_key: None,
            error: Some(error),
        }
    }
}

/// Listener lifecycle, tracked for logging only. Correctness does not hang
/// off this value; the oneshot sender slot is the real once-only gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Listening,
    ServingSuccess,
    ServingFailure,
    ShuttingDown,
}

/// Query parameters the provider may attach to the redirect.
#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

struct ListenerShared {
    config: ProviderConfig,
    context: AuthContext,
    exchanger: Arc<TokenExchanger>,
    result_tx: Mutex<Option<oneshot::Sender<ListenerResult>>>,
    state: Mutex<ListenerState>,
    shutdown: CancellationToken,
}

impl ListenerShared {
    fn transition(&self, next: ListenerState) {
        let mut state = self.state.lock();
        debug!(from = ?*state, to = ?next, "listener state transition");
        *state = next;
    }

    /// Take the result sender if this is the first recognized callback.
    fn take_sender(&self) -> Option<oneshot::Sender<ListenerResult>> {
        self.result_tx.lock().take()
    }

    /// Deliver the outcome and arm the delayed shutdown. Idempotent against
    /// a racing timeout cancel from the orchestrator.
    fn finish(self: &Arc<Self>, result: ListenerResult, tx: oneshot::Sender<ListenerResult>) {
        self.transition(if result.error.is_none() {
            ListenerState::ServingSuccess
        } else {
            ListenerState::ServingFailure
        });

        if tx.send(result).is_err() {
            // Orchestrator already gave up waiting; nothing left to do but
            // close the socket.
            warn!("authorization outcome dropped; orchestrator no longer waiting");
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_SECS)).await;
            shared.transition(ListenerState::ShuttingDown);
            shared.shutdown.cancel();
        });
    }
}

/// Running listener: the outcome channel plus the shutdown trigger.
pub struct ListenerHandle {
    pub result_rx: oneshot::Receiver<ListenerResult>,
    pub(crate) shutdown: CancellationToken,
}

impl ListenerHandle {
    /// Close the listener without waiting for a callback.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }
}

/// Bound but not yet serving callback listener.
///
/// Binding is separate from serving so the final port is known before the
/// authorization URL (which embeds the redirect URI) is constructed.
#[derive(Debug)]
pub struct CallbackServer {
    listener: TcpListener,
    port: u16,
}

impl CallbackServer {
    /// Bind a loopback socket according to the port policy.
    ///
    /// A fixed-port bind failure is terminal; no authorization URL exists at
    /// that point, so nothing provider-side has happened yet. A negotiated
    /// policy falls back to an ephemeral port instead.
    pub async fn bind(policy: PortPolicy) -> AuthResult<Self> {
        let preferred = match policy {
            PortPolicy::Fixed(port) | PortPolicy::Negotiated(port) => port,
        };
        let addr = SocketAddr::from(([127, 0, 0, 1], preferred));

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) if matches!(policy, PortPolicy::Negotiated(_)) => {
                warn!(port = preferred, error = %e, "preferred port unavailable, falling back to ephemeral port");
                TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                    .await
                    .map_err(|e| AuthError::PortUnavailable {
                        port: 0,
                        detail: format!("failed to bind ephemeral fallback port: {}", e),
                    })?
            }
            Err(e) => {
                return Err(AuthError::PortUnavailable {
                    port: preferred,
                    detail: e.to_string(),
                })
            }
        };

        let port = listener
            .local_addr()
            .map_err(AuthError::Io)?
            .port();
        info!(port, "callback listener bound");

        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start serving the redirect path. Consumes the context: the listener
    /// owns the state/verifier secrets for the rest of the attempt.
    pub fn serve(
        self,
        config: ProviderConfig,
        context: AuthContext,
        exchanger: Arc<TokenExchanger>,
    ) -> ListenerHandle {
        let (result_tx, result_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();

        let shared = Arc::new(ListenerShared {
            config: config.clone(),
            context,
            exchanger,
            result_tx: Mutex::new(Some(result_tx)),
            state: Mutex::new(ListenerState::Listening),
            shutdown: shutdown.clone(),
        });

        let app = Router::new()
            .route(&config.redirect_path, get(handle_callback))
            .fallback(handle_unknown)
            .with_state(shared);

        let listener = self.listener;
        let graceful = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful.cancelled_owned())
                .await
            {
                error!(error = %e, "callback listener error");
            }
            debug!("callback listener stopped");
        });

        ListenerHandle {
            result_rx,
            shutdown,
        }
    }
}

/// Anything off the redirect path (favicons, crawlers) gets a plain 404 and
/// the listener keeps waiting for the real callback.
async fn handle_unknown() -> (axum::http::StatusCode, &'static str) {
    debug!("ignoring request outside the redirect path");
    (axum::http::StatusCode::NOT_FOUND, "Not Found")
}

async fn handle_callback(
    State(shared): State<Arc<ListenerShared>>,
    Query(query): Query<CallbackQuery>,
) -> Html<String> {
    // CSRF binding comes before anything else, including the error
    // parameter: a request that cannot echo this attempt's state is ignored
    // outright, so a forged local request can neither complete nor terminate
    // a pending attempt.
    if query.state.as_deref() != Some(shared.context.state.as_str()) {
        warn!("ignoring callback with mismatched state");
        return Html(failure_page(
            "This request does not match the pending sign-in attempt.",
        ));
    }

    let Some(tx) = shared.take_sender() else {
        debug!("duplicate callback after attempt completed");
        return Html(failure_page(
            "This authorization attempt has already completed. You can close this window.",
        ));
    };

    // Provider-side rejection: the user denied access or the request was
    // invalid upstream. No code to exchange.
    if let Some(error) = query.error {
        let detail = match query.error_description {
            Some(desc) => format!("{}: {}", error, desc),
            None => error,
        };
        warn!(detail = %detail, "provider rejected the authorization request");
        shared.finish(
            ListenerResult::failure(AuthError::Authorization(detail.clone())),
            tx,
        );
        return Html(failure_page(&format!("Authorization failed: {}", detail)));
    }

    if shared.context.is_expired() {
        warn!("callback arrived after the authorization context expired");
        shared.finish(
            ListenerResult::failure(AuthError::Authorization(
                "authorization attempt expired; please start again".to_string(),
            )),
            tx,
        );
        return Html(failure_page(
            "Authorization failed: this sign-in attempt expired. Please start again.",
        ));
    }

    let Some(code) = query.code else {
        warn!("callback carried neither a code nor an error");
        shared.finish(
            ListenerResult::failure(AuthError::Authorization(
                "callback carried no authorization code".to_string(),
            )),
            tx,
        );
        return Html(failure_page(
            "Authorization failed: the provider sent no authorization code.",
        ));
    };

    // The orchestrator assigns the redirect URI before serving; a missing
    // one is a wiring bug, and exchanging with a fabricated URI would only
    // produce a confusing upstream rejection.
    let Some(redirect_uri) = shared.context.redirect_uri.clone() else {
        error!("authorization context has no redirect URI");
        shared.finish(
            ListenerResult::failure(AuthError::Configuration(
                "authorization context has no redirect URI".to_string(),
            )),
            tx,
        );
        return Html(failure_page(
            "Authorization failed: internal configuration error. Check the application logs.",
        ));
    };

    match shared
        .exchanger
        .exchange_code(
            &shared.config,
            &code,
            &shared.context.code_verifier,
            &redirect_uri,
        )
        .await
    {
        Ok(tokens) => match exchange_api_key_if_scoped(&shared, &tokens).await {
            Ok(api_key) => {
                info!(provider = %shared.config.provider_id, "authorization complete");
                shared.finish(ListenerResult::success(tokens, api_key), tx);
                Html(success_page())
            }
            Err(e) => {
                error!(error = %e, "API key exchange failed");
                shared.finish(ListenerResult::failure(e), tx);
                Html(failure_page(
                    "Authorization failed: the API key exchange was rejected. Check the application logs.",
                ))
            }
        },
        Err(e) => {
            error!(error = %e, "token exchange failed");
            shared.finish(ListenerResult::failure(e), tx);
            Html(failure_page(
                "Authorization failed: the token exchange was rejected. Check the application logs.",
            ))
        }
    }
}

/// Run the API-key exchange when the identity claims carried both an
/// organization and a project. Absence of either (or of an ID token to
/// exchange) is a valid outcome and yields `Ok(None)`; a failed exchange
/// fails the whole attempt.
async fn exchange_api_key_if_scoped(
    shared: &ListenerShared,
    tokens: &TokenBundle,
) -> AuthResult<Option<String>> {
    if tokens.organization_id.is_none() || tokens.project_id.is_none() {
        info!(
            provider = %shared.config.provider_id,
            "identity claims carry no organization/project; skipping API key exchange"
        );
        return Ok(None);
    }

    let Some(id_token) = tokens.id_token.as_deref() else {
        return Ok(None);
    };

    let key = shared
        .exchanger
        .exchange_api_key(&shared.config, id_token)
        .await?;
    Ok(Some(key))
}

fn success_page() -> String {
    page(
        "Authorization successful",
        "You're signed in. You can close this window and return to the terminal.",
    )
}

fn failure_page(message: &str) -> String {
    page("Authorization failed", message)
}

fn page(title: &str, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>{title}</title>
  <style>
    body {{ font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif;
           display: flex; align-items: center; justify-content: center;
           height: 100vh; margin: 0; background: #f5f5f5; }}
    .card {{ background: #fff; border-radius: 8px; padding: 2.5rem 3rem;
            box-shadow: 0 2px 8px rgba(0,0,0,0.1); max-width: 28rem; }}
    h1 {{ font-size: 1.25rem; margin: 0 0 0.75rem; }}
    p {{ color: #555; margin: 0; }}
  </style>
</head>
<body>
  <div class="card">
    <h1>{title}</h1>
    <p>{message}</p>
  </div>
</body>
</html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_port_conflict_is_port_unavailable() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let err = CallbackServer::bind(PortPolicy::Fixed(port))
            .await
            .unwrap_err();
        match err {
            AuthError::PortUnavailable { port: p, .. } => assert_eq!(p, port),
            other => panic!("expected PortUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_negotiated_falls_back_to_ephemeral() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let server = CallbackServer::bind(PortPolicy::Negotiated(port))
            .await
            .unwrap();
        assert_ne!(server.port(), port);
        assert_ne!(server.port(), 0);
    }

    #[tokio::test]
    async fn test_negotiated_uses_preferred_port_when_free() {
        // Find a free port, release it, then ask for it. A race is possible
        // but unlikely on a loopback-only test host.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let server = CallbackServer::bind(PortPolicy::Negotiated(port))
            .await
            .unwrap();
        assert_eq!(server.port(), port);
    }

    #[test]
    fn test_pages_mention_outcome() {
        assert!(success_page().contains("Authorization successful"));
        assert!(failure_page("nope").contains("nope"));
    }

    /// Serve a listener with the given context; the token endpoint points at
    /// an unroutable port so any accidental exchange fails loudly.
    async fn serve_for_test(context: AuthContext) -> (u16, ListenerHandle) {
        let server = CallbackServer::bind(PortPolicy::Negotiated(0)).await.unwrap();
        let port = server.port();

        let mut config = ProviderConfig::openai_platform();
        config.token_url = "http://127.0.0.1:9/oauth/token".to_string();

        let exchanger = Arc::new(TokenExchanger::new().unwrap());
        (port, server.serve(config, context, exchanger))
    }

    #[tokio::test]
    async fn test_expired_context_rejects_callback_without_exchange() {
        let mut context = AuthContext::prepare_with_window(chrono::Duration::seconds(-1));
        context.redirect_uri = Some("http://localhost:0/auth/callback".to_string());
        let state = context.state.clone();

        let (port, handle) = serve_for_test(context).await;

        let response = reqwest::get(format!(
            "http://127.0.0.1:{}/auth/callback?code=stale&state={}",
            port, state
        ))
        .await
        .unwrap();
        assert!(response.text().await.unwrap().contains("expired"));

        let result = handle.result_rx.await.unwrap();
        assert!(matches!(result.error, Some(AuthError::Authorization(_))));
        assert!(result.tokens.is_none());
    }

    #[tokio::test]
    async fn test_missing_redirect_uri_is_configuration_failure() {
        let context = AuthContext::prepare();
        assert!(context.redirect_uri.is_none());
        let state = context.state.clone();

        let (port, handle) = serve_for_test(context).await;

        let response = reqwest::get(format!(
            "http://127.0.0.1:{}/auth/callback?code=orphan&state={}",
            port, state
        ))
        .await
        .unwrap();
        assert!(response.text().await.unwrap().contains("Authorization failed"));

        let result = handle.result_rx.await.unwrap();
        assert!(matches!(result.error, Some(AuthError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_mismatched_state_is_ignored_and_listener_keeps_waiting() {
        let mut context = AuthContext::prepare();
        context.redirect_uri = Some("http://localhost:0/auth/callback".to_string());

        let (port, mut handle) = serve_for_test(context).await;

        // Forged termination attempts: neither an error nor a code with the
        // wrong state may complete the attempt.
        for forged in [
            format!("http://127.0.0.1:{}/auth/callback?error=access_denied&state=forged", port),
            format!("http://127.0.0.1:{}/auth/callback?code=evil&state=forged", port),
            format!("http://127.0.0.1:{}/auth/callback?error=access_denied", port),
        ] {
            let response = reqwest::get(forged).await.unwrap();
            assert!(response
                .text()
                .await
                .unwrap()
                .contains("does not match the pending sign-in attempt"));
        }

        assert!(
            handle.result_rx.try_recv().is_err(),
            "forged callbacks must not produce an outcome"
        );
        handle.cancel();
    }
}
