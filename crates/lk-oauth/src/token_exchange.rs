//! Token exchange against the provider's token endpoint
//!
//! Two independent outbound operations: the authorization-code exchange and
//! the optional token-for-API-key exchange. Both use a bounded request
//! timeout and are never retried; the user re-runs the flow on failure.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use lk_types::{AuthError, AuthResult};

/// Outbound request timeout. Seconds, not minutes: a hung token endpoint
/// should fail the attempt, not the user's patience.
const REQUEST_TIMEOUT_SECS: u64 = 30;

const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ID_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:id_token";
const REQUESTED_TOKEN: &str = "openai-api-key";

/// Raw result of the authorization-code exchange, plus identity claims
/// decoded from the ID token (or, failing that, the access token).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub id_token: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub account_id: Option<String>,
    pub organization_id: Option<String>,
    pub project_id: Option<String>,
}

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// API-key exchange response body.
#[derive(Debug, Deserialize)]
struct ApiKeyResponse {
    access_token: String,
}

/// Identity claims decoded (unverified) from a provider JWT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityClaims {
    pub account_id: Option<String>,
    pub organization_id: Option<String>,
    pub project_id: Option<String>,
    pub organizations: Vec<OrganizationClaim>,
}

/// One entry of the organization list claim.
#[derive(Debug, Clone, PartialEq)]
pub struct OrganizationClaim {
    pub id: String,
    pub is_default: bool,
}

/// Decode the payload of a JWT without signature verification.
///
/// Only identity claims are read from it; the token is never trusted for
/// authorization decisions. Returns `None` for non-JWT (opaque) tokens.
pub fn decode_identity_claims(token: &str, claim_namespace: Option<&str>) -> Option<IdentityClaims> {
    let mut parts = token.split('.');
    let (_header, payload) = (parts.next()?, parts.next()?);
    parts.next()?;

    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let json: serde_json::Value = serde_json::from_slice(&bytes).ok()?;

    let claims = match claim_namespace {
        Some(ns) => json.get(ns)?,
        None => &json,
    };

    let string_claim = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| claims.get(*k).and_then(|v| v.as_str()))
            .map(str::to_string)
    };

    let organizations = claims
        .get("organizations")
        .and_then(|v| v.as_array())
        .map(|orgs| {
            orgs.iter()
                .filter_map(|org| {
                    Some(OrganizationClaim {
                        id: org.get("id").and_then(|v| v.as_str())?.to_string(),
                        is_default: org
                            .get("is_default")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(IdentityClaims {
        account_id: string_claim(&["chatgpt_account_id", "user_id", "account_id"]),
        organization_id: string_claim(&["organization_id"]),
        project_id: string_claim(&["project_id"]),
        organizations,
    })
}

/// Resolve the organization/project pair that gates the API-key exchange.
///
/// Organization fallback chain: the default-flagged entry of the
/// organization list, else the top-level organization claim, else `None`.
/// Absence is a valid terminal state (the user completes provider-side
/// setup out of band), not an error.
pub fn resolve_org_project(claims: &IdentityClaims) -> Option<(String, String)> {
    let project = claims.project_id.clone()?;
    let organization = claims
        .organizations
        .iter()
        .find(|org| org.is_default)
        .map(|org| org.id.clone())
        .or_else(|| claims.organization_id.clone())?;
    Some((organization, project))
}

/// HTTP client for the two token-endpoint operations.
pub struct TokenExchanger {
    client: Client,
}

impl TokenExchanger {
    pub fn new() -> AuthResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AuthError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Exchange the one-time authorization code for tokens.
    pub async fn exchange_code(
        &self,
        config: &ProviderConfig,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> AuthResult<TokenBundle> {
        info!(provider = %config.provider_id, "exchanging authorization code for tokens");

        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", redirect_uri);
        params.insert("client_id", &config.client_id);
        params.insert("code_verifier", code_verifier);

        let body = self.post_form(&config.token_url, &params).await?;

        let response: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            AuthError::TokenExchange {
                status: None,
                detail: format!("malformed token response: {}", e),
            }
        })?;

        // Identity claims live in the ID token when the provider issues one;
        // some providers put them in the access token instead.
        let namespace = config.identity_claim.as_deref();
        let claims = response
            .id_token
            .as_deref()
            .and_then(|t| decode_identity_claims(t, namespace))
            .or_else(|| {
                response
                    .access_token
                    .as_deref()
                    .and_then(|t| decode_identity_claims(t, namespace))
            })
            .unwrap_or_default();

        let (organization_id, project_id) = match resolve_org_project(&claims) {
            Some((org, project)) => (Some(org), Some(project)),
            None => (None, None),
        };

        debug!(
            provider = %config.provider_id,
            has_org = organization_id.is_some(),
            has_project = project_id.is_some(),
            "token exchange complete"
        );

        Ok(TokenBundle {
            id_token: response.id_token,
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            account_id: claims.account_id,
            organization_id,
            project_id,
        })
    }

    /// Exchange the ID token for a scoped API key.
    ///
    /// Only valid when the identity claims carried both an organization and
    /// a project; callers gate on [`TokenBundle::organization_id`] /
    /// [`TokenBundle::project_id`]. The issued key carries a dated,
    /// human-readable name so it is auditable on the provider's dashboard.
    pub async fn exchange_api_key(
        &self,
        config: &ProviderConfig,
        id_token: &str,
    ) -> AuthResult<String> {
        info!(provider = %config.provider_id, "exchanging ID token for API key");

        let name = format!(
            "{} CLI [auto-generated] ({})",
            config.provider_id,
            Utc::now().format("%Y-%m-%d")
        );

        let mut params = HashMap::new();
        params.insert("grant_type", TOKEN_EXCHANGE_GRANT);
        params.insert("client_id", &config.client_id);
        params.insert("requested_token", REQUESTED_TOKEN);
        params.insert("subject_token", id_token);
        params.insert("subject_token_type", ID_TOKEN_TYPE);
        params.insert("name", &name);

        let body = self.post_form(&config.token_url, &params).await?;

        let response: ApiKeyResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::TokenExchange {
                status: None,
                detail: format!("malformed API key exchange response: {}", e),
            })?;

        Ok(response.access_token)
    }

    /// POST a form-encoded request and return the body of a 2xx response.
    ///
    /// Non-success statuses surface the upstream status and body for
    /// diagnostics; request bodies (which carry secrets) are never included.
    async fn post_form(&self, url: &str, params: &HashMap<&str, &str>) -> AuthResult<String> {
        let response = self
            .client
            .post(url)
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::TokenExchange {
                status: None,
                detail: format!("request to token endpoint failed: {}", e),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::TokenExchange {
                status: Some(status.as_u16()),
                detail: format!("failed to read token endpoint response: {}", e),
            })?;

        if !status.is_success() {
            warn!(status = %status, "token endpoint returned an error");
            return Err(AuthError::TokenExchange {
                status: Some(status.as_u16()),
                detail: body,
            });
        }

        Ok(body)
    }
}
