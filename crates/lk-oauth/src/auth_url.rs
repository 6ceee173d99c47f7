//! Authorization URL construction

use crate::config::ProviderConfig;
use crate::pkce::AuthContext;
use lk_types::{AuthError, AuthResult};

/// Render the provider's authorization endpoint URL for a prepared context.
///
/// Fails if the context's redirect URI has not been assigned yet (the
/// listener's port must be known before the URL can be shown to the user).
/// All standard parameters are present even when empty; extra provider
/// flags are passed through verbatim.
pub fn build_auth_url(ctx: &AuthContext, config: &ProviderConfig) -> AuthResult<String> {
    let redirect_uri = ctx.redirect_uri.as_deref().ok_or_else(|| {
        AuthError::Configuration(
            "redirect URI not assigned; the callback listener must be bound first".to_string(),
        )
    })?;

    let mut url = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
        config.authorize_url,
        urlencoding::encode(&config.client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&config.scope),
        urlencoding::encode(&ctx.code_challenge),
        urlencoding::encode(&ctx.state),
    );

    for (key, value) in &config.extra_auth_params {
        url.push_str(&format!(
            "&{}={}",
            urlencoding::encode(key),
            urlencoding::encode(value)
        ));
    }

    Ok(url)
}
