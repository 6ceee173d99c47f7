//! Credential persistence
//!
//! Credentials are stored as one pretty-printed JSON file per provider,
//! owner-read/write only. The file is created with restrictive permissions
//! rather than chmod-ed afterwards, so no world-readable window exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::token_exchange::TokenBundle;
use lk_types::{AuthError, AuthResult};

/// Everything one completed authorization attempt produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub tokens: TokenBundle,
    /// Scoped API key, present only when the identity claims carried an
    /// organization and a project at exchange time.
    pub api_key: Option<String>,
    pub last_refresh: DateTime<Utc>,
}

impl CredentialBundle {
    pub fn new(tokens: TokenBundle, api_key: Option<String>) -> Self {
        Self {
            tokens,
            api_key,
            last_refresh: Utc::now(),
        }
    }
}

/// File-backed credential store for one provider.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at the default location for a provider:
    /// `~/.loopkey/credentials/<provider_id>.json`.
    pub fn for_provider(provider_id: &str) -> AuthResult<Self> {
        Ok(Self {
            path: default_dir()?.join(format!("{}.json", provider_id)),
        })
    }

    /// Store at an explicit path. Used by host applications with their own
    /// data directory layout, and by tests.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted bundle, `None` when no file exists yet.
    pub async fn load(&self) -> AuthResult<Option<CredentialBundle>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let bundle = serde_json::from_str(&contents)
                    .map_err(|e| AuthError::Storage(format!("corrupt credential file: {}", e)))?;
                debug!(path = %self.path.display(), "loaded credentials");
                Ok(Some(bundle))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AuthError::Io(e)),
        }
    }

    /// Persist the bundle, replacing any previous contents.
    pub async fn save(&self, bundle: &CredentialBundle) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(bundle)?;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path).await?;
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;

        // mode() only applies at creation; clamp a pre-existing file too.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        info!(path = %self.path.display(), "credentials saved");
        Ok(())
    }

    /// Remove the credential file. Missing files are not an error.
    pub async fn delete(&self) -> AuthResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "credentials deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Io(e)),
        }
    }
}

/// Default credential directory: `~/.loopkey/credentials`, with a
/// `~/.loopkey-{env}` variant when `LOOPKEY_ENV` is set. Debug builds use
/// `.loopkey-dev` so development never touches real credentials.
fn default_dir() -> AuthResult<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| AuthError::Storage("could not determine home directory".to_string()))?;

    let base = if let Ok(env) = std::env::var("LOOPKEY_ENV") {
        format!(".loopkey-{}", env)
    } else if cfg!(debug_assertions) {
        ".loopkey-dev".to_string()
    } else {
        ".loopkey".to_string()
    };

    Ok(home.join(base).join("credentials"))
}
