//! User-facing flow notifications
//!
//! The engine reports progress through a trait so hosts can route messages
//! to a terminal, a desktop notification, or anything else. The engine never
//! prints directly.

use crate::storage::CredentialBundle;
use tracing::{error, info, warn};

/// Severity of a flow status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Host-side surface for flow progress.
pub trait FlowUi: Send + Sync {
    /// Ask the host to open the authorization URL in a browser. Returns
    /// `false` when the host could not (the flow then tells the user to
    /// open it manually and keeps waiting).
    fn open_url(&self, url: &str) -> bool;

    /// Report a status message.
    fn status(&self, level: StatusLevel, message: &str);

    /// Called after new credentials are persisted. Best effort; failures
    /// here never fail the flow.
    fn credentials_updated(&self, _bundle: &CredentialBundle) {}
}

/// Log-only UI. Never opens a browser; the user follows the logged URL.
pub struct TracingUi;

impl FlowUi for TracingUi {
    fn open_url(&self, url: &str) -> bool {
        info!(%url, "open this URL in your browser to continue");
        false
    }

    fn status(&self, level: StatusLevel, message: &str) {
        match level {
            StatusLevel::Info | StatusLevel::Success => info!("{}", message),
            StatusLevel::Warning => warn!("{}", message),
            StatusLevel::Error => error!("{}", message),
        }
    }
}
