pub mod fetcher;
pub mod http_client;
pub mod parsers;
pub mod session;

use crate::models::ChartType;
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

pub use self::fetcher::ChartFetcher;
pub use self::session::{PortalSession, SessionState};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PortalError {
    /// Credentials rejected or the login form no longer looks as expected.
    #[error("login failed: {0}")]
    Login(String),

    /// Transport failure or a response the client cannot make sense of.
    #[error("{message}")]
    Protocol {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("session is not authenticated (state: {0:?})")]
    NotAuthenticated(SessionState),
}

impl PortalError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        PortalError::Protocol {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn protocol_caused(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        PortalError::Protocol {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

// ── Credentials ───────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// PV system the session reads charts for.
    pub system_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("system_id", &self.system_id)
            .finish()
    }
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// Anything that can hand out a day's chart document.
#[async_trait]
pub trait ChartSource: Send + Sync {
    async fn get_chart(
        &self,
        date: NaiveDate,
        chart_type: ChartType,
    ) -> Result<serde_json::Value, PortalError>;
}
