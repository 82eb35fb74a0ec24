//! Authenticated correspondence with the portal.
//!
//! Login walks an OAuth-style redirect chain:
//!   1. landing page (anti-forgery cookies)
//!   2. login page via redirects; yields the one-time `sessionDataKey` and,
//!      in the final URL, the `redirect_uri` callback
//!   3. POST credentials + key to the identity provider
//!   4. pick the hidden callback fields out of the answer
//!   5. POST them to the callback to obtain the session cookies
//!   6. confirm via [`PortalSession::is_logged_in`]
//!
//! Nothing is retried. A failed step leaves the session in [`SessionState::Failed`].

use super::http_client::HttpClient;
use super::parsers::{LOGIN_FORM_FIELDS, extract_hidden_fields, extract_session_key, query_param};
use super::{ChartSource, Credentials, PortalError};
use crate::config::PortalConfig;
use crate::models::ChartType;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use reqwest::Url;
use tracing::{debug, info};

/// Query parameter naming the PV system, both in chart requests and in the
/// dashboard URL a logged-in landing page redirects to.
pub const SYSTEM_ID_PARAM: &str = "pvSystemId";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Failed,
}

struct Endpoints {
    landing: Url,
    login: Url,
    auth: Url,
    chart: Url,
}

impl Endpoints {
    fn from_config(config: &PortalConfig) -> Result<Self, PortalError> {
        let parse = |name: &str, raw: &str| {
            Url::parse(raw).map_err(|e| {
                PortalError::protocol_caused(format!("Invalid {} URL {:?}", name, raw), e)
            })
        };
        Ok(Self {
            landing: parse("landing", &config.landing_url)?,
            login: parse("login", &config.login_url)?,
            auth: parse("auth", &config.auth_url)?,
            chart: parse("chart", &config.chart_url)?,
        })
    }
}

pub struct PortalSession {
    http: HttpClient,
    endpoints: Endpoints,
    credentials: Credentials,
    state: SessionState,
    session_key: Option<String>,
}

impl PortalSession {
    /// A session that has not logged in yet.
    pub fn new(config: &PortalConfig, credentials: Credentials) -> Result<Self, PortalError> {
        Ok(Self {
            http: HttpClient::new(config)?,
            endpoints: Endpoints::from_config(config)?,
            credentials,
            state: SessionState::Unauthenticated,
            session_key: None,
        })
    }

    /// Build a session and log in; any failure aborts construction.
    pub async fn connect(
        config: &PortalConfig,
        credentials: Credentials,
    ) -> Result<Self, PortalError> {
        let mut session = Self::new(config, credentials)?;
        info!("Logging into the portal at {}...", session.endpoints.landing);
        session.login().await?;
        info!("... done logging in.");
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn login(&mut self) -> Result<(), PortalError> {
        self.state = SessionState::Authenticating;
        match self.run_login().await {
            Ok(()) => {
                self.state = SessionState::Authenticated;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn run_login(&mut self) -> Result<(), PortalError> {
        debug!("Visiting landing page {} for cookies", self.endpoints.landing);
        self.http.get(self.endpoints.landing.clone()).await?;

        debug!("Retrieving login page via {}", self.endpoints.login);
        let login_page = self
            .http
            .get(self.endpoints.login.clone())
            .await?
            .ensure_success()?;

        let session_key = extract_session_key(&login_page.body).ok_or_else(|| {
            PortalError::protocol(
                "Could not find the session data key in the login page, \
                 perhaps the portal changed its login procedure",
            )
        })?;
        let callback = query_param(&login_page.url, "redirect_uri")
            .ok_or_else(|| {
                PortalError::protocol(format!(
                    "Login page {} carries no redirect_uri",
                    login_page.url
                ))
            })
            .and_then(|raw| {
                Url::parse(&raw).map_err(|e| {
                    PortalError::protocol_caused(format!("Invalid callback URL {:?}", raw), e)
                })
            })?;
        self.session_key = Some(session_key.clone());

        debug!("Submitting login form to {}", self.endpoints.auth);
        let answer = self
            .http
            .post_form(
                self.endpoints.auth.clone(),
                &[
                    ("username", self.credentials.username.as_str()),
                    ("password", self.credentials.password.as_str()),
                    ("sessionDataKey", session_key.as_str()),
                ],
            )
            .await?;

        let fields = extract_hidden_fields(&answer.body, &LOGIN_FORM_FIELDS).map_err(|missing| {
            PortalError::Login(format!(
                "field {:?} missing from the login answer, are the credentials correct?",
                missing
            ))
        })?;

        debug!("Credentials accepted, finishing login at {}", callback);
        let form: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.http.post_form(callback, &form).await?;

        if !self.is_logged_in().await? {
            return Err(PortalError::Login(format!(
                "portal did not confirm the session for system {}",
                self.credentials.system_id
            )));
        }
        Ok(())
    }

    /// A logged-in landing page redirects (at least twice) to the dashboard of
    /// the configured PV system.
    pub async fn is_logged_in(&self) -> Result<bool, PortalError> {
        let page = self.http.get(self.endpoints.landing.clone()).await?;
        let confirmed = page.redirects.len() >= 2
            && page
                .redirects
                .last()
                .and_then(|target| query_param(target, SYSTEM_ID_PARAM))
                .is_some_and(|id| id == self.credentials.system_id);
        debug!(
            "Landing page: {} redirects, ends at {} (logged in: {})",
            page.redirects.len(),
            page.url,
            confirmed
        );
        Ok(confirmed)
    }

    fn chart_url(&self, date: NaiveDate, chart_type: ChartType) -> Url {
        let mut url = self.endpoints.chart.clone();
        url.query_pairs_mut()
            .append_pair(SYSTEM_ID_PARAM, &self.credentials.system_id)
            .append_pair("year", &date.year().to_string())
            .append_pair("month", &date.month().to_string())
            .append_pair("day", &date.day().to_string())
            .append_pair("interval", "day")
            .append_pair("view", chart_type.as_str());
        url
    }
}

#[async_trait]
impl ChartSource for PortalSession {
    async fn get_chart(
        &self,
        date: NaiveDate,
        chart_type: ChartType,
    ) -> Result<serde_json::Value, PortalError> {
        if self.state != SessionState::Authenticated {
            return Err(PortalError::NotAuthenticated(self.state));
        }

        let url = self.chart_url(date, chart_type);
        debug!("Retrieving {} chart for {} from {}", chart_type, date, url);
        let page = self.http.get(url).await?.ensure_success()?;

        serde_json::from_str(&page.body).map_err(|e| {
            PortalError::protocol_caused(
                format!("{} chart for {} is not JSON", chart_type, date),
                e,
            )
        })
    }
}
