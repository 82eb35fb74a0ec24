use super::PortalError;
use crate::config::PortalConfig;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode, Url};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
#[error("HTTP {status} from {url}")]
pub struct HttpStatusError {
    pub status: StatusCode,
    pub url: Url,
}

/// A response after all redirects were followed.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: Url,
    pub status: StatusCode,
    /// Targets of every redirect hop, in order. The last one equals `url`.
    pub redirects: Vec<Url>,
    pub body: String,
}

impl Page {
    pub fn ensure_success(self) -> Result<Self, PortalError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            let err = HttpStatusError {
                status: self.status,
                url: self.url.clone(),
            };
            Err(PortalError::protocol_caused(
                format!("Portal answered {} for {}", self.status, self.url),
                err,
            ))
        }
    }
}

/// Cookie-keeping HTTP client that follows redirects itself so the chain
/// stays visible to the caller.
pub struct HttpClient {
    inner: reqwest::Client,
    max_redirects: usize,
}

impl HttpClient {
    pub fn new(config: &PortalConfig) -> Result<Self, PortalError> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| PortalError::protocol_caused("Failed to build HTTP client", e))?;

        Ok(Self {
            inner,
            max_redirects: config.max_redirects,
        })
    }

    pub async fn get(&self, url: Url) -> Result<Page, PortalError> {
        self.send(Method::GET, url, None).await
    }

    pub async fn post_form(&self, url: Url, form: &[(&str, &str)]) -> Result<Page, PortalError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form)
            .finish();
        self.send(Method::POST, url, Some(body)).await
    }

    async fn send(
        &self,
        mut method: Method,
        mut url: Url,
        mut form: Option<String>,
    ) -> Result<Page, PortalError> {
        let mut redirects = Vec::new();

        loop {
            debug!("{} {}", method, url);
            let mut request = self.inner.request(method.clone(), url.clone());
            if let Some(body) = &form {
                request = request
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(body.clone());
            }
            let resp = request.send().await.map_err(|e| transport_error(&url, e))?;
            let status = resp.status();

            let location = resp
                .headers()
                .get(LOCATION)
                .filter(|_| status.is_redirection());
            if let Some(location) = location {
                let location = location.to_str().map_err(|e| {
                    PortalError::protocol_caused(format!("Unreadable redirect from {}", url), e)
                })?;
                let next = url.join(location).map_err(|e| {
                    PortalError::protocol_caused(
                        format!("Bad redirect target {:?} from {}", location, url),
                        e,
                    )
                })?;
                if redirects.len() >= self.max_redirects {
                    return Err(PortalError::protocol(format!(
                        "More than {} redirects starting from {}",
                        self.max_redirects, url
                    )));
                }
                if !matches!(
                    status,
                    StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
                ) {
                    method = Method::GET;
                    form = None;
                }
                trace!("{} → {}", status, next);
                redirects.push(next.clone());
                url = next;
                continue;
            }

            let body = resp.text().await.map_err(|e| transport_error(&url, e))?;
            return Ok(Page {
                url,
                status,
                redirects,
                body,
            });
        }
    }
}

fn transport_error(url: &Url, err: reqwest::Error) -> PortalError {
    let message = if err.is_connect() || err.is_timeout() {
        format!("Could not reach {}, is the network ok?", url)
    } else {
        format!("Request to {} failed", url)
    };
    PortalError::protocol_caused(message, err)
}
