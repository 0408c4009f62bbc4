//! reqwest-backed [`DecisionSource`] for the Diavgeia open-data API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{Credentials, SessionConfig};
use crate::contract::{DecisionSource, FetchError, SearchPage, SearchQuery};

const USER_AGENT: &str = concat!("diavgeia-fetch/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client plus the credential pair; one per dispatch run.
pub struct DiavgeiaClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl DiavgeiaClient {
    pub fn new(client: Client, base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self, reqwest::Error> {
        let client = build_http_client(config.request_timeout)?;
        Ok(Self::new(
            client,
            config.api_base.clone(),
            config.credentials.clone(),
        ))
    }

    pub fn search_url(&self) -> String {
        format!("{}/search", self.base_url)
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response, FetchError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .basic_auth(&self.credentials.user, Some(&self.credentials.password))
            .send()
            .await
            .map_err(|e| classify(url, e))?;
        check_status(url, response)
    }

    async fn body(url: &str, response: Response) -> Result<Vec<u8>, FetchError> {
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| classify(url, e))
    }
}

pub fn build_http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(30))
        .build()
}

fn classify(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::Transient {
            url: url.to_string(),
            reason: err.to_string(),
        }
    } else {
        FetchError::Contract {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

fn check_status(url: &str, response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = url.to_string();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::Unauthorized {
            url,
            status: status.as_u16(),
        }),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            Err(FetchError::Transient {
                url,
                reason: format!("HTTP {}", s.as_u16()),
            })
        }
        s => Err(FetchError::Status {
            url,
            status: s.as_u16(),
        }),
    }
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"))
}

#[async_trait]
impl DecisionSource for DiavgeiaClient {
    async fn search(&self, query: &SearchQuery) -> Result<Option<SearchPage>, FetchError> {
        let url = self.search_url();
        let params = [
            ("from_date", query.from_date.to_string()),
            ("to_date", query.to_date.to_string()),
            ("size", query.size.to_string()),
            ("page", query.page.to_string()),
        ];
        debug!(url = %url, page = query.page, from_date = %query.from_date, "Requesting search page");
        let response = self.get(&url, &params).await?;
        if response.status() == StatusCode::NO_CONTENT || !is_json(&response) {
            warn!(url = %url, status = %response.status(), "Search returned no JSON content");
            return Ok(None);
        }
        let body = Self::body(&url, response).await?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| FetchError::Contract {
                url,
                reason: format!("malformed search page: {e}"),
            })
    }

    async fn fetch_decision(&self, url: &str) -> Result<Value, FetchError> {
        debug!(url, "Re-fetching decision through its self-link");
        let response = self.get(url, &[]).await?;
        let body = Self::body(url, response).await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Contract {
            url: url.to_string(),
            reason: format!("malformed decision: {e}"),
        })
    }

    async fn fetch_document(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.get(url, &[]).await?;
        Self::body(url, response).await
    }
}
