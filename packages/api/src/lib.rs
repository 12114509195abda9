#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! REST client for the GreenSentinel incident API.
//!
//! Covers the three operations the client applications perform: the
//! bootstrap list fetch, single-incident detail, and state transitions
//! (`PATCH`). Transient failures (connection errors, timeouts, HTTP 429
//! and 5xx) retry with exponential backoff; other 4xx responses are
//! permanent and surface immediately.
//!
//! The list endpoint has been observed answering with three different
//! body shapes over the product's life: a bare array, `{"incidents":
//! [...]}`, and `{"data": [...], "total": n}`. [`ListResponse`] commits to
//! that set as an exhaustive union instead of sniffing shapes per
//! endpoint; anything else is a parse error.

use std::time::Duration;

use green_sentinel_config::ClientConfig;
use green_sentinel_incident_models::{Incident, IncidentState};
use serde::Deserialize;

/// Number of extra attempts for transient HTTP failures. With exponential
/// backoff (1s, 2s, 4s) the total wait before giving up is 7 seconds.
const MAX_RETRIES: u32 = 3;

/// Errors that can occur talking to the incident API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// HTTP request failed (connection, timeout, TLS).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for log context.
        body: String,
    },

    /// The response body did not match any known shape.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One page of incidents from the list endpoint, normalized from
/// whichever envelope the server used.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentPage {
    /// The incidents, in server order (newest first).
    pub incidents: Vec<Incident>,
    /// Total matching records server-side. Falls back to the page length
    /// when the envelope does not carry a count.
    pub total: u64,
}

/// The observed list response encodings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListResponse {
    /// Bare JSON array of incidents.
    Bare(Vec<Incident>),
    /// `{"incidents": [...]}` as returned by the field API.
    Keyed { incidents: Vec<Incident> },
    /// `{"data": [...], "total": n}` as returned by the admin API.
    Paged { data: Vec<Incident>, total: u64 },
}

impl From<ListResponse> for IncidentPage {
    fn from(response: ListResponse) -> Self {
        match response {
            ListResponse::Bare(incidents) | ListResponse::Keyed { incidents } => {
                let total = incidents.len() as u64;
                Self { incidents, total }
            }
            ListResponse::Paged { data, total } => Self {
                incidents: data,
                total,
            },
        }
    }
}

/// HTTP client for the incident API.
pub struct IncidentApi {
    client: reqwest::Client,
    base_url: String,
}

impl IncidentApi {
    /// Creates a client for the given base URL.
    ///
    /// `base_url` should be like `http://localhost:8000` (no trailing
    /// slash; one is stripped if present).
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Creates a client from a resolved [`ClientConfig`].
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(&config.http_base())
    }

    /// Fetches the most recent incidents, optionally filtered by state
    /// server-side, bounded by `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the request fails after all retries, the
    /// server answers with a permanent error status, or the body matches
    /// none of the known response shapes.
    pub async fn list_incidents(
        &self,
        state: Option<IncidentState>,
        limit: usize,
    ) -> Result<IncidentPage, ApiError> {
        let url = format!("{}/api/v1/incidents", self.base_url);
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(state) = state {
            query.push(("state", state.to_string()));
        }

        log::debug!("GET {url} (limit={limit}, state={state:?})");
        let body = send_with_retry(|| self.client.get(&url).query(&query)).await?;
        let response: ListResponse = serde_json::from_str(&body)?;
        Ok(response.into())
    }

    /// Fetches a single incident by id.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the request fails after all retries or the
    /// body is not an incident.
    pub async fn get_incident(&self, id: i64) -> Result<Incident, ApiError> {
        let url = format!("{}/api/v1/incidents/{id}", self.base_url);
        log::debug!("GET {url}");
        let body = send_with_retry(|| self.client.get(&url)).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Requests a state transition for the given incident.
    ///
    /// The caller is expected to have applied the change optimistically;
    /// the authoritative record flows back over the live stream.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the request fails after all retries or the
    /// server rejects the transition.
    pub async fn update_state(&self, id: i64, state: IncidentState) -> Result<(), ApiError> {
        let url = format!("{}/api/v1/incidents/{id}", self.base_url);
        log::debug!("PATCH {url} (state={state})");
        send_with_retry(|| {
            self.client
                .patch(&url)
                .json(&serde_json::json!({ "state": state }))
        })
        .await?;
        Ok(())
    }
}

/// Sends a request and returns the response body as text, retrying
/// transient failures with exponential backoff.
///
/// The `build_request` closure is called on each attempt to construct a
/// fresh [`reqwest::RequestBuilder`], since builders are consumed by
/// `.send()`.
async fn send_with_retry<F>(build_request: F) -> Result<String, ApiError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome = build_request().send().await;
        let retryable = match &outcome {
            Ok(response) => {
                let status = response.status();
                status.as_u16() == 429 || status.is_server_error()
            }
            Err(err) => err.is_connect() || err.is_timeout(),
        };

        if retryable && attempt < MAX_RETRIES {
            let delay = Duration::from_secs(1 << attempt);
            match &outcome {
                Ok(response) => log::warn!(
                    "Transient HTTP {} (attempt {}/{MAX_RETRIES}), retrying in {delay:?}",
                    response.status(),
                    attempt + 1
                ),
                Err(err) => log::warn!(
                    "Request failed: {err} (attempt {}/{MAX_RETRIES}), retrying in {delay:?}",
                    attempt + 1
                ),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }

        let response = outcome?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        return Ok(response.text().await?);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bare_array_response() {
        let page: IncidentPage = serde_json::from_str::<ListResponse>(
            r#"[{"id": 1, "confidence": 0.9}, {"id": 2, "confidence": 0.4}]"#,
        )
        .unwrap()
        .into();
        assert_eq!(page.incidents.len(), 2);
        assert_eq!(page.total, 2);
    }

    #[test]
    fn decodes_keyed_response() {
        let page: IncidentPage = serde_json::from_str::<ListResponse>(
            r#"{"incidents": [{"id": 5, "state": "validated_fire"}]}"#,
        )
        .unwrap()
        .into();
        assert_eq!(page.incidents[0].id, 5);
        assert_eq!(page.total, 1);
    }

    #[test]
    fn decodes_paged_response_with_total() {
        let page: IncidentPage = serde_json::from_str::<ListResponse>(
            r#"{"data": [{"id": 9}], "total": 250, "page": 1, "totalPages": 25}"#,
        )
        .unwrap()
        .into();
        assert_eq!(page.incidents.len(), 1);
        assert_eq!(page.total, 250);
    }

    #[test]
    fn rejects_unknown_response_shape() {
        assert!(serde_json::from_str::<ListResponse>(r#"{"results": []}"#).is_err());
        assert!(serde_json::from_str::<ListResponse>("42").is_err());
    }

    #[test]
    fn strips_trailing_slash_from_base_url() {
        let api = IncidentApi::new("http://localhost:8000/");
        assert_eq!(api.base_url, "http://localhost:8000");
    }
}
