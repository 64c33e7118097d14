//! HTTP client for upstream root servers.

use super::shape::parser_for;
use super::{FetchError, FetchMode, FetchedListing, SourceClient};
use crate::model::Source;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_USER_AGENT: &str = concat!("meeting-aggregator/", env!("CARGO_PKG_VERSION"));

/// Fetches `GetServiceBodies`, `GetFormats` and `GetSearchResults` from a source.
pub struct HttpSourceClient {
    client: reqwest::Client,
}

impl HttpSourceClient {
    /// `timeout` bounds each request, including reading the body.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_request_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_request_error(url, e))?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Parse {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

fn classify_request_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Unreachable {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

fn meetings_url(source: &Source, mode: FetchMode) -> String {
    let mut url = source.endpoint("GetSearchResults");
    if let FetchMode::ChangedSince(cutoff) = mode {
        url.push_str(&format!("&changed_since={}", cutoff.timestamp()));
    }
    url
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch(&self, source: &Source, mode: FetchMode) -> Result<FetchedListing, FetchError> {
        let parser = parser_for(source.shape);

        let service_bodies_url = source.endpoint("GetServiceBodies");
        let payload = self.get_json(&service_bodies_url).await?;
        let bodies = parser
            .service_bodies(source.id, &payload)
            .map_err(|message| FetchError::Parse {
                url: service_bodies_url.clone(),
                message,
            })?;

        let formats_url = source.endpoint("GetFormats");
        let payload = self.get_json(&formats_url).await?;
        let formats = parser
            .formats(source.id, &payload)
            .map_err(|message| FetchError::Parse {
                url: formats_url.clone(),
                message,
            })?;

        let meetings_url = meetings_url(source, mode);
        let payload = self.get_json(&meetings_url).await?;
        let meetings = parser
            .meetings(source.id, &payload)
            .map_err(|message| FetchError::Parse {
                url: meetings_url.clone(),
                message,
            })?;

        debug!(
            "Fetched {} service bodies, {} formats and {} meetings from {} ({} skipped)",
            bodies.service_bodies.len(),
            formats.formats.len(),
            meetings.meetings.len(),
            source.display_name(),
            bodies.problems.len() + formats.problems.len() + meetings.problems.len()
        );

        let change_cutoff =
            FetchedListing::resolve_change_cutoff(meetings.reported_cutoff, &meetings.meetings);
        let mut problems = bodies.problems;
        problems.extend(formats.problems);
        problems.extend(meetings.problems);

        Ok(FetchedListing {
            service_bodies: bodies.service_bodies,
            meetings: meetings.meetings,
            formats: formats.formats,
            deleted_meeting_ids: meetings.deleted_ids,
            problems,
            change_cutoff,
        })
    }
}
