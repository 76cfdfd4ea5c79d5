//! Source-data fetch contract and implementations.
//!
//! The reconciliation engine only ever sees a [`DataFetcher`]: fetching is
//! idempotent (re-fetching the same window returns the source's current
//! authoritative state, never a side effect), and every payload is parsed
//! into a [`DistrictSnapshot`] with strict shape validation before the
//! engine touches it.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mere_core::{DistrictSnapshot, TargetMonth};
use mere_store::BackoffPolicy;
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::info_span;

pub const CRATE_NAME: &str = "mere-fetch";

/// Inclusive date range a fetch covers, normally one whole target month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl FetchWindow {
    pub fn for_month(month: TargetMonth) -> Self {
        Self {
            start: month.first_day(),
            end: month.last_day(),
        }
    }

    pub fn month(&self) -> TargetMonth {
        TargetMonth::containing(self.end)
    }
}

/// Malformed payload. Shape errors are logged and skip the cycle; they never
/// terminate a job.
#[derive(Debug, Error)]
pub enum DataShapeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload missing required field {0:?}")]
    MissingField(&'static str),
    #[error("payload field {field:?} holds invalid date {value:?}")]
    InvalidDate { field: &'static str, value: String },
    #[error("payload is for district {found:?}, expected {expected:?}")]
    DistrictMismatch { expected: String, found: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Shape(#[from] DataShapeError),
    #[error("fixture io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Fetch the current published performance data for one district over one
/// date window.
#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch(
        &self,
        district_id: &str,
        window: FetchWindow,
    ) -> Result<DistrictSnapshot, FetchError>;
}

#[derive(Debug, Deserialize)]
struct RawDistrictPayload {
    district_id: Option<String>,
    /// As-of date embedded by the publisher, `YYYY-MM-DD`.
    as_of: Option<String>,
    membership: Option<i64>,
    paid_clubs: Option<i64>,
    distinguished_clubs: Option<i64>,
}

/// Parse raw payload bytes into a snapshot, validating district identity and
/// the embedded as-of date. The payload hash travels with the snapshot for
/// provenance and cheap equality checks.
pub fn parse_snapshot(
    bytes: &[u8],
    expected_district: &str,
    month: TargetMonth,
    fetched_at: DateTime<Utc>,
) -> Result<DistrictSnapshot, DataShapeError> {
    let payload: RawDistrictPayload = serde_json::from_slice(bytes)?;

    let district_id = payload
        .district_id
        .ok_or(DataShapeError::MissingField("district_id"))?;
    if district_id != expected_district {
        return Err(DataShapeError::DistrictMismatch {
            expected: expected_district.to_string(),
            found: district_id,
        });
    }

    let as_of = payload.as_of.ok_or(DataShapeError::MissingField("as_of"))?;
    let as_of_date = NaiveDate::parse_from_str(&as_of, "%Y-%m-%d").map_err(|_| {
        DataShapeError::InvalidDate {
            field: "as_of",
            value: as_of,
        }
    })?;

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let payload_sha256 = hex::encode(hasher.finalize());

    Ok(DistrictSnapshot {
        district_id,
        target_month: month,
        as_of_date,
        membership: payload.membership,
        club_count: payload.paid_clubs,
        distinguished_clubs: payload.distinguished_clubs,
        fetched_at,
        payload_sha256,
    })
}

#[derive(Debug, Clone)]
pub struct HttpFetchConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpFetchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dashboards.example.org/api".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP fetcher with exponential-backoff retries for transient failures.
#[derive(Debug)]
pub struct HttpDataFetcher {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl HttpDataFetcher {
    pub fn new(config: HttpFetchConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    fn url_for(&self, district_id: &str, window: FetchWindow) -> String {
        format!(
            "{}/districts/{}/performance?start={}&end={}",
            self.base_url, district_id, window.start, window.end
        )
    }

    async fn fetch_bytes(&self, district_id: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("district_fetch", district_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[async_trait]
impl DataFetcher for HttpDataFetcher {
    async fn fetch(
        &self,
        district_id: &str,
        window: FetchWindow,
    ) -> Result<DistrictSnapshot, FetchError> {
        let url = self.url_for(district_id, window);
        let bytes = self.fetch_bytes(district_id, &url).await?;
        Ok(parse_snapshot(&bytes, district_id, window.month(), Utc::now())?)
    }
}

/// Fixture-backed fetcher for tests and offline runs. Payloads live under
/// `<root>/<district_id>/<YYYY-MM>.json` and are parsed through the same
/// shape validation as live data.
#[derive(Debug, Clone)]
pub struct FixtureDataFetcher {
    root: PathBuf,
}

impl FixtureDataFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DataFetcher for FixtureDataFetcher {
    async fn fetch(
        &self,
        district_id: &str,
        window: FetchWindow,
    ) -> Result<DistrictSnapshot, FetchError> {
        let month = window.month();
        let path = self
            .root
            .join(district_id)
            .join(format!("{month}.json"));
        let bytes = fs::read(&path).await?;
        Ok(parse_snapshot(&bytes, district_id, month, Utc::now())?)
    }
}
