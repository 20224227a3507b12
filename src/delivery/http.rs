use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Url;

use super::{DeliveryError, DeliveryRequest};

const HEADER_APPLICATION: HeaderName = HeaderName::from_static("x-profile-application");
const HEADER_START: HeaderName = HeaderName::from_static("x-profile-start");
const HEADER_END: HeaderName = HeaderName::from_static("x-profile-end");
const HEADER_EXPORT_INDEX: HeaderName = HeaderName::from_static("x-profile-export-index");
const HEADER_SAMPLES: HeaderName = HeaderName::from_static("x-profile-samples");
const HEADER_TAG: HeaderName = HeaderName::from_static("x-profile-tag");
const HEADER_API_KEY: HeaderName = HeaderName::from_static("dd-api-key");

/// Posts each artifact to a remote collector.
pub struct HttpDelivery {
    client: reqwest::Client,
    url: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpDelivery {
    pub fn new(url: Url, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            url,
            api_key,
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        "http"
    }

    /// Sends one POST. Any non-2xx status is a failure.
    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<(), DeliveryError> {
        let headers = self.headers(request)?;

        let resp = self
            .client
            .post(self.url.clone())
            .headers(headers)
            .body(request.payload.clone())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            return Err(DeliveryError::Status(status));
        }

        tracing::debug!(
            application = %request.application_id,
            export_index = request.export_index,
            bytes = request.payload.len(),
            "exported profile via HTTP",
        );

        Ok(())
    }

    fn classify(&self, err: reqwest::Error) -> DeliveryError {
        if err.is_timeout() {
            DeliveryError::Timeout(self.timeout)
        } else {
            DeliveryError::Transport(err)
        }
    }

    fn headers(&self, request: &DeliveryRequest) -> Result<HeaderMap, DeliveryError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(HEADER_APPLICATION, header_value(&request.application_id)?);
        headers.insert(HEADER_START, header_value(&format_rfc3339(request.window.start))?);
        headers.insert(HEADER_END, header_value(&format_rfc3339(request.window.end))?);
        headers.insert(HEADER_EXPORT_INDEX, HeaderValue::from(request.export_index));
        headers.insert(HEADER_SAMPLES, HeaderValue::from(request.sample_count));

        for tag in &request.tags {
            headers.append(HEADER_TAG, header_value(&tag.to_string())?);
        }

        if let Some(key) = &self.api_key {
            let mut value = header_value(key)?;
            value.set_sensitive(true);
            headers.insert(HEADER_API_KEY, value);
        }

        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, DeliveryError> {
    HeaderValue::from_str(value)
        .map_err(|_| DeliveryError::Request(format!("invalid header value {value:?}")))
}

/// RFC 3339 with millisecond precision, e.g. `2024-05-01T12:00:00.123Z`.
fn format_rfc3339(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}
