//! Delivery of serialized artifacts to the resolved endpoint.

pub mod disk;
pub mod http;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::profile::TimeWindow;
use crate::tags::TagSet;

pub use self::disk::DiskDelivery;
pub use self::http::HttpDelivery;

/// Failure delivering one artifact.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("collector returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("transport: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("writing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid request: {0}")]
    Request(String),
}

/// One artifact ready to be delivered.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub application_id: Arc<str>,
    /// Human-readable name used for file names (service, or the identifier).
    pub application_name: String,
    pub payload: Vec<u8>,
    /// Base tags followed by the per-application tags.
    pub tags: TagSet,
    pub window: TimeWindow,
    pub export_index: u64,
    pub sample_count: u64,
}

/// Delivery dispatches artifacts to the HTTP or disk backend.
pub enum Delivery {
    Http(HttpDelivery),
    Disk(DiskDelivery),
}

impl Delivery {
    /// Builds the backend matching `endpoint`.
    pub fn from_endpoint(endpoint: &Endpoint, process_id: u32) -> Result<Self> {
        Ok(match endpoint {
            Endpoint::Http {
                url,
                api_key,
                timeout,
            } => Self::Http(HttpDelivery::new(url.clone(), api_key.clone(), *timeout)?),
            Endpoint::Disk { directory } => {
                Self::Disk(DiskDelivery::new(directory.clone(), process_id))
            }
        })
    }

    /// Returns the backend name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Http(d) => d.name(),
            Self::Disk(d) => d.name(),
        }
    }

    /// Delivers one artifact. No retries.
    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<(), DeliveryError> {
        match self {
            Self::Http(d) => d.deliver(request).await,
            Self::Disk(d) => d.deliver(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_endpoint_picks_backend() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let disk = Delivery::from_endpoint(
            &Endpoint::Disk {
                directory: tmp.path().to_path_buf(),
            },
            7,
        )
        .expect("disk delivery");
        assert_eq!(disk.name(), "disk");

        let http = Delivery::from_endpoint(
            &Endpoint::Http {
                url: reqwest::Url::parse("http://127.0.0.1:8126/profiling/v1/input").expect("url"),
                api_key: None,
                timeout: Duration::from_secs(1),
            },
            7,
        )
        .expect("http delivery");
        assert_eq!(http.name(), "http");
    }

    #[test]
    fn test_io_error_display_names_path() {
        let err = DeliveryError::Io {
            path: PathBuf::from("/tmp/x.pprof"),
            source: std::io::Error::from(std::io::ErrorKind::AlreadyExists),
        };
        assert!(err.to_string().contains("/tmp/x.pprof"));
    }
}
