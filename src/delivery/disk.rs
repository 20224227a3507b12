use std::fmt::Write as _;
use std::path::PathBuf;

use tokio::io::AsyncWriteExt;

use super::{DeliveryError, DeliveryRequest};

/// Writes each artifact to its own file under a directory.
pub struct DiskDelivery {
    directory: PathBuf,
    process_id: u32,
}

impl DiskDelivery {
    pub fn new(directory: PathBuf, process_id: u32) -> Self {
        Self {
            directory,
            process_id,
        }
    }

    pub fn name(&self) -> &str {
        "disk"
    }

    /// `<name>_<application id>_<pid>_<export index>.pprof`
    ///
    /// Several applications may share a service name, so the identifier is
    /// always part of the name and is escaped without loss.
    pub fn file_name(&self, request: &DeliveryRequest) -> String {
        format!(
            "{}_{}_{}_{}.pprof",
            sanitize(&request.application_name),
            escape_id(&request.application_id),
            self.process_id,
            request.export_index
        )
    }

    /// Writes the artifact. An existing file is never overwritten.
    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<(), DeliveryError> {
        let path = self.directory.join(self.file_name(request));
        let io_err = |source| DeliveryError::Io {
            path: path.clone(),
            source,
        };

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.write_all(&request.payload).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        tracing::debug!(
            application = %request.application_id,
            path = %path.display(),
            bytes = request.payload.len(),
            samples = request.sample_count,
            "wrote profile to disk",
        );

        Ok(())
    }
}

/// Replaces characters outside `[A-Za-z0-9._-]` with `_`.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Keeps `[A-Za-z0-9.-]` and writes every other byte as `_XX` (hex), so
/// distinct identifiers never map to the same string.
fn escape_id(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-') {
            escaped.push(char::from(b));
        } else {
            let _ = write!(escaped, "_{b:02X}");
        }
    }
    if escaped.is_empty() {
        escaped.push('_');
    }
    escaped
}
