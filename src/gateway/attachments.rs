// Inline attachment relay
//
// Bytes land under `storage.upload_dir` as `{uuid}_{sanitized name}`; the
// metadata record goes through the repository.

use crate::gateway::error::{GatewayError, StoreError};
use crate::gateway::model::{AttachmentRecord, NewAttachment};
use crate::gateway::storage::Repository;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Public prefix recorded as the storage location
const LOCATION_PREFIX: &str = "/uploads/";

pub struct AttachmentPipeline {
    upload_dir: PathBuf,
    repository: Arc<dyn Repository>,
}

impl AttachmentPipeline {
    pub fn new(upload_dir: impl Into<PathBuf>, repository: Arc<dyn Repository>) -> Result<Self, StoreError> {
        let upload_dir = upload_dir.into();
        std::fs::create_dir_all(&upload_dir)?;

        Ok(Self {
            upload_dir,
            repository,
        })
    }

    /// Decode the transport encoding (base64, with or without a `data:` prefix)
    pub fn decode(encoded: &str) -> Result<Vec<u8>, GatewayError> {
        let payload = match encoded.split_once(";base64,") {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => encoded,
        };

        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(GatewayError::validation("attachment is empty"));
        }

        STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| GatewayError::validation(format!("attachment is not valid base64: {}", e)))
    }

    /// Decode and store in one step
    pub fn store(
        &self,
        encoded: &str,
        declared_name: &str,
        mime_type: &str,
    ) -> Result<AttachmentRecord, GatewayError> {
        let bytes = Self::decode(encoded)?;
        self.store_bytes(&bytes, declared_name, mime_type)
    }

    /// Write `bytes` under a fresh unique name and record it.
    ///
    /// Every call creates a new record, identical bytes included.
    pub fn store_bytes(
        &self,
        bytes: &[u8],
        declared_name: &str,
        mime_type: &str,
    ) -> Result<AttachmentRecord, GatewayError> {
        let (stored_name, path) = self.write_unique(bytes, declared_name)?;

        let record = self.repository.save_attachment(NewAttachment {
            stored_name: stored_name.clone(),
            declared_name: declared_name.to_string(),
            mime_type: mime_type.to_string(),
            byte_size: bytes.len() as u64,
            storage_location: format!("{}{}", LOCATION_PREFIX, stored_name),
        });

        match record {
            Ok(record) => {
                tracing::info!(
                    attachment_id = record.id,
                    stored_name = %record.stored_name,
                    byte_size = record.byte_size,
                    "Attachment stored"
                );
                Ok(record)
            }
            Err(e) => {
                // No record means no observable file either
                if let Err(cleanup) = std::fs::remove_file(&path) {
                    tracing::warn!("Failed to remove orphaned upload {}: {}", path.display(), cleanup);
                }
                Err(e.into())
            }
        }
    }

    /// Read back the bytes of a stored attachment
    pub fn read(&self, stored_name: &str) -> Result<Vec<u8>, GatewayError> {
        if stored_name.contains(|c: char| c == '/' || c == '\\') || stored_name.starts_with('.') {
            return Err(GatewayError::validation("invalid stored name"));
        }

        let path = self.upload_dir.join(stored_name);
        std::fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => GatewayError::validation(format!("no attachment named {}", stored_name)),
            _ => GatewayError::Persistence(StoreError::Io(e)),
        })
    }

    fn write_unique(&self, bytes: &[u8], declared_name: &str) -> Result<(String, PathBuf), StoreError> {
        let safe = sanitize(declared_name);

        loop {
            let stored_name = format!("{}_{}", Uuid::new_v4(), safe);
            let path = self.upload_dir.join(&stored_name);

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_all()) {
                drop(file);
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }

            return Ok((stored_name, path));
        }
    }
}

/// Replace whitespace and path separators so the name stays one path segment
fn sanitize(declared_name: &str) -> String {
    let cleaned: String = declared_name
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() || c == '/' || c == '\\' { '_' } else { c })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "attachment".to_string()
    } else {
        cleaned
    }
}
