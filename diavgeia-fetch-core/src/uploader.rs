//! # uploader: dedup-aware mirroring of export artifacts
//!
//! Each artifact maps to the deterministic key
//! `<upload_prefix>/<date>/<ada>/<filename>`. Before uploading, the stored
//! versions under that key are listed; if any carries the artifact's SHA-256,
//! nothing is sent. Repeated runs over the same day are therefore no-ops for
//! unchanged content.

use std::sync::Arc;

use tracing::{debug, info};

use crate::contract::{NewObject, ObjectStore, StoreError};
use crate::download::ExportArtifact;
use crate::fsutil::sha256_file;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { key: String, version_id: String },
    /// A stored version already had the same checksum.
    Unchanged { key: String, version_id: String },
}

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn remote_key(&self, artifact: &ExportArtifact) -> String {
        let date = artifact.date.format("%Y-%m-%d");
        let file_name = artifact.file_name();
        if self.prefix.is_empty() {
            format!("{date}/{}/{file_name}", artifact.ada)
        } else {
            format!("{}/{date}/{}/{file_name}", self.prefix, artifact.ada)
        }
    }

    pub async fn upload_artifact(&self, artifact: &ExportArtifact) -> Result<UploadOutcome, StoreError> {
        let key = self.remote_key(artifact);
        let checksum = sha256_file(&artifact.path).await?;
        debug!(key = %key, "Checking previous versions of file {}", artifact.file_name());

        let versions = self.store.list_versions(&key).await?;
        if let Some(existing) = versions
            .iter()
            .find(|v| v.key == key && v.checksum.as_deref() == Some(checksum.as_str()))
        {
            debug!(key = %key, version_id = %existing.id, "File {} exists as {}", artifact.file_name(), existing.id);
            return Ok(UploadOutcome::Unchanged {
                key,
                version_id: existing.id.clone(),
            });
        }

        debug!(key = %key, previous_versions = versions.len(), "Uploading file {}", artifact.file_name());
        let stored = self
            .store
            .upload(NewObject {
                key: key.clone(),
                path: artifact.path.clone(),
                checksum,
            })
            .await?;
        info!(key = %key, version_id = %stored.id, "Uploaded artifact");
        Ok(UploadOutcome::Uploaded {
            key,
            version_id: stored.id,
        })
    }
}
