use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use tempfile::tempdir;

use diavgeia_fetch_core::contract::{MockObjectStore, StoreError, StoredVersion};
use diavgeia_fetch_core::download::{ArtifactKind, ExportArtifact};
use diavgeia_fetch_core::fsutil::sha256_hex;
use diavgeia_fetch_core::uploader::{UploadOutcome, Uploader};

/// Mock store backed by an in-memory version list.
fn versioned_store(expected_uploads: usize) -> (MockObjectStore, Arc<Mutex<Vec<StoredVersion>>>) {
    let versions: Arc<Mutex<Vec<StoredVersion>>> = Arc::default();
    let mut store = MockObjectStore::new();

    let listed = versions.clone();
    store.expect_list_versions().returning(move |key| {
        Ok(listed
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v.key == key)
            .cloned()
            .collect())
    });

    let stored = versions.clone();
    store.expect_upload().times(expected_uploads).returning(move |object| {
        let mut all = stored.lock().unwrap();
        let version = StoredVersion {
            id: format!("v{}", all.len() + 1),
            key: object.key,
            checksum: Some(object.checksum),
        };
        all.push(version.clone());
        Ok(version)
    });
    (store, versions)
}

fn artifact(root: &std::path::Path) -> ExportArtifact {
    ExportArtifact::new(
        root,
        NaiveDate::from_ymd_opt(2023, 11, 15).unwrap(),
        "ABC123",
        ArtifactKind::Metadata,
    )
}

#[tokio::test]
async fn test_same_content_twice_uploads_once() {
    let dir = tempdir().unwrap();
    let artifact = artifact(dir.path());
    std::fs::create_dir_all(artifact.path.parent().unwrap()).unwrap();
    std::fs::write(&artifact.path, b"same bytes").unwrap();

    let (store, versions) = versioned_store(1);
    let uploader = Uploader::new(Arc::new(store), "sink2");

    let first = uploader.upload_artifact(&artifact).await.unwrap();
    let second = uploader.upload_artifact(&artifact).await.unwrap();

    let key = "sink2/2023-11-15/ABC123/ABC123.json.gz".to_string();
    assert_eq!(first, UploadOutcome::Uploaded { key: key.clone(), version_id: "v1".into() });
    assert_eq!(second, UploadOutcome::Unchanged { key, version_id: "v1".into() });
    assert_eq!(
        versions.lock().unwrap()[0].checksum.as_deref(),
        Some(sha256_hex(b"same bytes").as_str())
    );
}

#[tokio::test]
async fn test_changed_content_creates_new_version() {
    let dir = tempdir().unwrap();
    let artifact = artifact(dir.path());
    std::fs::create_dir_all(artifact.path.parent().unwrap()).unwrap();

    let (store, versions) = versioned_store(2);
    let uploader = Uploader::new(Arc::new(store), "sink2/");

    std::fs::write(&artifact.path, b"first").unwrap();
    uploader.upload_artifact(&artifact).await.unwrap();
    std::fs::write(&artifact.path, b"second").unwrap();
    let outcome = uploader.upload_artifact(&artifact).await.unwrap();

    assert!(matches!(outcome, UploadOutcome::Uploaded { ref version_id, .. } if version_id == "v2"));
    assert_eq!(versions.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_store_errors_surface_to_caller() {
    let dir = tempdir().unwrap();
    let artifact = artifact(dir.path());
    std::fs::create_dir_all(artifact.path.parent().unwrap()).unwrap();
    std::fs::write(&artifact.path, b"bytes").unwrap();

    let mut store = MockObjectStore::new();
    store
        .expect_list_versions()
        .returning(|_| Err(StoreError::Unauthorized("bad application key".into())));
    store.expect_upload().never();

    let uploader = Uploader::new(Arc::new(store), "sink2");
    let result = uploader.upload_artifact(&artifact).await;
    assert!(matches!(result, Err(StoreError::Unauthorized(_))));
}

#[test]
fn test_remote_key_without_prefix() {
    let dir = tempdir().unwrap();
    let uploader = Uploader::new(Arc::new(MockObjectStore::new()), "");
    assert_eq!(uploader.remote_key(&artifact(dir.path())), "2023-11-15/ABC123/ABC123.json.gz");
}
