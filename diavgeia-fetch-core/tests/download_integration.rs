use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use serde_json::{json, Value};
use tempfile::tempdir;

use diavgeia_fetch_core::config::{Credentials, SessionConfig};
use diavgeia_fetch_core::contract::{FetchError, MockDecisionSource, MockObjectStore, StoredVersion};
use diavgeia_fetch_core::decision::Decision;
use diavgeia_fetch_core::download::{DownloadSummary, Downloader};
use diavgeia_fetch_core::queue::{QueuedDecision, WorkQueue};
use diavgeia_fetch_core::retry::{DeadLetterLog, RetryPolicy};
use diavgeia_fetch_core::uploader::Uploader;

// 2023-11-14T22:13:20Z, already the 15th in Athens.
const SUBMITTED_MS: i64 = 1_700_000_000_000;

fn config(export: &Path, max_attempts: u32) -> Arc<SessionConfig> {
    let mut config = SessionConfig::new(
        NaiveDate::from_ymd_opt(2023, 11, 14).unwrap(),
        export,
        Credentials::new("user", "secret"),
    );
    config.retry = RetryPolicy::immediate(max_attempts);
    Arc::new(config)
}

fn decision(ada: &str, document_url: &str) -> QueuedDecision {
    let value = json!({
        "ada": ada,
        "documentUrl": document_url,
        "submissionTimestamp": SUBMITTED_MS,
        "subject": "Έγκριση δαπάνης",
    });
    QueuedDecision::first(Decision::from_value(value).unwrap())
}

async fn closed_queue(items: Vec<QueuedDecision>) -> Arc<WorkQueue> {
    let queue = Arc::new(WorkQueue::unbounded());
    for item in items {
        queue.push(item).await.unwrap();
    }
    queue.close();
    queue
}

fn gunzip(path: &Path) -> Vec<u8> {
    let file = std::fs::File::open(path).unwrap_or_else(|e| panic!("{} should exist: {e}", path.display()));
    let mut out = Vec::new();
    GzDecoder::new(file).read_to_end(&mut out).unwrap();
    out
}

fn downloader(
    source: MockDecisionSource,
    queue: Arc<WorkQueue>,
    config: Arc<SessionConfig>,
) -> Downloader {
    let dead_letters = Arc::new(DeadLetterLog::new(config.export_path.join("dead_letter.jsonl")));
    Downloader::new("Downloader-20231114-0", Arc::new(source), queue, config, dead_letters)
}

#[tokio::test]
async fn test_empty_document_url_writes_metadata_only() {
    let export = tempdir().unwrap();
    let mut source = MockDecisionSource::new();
    source.expect_fetch_document().never();

    let queue = closed_queue(vec![decision("ABC123", "")]).await;
    let summary = downloader(source, queue.clone(), config(export.path(), 3))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.metadata_written, 1);
    assert_eq!(summary.documents_skipped, 1);
    assert_eq!(summary.documents_written, 0);

    let dir = export.path().join("2023-11-15").join("ABC123");
    let metadata: Value = serde_json::from_slice(&gunzip(&dir.join("ABC123.json.gz"))).unwrap();
    assert_eq!(metadata["ada"], "ABC123");
    assert_eq!(metadata["subject"], "Έγκριση δαπάνης");
    assert!(!dir.join("ABC123.pdf.gz").exists());
    assert_eq!(queue.terminations(), 1);
}

#[tokio::test]
async fn test_metadata_json_has_sorted_keys_and_raw_utf8() {
    let export = tempdir().unwrap();
    let source = MockDecisionSource::new();
    let queue = closed_queue(vec![decision("ABC123", "")]).await;
    let mut cfg = (*config(export.path(), 3)).clone();
    cfg.download_documents = false;

    downloader(source, queue, Arc::new(cfg)).run().await.unwrap();

    let bytes = gunzip(&export.path().join("2023-11-15/ABC123/ABC123.json.gz"));
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.starts_with(r#"{"ada":"ABC123","documentUrl":"","subject":"Έγκριση δαπάνης""#), "{text}");
}

#[tokio::test]
async fn test_document_is_gzipped_next_to_metadata() {
    let export = tempdir().unwrap();
    let mut source = MockDecisionSource::new();
    source
        .expect_fetch_document()
        .withf(|url: &str| url == "https://diavgeia.gov.gr/doc/D1")
        .times(1)
        .returning(|_| Ok(b"%PDF-1.7 body".to_vec()));

    let queue = closed_queue(vec![decision("D1", "https://diavgeia.gov.gr/doc/D1")]).await;
    let summary = downloader(source, queue, config(export.path(), 3)).run().await.unwrap();

    assert_eq!(summary.documents_written, 1);
    let pdf = gunzip(&export.path().join("2023-11-15/D1/D1.pdf.gz"));
    assert_eq!(pdf, b"%PDF-1.7 body");
}

#[tokio::test]
async fn test_transient_document_failure_is_requeued_then_succeeds() {
    let export = tempdir().unwrap();
    let mut source = MockDecisionSource::new();
    let mut calls = 0;
    source.expect_fetch_document().times(2).returning(move |url| {
        calls += 1;
        if calls == 1 {
            Err(FetchError::Transient {
                url: url.to_string(),
                reason: "connection reset by peer".into(),
            })
        } else {
            Ok(b"%PDF".to_vec())
        }
    });

    let queue = closed_queue(vec![decision("R1", "https://diavgeia.gov.gr/doc/R1")]).await;
    let summary = downloader(source, queue.clone(), config(export.path(), 3))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.retried, 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.metadata_written, 1, "metadata counted once per decision");
    assert_eq!(summary.documents_written, 1);
    assert_eq!(summary.dead_lettered, 0);
    assert!(export.path().join("2023-11-15/R1/R1.pdf.gz").exists());
}

#[tokio::test]
async fn test_retries_stop_at_cap_and_go_to_dead_letter() {
    let export = tempdir().unwrap();
    let mut source = MockDecisionSource::new();
    source.expect_fetch_document().times(2).returning(|url| {
        Err(FetchError::Transient {
            url: url.to_string(),
            reason: "timed out".into(),
        })
    });

    let queue = closed_queue(vec![decision("DL1", "https://diavgeia.gov.gr/doc/DL1")]).await;
    let summary = downloader(source, queue, config(export.path(), 2)).run().await.unwrap();

    assert_eq!(summary.retried, 1);
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.metadata_written, 0);

    let log = std::fs::read_to_string(export.path().join("dead_letter.jsonl")).unwrap();
    let lines: Vec<Value> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["ada"], "DL1");
    assert_eq!(lines[0]["attempts"], 2);
    assert_eq!(lines[0]["decision"]["documentUrl"], "https://diavgeia.gov.gr/doc/DL1");
}

#[tokio::test]
async fn test_missing_document_keeps_metadata() {
    let export = tempdir().unwrap();
    let mut source = MockDecisionSource::new();
    source.expect_fetch_document().times(1).returning(|url| {
        Err(FetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    });

    let queue = closed_queue(vec![decision("M1", "https://diavgeia.gov.gr/doc/M1")]).await;
    let summary = downloader(source, queue, config(export.path(), 3)).run().await.unwrap();

    assert_eq!(summary.document_failures, 1);
    assert_eq!(summary.processed, 1);
    assert!(export.path().join("2023-11-15/M1/M1.json.gz").exists());
    assert!(!export.path().join("2023-11-15/M1/M1.pdf.gz").exists());
}

#[tokio::test]
async fn test_every_downloader_observes_terminate_once() {
    let export = tempdir().unwrap();
    let items = (0..5).map(|i| decision(&format!("N{i}"), "")).collect();
    let queue = closed_queue(items).await;
    let cfg = config(export.path(), 3);

    let mut handles = Vec::new();
    for id in 0..3 {
        let dead_letters = Arc::new(DeadLetterLog::new(export.path().join("dead_letter.jsonl")));
        let worker = Downloader::new(
            format!("Downloader-20231114-{id}"),
            Arc::new(MockDecisionSource::new()),
            queue.clone(),
            cfg.clone(),
            dead_letters,
        );
        handles.push(tokio::spawn(async move { worker.run().await }));
    }

    let mut total = DownloadSummary::default();
    for handle in handles {
        total.merge(&handle.await.unwrap().unwrap());
    }
    assert_eq!(total.processed, 5);
    assert_eq!(queue.terminations(), 3);
}

#[tokio::test]
async fn test_artifacts_are_mirrored_when_uploader_present() {
    let export = tempdir().unwrap();
    let mut store = MockObjectStore::new();
    store
        .expect_list_versions()
        .withf(|key: &str| key == "sink2/2023-11-15/U1/U1.json.gz")
        .times(1)
        .returning(|_| Ok(vec![]));
    store.expect_upload().times(1).returning(|object| {
        Ok(StoredVersion {
            id: "v1".into(),
            key: object.key,
            checksum: Some(object.checksum),
        })
    });
    let uploader = Arc::new(Uploader::new(Arc::new(store), "sink2"));

    let queue = closed_queue(vec![decision("U1", "")]).await;
    let summary = downloader(MockDecisionSource::new(), queue, config(export.path(), 3))
        .with_uploader(Some(uploader))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.upload_failures, 0);
}
