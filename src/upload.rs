//! Backblaze B2 implementation of [`ObjectStore`] using the native v2 API.
//!
//! The content checksum used for dedup lives in the file info key `sha256`.
//! B2's own SHA-1 verification is skipped (`do_not_verify`).

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use diavgeia_fetch_core::api::build_http_client;
use diavgeia_fetch_core::contract::{NewObject, ObjectStore, StoreError, StoredVersion};

pub const B2_AUTHORIZE_URL: &str = "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";
const CHECKSUM_INFO_KEY: &str = "sha256";
const LIST_PAGE_SIZE: u32 = 100;

#[derive(Clone, PartialEq, Eq)]
pub struct B2Credentials {
    pub key_id: String,
    pub application_key: String,
    pub bucket_name: String,
}

impl fmt::Debug for B2Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("B2Credentials")
            .field("key_id", &self.key_id)
            .field("application_key", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Authorization {
    account_id: String,
    authorization_token: String,
    api_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bucket {
    bucket_id: String,
    bucket_name: String,
}

#[derive(Debug, Deserialize)]
struct BucketList {
    buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTarget {
    upload_url: String,
    authorization_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileVersion {
    file_id: String,
    file_name: String,
    #[serde(default)]
    file_info: serde_json::Map<String, Value>,
    #[serde(default)]
    action: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileVersionPage {
    files: Vec<FileVersion>,
    next_file_name: Option<String>,
    next_file_id: Option<String>,
}

pub struct B2Client {
    client: Client,
    auth: Authorization,
    bucket_id: String,
    upload_target: Mutex<Option<UploadTarget>>,
}

impl B2Client {
    /// Authorises the account and resolves the bucket id.
    pub async fn connect(credentials: &B2Credentials) -> Result<Self, StoreError> {
        let client = build_http_client(std::time::Duration::from_secs(120))
            .map_err(|e| StoreError::Request(e.to_string()))?;
        let response = client
            .get(B2_AUTHORIZE_URL)
            .basic_auth(&credentials.key_id, Some(&credentials.application_key))
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;
        let auth: Authorization = parse(response, "b2_authorize_account").await?;

        let mut b2 = Self {
            client,
            auth,
            bucket_id: String::new(),
            upload_target: Mutex::new(None),
        };
        let buckets: BucketList = b2
            .call(
                "b2_list_buckets",
                json!({"accountId": b2.auth.account_id, "bucketName": credentials.bucket_name}),
            )
            .await?;
        b2.bucket_id = buckets
            .buckets
            .into_iter()
            .find(|b| b.bucket_name == credentials.bucket_name)
            .map(|b| b.bucket_id)
            .ok_or_else(|| StoreError::Request(format!("bucket {} not found", credentials.bucket_name)))?;
        info!(bucket = %credentials.bucket_name, "Connected to B2 bucket");
        Ok(b2)
    }

    async fn call<T: DeserializeOwned>(&self, operation: &str, body: Value) -> Result<T, StoreError> {
        let url = format!("{}/b2api/v2/{operation}", self.auth.api_url);
        let response = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, &self.auth.authorization_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Request(format!("{operation}: {e}")))?;
        parse(response, operation).await
    }

    async fn upload_target(&self) -> Result<UploadTarget, StoreError> {
        let cached = self
            .upload_target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match cached {
            Some(target) => Ok(target),
            None => self.call("b2_get_upload_url", json!({"bucketId": self.bucket_id})).await,
        }
    }

    fn release_upload_target(&self, target: UploadTarget) {
        *self
            .upload_target
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(target);
    }
}

#[async_trait]
impl ObjectStore for B2Client {
    async fn list_versions(&self, key: &str) -> Result<Vec<StoredVersion>, StoreError> {
        let mut versions = Vec::new();
        let mut start: Option<(String, String)> = None;
        loop {
            let mut body = json!({
                "bucketId": self.bucket_id,
                "prefix": key,
                "maxFileCount": LIST_PAGE_SIZE,
            });
            match &start {
                Some((name, id)) => {
                    body["startFileName"] = json!(name);
                    body["startFileId"] = json!(id);
                }
                None => body["startFileName"] = json!(key),
            }
            let page: FileVersionPage = self.call("b2_list_file_versions", body).await?;
            let next = page.next_file_name.clone().zip(page.next_file_id.clone());
            versions.extend(versions_for_key(page.files, key));
            match next {
                Some((name, id)) if name == key => start = Some((name, id)),
                _ => break,
            }
        }
        debug!(key, versions = versions.len(), "Listed file versions");
        Ok(versions)
    }

    async fn upload(&self, object: NewObject) -> Result<StoredVersion, StoreError> {
        let bytes = tokio::fs::read(&object.path).await?;
        let target = self.upload_target().await?;
        let response = self
            .client
            .post(&target.upload_url)
            .header(reqwest::header::AUTHORIZATION, &target.authorization_token)
            .header("X-Bz-File-Name", encode_file_name(&object.key))
            .header(reqwest::header::CONTENT_TYPE, "b2/x-auto")
            .header("X-Bz-Content-Sha1", "do_not_verify")
            .header(format!("X-Bz-Info-{CHECKSUM_INFO_KEY}"), &object.checksum)
            .body(bytes)
            .send()
            .await
            .map_err(|e| StoreError::Request(format!("upload {}: {e}", object.key)))?;
        let uploaded: FileVersion = parse(response, "upload").await?;
        self.release_upload_target(target);
        Ok(StoredVersion {
            id: uploaded.file_id,
            key: uploaded.file_name,
            checksum: Some(object.checksum),
        })
    }
}

/// A connected B2 store when credentials are configured, otherwise `None`.
pub async fn connect_store(
    credentials: Option<&B2Credentials>,
) -> Result<Option<Arc<dyn ObjectStore>>, StoreError> {
    match credentials {
        Some(credentials) => Ok(Some(Arc::new(B2Client::connect(credentials).await?))),
        None => Ok(None),
    }
}

async fn parse<T: DeserializeOwned>(response: Response, operation: &str) -> Result<T, StoreError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::Unauthorized(format!("{operation}: {body}")));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::Request(format!("{operation}: HTTP {status}: {body}")));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| StoreError::Request(format!("{operation}: malformed response: {e}")))
}

/// Keeps exact-key uploads; hides, folder markers and longer names sharing the prefix are dropped.
fn versions_for_key(files: Vec<FileVersion>, key: &str) -> Vec<StoredVersion> {
    files
        .into_iter()
        .filter(|f| f.file_name == key && f.action.as_deref().unwrap_or("upload") == "upload")
        .map(|f| StoredVersion {
            checksum: f
                .file_info
                .get(CHECKSUM_INFO_KEY)
                .and_then(Value::as_str)
                .map(str::to_string),
            id: f.file_id,
            key: f.file_name,
        })
        .collect()
}

/// Percent-encodes each path segment; `/` separators stay literal.
fn encode_file_name(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
