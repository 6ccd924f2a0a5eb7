// ABOUTME: Remote object store adapters (Supabase Storage, GCS, local directory)
// ABOUTME: Exposes download, upload and public-URL resolution over one bucket

use crate::config::{Config, StorageBackend};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_storage::{
    client::{Client as GcsClient, ClientConfig},
    http::objects::{
        download::Range as DownloadRange,
        get::GetObjectRequest,
        patch::PatchObjectRequest,
        upload::{Media, UploadObjectRequest, UploadType},
        Object,
    },
};
use reqwest::{header, StatusCode, Url};
use serde::Deserialize;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object path: {0}")]
    InvalidPath(String),
    #[error("storage request failed: {0}")]
    Request(String),
    #[error("storage misconfigured: {0}")]
    Config(String),
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Blob store bound to a single bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn backend(&self) -> &'static str;

    fn bucket(&self) -> &str;

    async fn download(&self, path: &str) -> Result<Bytes, StorageError>;

    /// Upload, replacing any existing object at `path`
    async fn upload(&self, path: &str, data: Bytes, content_type: &str) -> Result<(), StorageError>;

    fn public_url(&self, path: &str) -> String;
}

/// Build the store selected in the configuration
pub async fn connect(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.storage_backend {
        StorageBackend::Supabase => {
            let url = config
                .supabase_url
                .as_deref()
                .ok_or_else(|| anyhow!("SUPABASE_URL is required for the supabase backend"))?;
            let key = config.supabase_service_key.as_deref().ok_or_else(|| {
                anyhow!("SUPABASE_SERVICE_KEY is required for the supabase backend")
            })?;
            Arc::new(SupabaseStore::new(
                url,
                key,
                &config.storage_bucket,
                config.cache_control_secs,
            )?)
        }
        StorageBackend::Gcs => {
            let gcs_config = ClientConfig::default().with_auth().await?;
            Arc::new(GcsStore::new(
                GcsClient::new(gcs_config),
                &config.storage_bucket,
                config.cache_control_secs,
            )?)
        }
        StorageBackend::Local => Arc::new(LocalStore::new(
            &config.local_storage_root,
            &config.storage_bucket,
        )?),
    };

    info!(
        "Object store: {} (bucket {})",
        store.backend(),
        store.bucket()
    );
    Ok(store)
}

/// Reject paths that would escape the bucket namespace or address nothing
pub fn validate_object_path(path: &str) -> Result<(), StorageError> {
    if path.trim().is_empty() {
        return Err(StorageError::InvalidPath("path is empty".into()));
    }
    if path.starts_with('/') {
        return Err(StorageError::InvalidPath(format!(
            "{}: must be relative to the bucket",
            path
        )));
    }
    if path.contains('\\') {
        return Err(StorageError::InvalidPath(format!(
            "{}: backslashes are not allowed",
            path
        )));
    }
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::InvalidPath(format!(
            "{}: empty or relative segments are not allowed",
            path
        )));
    }
    Ok(())
}

/// MIME type for an object, by extension
pub fn content_type_for(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match extension.as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("m4a") | Some("aac") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("opus") => "audio/opus",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("exr") => "image/x-exr",
        _ => "application/octet-stream",
    }
}

/// Supabase Storage over its REST API
pub struct SupabaseStore {
    http: reqwest::Client,
    base_url: Url,
    service_key: String,
    bucket: String,
    cache_control_secs: u32,
}

impl SupabaseStore {
    pub fn new(
        base_url: &str,
        service_key: &str,
        bucket: &str,
        cache_control_secs: u32,
    ) -> Result<Self, StorageError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| StorageError::Config(format!("invalid SUPABASE_URL: {}", e)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(StorageError::Config(format!(
                "SUPABASE_URL must be http(s), got {}",
                base_url.scheme()
            )));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            service_key: service_key.to_string(),
            bucket: bucket.to_string(),
            cache_control_secs,
        })
    }

    /// `{base}/storage/v1/object[/{scope}]/{bucket}/{path}`
    fn object_url(&self, scope: Option<&str>, path: &str) -> Url {
        let prefix = ["storage", "v1", "object"]
            .into_iter()
            .chain(scope)
            .chain([self.bucket.as_str()]);
        join_object_path(&self.base_url, prefix, path)
    }
}

/// Append `prefix` and then each `/`-separated part of `path` to `base`, percent-encoding every segment
fn join_object_path<'a>(base: &Url, prefix: impl IntoIterator<Item = &'a str>, path: &str) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments
            .pop_if_empty()
            .extend(prefix)
            .extend(path.split('/'));
    }
    url
}

/// Supabase Storage error body, e.g.
/// `{"statusCode":"404","code":"NoSuchKey","error":"not_found","message":"Object not found"}`
#[derive(Debug, Default, Deserialize)]
struct SupabaseErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// Only a missing object counts; a missing bucket is a configuration failure
fn is_missing_object(status: StatusCode, body: &str) -> bool {
    match serde_json::from_str::<SupabaseErrorBody>(body) {
        Ok(err) if err.code.is_empty() && err.error.is_empty() && err.message.is_empty() => {
            status == StatusCode::NOT_FOUND
        }
        Ok(err) => {
            err.code == "NoSuchKey"
                || err.error == "not_found"
                || err.message.eq_ignore_ascii_case("object not found")
        }
        Err(_) => status == StatusCode::NOT_FOUND,
    }
}

#[async_trait]
impl ObjectStore for SupabaseStore {
    fn backend(&self) -> &'static str {
        "supabase"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn download(&self, path: &str) -> Result<Bytes, StorageError> {
        let url = self.object_url(None, path);
        debug!("Downloading {} from supabase bucket {}", path, self.bucket);

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .send()
            .await
            .map_err(|e| StorageError::Request(format!("download of {} failed: {}", path, e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .bytes()
                .await
                .map_err(|e| StorageError::Request(format!("reading {} failed: {}", path, e)));
        }

        let body = response.text().await.unwrap_or_default();
        // Supabase reports missing objects as 400 with a not_found error body
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST)
            && is_missing_object(status, &body)
        {
            return Err(StorageError::NotFound(path.to_string()));
        }

        Err(StorageError::Request(format!(
            "download of {} failed: {} - {}",
            path, status, body
        )))
    }

    async fn upload(&self, path: &str, data: Bytes, content_type: &str) -> Result<(), StorageError> {
        let url = self.object_url(None, path);
        let size = data.len();

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header("x-upsert", "true")
            .header(
                header::CACHE_CONTROL,
                format!("max-age={}", self.cache_control_secs),
            )
            .header(header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .map_err(|e| StorageError::Request(format!("upload of {} failed: {}", path, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Request(format!(
                "upload of {} failed: {} - {}",
                path, status, body
            )));
        }

        debug!("Uploaded {} bytes to supabase {}/{}", size, self.bucket, path);
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        self.object_url(Some("public"), path).to_string()
    }
}

const GCS_PUBLIC_HOST: &str = "https://storage.googleapis.com";

/// Google Cloud Storage through the JSON API client
pub struct GcsStore {
    client: GcsClient,
    bucket: String,
    cache_control_secs: u32,
    public_base: Url,
}

impl GcsStore {
    pub fn new(client: GcsClient, bucket: &str, cache_control_secs: u32) -> Result<Self, StorageError> {
        let public_base = Url::parse(GCS_PUBLIC_HOST)
            .map_err(|e| StorageError::Config(format!("invalid GCS public host: {}", e)))?;

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            cache_control_secs,
            public_base,
        })
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn backend(&self) -> &'static str {
        "gcs"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn download(&self, path: &str) -> Result<Bytes, StorageError> {
        debug!("Downloading gs://{}/{}", self.bucket, path);

        let data = self
            .client
            .download_object(
                &GetObjectRequest {
                    bucket: self.bucket.clone(),
                    object: path.to_string(),
                    ..Default::default()
                },
                &DownloadRange::default(),
            )
            .await
            .map_err(|e| match e {
                google_cloud_storage::http::Error::Response(ref resp) if resp.code == 404 => {
                    StorageError::NotFound(path.to_string())
                }
                other => StorageError::Request(format!(
                    "download of gs://{}/{} failed: {}",
                    self.bucket, path, other
                )),
            })?;

        Ok(Bytes::from(data))
    }

    async fn upload(&self, path: &str, data: Bytes, content_type: &str) -> Result<(), StorageError> {
        let size = data.len();
        let mut media = Media::new(path.to_string());
        media.content_type = content_type.to_string().into();

        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                data,
                &UploadType::Simple(media),
            )
            .await
            .map_err(|e| {
                StorageError::Request(format!(
                    "upload of gs://{}/{} failed: {}",
                    self.bucket, path, e
                ))
            })?;

        let patch_req = PatchObjectRequest {
            bucket: self.bucket.clone(),
            object: path.to_string(),
            metadata: Some(Object {
                cache_control: Some(format!("public, max-age={}", self.cache_control_secs)),
                ..Default::default()
            }),
            ..Default::default()
        };
        if let Err(e) = self.client.patch_object(&patch_req).await {
            warn!("Failed to set cache-control on gs://{}/{}: {}", self.bucket, path, e);
        }

        debug!("Uploaded {} bytes to gs://{}/{}", size, self.bucket, path);
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        join_object_path(&self.public_base, [self.bucket.as_str()], path).to_string()
    }
}

/// Objects stored as files under `{root}/{bucket}`
pub struct LocalStore {
    bucket: String,
    bucket_dir: PathBuf,
}

impl LocalStore {
    pub fn new(root: &Path, bucket: &str) -> Result<Self, StorageError> {
        let bucket_dir = root.join(bucket);
        std::fs::create_dir_all(&bucket_dir)?;
        let bucket_dir = bucket_dir.canonicalize()?;

        Ok(Self {
            bucket: bucket.to_string(),
            bucket_dir,
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_object_path(path)?;
        Ok(self.bucket_dir.join(path))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn download(&self, path: &str) -> Result<Bytes, StorageError> {
        let file = self.resolve(path)?;
        match tokio::fs::read(&file).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(path.to_string())),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn upload(&self, path: &str, data: Bytes, _content_type: &str) -> Result<(), StorageError> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, &data).await?;
        debug!("Wrote {} bytes to {:?}", data.len(), file);
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        let file = self.bucket_dir.join(path);
        Url::from_file_path(&file)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("file://{}", file.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_object_path() {
        assert!(validate_object_path("songs/track.wav").is_ok());
        assert!(validate_object_path("track.mp3").is_ok());

        assert!(validate_object_path("").is_err());
        assert!(validate_object_path("   ").is_err());
        assert!(validate_object_path("/abs/track.wav").is_err());
        assert!(validate_object_path("songs/../secrets").is_err());
        assert!(validate_object_path("songs//track.wav").is_err());
        assert!(validate_object_path("songs/").is_err());
        assert!(validate_object_path("songs\\track.wav").is_err());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a/b.mp3"), "audio/mpeg");
        assert_eq!(content_type_for("a/b.MP3"), "audio/mpeg");
        assert_eq!(content_type_for("b.flac"), "audio/flac");
        assert_eq!(content_type_for("sky_2K_ZIP.exr"), "image/x-exr");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn test_supabase_urls() {
        let store = SupabaseStore::new(
            "https://project.supabase.co",
            "key",
            "realease-experience-content",
            3600,
        )
        .unwrap();

        assert_eq!(
            store.object_url(None, "experiences/intro.mp3").as_str(),
            "https://project.supabase.co/storage/v1/object/realease-experience-content/experiences/intro.mp3"
        );
        assert_eq!(
            store.public_url("experiences/my track.mp3"),
            "https://project.supabase.co/storage/v1/object/public/realease-experience-content/experiences/my%20track.mp3"
        );
    }

    #[test]
    fn test_supabase_rejects_bad_url() {
        assert!(matches!(
            SupabaseStore::new("not a url", "key", "bucket", 3600),
            Err(StorageError::Config(_))
        ));
        assert!(matches!(
            SupabaseStore::new("ftp://project.supabase.co", "key", "bucket", 3600),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn test_missing_object_detection() {
        assert!(is_missing_object(
            StatusCode::BAD_REQUEST,
            r#"{"statusCode":"404","error":"not_found","message":"Object not found"}"#
        ));
        assert!(is_missing_object(
            StatusCode::NOT_FOUND,
            r#"{"statusCode":"404","code":"NoSuchKey","error":"Not Found","message":"Object not found"}"#
        ));
        assert!(is_missing_object(StatusCode::NOT_FOUND, "<html>Not Found</html>"));

        assert!(!is_missing_object(
            StatusCode::BAD_REQUEST,
            r#"{"statusCode":"404","error":"Bucket not found","message":"Bucket not found"}"#
        ));
        assert!(!is_missing_object(
            StatusCode::NOT_FOUND,
            r#"{"statusCode":"404","code":"NoSuchBucket","error":"Bucket not found","message":"Bucket not found"}"#
        ));
        assert!(!is_missing_object(StatusCode::BAD_REQUEST, r#"{"error":"invalid_jwt"}"#));
        assert!(!is_missing_object(StatusCode::BAD_REQUEST, "bad request"));
    }

    #[test]
    fn test_gcs_public_url_encodes_segments() {
        let base = Url::parse(GCS_PUBLIC_HOST).unwrap();
        assert_eq!(
            join_object_path(&base, ["media"], "hdri/abc/sky_2K_ZIP.exr").as_str(),
            "https://storage.googleapis.com/media/hdri/abc/sky_2K_ZIP.exr"
        );
        assert_eq!(
            join_object_path(&base, ["media"], "songs/my track#1?.mp3").as_str(),
            "https://storage.googleapis.com/media/songs/my%20track%231%3F.mp3"
        );
    }

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let root = TempDir::new().unwrap();
        let store = LocalStore::new(root.path(), "media").unwrap();

        store
            .upload("nested/dir/out.mp3", Bytes::from_static(b"ID3"), "audio/mpeg")
            .await
            .unwrap();
        let data = store.download("nested/dir/out.mp3").await.unwrap();
        assert_eq!(&data[..], b"ID3");

        let url = store.public_url("nested/dir/out.mp3");
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("/media/nested/dir/out.mp3"));
    }

    #[tokio::test]
    async fn test_local_store_missing_object() {
        let root = TempDir::new().unwrap();
        let store = LocalStore::new(root.path(), "media").unwrap();

        let err = store.download("missing.wav").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(p) if p == "missing.wav"));
    }

    #[tokio::test]
    async fn test_local_store_rejects_traversal() {
        let root = TempDir::new().unwrap();
        let store = LocalStore::new(root.path(), "media").unwrap();

        let err = store
            .upload("../escape.mp3", Bytes::from_static(b"x"), "audio/mpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }
}
