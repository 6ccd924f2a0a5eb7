// ABOUTME: HTTP surface: audio conversion from storage or upload, HDRI compression, health
// ABOUTME: Stages inputs in a per-request scratch dir, runs the converter, uploads the result

use crate::audio::{AudioFormat, AudioSettings, LoudnessReport, Transcoder};
use crate::config::Config;
use crate::error::{ConversionError, Result};
use crate::hdri::{self, CompressionResult, HdriSettings};
use crate::storage::{content_type_for, validate_object_path, ObjectStore};
use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Form, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tempfile::TempDir;
use tokio::{io::AsyncWriteExt, sync::Semaphore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, info, warn, Level};
use uuid::Uuid;

/// Bytes of an upload kept for format sniffing
const HEAD_BYTES: usize = 4;

// App state shared across handlers
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ObjectStore>,
    pub transcoder: Transcoder,
    /// Bounds concurrent external conversions
    pub permits: Arc<Semaphore>,
    pub ffmpeg_available: bool,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn ObjectStore>) -> Self {
        let transcoder = Transcoder::new(
            config.ffmpeg_path.clone(),
            Duration::from_secs(config.ffmpeg_timeout_secs),
        );
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_conversions)),
            config,
            store,
            transcoder,
            ffmpeg_available: false,
        }
    }

    fn hdri_settings(&self) -> HdriSettings {
        HdriSettings {
            target_width: self.config.hdri_target_width,
            target_height: self.config.hdri_target_height,
        }
    }
}

/// Optional audio fields shared by the form and multipart endpoints
#[derive(Debug, Default, Deserialize)]
pub struct AudioOptions {
    #[serde(default)]
    pub target_format: Option<String>,
    #[serde(default)]
    pub bitrate: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<String>,
    #[serde(default)]
    pub channels: Option<String>,
    #[serde(default)]
    pub normalize: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl AudioOptions {
    fn from_fields(fields: &mut HashMap<String, String>) -> Self {
        Self {
            target_format: fields.remove("target_format"),
            bitrate: fields.remove("bitrate"),
            sample_rate: fields.remove("sample_rate"),
            channels: fields.remove("channels"),
            normalize: fields.remove("normalize"),
        }
    }

    fn to_settings(&self, config: &Config) -> Result<AudioSettings> {
        let format = match non_blank(&self.target_format) {
            Some(f) => AudioFormat::parse(f).ok_or_else(|| {
                ConversionError::BadRequest(format!("Unsupported target format: {}", f))
            })?,
            None => config.default_audio_format,
        };

        let bitrate = non_blank(&self.bitrate)
            .map(str::to_string)
            .unwrap_or_else(|| config.default_audio_bitrate.clone());

        let sample_rate = non_blank(&self.sample_rate)
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|_| ConversionError::BadRequest(format!("Invalid sample_rate: {}", v)))
            })
            .transpose()?;

        let channels = non_blank(&self.channels)
            .map(|v| {
                v.parse::<u8>()
                    .map_err(|_| ConversionError::BadRequest(format!("Invalid channels: {}", v)))
            })
            .transpose()?;

        let normalize = match non_blank(&self.normalize).map(str::to_lowercase).as_deref() {
            None | Some("false") | Some("0") | Some("no") | Some("off") => false,
            Some("true") | Some("1") | Some("yes") | Some("on") => true,
            Some(other) => {
                return Err(ConversionError::BadRequest(format!(
                    "Invalid normalize flag: {}",
                    other
                )))
            }
        };

        let settings = AudioSettings {
            format,
            bitrate,
            sample_rate,
            channels,
            normalize,
        };
        settings.validate().map_err(ConversionError::BadRequest)?;
        Ok(settings)
    }
}

/// Convert an object that already lives in the bucket
#[derive(Debug, Default, Deserialize)]
pub struct ConvertRequest {
    #[serde(rename = "convert_supabase_storage_path", alias = "source_path", default)]
    pub source_path: String,
    #[serde(rename = "result_supabase_storage_path", alias = "result_path", default)]
    pub result_path: String,
    #[serde(flatten)]
    pub options: AudioOptions,
}

impl ConvertRequest {
    fn from_fields(mut fields: HashMap<String, String>) -> Self {
        let mut take = |primary: &str, alias: &str| {
            fields
                .remove(primary)
                .or_else(|| fields.remove(alias))
                .unwrap_or_default()
        };
        let source_path = take("convert_supabase_storage_path", "source_path");
        let result_path = take("result_supabase_storage_path", "result_path");
        Self {
            source_path,
            result_path,
            options: AudioOptions::from_fields(&mut fields),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AudioConversionResponse {
    pub public_url: String,
    pub path: String,
    pub content_type: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub normalized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loudness: Option<LoudnessReport>,
}

#[derive(Debug, Serialize)]
pub struct HdriConversionResponse {
    pub public_url: String,
    pub path: String,
    pub original_filename: String,
    pub original_size: u64,
    pub conversion_type: String,
    pub width: usize,
    pub height: usize,
    pub compression_results: Vec<CompressionResult>,
}

// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    ffmpeg_available: bool,
    storage_backend: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/", get(handle_health))
        .route("/health", get(handle_health))
        .route(
            "/convert",
            post(handle_convert).options(handle_cors_preflight),
        )
        .route(
            "/convert/audio",
            post(handle_convert_audio).options(handle_cors_preflight),
        )
        .route(
            "/convert/hdri",
            post(handle_convert_hdri).options(handle_cors_preflight),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

async fn handle_cors_preflight() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        ffmpeg_available: state.ffmpeg_available,
        storage_backend: state.store.backend().to_string(),
    })
}

/// POST /convert - accepts url-encoded or multipart form fields
async fn handle_convert(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let request = match extract_convert_request(&state, request).await {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    let scratch = match new_scratch(&state.config, "audio-") {
        Ok(dir) => dir,
        Err(e) => return e.into_response(),
    };
    let result = process_storage_conversion(&state, request, scratch.path()).await;
    release_scratch(scratch);

    // Existing clients read the bare public URL
    match result {
        Ok(response) => (StatusCode::OK, Json(response.public_url)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /convert/audio - multipart upload of the source file
async fn handle_convert_audio(State(state): State<Arc<AppState>>, multipart: Multipart) -> Response {
    let scratch = match new_scratch(&state.config, "audio-") {
        Ok(dir) => dir,
        Err(e) => return e.into_response(),
    };
    let result = process_uploaded_audio(&state, multipart, scratch.path()).await;
    release_scratch(scratch);

    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /convert/hdri - multipart upload of an .exr file
async fn handle_convert_hdri(State(state): State<Arc<AppState>>, multipart: Multipart) -> Response {
    let scratch = match new_scratch(&state.config, "hdri-") {
        Ok(dir) => Arc::new(dir),
        Err(e) => return e.into_response(),
    };
    let result = process_hdri(&state, multipart, &scratch).await;
    match Arc::try_unwrap(scratch) {
        Ok(dir) => release_scratch(dir),
        Err(_) => debug!("Scratch directory still held by a blocking job"),
    }

    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn extract_convert_request(state: &Arc<AppState>, request: Request) -> Result<ConvertRequest> {
    if is_multipart(request.headers()) {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|e| ConversionError::BadRequest(e.body_text()))?;
        let mut fields = HashMap::new();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            fields.insert(name, field.text().await?);
        }
        Ok(ConvertRequest::from_fields(fields))
    } else {
        let Form(request) = Form::<ConvertRequest>::from_request(request, state)
            .await
            .map_err(|e| ConversionError::BadRequest(e.body_text()))?;
        Ok(request)
    }
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

fn new_scratch(config: &Config, prefix: &str) -> Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(&config.scratch_dir)?;
    debug!("Created scratch directory {:?}", dir.path());
    Ok(dir)
}

/// Remove the scratch directory; failures are logged, never surfaced
fn release_scratch(scratch: TempDir) {
    let path = scratch.path().to_path_buf();
    match scratch.close() {
        Ok(()) => debug!("Removed scratch directory {:?}", path),
        Err(e) => warn!("Failed to remove scratch directory {:?}: {}", path, e),
    }
}

/// Run `job` on the blocking pool under a conversion permit.
///
/// The permit and the scratch directory move into the job, so both stay held until it
/// finishes even when the request future is dropped first.
async fn run_blocking_job<T, F>(state: &AppState, scratch: &Arc<TempDir>, job: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let permit = Arc::clone(&state.permits)
        .acquire_owned()
        .await
        .map_err(|_| ConversionError::Internal("conversion pool closed".to_string()))?;
    let scratch = Arc::clone(scratch);

    tokio::task::spawn_blocking(move || {
        let _held = (permit, scratch);
        job()
    })
    .await
    .map_err(|e| ConversionError::Internal(format!("blocking worker failed: {}", e)))
}

/// Reduce a client-supplied name to a safe single path component
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "upload".to_string())
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

/// An uploaded file written to the scratch directory
struct StagedFile {
    path: PathBuf,
    original_name: String,
    size: u64,
    head: Vec<u8>,
}

/// Multipart body split into the single `file` part and the text fields
struct UploadForm {
    file: Option<StagedFile>,
    fields: HashMap<String, String>,
}

async fn read_upload_form(mut multipart: Multipart, scratch: &Path) -> Result<UploadForm> {
    let mut file = None;
    let mut fields = HashMap::new();

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name != "file" {
            fields.insert(name, field.text().await?);
            continue;
        }
        if file.is_some() {
            return Err(ConversionError::BadRequest(
                "Only one file may be uploaded".to_string(),
            ));
        }

        let original_name = field.file_name().unwrap_or("upload").to_string();
        let path = scratch.join(format!("input-{}", sanitize_file_name(&original_name)));
        debug!("Saving uploaded file {} to {:?}", original_name, path);

        let mut out = tokio::fs::File::create(&path).await?;
        let mut size: u64 = 0;
        let mut head = Vec::with_capacity(HEAD_BYTES);
        while let Some(chunk) = field.chunk().await? {
            if head.len() < HEAD_BYTES {
                let take = (HEAD_BYTES - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }
            size += chunk.len() as u64;
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        debug!("Input file size: {} bytes", size);

        file = Some(StagedFile {
            path,
            original_name,
            size,
            head,
        });
    }

    Ok(UploadForm { file, fields })
}

fn require_path(value: &str, field: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConversionError::BadRequest(format!("No {} provided", field)));
    }
    validate_object_path(value)?;
    Ok(value.to_string())
}

async fn process_storage_conversion(
    state: &AppState,
    request: ConvertRequest,
    scratch: &Path,
) -> Result<AudioConversionResponse> {
    let source_path = require_path(&request.source_path, "convert_supabase_storage_path")?;
    let result_path = require_path(&request.result_path, "result_supabase_storage_path")?;
    let settings = request.options.to_settings(&state.config)?;

    info!("Converting {} -> {}", source_path, result_path);

    debug!("Downloading {} from storage", source_path);
    let data = state.store.download(&source_path).await?;
    if data.is_empty() {
        return Err(ConversionError::BadRequest(format!(
            "Source file is empty: {}",
            source_path
        )));
    }

    let source_name = source_path.rsplit('/').next().unwrap_or(&source_path);
    let input_path = scratch.join(format!("input-{}", sanitize_file_name(source_name)));
    debug!("Saving downloaded file to: {:?}", input_path);
    tokio::fs::write(&input_path, &data).await?;

    convert_staged_audio(state, &input_path, &result_path, &settings).await
}

async fn process_uploaded_audio(
    state: &AppState,
    multipart: Multipart,
    scratch: &Path,
) -> Result<AudioConversionResponse> {
    let UploadForm { file, mut fields } = read_upload_form(multipart, scratch).await?;
    let file = file.ok_or_else(|| ConversionError::BadRequest("No file uploaded".to_string()))?;
    if file.size == 0 {
        return Err(ConversionError::BadRequest("Input file is empty".to_string()));
    }

    let settings = AudioOptions::from_fields(&mut fields).to_settings(&state.config)?;
    let result_path = match fields.get("result_path").map(|p| p.trim()).filter(|p| !p.is_empty()) {
        Some(path) => require_path(path, "result_path")?,
        None => format!(
            "converted/{}/{}.{}",
            Uuid::new_v4(),
            file_stem(&sanitize_file_name(&file.original_name)),
            settings.format.extension()
        ),
    };

    info!("Converting upload {} -> {}", file.original_name, result_path);
    convert_staged_audio(state, &file.path, &result_path, &settings).await
}

async fn convert_staged_audio(
    state: &AppState,
    input_path: &Path,
    result_path: &str,
    settings: &AudioSettings,
) -> Result<AudioConversionResponse> {
    let input_name = input_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let output_path = input_path.with_file_name(format!(
        "{}-converted.{}",
        file_stem(&input_name),
        settings.format.extension()
    ));

    let conversion = {
        let _permit = state
            .permits
            .acquire()
            .await
            .map_err(|_| ConversionError::Internal("conversion pool closed".to_string()))?;
        debug!("Starting audio conversion");
        state
            .transcoder
            .convert(
                input_path,
                &output_path,
                settings,
                &state.config.loudness_target,
                state.config.analyze_loudness,
            )
            .await?
    };
    debug!("Audio conversion completed. Output path: {:?}", output_path);

    let data = tokio::fs::read(&output_path).await?;
    let size = data.len() as u64;
    let content_type = settings.format.content_type();

    debug!("Uploading to path: {}", result_path);
    state
        .store
        .upload(result_path, Bytes::from(data), content_type)
        .await?;
    let public_url = state.store.public_url(result_path);
    info!("Upload completed. Public URL: {}", public_url);

    Ok(AudioConversionResponse {
        public_url,
        path: result_path.to_string(),
        content_type: content_type.to_string(),
        size,
        duration_seconds: conversion.duration_seconds,
        normalized: conversion.normalized,
        loudness: conversion.loudness,
    })
}

async fn process_hdri(
    state: &AppState,
    multipart: Multipart,
    scratch: &Arc<TempDir>,
) -> Result<HdriConversionResponse> {
    let UploadForm { file, fields } = read_upload_form(multipart, scratch.path()).await?;
    let file = file.ok_or_else(|| ConversionError::BadRequest("No file uploaded".to_string()))?;
    info!("Starting HDRI conversion for file: {}", file.original_name);

    let extension = extension_of(&file.original_name);
    if extension.as_deref() != Some("exr") {
        return Err(ConversionError::UnsupportedMedia(format!(
            "Unsupported file type: {}; supported: .exr",
            extension
                .map(|e| format!(".{}", e))
                .unwrap_or_else(|| "(none)".to_string())
        )));
    }
    if file.size == 0 {
        return Err(ConversionError::BadRequest("Input file is empty".to_string()));
    }
    if !hdri::is_exr(&file.head) {
        return Err(ConversionError::UnsupportedMedia(
            "File is not an OpenEXR image".to_string(),
        ));
    }

    let output_name = hdri::output_file_name(Path::new(&sanitize_file_name(&file.original_name)));
    let result_path = match fields.get("result_path").map(|p| p.trim()).filter(|p| !p.is_empty()) {
        Some(path) => require_path(path, "result_path")?,
        None => format!("hdri/{}/{}", Uuid::new_v4(), output_name),
    };

    let input = file.path.clone();
    let output_dir = scratch.path().join("output");
    let settings = state.hdri_settings();
    debug!("Starting EXR compression");
    let compressed = run_blocking_job(state, scratch, move || {
        hdri::compress_exr(&input, &output_dir, &settings)
    })
    .await?
    .map_err(|e| ConversionError::InvalidImage(format!("{:#}", e)))?;
    debug!(
        "EXR compression completed: {}x{} -> {}x{} (alpha: {})",
        compressed.source_width,
        compressed.source_height,
        compressed.width,
        compressed.height,
        compressed.has_alpha
    );

    let data = tokio::fs::read(&compressed.path).await.map_err(|e| {
        ConversionError::Internal(format!("No output file was generated during compression: {}", e))
    })?;
    let compressed_size = data.len() as u64;
    let result = CompressionResult::new(output_name.clone(), file.size, compressed_size);
    info!(
        "Compressed {} from {} to {} bytes ({})",
        file.original_name, file.size, compressed_size, result.compression_ratio
    );

    state
        .store
        .upload(&result_path, Bytes::from(data), content_type_for(&output_name))
        .await?;
    let public_url = state.store.public_url(&result_path);
    info!("Upload completed. Public URL: {}", public_url);

    Ok(HdriConversionResponse {
        public_url,
        path: result_path,
        original_filename: file.original_name,
        original_size: file.size,
        conversion_type: "EXR compression".to_string(),
        width: compressed.width,
        height: compressed.height,
        compression_results: vec![result],
    })
}
