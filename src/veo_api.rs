use base64::Engine;
use rand::RngExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_WAIT_SECS: u64 = 600;

/// Substring the service returns when the selected key has no access to Veo.
pub const KEY_NOT_FOUND_MARKER: &str = "Requested entity was not found";

pub const STATUS_INITIALIZING: &str = "Initializing creative sequence...";
pub const STATUS_SUBMITTED: &str = "Dreaming up the scene... (This may take a minute)";
pub const STATUS_DOWNLOADING: &str = "Downloading your masterpiece...";

/// Filler shown on every poll tick
pub const PROGRESS_MESSAGES: [&str; 5] = [
    "Rendering frames...",
    "Applying physics...",
    "Composing lighting...",
    "Polishing pixels...",
    "Almost there...",
];

/// Supported Veo models
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VeoModel {
    /// Veo 3.1 preview - highest quality
    #[default]
    Veo31Preview,
    /// Veo 3.1 fast preview - lower latency
    Veo31Fast,
}

impl VeoModel {
    pub fn api_model_name(&self) -> &'static str {
        match self {
            VeoModel::Veo31Preview => "veo-3.1-generate-preview",
            VeoModel::Veo31Fast => "veo-3.1-fast-generate-preview",
        }
    }
}

impl fmt::Display for VeoModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VeoModel::Veo31Preview => write!(f, "3.1"),
            VeoModel::Veo31Fast => write!(f, "3.1-fast"),
        }
    }
}

impl FromStr for VeoModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "3.1" | "preview" | "veo-3.1-generate-preview" => Ok(VeoModel::Veo31Preview),
            "3.1-fast" | "fast" | "veo-3.1-fast-generate-preview" => Ok(VeoModel::Veo31Fast),
            _ => Err(format!("Unknown model: {}. Use '3.1' or '3.1-fast'", s)),
        }
    }
}

/// Output resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Resolution {
    #[default]
    P720,
    P1080,
}

impl Resolution {
    pub fn api_value(&self) -> &'static str {
        match self {
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.api_value())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "720p" | "720" => Ok(Resolution::P720),
            "1080p" | "1080" => Ok(Resolution::P1080),
            _ => Err(format!("Invalid resolution: {}. Use 720p or 1080p", s)),
        }
    }
}

/// Aspect ratio of the generated video
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AspectRatio {
    #[default]
    Square, // 1:1
    Portrait,  // 9:16
    Landscape, // 16:9
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 3] = [
        AspectRatio::Square,
        AspectRatio::Portrait,
        AspectRatio::Landscape,
    ];

    pub fn api_value(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Landscape => "16:9",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AspectRatio::Square => "Square (1:1)",
            AspectRatio::Portrait => "Portrait (9:16)",
            AspectRatio::Landscape => "Landscape (16:9)",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.api_value())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1:1" | "square" => Ok(AspectRatio::Square),
            "9:16" | "portrait" | "tall" => Ok(AspectRatio::Portrait),
            "16:9" | "landscape" | "wide" => Ok(AspectRatio::Landscape),
            _ => Err(format!(
                "Invalid aspect ratio: {}. Use 1:1, 9:16, or 16:9",
                s
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum VeoError {
    #[error("API Key Error: Please select your project again.")]
    ApiKeyRejected,

    #[error("Veo API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Rate limited by API. Retry after some time.")]
    RateLimited,

    #[error("{0}")]
    GenerationFailed(String),

    #[error("Content blocked: {0}")]
    ContentBlocked(String),

    #[error("No video URI returned from the model.")]
    NoVideoUri,

    #[error("Failed to download video: {0}")]
    DownloadFailed(String),

    #[error("Veo returned a Cloud Storage URI ({0}) which cannot be downloaded with an API key")]
    UnsupportedStorageUri(String),

    #[error("Video generation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Please upload a valid image file (JPG or PNG). Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("The image is empty")]
    EmptyImage,

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl VeoError {
    /// True when the failure means the selected credential has to be picked again.
    pub fn is_api_key_error(&self) -> bool {
        matches!(self, VeoError::ApiKeyRejected)
    }
}

pub type Result<T> = std::result::Result<T, VeoError>;

#[derive(Debug, Clone)]
pub struct VeoClientConfig {
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    pub model: VeoModel,
    pub resolution: Resolution,
}

impl Default for VeoClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_wait_secs: DEFAULT_MAX_WAIT_SECS,
            model: VeoModel::default(),
            resolution: Resolution::default(),
        }
    }
}

/// Starting frame for the animation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl InputImage {
    /// Create from file path
    pub async fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mime_type = mime_type_from_path(path)?;
        let data = fs::read(path).await?;
        if data.is_empty() {
            return Err(VeoError::EmptyImage);
        }
        debug!("Loaded {} ({} bytes, {})", path.display(), data.len(), mime_type);
        Ok(Self { mime_type, data })
    }

    /// Create from raw bytes with explicit mime type
    pub fn from_bytes(data: Vec<u8>, mime_type: String) -> Self {
        Self { mime_type, data }
    }

    /// Accepts raw base64 or a `data:<mime>;base64,<payload>` URL
    pub fn from_base64(encoded: &str, mime_type: &str) -> Result<Self> {
        let (mime_type, payload) = match encoded.strip_prefix("data:") {
            Some(rest) => {
                let Some((header, payload)) = rest.split_once(',') else {
                    return Err(VeoError::UnsupportedFormat(format!("data:{}", rest)));
                };
                let mime = header.split(';').next().unwrap_or(mime_type);
                (mime.to_string(), payload)
            }
            None => (mime_type.to_string(), encoded),
        };

        if !mime_type.starts_with("image/") {
            return Err(VeoError::UnsupportedFormat(mime_type));
        }

        let data = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
        if data.is_empty() {
            return Err(VeoError::EmptyImage);
        }
        Ok(Self { mime_type, data })
    }

    /// Get base64 encoded data
    pub fn base64_data(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

/// Determine MIME type from file extension
fn mime_type_from_path(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => Ok("image/png".to_string()),
        "jpg" | "jpeg" => Ok("image/jpeg".to_string()),
        "webp" => Ok("image/webp".to_string()),
        "gif" => Ok("image/gif".to_string()),
        "heic" => Ok("image/heic".to_string()),
        "heif" => Ok("image/heif".to_string()),
        _ => Err(VeoError::UnsupportedFormat(ext)),
    }
}

/// Finished animation
#[derive(Debug, Clone)]
pub struct GeneratedVideo {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub uri: String,
}

impl GeneratedVideo {
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "video/webm" => "webm",
            "video/quicktime" => "mov",
            _ => "mp4",
        }
    }

    /// Write the video to disk, creating missing parent directories
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, &self.data).await?;
        info!("Saved {} bytes to {}", self.data.len(), path.display());
        Ok(())
    }
}

// Request wire format

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateVideosRequest {
    instances: Vec<VideoInstance>,
    parameters: VideoParameters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoInstance {
    prompt: String,
    image: MediaData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaData {
    inline_data: InlineData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoParameters {
    aspect_ratio: String,
    resolution: String,
    number_of_videos: u32,
}

// Long-running operation

/// Handle to an asynchronous generation job
#[derive(Debug, Clone, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub response: Option<OperationResponse>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    #[serde(default)]
    pub generate_video_response: Option<GenerateVideoResponse>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateVideoResponse {
    #[serde(default)]
    pub generated_samples: Vec<GeneratedSample>,
    #[serde(default)]
    pub rai_media_filtered_count: Option<u32>,
    #[serde(default)]
    pub rai_media_filtered_reasons: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedSample {
    #[serde(default)]
    pub video: Option<VideoRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoRef {
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Pick a random progress message for a poll tick
pub fn progress_message() -> &'static str {
    let idx = rand::rng().random_range(0..PROGRESS_MESSAGES.len());
    PROGRESS_MESSAGES[idx]
}

/// Map an HTTP failure to the error the caller should see
fn classify_api_error(status: u16, message: String) -> VeoError {
    if message.contains(KEY_NOT_FOUND_MARKER) {
        return VeoError::ApiKeyRejected;
    }
    if status == 429 {
        return VeoError::RateLimited;
    }
    VeoError::ApiError { status, message }
}

/// Any error mentioning the missing-entity marker means the key is unusable
fn reject_unusable_key(err: VeoError) -> VeoError {
    if !err.is_api_key_error() && err.to_string().contains(KEY_NOT_FOUND_MARKER) {
        VeoError::ApiKeyRejected
    } else {
        err
    }
}

/// Extract the video URI from a finished operation
pub fn video_uri(operation: &Operation) -> Result<String> {
    if let Some(err) = &operation.error {
        let message = err
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "Video generation failed.".to_string());
        return Err(reject_unusable_key(VeoError::GenerationFailed(message)));
    }

    let Some(resp) = operation
        .response
        .as_ref()
        .and_then(|r| r.generate_video_response.as_ref())
    else {
        return Err(VeoError::NoVideoUri);
    };

    let uri = resp
        .generated_samples
        .iter()
        .find_map(|s| s.video.as_ref().and_then(|v| v.uri.clone()));

    match uri {
        Some(uri) => Ok(uri),
        None if resp.rai_media_filtered_count.unwrap_or(0) > 0 => {
            let reason = resp
                .rai_media_filtered_reasons
                .first()
                .cloned()
                .unwrap_or_else(|| "Video was filtered by Veo safety filters".to_string());
            Err(VeoError::ContentBlocked(reason))
        }
        None => Err(VeoError::NoVideoUri),
    }
}

/// Download links need the key as a query parameter
fn with_api_key(uri: &str, api_key: &str) -> String {
    if uri.contains('?') {
        format!("{}&key={}", uri, api_key)
    } else {
        format!("{}?key={}", uri, api_key)
    }
}

#[derive(Debug, Clone)]
pub struct VeoClient {
    client: Client,
    api_key: String,
    base_url: String,
    config: VeoClientConfig,
}

impl VeoClient {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_config(api_key, VeoClientConfig::default())
    }

    pub fn with_config(api_key: String, config: VeoClientConfig) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(VeoError::NetworkError)?;

        Ok(Self {
            client,
            api_key,
            base_url: GEMINI_API_URL.to_string(),
            config,
        })
    }

    /// Point the client at a different API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn config(&self) -> &VeoClientConfig {
        &self.config
    }

    fn build_payload(
        &self,
        image: &InputImage,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> GenerateVideosRequest {
        GenerateVideosRequest {
            instances: vec![VideoInstance {
                prompt: prompt.to_string(),
                image: MediaData {
                    inline_data: InlineData {
                        mime_type: image.mime_type.clone(),
                        data: image.base64_data(),
                    },
                },
            }],
            parameters: VideoParameters {
                aspect_ratio: aspect_ratio.api_value().to_string(),
                resolution: self.config.resolution.api_value().to_string(),
                number_of_videos: 1,
            },
        }
    }

    async fn error_from_response(response: reqwest::Response) -> VeoError {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        classify_api_error(status.as_u16(), error_text)
    }

    /// Submit the job; returns the operation handle
    pub async fn start_generation(
        &self,
        image: &InputImage,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<Operation> {
        let url = format!(
            "{}/models/{}:predictLongRunning?key={}",
            self.base_url,
            self.config.model.api_model_name(),
            self.api_key
        );

        let payload = self.build_payload(image, prompt, aspect_ratio);

        debug!(
            "Submitting video generation (model: {}, aspect: {}, resolution: {})",
            self.config.model, aspect_ratio, self.config.resolution
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        debug!("Received response with status: {}", status);

        if !status.is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let operation: Operation = response.json().await?;
        info!("Video generation started: {}", operation.name);
        Ok(operation)
    }

    /// Fetch the current state of an operation
    pub async fn get_operation(&self, name: &str) -> Result<Operation> {
        let url = format!("{}/{}?key={}", self.base_url, name, self.api_key);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        Ok(response.json().await?)
    }

    /// Poll on a fixed interval until the job is done or reports an error
    pub async fn wait_for_completion(
        &self,
        mut operation: Operation,
        on_status: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<Operation> {
        let start = Instant::now();
        let max_wait = Duration::from_secs(self.config.max_wait_secs);
        let interval = Duration::from_secs(self.config.poll_interval_secs);

        while !operation.done && operation.error.is_none() {
            if start.elapsed() >= max_wait {
                return Err(VeoError::Timeout(self.config.max_wait_secs));
            }

            tokio::time::sleep(interval).await;
            on_status(progress_message());

            operation = self.get_operation(&operation.name).await?;
            debug!(
                "Operation {} done={} ({}s elapsed)",
                operation.name,
                operation.done,
                start.elapsed().as_secs()
            );
        }

        Ok(operation)
    }

    /// Fetch the video bytes behind a result URI
    pub async fn download_video(&self, uri: &str) -> Result<GeneratedVideo> {
        if uri.starts_with("gs://") {
            return Err(VeoError::UnsupportedStorageUri(uri.to_string()));
        }

        debug!("Downloading video from {}", uri);

        let response = self
            .client
            .get(with_api_key(uri, &self.api_key))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("unknown status");
            return Err(VeoError::DownloadFailed(reason.to_string()));
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("video/"))
            .unwrap_or("video/mp4")
            .to_string();

        let data = response.bytes().await?.to_vec();

        Ok(GeneratedVideo {
            data,
            mime_type,
            uri: uri.to_string(),
        })
    }

    /// Submit, poll until finished, then download the result
    pub async fn generate_video(
        &self,
        image: &InputImage,
        prompt: &str,
        aspect_ratio: AspectRatio,
        on_status: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<GeneratedVideo> {
        self.run_generation(image, prompt, aspect_ratio, on_status)
            .await
            .map_err(|e| {
                warn!("Veo generation error: {}", e);
                reject_unusable_key(e)
            })
    }

    async fn run_generation(
        &self,
        image: &InputImage,
        prompt: &str,
        aspect_ratio: AspectRatio,
        on_status: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<GeneratedVideo> {
        on_status(STATUS_INITIALIZING);

        let operation = self.start_generation(image, prompt, aspect_ratio).await?;

        on_status(STATUS_SUBMITTED);

        let operation = self.wait_for_completion(operation, on_status).await?;
        let uri = video_uri(&operation)?;

        on_status(STATUS_DOWNLOADING);

        let video = self.download_video(&uri).await?;
        info!("Video generation successful ({} bytes)", video.data.len());
        Ok(video)
    }
}
