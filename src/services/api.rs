use crate::core::config::ApiConfig;
use crate::core::state::{
    Diagram, GeneratedContent, ImageDesign, MediaResult, Mode, Topic, VideoArtifact, VideoScene,
    VisualElement,
};
use crate::services::persona::PersonaLibrary;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Everything the workflow needs from the generation backend. Network
/// failures and rejected requests both surface as `Err`.
#[async_trait]
pub trait ContentApi: Send + Sync {
    async fn analyze_topics(&self, keyword: &str) -> Result<TopicAnalysis>;
    async fn generate_content(&self, request: &GenerateRequest) -> Result<GeneratedContent>;
    async fn generate_images(&self, request: &MediaBatchRequest) -> Result<BatchMediaResult>;
    async fn generate_audio(&self, request: &MediaBatchRequest) -> Result<BatchMediaResult>;
    async fn generate_single_image(&self, request: &SingleMediaRequest) -> Result<MediaResult>;
    async fn generate_single_audio(&self, request: &SingleMediaRequest) -> Result<MediaResult>;
    async fn create_video(&self, request: &VideoRequest) -> Result<VideoArtifact>;
    async fn list_personas(&self) -> Result<PersonaLibrary>;
    async fn list_models(&self) -> Result<Vec<ModelOption>>;
}

// --- Wire types ---

#[derive(Debug, Clone, Serialize)]
struct AnalyzeRequest<'a> {
    keyword: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicAnalysis {
    pub topics: Vec<Topic>,
    /// `websearch`, `fallback` or `error`.
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerateRequest {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_url: Option<String>,
    pub mode: Mode,
    pub llm_model: String,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outline: Option<Vec<String>>,
    /// Full search record for the topic, used by the backend as context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_data: Option<Topic>,
}

#[derive(Debug, Deserialize, Default)]
struct GenerateResponse {
    #[serde(default)]
    titles: Vec<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    image_designs: Option<Vec<ImageDesign>>,
    #[serde(default)]
    visual_scenes: Option<Vec<VideoScene>>,
    #[serde(default)]
    diagrams: Option<Vec<Diagram>>,
}

impl GenerateResponse {
    fn into_content(self, mode: Mode) -> GeneratedContent {
        let visual_elements = match mode {
            Mode::Image => self
                .image_designs
                .unwrap_or_default()
                .into_iter()
                .map(VisualElement::ImageDesign)
                .collect(),
            Mode::Video => self
                .visual_scenes
                .unwrap_or_default()
                .into_iter()
                .map(VisualElement::VideoScene)
                .collect(),
            Mode::Wechat => self
                .diagrams
                .unwrap_or_default()
                .into_iter()
                .map(VisualElement::Diagram)
                .collect(),
        };
        GeneratedContent {
            titles: self.titles,
            content: self.content,
            visual_elements,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MediaItem {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
}

impl MediaItem {
    pub fn from_element(element: &VisualElement) -> Self {
        Self {
            prompt: element.prompt().to_string(),
            narration: Some(element.narration().to_string()),
            sentiment: element.sentiment().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MediaBatchRequest {
    pub scenes: Vec<MediaItem>,
    pub provider: String,
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BatchMediaResult {
    pub results: Vec<MediaResult>,
    #[serde(default)]
    pub success_count: usize,
    #[serde(default)]
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SingleMediaRequest {
    pub scene: MediaItem,
    pub index: usize,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SceneNarration {
    pub narration: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VideoRequest {
    pub image_paths: Vec<String>,
    pub audio_paths: Vec<String>,
    pub scenes: Vec<SceneNarration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bgm_path: Option<String>,
    pub bgm_volume: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoResponse {
    video_path: Option<String>,
    video_url: Option<String>,
    srt_path: Option<String>,
    srt_url: Option<String>,
    #[serde(default)]
    duration: f64,
    error: Option<String>,
}

impl VideoResponse {
    fn into_artifact(self) -> Result<VideoArtifact> {
        if let Some(error) = self.error {
            return Err(anyhow!("Video composition failed: {}", error));
        }
        let video_path = self
            .video_path
            .ok_or_else(|| anyhow!("Video composition returned no file"))?;
        Ok(VideoArtifact {
            video_path,
            video_url: self.video_url,
            srt_path: self.srt_path,
            srt_url: self.srt_url,
            duration: self.duration,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelOption {
    pub label: String,
    pub value: String,
}

#[derive(Deserialize)]
struct ModelList {
    models: Vec<ModelOption>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    detail: serde_json::Value,
}

fn error_detail(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(ApiErrorBody {
            detail: serde_json::Value::String(s),
        }) => s,
        Ok(ApiErrorBody { detail }) => detail.to_string(),
        Err(_) => body.to_string(),
    }
}

// --- HTTP client ---

#[derive(Debug, Clone)]
pub struct HttpContentApi {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpContentApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid API base url: {}", config.base_url))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { base_url, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid endpoint path: {}", path))
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        debug!("POST {}", url);
        let resp = self.client.post(url).json(body).send().await?;
        Self::read(path, resp).await
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = self.endpoint(path)?;
        debug!("GET {}", url);
        let resp = self.client.get(url).send().await?;
        Self::read(path, resp).await
    }

    async fn read<R: DeserializeOwned>(path: &str, resp: reqwest::Response) -> Result<R> {
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let detail = error_detail(&body);
            warn!("{} failed with {}: {}", path, status, detail);
            return Err(anyhow!("API error ({}): {}", status, detail));
        }

        serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse response from {}. Body: {}", path, body))
    }
}

#[async_trait]
impl ContentApi for HttpContentApi {
    async fn analyze_topics(&self, keyword: &str) -> Result<TopicAnalysis> {
        self.post("api/topics/analyze", &AnalyzeRequest { keyword }).await
    }

    async fn generate_content(&self, request: &GenerateRequest) -> Result<GeneratedContent> {
        let resp: GenerateResponse = self.post("api/content/generate", request).await?;
        Ok(resp.into_content(request.mode))
    }

    async fn generate_images(&self, request: &MediaBatchRequest) -> Result<BatchMediaResult> {
        self.post("api/media/images", request).await
    }

    async fn generate_audio(&self, request: &MediaBatchRequest) -> Result<BatchMediaResult> {
        self.post("api/media/audio", request).await
    }

    async fn generate_single_image(&self, request: &SingleMediaRequest) -> Result<MediaResult> {
        self.post("api/media/images/single", request).await
    }

    async fn generate_single_audio(&self, request: &SingleMediaRequest) -> Result<MediaResult> {
        self.post("api/media/audio/single", request).await
    }

    async fn create_video(&self, request: &VideoRequest) -> Result<VideoArtifact> {
        let resp: VideoResponse = self.post("api/video/create", request).await?;
        resp.into_artifact()
    }

    async fn list_personas(&self) -> Result<PersonaLibrary> {
        self.get("api/config/personas").await
    }

    async fn list_models(&self) -> Result<Vec<ModelOption>> {
        let list: ModelList = self.get("api/config/models").await?;
        Ok(list.models)
    }
}
