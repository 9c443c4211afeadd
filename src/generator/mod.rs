use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::generator::model::{GenerateContentResponse, Operation};
use crate::model::{Audience, ChatMessage, ChatRole, Format, GeneratedContent, Length, Style, Theme};

pub mod model;

const SYSTEM_INSTRUCTION: &str = "You are a compassionate, wise, and encouraging AI Christian Pastor. \
Your primary mission is to provide Bible-based guidance, prayerful support, and theological insights rooted in the Holy Scriptures.\n\
STRICT CONSTRAINTS:\n\
1. Focus on Christian encouragement and Biblical wisdom.\n\
2. Address the user with warmth and respect. Use a tone that reflects the fruits of the Spirit.\n\
3. When quoting scripture, include the book, chapter, and verse reference.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageSize {
    #[default]
    OneK,
    TwoK,
    FourK,
}

impl ImageSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSize::OneK => "1K",
            ImageSize::TwoK => "2K",
            ImageSize::FourK => "4K",
        }
    }
}

impl FromStr for ImageSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1K" => Ok(ImageSize::OneK),
            "2K" => Ok(ImageSize::TwoK),
            "4K" => Ok(ImageSize::FourK),
            other => Err(format!("unknown image size: {other} (expected 1K, 2K or 4K)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectRatio {
    #[default]
    Landscape,
    Portrait,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
        }
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "16:9" | "landscape" => Ok(AspectRatio::Landscape),
            "9:16" | "portrait" => Ok(AspectRatio::Portrait),
            other => Err(format!("unknown aspect ratio: {other}")),
        }
    }
}

/// Parameters for a structured devotional text generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevotionalRequest {
    pub theme: Theme,
    pub verse: String,
    pub format: Format,
    pub length: Length,
    pub audience: Audience,
    pub style: Style,
    pub custom_instruction: Option<String>,
}

impl DevotionalRequest {
    pub fn new(theme: Theme, verse: impl Into<String>, format: Format) -> Self {
        Self {
            theme,
            verse: verse.into(),
            format,
            length: Length::default(),
            audience: Audience::default(),
            style: Style::default(),
            custom_instruction: None,
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.custom_instruction = Some(instruction.into());
        self
    }
}

/// The external generative service. Any error is retryable only by resubmitting.
#[async_trait]
pub trait GeneratorClient: Send + Sync {
    async fn generate_devotional(&self, req: &DevotionalRequest) -> Result<GeneratedContent>;

    /// Returns an image URI (a `data:` URI for inline results).
    async fn generate_image(&self, prompt: &str, size: ImageSize) -> Result<String>;

    /// Returns a video URI once the long-running generation finishes.
    async fn generate_video(
        &self,
        prompt: &str,
        aspect: AspectRatio,
        seed_image: Option<&str>,
    ) -> Result<String>;

    /// Apply `prompt` to an image given as a `data:` URI; returns the edited image URI.
    async fn edit_image(&self, image: &str, prompt: &str) -> Result<String>;

    /// Free-form analysis of `text`. An empty answer is returned as is.
    async fn analyze(&self, text: &str, task: &str) -> Result<String>;

    async fn chat_turn(&self, message: &str, history: &[ChatMessage]) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiModels {
    pub text: String,
    pub image: String,
    pub video: String,
    pub edit: String,
    pub analysis: String,
}

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: Url,
    api_key: String,
    models: GeminiModels,
    poll_interval: Duration,
}

impl fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    pub fn new(
        api_key: String,
        base_url: Url,
        models: GeminiModels,
        poll_interval: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent("devotional-pipeline/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
            models,
            poll_interval,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let g = &cfg.generator;
        let base_url = Url::parse(&g.base_url).context("invalid generator.base_url")?;
        Self::new(
            g.api_key.clone(),
            base_url,
            GeminiModels {
                text: g.text_model.clone(),
                image: g.image_model.clone(),
                video: g.video_model.clone(),
                edit: g.edit_model.clone(),
                analysis: g.analysis_model.clone(),
            },
            Duration::from_millis(g.video_poll_interval_ms),
        )
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .context("invalid generator base URL")?;
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("x-goog-api-key", &self.api_key);
        if let Some(body) = body {
            builder = builder.header("Content-Type", "application/json").json(body);
        }
        builder.build().context("failed to build generator request")
    }

    async fn execute<R: DeserializeOwned>(&self, request: reqwest::Request) -> Result<R> {
        debug!(url = %request.url(), "sending generator request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach generator")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from generator: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("generator error {}: {}", status, body));
        }
        res.json().await.context("invalid generator response")
    }

    async fn generate_content(&self, model: &str, body: &Value) -> Result<GenerateContentResponse> {
        let path = format!("v1beta/models/{model}:generateContent");
        let request = self.build_request(Method::POST, &path, Some(body))?;
        self.execute(request).await
    }
}

#[async_trait]
impl GeneratorClient for GeminiClient {
    #[instrument(skip_all, fields(format = %req.format, theme = %req.theme))]
    async fn generate_devotional(&self, req: &DevotionalRequest) -> Result<GeneratedContent> {
        let body = build_devotional_request(req);
        let resp = self.generate_content(&self.models.text, &body).await?;
        let text = resp
            .text()
            .ok_or_else(|| anyhow!("generator returned an empty response"))?;
        parse_devotional(&text, req.format)
    }

    #[instrument(skip_all, fields(size = size.as_str()))]
    async fn generate_image(&self, prompt: &str, size: ImageSize) -> Result<String> {
        let body = build_image_request(prompt, size);
        let resp = self.generate_content(&self.models.image, &body).await?;
        resp.inline_data_uri()
            .ok_or_else(|| anyhow!("no image returned"))
    }

    #[instrument(skip_all, fields(aspect = aspect.as_str(), seeded = seed_image.is_some()))]
    async fn generate_video(
        &self,
        prompt: &str,
        aspect: AspectRatio,
        seed_image: Option<&str>,
    ) -> Result<String> {
        let body = build_video_request(prompt, aspect, seed_image)?;
        let path = format!("v1beta/models/{}:predictLongRunning", self.models.video);
        let request = self.build_request(Method::POST, &path, Some(&body))?;
        let mut operation: Operation = self.execute(request).await?;
        info!(operation = %operation.name, "video generation started");

        while !operation.done {
            tokio::time::sleep(self.poll_interval).await;
            let request = self.build_request(Method::GET, &format!("v1beta/{}", operation.name), None)?;
            operation = self.execute(request).await?;
        }

        if let Some(err) = &operation.error {
            return Err(anyhow!("video generation failed: {}", err.message));
        }
        operation
            .video_uri()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("video operation finished without a video"))
    }

    #[instrument(skip_all)]
    async fn edit_image(&self, image: &str, prompt: &str) -> Result<String> {
        let body = build_edit_image_request(image, prompt)?;
        let resp = self.generate_content(&self.models.edit, &body).await?;
        resp.inline_data_uri()
            .ok_or_else(|| anyhow!("editing failed: no image returned"))
    }

    #[instrument(skip_all, fields(chars = text.len()))]
    async fn analyze(&self, text: &str, task: &str) -> Result<String> {
        let body = build_analysis_request(text, task);
        let resp = self.generate_content(&self.models.analysis, &body).await?;
        Ok(resp.text().unwrap_or_default())
    }

    #[instrument(skip_all, fields(turns = history.len()))]
    async fn chat_turn(&self, message: &str, history: &[ChatMessage]) -> Result<String> {
        let body = build_chat_request(message, history);
        let resp = self.generate_content(&self.models.text, &body).await?;
        resp.text()
            .ok_or_else(|| anyhow!("generator returned an empty response"))
    }
}

pub fn build_devotional_prompt(req: &DevotionalRequest) -> String {
    let mut prompt = format!(
        "Generate a {} Christian {} focused on the theme of {}.\nTarget audience: {:?}. Tone: {:?}.\n",
        req.length.label(),
        req.format.label(),
        req.theme,
        req.audience,
        req.style,
    );
    if req.verse.trim().is_empty() {
        prompt.push_str("Choose a relevant Bible verse.\n");
    } else {
        prompt.push_str(&format!("Base it on the Bible verse: {}.\n", req.verse.trim()));
    }
    if let Some(instruction) = req.custom_instruction.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("ADJUSTMENT REQUEST: {}\n", instruction.trim()));
    }
    prompt.push_str("Provide practical application and a clear call to action.");
    prompt
}

pub fn build_devotional_request(req: &DevotionalRequest) -> Value {
    json!({
        "systemInstruction": { "parts": [ { "text": SYSTEM_INSTRUCTION } ] },
        "contents": [
            { "role": "user", "parts": [ { "text": build_devotional_prompt(req) } ] }
        ],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": {
                "type": "OBJECT",
                "properties": {
                    "title": { "type": "STRING" },
                    "bibleVerse": { "type": "STRING" },
                    "devotionalMessage": { "type": "STRING" },
                    "practicalApplication": { "type": "STRING" },
                    "callToAction": { "type": "STRING" },
                    "hashtags": { "type": "ARRAY", "items": { "type": "STRING" } }
                },
                "required": [
                    "title",
                    "bibleVerse",
                    "devotionalMessage",
                    "practicalApplication",
                    "callToAction"
                ]
            }
        }
    })
}

pub fn build_image_request(prompt: &str, size: ImageSize) -> Value {
    json!({
        "contents": [ { "role": "user", "parts": [ { "text": prompt } ] } ],
        "generationConfig": {
            "responseModalities": ["IMAGE"],
            "imageConfig": { "aspectRatio": "1:1", "imageSize": size.as_str() }
        }
    })
}

/// Split a `data:<mime>;base64,<bytes>` URI into mime type and payload.
fn split_data_uri(uri: &str) -> Option<(&str, &str)> {
    let (header, data) = uri.strip_prefix("data:")?.split_once(',')?;
    let mime = header.strip_suffix(";base64").unwrap_or(header);
    if mime.is_empty() || data.is_empty() {
        return None;
    }
    Some((mime, data))
}

/// `seed_image` must be a `data:<mime>;base64,<bytes>` URI.
pub fn build_video_request(
    prompt: &str,
    aspect: AspectRatio,
    seed_image: Option<&str>,
) -> Result<Value> {
    let mut instance = json!({ "prompt": prompt });
    if let Some(uri) = seed_image {
        let (mime, data) =
            split_data_uri(uri).ok_or_else(|| anyhow!("seed image must be a base64 data URI"))?;
        instance["image"] = json!({ "bytesBase64Encoded": data, "mimeType": mime });
    }
    Ok(json!({
        "instances": [instance],
        "parameters": {
            "aspectRatio": aspect.as_str(),
            "resolution": "720p",
            "sampleCount": 1
        }
    }))
}

/// The image goes first, the edit instruction second.
pub fn build_edit_image_request(image: &str, prompt: &str) -> Result<Value> {
    let (mime, data) =
        split_data_uri(image).ok_or_else(|| anyhow!("image to edit must be a base64 data URI"))?;
    Ok(json!({
        "contents": [ {
            "role": "user",
            "parts": [
                { "inlineData": { "data": data, "mimeType": mime } },
                { "text": prompt }
            ]
        } ],
        "generationConfig": { "responseModalities": ["IMAGE"] }
    }))
}

pub fn build_analysis_request(text: &str, task: &str) -> Value {
    json!({
        "systemInstruction": { "parts": [ { "text": SYSTEM_INSTRUCTION } ] },
        "contents": [
            { "role": "user", "parts": [ { "text": format!("TEXT: {text}\n\nTASK: {task}") } ] }
        ]
    })
}

pub fn build_chat_request(message: &str, history: &[ChatMessage]) -> Value {
    let mut contents: Vec<Value> = history
        .iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::User => "user",
                ChatRole::Model => "model",
            };
            json!({ "role": role, "parts": [ { "text": m.text } ] })
        })
        .collect();
    contents.push(json!({ "role": "user", "parts": [ { "text": message } ] }));
    json!({
        "systemInstruction": { "parts": [ { "text": SYSTEM_INSTRUCTION } ] },
        "contents": contents,
        "generationConfig": { "temperature": 0.7 }
    })
}

/// Decode the model's JSON answer and stamp it with the requested format.
pub fn parse_devotional(text: &str, format: Format) -> Result<GeneratedContent> {
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let mut content: GeneratedContent =
        serde_json::from_str(trimmed).context("generator returned malformed devotional JSON")?;
    content.format = Some(format);
    Ok(content)
}
