//! Ad hoc generation outside the pipeline: devotionals, images, videos, image
//! edits and text analysis, plus the pastor chat.
//!
//! Nothing here is persisted; callers decide whether to keep a result as a draft
//! or in the library.

use anyhow::{bail, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

use crate::generator::{AspectRatio, DevotionalRequest, GeneratorClient, ImageSize};
use crate::model::{ChatMessage, ChatRole, GeneratedContent};

const DEFAULT_ANIMATION_PROMPT: &str = "Animate this sacred scene";

#[derive(Clone)]
pub struct Studio {
    generator: Arc<dyn GeneratorClient>,
}

impl Studio {
    pub fn new(generator: Arc<dyn GeneratorClient>) -> Self {
        Self { generator }
    }

    #[instrument(skip_all, fields(format = %req.format, theme = %req.theme))]
    pub async fn compose(&self, req: &DevotionalRequest) -> Result<GeneratedContent> {
        self.generator.generate_devotional(req).await
    }

    #[instrument(skip_all, fields(size = size.as_str()))]
    pub async fn image(&self, prompt: &str, size: ImageSize) -> Result<String> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            bail!("image prompt must be non-empty");
        }
        self.generator.generate_image(prompt, size).await
    }

    /// Generate a video, optionally animating `seed_image` (a `data:` URI). A
    /// seeded video may omit the prompt.
    #[instrument(skip_all, fields(aspect = aspect.as_str(), seeded = seed_image.is_some()))]
    pub async fn video(
        &self,
        prompt: &str,
        aspect: AspectRatio,
        seed_image: Option<&str>,
    ) -> Result<String> {
        let prompt = match (prompt.trim(), seed_image) {
            ("", Some(_)) => DEFAULT_ANIMATION_PROMPT,
            ("", None) => bail!("video prompt must be non-empty without a seed image"),
            (p, _) => p,
        };
        self.generator.generate_video(prompt, aspect, seed_image).await
    }

    #[instrument(skip_all)]
    pub async fn edit_image(&self, image: &str, prompt: &str) -> Result<String> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            bail!("edit instruction must be non-empty");
        }
        self.generator.edit_image(image, prompt).await
    }

    /// Run `task` over `text`, e.g. summarising a sermon or checking a draft.
    #[instrument(skip_all)]
    pub async fn analyze(&self, text: &str, task: &str) -> Result<String> {
        if text.trim().is_empty() || task.trim().is_empty() {
            bail!("analysis needs both text and a task");
        }
        self.generator.analyze(text, task.trim()).await
    }

    /// One pastor chat turn. On success both the question and the reply are
    /// appended to `history`; on failure `history` is left as it was.
    #[instrument(skip_all, fields(turns = history.len()))]
    pub async fn ask(&self, history: &mut Vec<ChatMessage>, message: &str) -> Result<ChatMessage> {
        let reply = self.generator.chat_turn(message, history).await?;
        history.push(ChatMessage {
            role: ChatRole::User,
            text: message.to_string(),
            timestamp: Utc::now(),
        });
        let reply = ChatMessage {
            role: ChatRole::Model,
            text: reply,
            timestamp: Utc::now(),
        };
        history.push(reply.clone());
        Ok(reply)
    }
}
