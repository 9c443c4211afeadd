//! Content pipeline: calendar entries are expanded into one item per requested
//! format, generated, reviewed, approved and published into the library.
//!
//! ```text
//! Scheduled (calendar entry) -> Generating -> Ready | Failed
//!                                             Ready -> Approved -> published (moved to library)
//!                                             Failed -> retried as a new Generating item
//! ```
//!
//! Every mutating operation takes the caller's session and requires an admin.

use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::{require_admin, AuthError};
use crate::generator::{AspectRatio, DevotionalRequest, GeneratorClient, ImageSize};
use crate::library::Library;
use crate::model::{
    CalendarEntry, Format, FormatKind, GeneratedContent, NewCalendarEntry, PipelineItem,
    PipelineStatus, Session, Theme,
};
use crate::store::{Collection, Store, StoreError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("no {kind} with id {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("cannot {action} an item that is {from}")]
    InvalidTransition {
        from: PipelineStatus,
        action: &'static str,
    },
    #[error("{0}")]
    Validation(String),
    #[error("generation failed: {0}")]
    Generation(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// A format whose generation failed during expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationFailure {
    pub item_id: String,
    pub format: Format,
    pub message: String,
}

/// Outcome of expanding one calendar entry.
#[derive(Debug, Clone, Default)]
pub struct ExpansionReport {
    pub entry_id: String,
    /// Final state of every item created, in format order.
    pub items: Vec<PipelineItem>,
    pub failures: Vec<GenerationFailure>,
}

impl ExpansionReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of one [`Pipeline::process_due`] run.
#[derive(Debug, Default)]
pub struct DueRun {
    pub expanded: Vec<ExpansionReport>,
    /// Due entries that could not be expanded. They stay on the calendar.
    pub skipped: Vec<(String, PipelineError)>,
}

/// One generation attempt for a persisted placeholder.
struct Attempt {
    /// The settled item, or `None` when it was discarded while generating.
    item: Option<PipelineItem>,
    failure: Option<String>,
}

const IMAGE_CAPTION: &str = "Prophetic Concept Manifested";
const VIDEO_CAPTION: &str = "Veo Cinematic testimony";

#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    library: Library,
    generator: Arc<dyn GeneratorClient>,
}

impl Pipeline {
    pub fn new(store: Store, generator: Arc<dyn GeneratorClient>) -> Self {
        Self {
            library: Library::new(store.clone()),
            store,
            generator,
        }
    }

    pub async fn calendar(&self) -> Result<Vec<CalendarEntry>> {
        Ok(self.store.list(Collection::Calendar).await?)
    }

    pub async fn items(&self) -> Result<Vec<PipelineItem>> {
        Ok(self.store.list(Collection::Pipeline).await?)
    }

    pub async fn item(&self, id: &str) -> Result<Option<PipelineItem>> {
        Ok(self.store.get(Collection::Pipeline, id).await?)
    }

    async fn require_item(&self, id: &str) -> Result<PipelineItem> {
        self.item(id).await?.ok_or_else(|| PipelineError::NotFound {
            kind: "pipeline item",
            id: id.to_string(),
        })
    }

    #[instrument(skip_all, fields(date = %new.date, theme = %new.theme))]
    pub async fn schedule(
        &self,
        session: Option<&Session>,
        new: NewCalendarEntry,
    ) -> Result<CalendarEntry> {
        require_admin(session)?;
        let verse = new.verse.trim();
        if verse.is_empty() {
            return Err(PipelineError::Validation("verse must be non-empty".into()));
        }
        let mut formats: Vec<Format> = Vec::with_capacity(new.formats.len());
        for format in new.formats {
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        if formats.is_empty() {
            return Err(PipelineError::Validation(
                "at least one format must be requested".into(),
            ));
        }
        let entry = CalendarEntry {
            id: Uuid::new_v4().to_string(),
            date: new.date,
            theme: new.theme,
            verse: verse.to_string(),
            requested_formats: formats,
        };
        self.store.append(Collection::Calendar, &entry).await?;
        info!(id = %entry.id, formats = entry.requested_formats.len(), "calendar entry scheduled");
        Ok(entry)
    }

    pub async fn unschedule(&self, session: Option<&Session>, entry_id: &str) -> Result<bool> {
        require_admin(session)?;
        let removed = self
            .store
            .remove::<CalendarEntry>(Collection::Calendar, entry_id)
            .await?;
        Ok(removed > 0)
    }

    /// Generate every requested format of a calendar entry, one at a time, then
    /// delete the entry. Failed formats leave a `Failed` item and are listed in
    /// the report; items that succeeded are kept either way.
    #[instrument(skip_all, fields(entry_id = %entry_id))]
    pub async fn expand(&self, session: Option<&Session>, entry_id: &str) -> Result<ExpansionReport> {
        require_admin(session)?;
        let entry: CalendarEntry = self
            .store
            .get(Collection::Calendar, entry_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                kind: "calendar entry",
                id: entry_id.to_string(),
            })?;
        if entry.requested_formats.is_empty() {
            return Err(PipelineError::Validation(format!(
                "calendar entry {} requests no formats",
                entry.id
            )));
        }

        let mut report = ExpansionReport {
            entry_id: entry.id.clone(),
            ..Default::default()
        };
        let mut created = Vec::with_capacity(entry.requested_formats.len());

        if let Err(err) = self.expand_formats(&entry, &mut report, &mut created).await {
            // Leave no half-expanded entry behind; expanding it again starts clean.
            self.abandon(&created).await;
            return Err(err);
        }
        info!(
            items = report.items.len(),
            failures = report.failures.len(),
            "calendar entry expanded"
        );
        Ok(report)
    }

    async fn expand_formats(
        &self,
        entry: &CalendarEntry,
        report: &mut ExpansionReport,
        created: &mut Vec<String>,
    ) -> Result<()> {
        for &format in &entry.requested_formats {
            let placeholder = placeholder(&entry.id, Some(entry.theme), &entry.verse, format, None);
            // Persist before generating so viewers see work in progress.
            self.store.append(Collection::Pipeline, &placeholder).await?;
            created.push(placeholder.id.clone());

            let attempt = self.attempt(&placeholder, entry.theme).await?;
            if let Some(message) = attempt.failure {
                report.failures.push(GenerationFailure {
                    item_id: placeholder.id.clone(),
                    format,
                    message,
                });
            }
            report.items.extend(attempt.item);
        }

        self.store
            .remove::<CalendarEntry>(Collection::Calendar, &entry.id)
            .await?;
        Ok(())
    }

    async fn abandon(&self, created: &[String]) {
        if created.is_empty() {
            return;
        }
        let removed = self
            .store
            .remove_where(Collection::Pipeline, |it: &PipelineItem| {
                created.contains(&it.id)
            })
            .await;
        match removed {
            Ok(n) => warn!(removed = n, "expansion aborted; its items were removed"),
            Err(err) => error!(?err, ids = ?created, "expansion aborted; its items could not be removed"),
        }
    }

    /// Expand every calendar entry dated on or before `today`, oldest first.
    /// Entries that cannot be expanded are skipped and reported; store and
    /// session errors end the run.
    #[instrument(skip_all, fields(today = %today))]
    pub async fn process_due(&self, session: Option<&Session>, today: NaiveDate) -> Result<DueRun> {
        require_admin(session)?;
        let mut due: Vec<CalendarEntry> = self
            .calendar()
            .await?
            .into_iter()
            .filter(|e| e.date <= today)
            .collect();
        due.sort_by_key(|e| e.date);

        let mut run = DueRun::default();
        for entry in due {
            match self.expand(session, &entry.id).await {
                Ok(report) => run.expanded.push(report),
                Err(err @ (PipelineError::Validation(_) | PipelineError::NotFound { .. })) => {
                    warn!(entry_id = %entry.id, error = %err, "due entry skipped");
                    run.skipped.push((entry.id, err));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(run)
    }

    /// Generate a `Failed` item again. The failed item is replaced by a new
    /// item for the same entry, format, theme and verse; the returned item is
    /// `Ready` or, when generation failed again, `Failed`.
    #[instrument(skip_all, fields(item_id = %item_id))]
    pub async fn retry(&self, session: Option<&Session>, item_id: &str) -> Result<PipelineItem> {
        require_admin(session)?;
        let failed = self.require_item(item_id).await?;
        if failed.status != PipelineStatus::Failed {
            return Err(PipelineError::InvalidTransition {
                from: failed.status,
                action: "retry",
            });
        }

        let theme = failed.theme.unwrap_or(Theme::Hope);
        let fresh = placeholder(
            &failed.calendar_id,
            Some(theme),
            &failed.content.bible_verse,
            failed.format,
            failed.platforms.clone(),
        );
        self.store.append(Collection::Pipeline, &fresh).await?;
        let replaced = self
            .store
            .remove_where(Collection::Pipeline, |it: &PipelineItem| {
                it.id == failed.id && it.status == PipelineStatus::Failed
            })
            .await?;
        if replaced == 0 {
            self.store
                .remove::<PipelineItem>(Collection::Pipeline, &fresh.id)
                .await?;
            return Err(PipelineError::NotFound {
                kind: "failed pipeline item",
                id: item_id.to_string(),
            });
        }
        info!(new_id = %fresh.id, format = %fresh.format, "retrying failed item");

        let attempt = self.attempt(&fresh, theme).await?;
        attempt.item.ok_or_else(|| PipelineError::NotFound {
            kind: "pipeline item",
            id: fresh.id.clone(),
        })
    }

    /// Regenerate a `Ready` item's payload with free-text adjustment
    /// instructions. The item stays `Ready`.
    #[instrument(skip_all, fields(item_id = %item_id))]
    pub async fn refine(
        &self,
        session: Option<&Session>,
        item_id: &str,
        instruction: &str,
    ) -> Result<PipelineItem> {
        require_admin(session)?;
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(PipelineError::Validation(
                "refinement instruction must be non-empty".into(),
            ));
        }
        let item = self.require_item(item_id).await?;
        if item.status != PipelineStatus::Ready {
            return Err(PipelineError::InvalidTransition {
                from: item.status,
                action: "refine",
            });
        }

        let theme = item.theme.unwrap_or(Theme::Hope);
        let content = self
            .generate(
                theme,
                &item.content.bible_verse,
                item.format,
                Some(instruction),
                Some(&item.content),
            )
            .await
            .map_err(|err| PipelineError::Generation(format!("{err:#}")))?;

        let updated = self
            .store
            .modify(Collection::Pipeline, item_id, |it: &mut PipelineItem| {
                if it.status != PipelineStatus::Ready {
                    return false;
                }
                it.content = content;
                true
            })
            .await?;
        updated.ok_or_else(|| PipelineError::NotFound {
            kind: "pipeline item",
            id: item_id.to_string(),
        })
    }

    #[instrument(skip_all, fields(item_id = %item_id))]
    pub async fn approve(&self, session: Option<&Session>, item_id: &str) -> Result<PipelineItem> {
        require_admin(session)?;
        self.advance(item_id, PipelineStatus::Approved, "approve").await
    }

    /// Record the distribution targets for an item before it is published.
    pub async fn set_platforms(
        &self,
        session: Option<&Session>,
        item_id: &str,
        platforms: Vec<String>,
    ) -> Result<PipelineItem> {
        require_admin(session)?;
        let platforms: Vec<String> = platforms
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let updated = self
            .store
            .modify(Collection::Pipeline, item_id, |it: &mut PipelineItem| {
                it.platforms = if platforms.is_empty() {
                    None
                } else {
                    Some(platforms)
                };
                true
            })
            .await?;
        updated.ok_or_else(|| PipelineError::NotFound {
            kind: "pipeline item",
            id: item_id.to_string(),
        })
    }

    /// Publish an `Approved` item: its content is saved to the library (upsert
    /// by natural key) and the item leaves the pipeline. Returns the item as it
    /// was when published.
    #[instrument(skip_all, fields(item_id = %item_id))]
    pub async fn publish(&self, session: Option<&Session>, item_id: &str) -> Result<PipelineItem> {
        require_admin(session)?;
        let mut item = self.require_item(item_id).await?;
        if item.status != PipelineStatus::Approved {
            return Err(PipelineError::InvalidTransition {
                from: item.status,
                action: "publish",
            });
        }
        self.library.save_devotional(&item.content).await?;
        self.store
            .remove::<PipelineItem>(Collection::Pipeline, item_id)
            .await?;
        item.posted_at = Some(Utc::now());
        info!(
            title = %item.content.title,
            platforms = ?item.platforms,
            "published to library"
        );
        Ok(item)
    }

    /// Remove an item in any state. Returns whether it existed.
    #[instrument(skip_all, fields(item_id = %item_id))]
    pub async fn discard(&self, session: Option<&Session>, item_id: &str) -> Result<bool> {
        require_admin(session)?;
        let removed = self
            .store
            .remove::<PipelineItem>(Collection::Pipeline, item_id)
            .await?;
        Ok(removed > 0)
    }

    async fn advance(
        &self,
        item_id: &str,
        next: PipelineStatus,
        action: &'static str,
    ) -> Result<PipelineItem> {
        let item = self.require_item(item_id).await?;
        if !item.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: item.status,
                action,
            });
        }
        let from = item.status;
        let updated = self
            .store
            .modify(Collection::Pipeline, item_id, |it: &mut PipelineItem| {
                if it.status != from {
                    return false;
                }
                it.status = next;
                true
            })
            .await?;
        updated.ok_or_else(|| PipelineError::NotFound {
            kind: "pipeline item",
            id: item_id.to_string(),
        })
    }

    /// Generate the payload for a persisted placeholder and settle it.
    async fn attempt(&self, placeholder: &PipelineItem, theme: Theme) -> Result<Attempt> {
        let format = placeholder.format;
        let outcome = self
            .generate(theme, &placeholder.content.bible_verse, format, None, None)
            .await;
        let failure = outcome.as_ref().err().map(|err| format!("{err:#}"));
        if let Some(message) = &failure {
            warn!(item_id = %placeholder.id, %format, error = %message, "generation failed");
        }
        let item = self.settle(&placeholder.id, outcome).await?;
        if item.is_none() {
            warn!(item_id = %placeholder.id, "item discarded during generation; result dropped");
        }
        Ok(Attempt { item, failure })
    }

    /// Write a generation result onto its item. Results for items that were
    /// discarded, or are no longer generating, are dropped.
    async fn settle(
        &self,
        item_id: &str,
        outcome: anyhow::Result<GeneratedContent>,
    ) -> Result<Option<PipelineItem>> {
        let updated = self
            .store
            .modify(Collection::Pipeline, item_id, |it: &mut PipelineItem| {
                if it.status != PipelineStatus::Generating {
                    return false;
                }
                match outcome {
                    Ok(content) => {
                        it.status = PipelineStatus::Ready;
                        it.content = content;
                    }
                    Err(err) => {
                        it.status = PipelineStatus::Failed;
                        it.error = Some(format!("{err:#}"));
                    }
                }
                true
            })
            .await?;
        Ok(updated)
    }

    /// Route one format to the matching generator call. `adjustment` and
    /// `existing` are set when refining.
    async fn generate(
        &self,
        theme: Theme,
        verse: &str,
        format: Format,
        adjustment: Option<&str>,
        existing: Option<&GeneratedContent>,
    ) -> anyhow::Result<GeneratedContent> {
        let with_adjustment = |prompt: String| match adjustment {
            Some(a) => format!("{prompt} ADJUSTMENT: {a}"),
            None => prompt,
        };
        match format.kind() {
            FormatKind::Image => {
                let prompt = with_adjustment(format!("Sacred spiritual art of {theme}. Verse: {verse}"));
                let url = self.generator.generate_image(&prompt, ImageSize::OneK).await?;
                Ok(media_content(
                    format!("{theme} Vision"),
                    IMAGE_CAPTION,
                    verse,
                    format,
                    Some(url),
                    None,
                ))
            }
            FormatKind::Video => {
                let prompt = with_adjustment(format!("Cinematic reflection of {theme}. {verse}"));
                let url = self
                    .generator
                    .generate_video(&prompt, AspectRatio::Landscape, None)
                    .await?;
                Ok(media_content(
                    format!("{theme} Motion"),
                    VIDEO_CAPTION,
                    verse,
                    format,
                    None,
                    Some(url),
                ))
            }
            FormatKind::Text => {
                let mut req = DevotionalRequest::new(theme, verse, format);
                if let Some(a) = adjustment {
                    let body = existing.map(|c| c.devotional_message.as_str()).unwrap_or("");
                    req = req.with_instruction(format!("EXISTING CONTENT: {body}. ADJUSTMENT: {a}"));
                }
                self.generator.generate_devotional(&req).await
            }
        }
    }
}

fn placeholder(
    calendar_id: &str,
    theme: Option<Theme>,
    verse: &str,
    format: Format,
    platforms: Option<Vec<String>>,
) -> PipelineItem {
    PipelineItem {
        id: Uuid::new_v4().to_string(),
        calendar_id: calendar_id.to_string(),
        format,
        theme,
        status: PipelineStatus::Generating,
        content: GeneratedContent::placeholder(verse),
        error: None,
        posted_at: None,
        platforms,
    }
}

fn media_content(
    title: String,
    caption: &str,
    verse: &str,
    format: Format,
    image_url: Option<String>,
    video_url: Option<String>,
) -> GeneratedContent {
    GeneratedContent {
        title,
        bible_verse: verse.to_string(),
        devotional_message: caption.to_string(),
        practical_application: String::new(),
        call_to_action: String::new(),
        hashtags: None,
        image_url,
        video_url,
        format: Some(format),
    }
}

