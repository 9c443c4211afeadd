use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDate, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use devotional_pipeline::auth::AuthError;
use devotional_pipeline::generator::{AspectRatio, DevotionalRequest, GeneratorClient, ImageSize};
use devotional_pipeline::library::Library;
use devotional_pipeline::model::{
    CalendarEntry, ChatMessage, Format, GeneratedContent, NewCalendarEntry, PipelineItem,
    PipelineStatus, Role, Session, Theme, User,
};
use devotional_pipeline::pipeline::{Pipeline, PipelineError};
use devotional_pipeline::store::{Collection, Store, StoreError};

/// Store mutation made while a generation call is in flight.
#[derive(Clone)]
enum Interference {
    /// Remove every generating item.
    DiscardGenerating(Store),
    /// Overwrite the calendar with something that no longer decodes.
    CorruptCalendar(Store),
}

#[derive(Clone, Default)]
struct RecordingGenerator {
    devotionals: Arc<Mutex<VecDeque<Result<GeneratedContent>>>>,
    media: Arc<Mutex<VecDeque<Result<String>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    interference: Option<Interference>,
}

impl RecordingGenerator {
    fn new() -> Self {
        Self::default()
    }

    async fn queue_devotional(&self, reply: Result<GeneratedContent>) {
        self.devotionals.lock().await.push_back(reply);
    }

    async fn queue_media(&self, reply: Result<String>) {
        self.media.lock().await.push_back(reply);
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn interfere(&self) {
        match &self.interference {
            Some(Interference::DiscardGenerating(store)) => {
                store
                    .remove_where(Collection::Pipeline, |it: &PipelineItem| {
                        it.status == PipelineStatus::Generating
                    })
                    .await
                    .unwrap();
            }
            Some(Interference::CorruptCalendar(store)) => {
                store
                    .put_value(Collection::Calendar, &"garbage")
                    .await
                    .unwrap();
            }
            None => {}
        }
    }
}

#[async_trait::async_trait]
impl GeneratorClient for RecordingGenerator {
    async fn generate_devotional(&self, req: &DevotionalRequest) -> Result<GeneratedContent> {
        self.calls.lock().await.push(format!(
            "devotional {} {} | {}",
            req.format,
            req.verse,
            req.custom_instruction.as_deref().unwrap_or("")
        ));
        self.interfere().await;
        let queued = self.devotionals.lock().await.pop_front();
        queued.unwrap_or_else(|| {
            let mut c = content(&format!("{} devotional", req.theme), &req.verse);
            c.format = Some(req.format);
            Ok(c)
        })
    }

    async fn generate_image(&self, prompt: &str, size: ImageSize) -> Result<String> {
        self.calls
            .lock()
            .await
            .push(format!("image {} | {prompt}", size.as_str()));
        self.interfere().await;
        let queued = self.media.lock().await.pop_front();
        queued.unwrap_or_else(|| Ok("data:image/png;base64,AAAA".into()))
    }

    async fn generate_video(
        &self,
        prompt: &str,
        aspect: AspectRatio,
        _seed_image: Option<&str>,
    ) -> Result<String> {
        self.calls
            .lock()
            .await
            .push(format!("video {} | {prompt}", aspect.as_str()));
        self.interfere().await;
        let queued = self.media.lock().await.pop_front();
        queued.unwrap_or_else(|| Ok("https://media.example/video.mp4".into()))
    }

    async fn edit_image(&self, _image: &str, prompt: &str) -> Result<String> {
        self.calls.lock().await.push(format!("edit | {prompt}"));
        Ok("data:image/png;base64,BBBB".into())
    }

    async fn analyze(&self, _text: &str, task: &str) -> Result<String> {
        self.calls.lock().await.push(format!("analyze | {task}"));
        Ok(String::new())
    }

    async fn chat_turn(&self, message: &str, _history: &[ChatMessage]) -> Result<String> {
        self.calls.lock().await.push(format!("chat | {message}"));
        Ok("Peace be with you.".into())
    }
}

fn content(title: &str, verse: &str) -> GeneratedContent {
    GeneratedContent {
        title: title.into(),
        bible_verse: verse.into(),
        devotional_message: "The Lord is my shepherd; I shall not want.".into(),
        practical_application: "Name one need and entrust it to God.".into(),
        call_to_action: "Pray Psalm 23 aloud.".into(),
        hashtags: Some(vec!["#Hope".into()]),
        image_url: None,
        video_url: None,
        format: None,
    }
}

fn session_for(role: Role, expires_in: Duration) -> Session {
    Session {
        user: User {
            id: "u-1".into(),
            email: "pastor@example.com".into(),
            password_hash: String::new(),
            role,
            is_verified: true,
            is_2fa_enabled: false,
            created_at: Utc::now(),
        },
        token: "token".into(),
        expires_at: Utc::now() + expires_in,
    }
}

fn admin() -> Session {
    session_for(Role::Admin, Duration::hours(1))
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn entry(day: &str, theme: Theme, verse: &str, formats: &[Format]) -> NewCalendarEntry {
    NewCalendarEntry {
        date: date(day),
        theme,
        verse: verse.into(),
        formats: formats.to_vec(),
    }
}

async fn setup() -> (Store, RecordingGenerator, Pipeline) {
    let store = Store::in_memory().await.unwrap();
    let generator = RecordingGenerator::new();
    let pipeline = Pipeline::new(store.clone(), Arc::new(generator.clone()));
    (store, generator, pipeline)
}

/// Schedule and expand a single-format entry, returning the resulting item.
async fn ready_item(pipeline: &Pipeline, format: Format) -> PipelineItem {
    let s = admin();
    let e = pipeline
        .schedule(Some(&s), entry("2026-03-01", Theme::Courage, "Joshua 1:9", &[format]))
        .await
        .unwrap();
    let report = pipeline.expand(Some(&s), &e.id).await.unwrap();
    assert!(report.is_success());
    report.items.into_iter().next().unwrap()
}

#[tokio::test]
async fn expand_generates_every_format_and_consumes_entry() {
    let (_store, generator, pipeline) = setup().await;
    let s = admin();
    let e = pipeline
        .schedule(
            Some(&s),
            entry("2026-03-01", Theme::Hope, "Psalm 23:1", &[Format::Sms, Format::ImagePrompt]),
        )
        .await
        .unwrap();

    let report = pipeline.expand(Some(&s), &e.id).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.entry_id, e.id);

    let items = pipeline.items().await.unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i.status == PipelineStatus::Ready));
    assert!(items.iter().all(|i| i.calendar_id == e.id));
    assert_eq!(items[0].format, Format::Sms);
    assert_eq!(items[0].theme, Some(Theme::Hope));
    assert_eq!(items[1].format, Format::ImagePrompt);
    assert_eq!(items[1].content.title, "Hope Vision");
    assert_eq!(items[1].content.devotional_message, "Prophetic Concept Manifested");
    assert_eq!(items[1].content.bible_verse, "Psalm 23:1");
    assert_eq!(
        items[1].content.image_url.as_deref(),
        Some("data:image/png;base64,AAAA")
    );
    assert!(pipeline.calendar().await.unwrap().is_empty());

    let calls = generator.calls().await;
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with("devotional SMS Psalm 23:1"));
    assert_eq!(
        calls[1],
        "image 1K | Sacred spiritual art of Hope. Verse: Psalm 23:1"
    );
}

#[tokio::test]
async fn failed_format_is_reported_and_earlier_items_survive() {
    let (_store, generator, pipeline) = setup().await;
    generator.queue_media(Err(anyhow!("quota exhausted"))).await;
    let s = admin();
    let e = pipeline
        .schedule(
            Some(&s),
            entry("2026-03-01", Theme::Hope, "Psalm 23:1", &[Format::Sms, Format::ImagePrompt]),
        )
        .await
        .unwrap();

    let report = pipeline.expand(Some(&s), &e.id).await.unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].format, Format::ImagePrompt);
    assert!(report.failures[0].message.contains("quota exhausted"));

    let items = pipeline.items().await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].status, PipelineStatus::Ready);
    assert_eq!(items[1].status, PipelineStatus::Failed);
    assert_eq!(items[1].id, report.failures[0].item_id);
    assert!(items[1].error.as_deref().unwrap().contains("quota exhausted"));
    assert!(pipeline.calendar().await.unwrap().is_empty());
}

#[tokio::test]
async fn entry_is_deleted_even_when_every_format_fails() {
    let (_store, generator, pipeline) = setup().await;
    generator.queue_devotional(Err(anyhow!("model overloaded"))).await;
    generator.queue_media(Err(anyhow!("video backend down"))).await;
    let s = admin();
    let e = pipeline
        .schedule(
            Some(&s),
            entry("2026-03-02", Theme::Faith, "Hebrews 11:1", &[Format::Email, Format::VideoScript]),
        )
        .await
        .unwrap();

    let report = pipeline.expand(Some(&s), &e.id).await.unwrap();
    assert_eq!(report.items.len(), 2);
    assert_eq!(report.failures.len(), 2);

    let items = pipeline.items().await.unwrap();
    assert!(items.iter().all(|i| i.status == PipelineStatus::Failed));
    assert!(pipeline.calendar().await.unwrap().is_empty());

    // Expanding again finds nothing to expand.
    let err = pipeline.expand(Some(&s), &e.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));
}

#[tokio::test]
async fn video_format_routes_to_video_generation() {
    let (_store, generator, pipeline) = setup().await;
    let item = ready_item(&pipeline, Format::VideoScript).await;
    assert_eq!(item.content.title, "Courage Motion");
    assert_eq!(item.content.devotional_message, "Veo Cinematic testimony");
    assert_eq!(
        item.content.video_url.as_deref(),
        Some("https://media.example/video.mp4")
    );
    assert_eq!(
        generator.calls().await,
        vec!["video 16:9 | Cinematic reflection of Courage. Joshua 1:9".to_string()]
    );
}

#[tokio::test]
async fn result_for_discarded_item_is_dropped() {
    let store = Store::in_memory().await.unwrap();
    let generator = RecordingGenerator {
        interference: Some(Interference::DiscardGenerating(store.clone())),
        ..Default::default()
    };
    let pipeline = Pipeline::new(store.clone(), Arc::new(generator));
    let s = admin();
    let e = pipeline
        .schedule(Some(&s), entry("2026-03-01", Theme::Love, "1 John 4:8", &[Format::Sms]))
        .await
        .unwrap();

    let report = pipeline.expand(Some(&s), &e.id).await.unwrap();
    assert!(report.items.is_empty());
    assert!(report.is_success());
    assert!(pipeline.items().await.unwrap().is_empty());
    assert!(pipeline.calendar().await.unwrap().is_empty());
}

#[tokio::test]
async fn status_only_moves_forward() {
    let (_store, generator, pipeline) = setup().await;
    generator.queue_devotional(Err(anyhow!("boom"))).await;
    let s = admin();
    let e = pipeline
        .schedule(
            Some(&s),
            entry("2026-03-01", Theme::Healing, "Ephesians 2:8", &[Format::Sms, Format::Email]),
        )
        .await
        .unwrap();
    let report = pipeline.expand(Some(&s), &e.id).await.unwrap();
    let failed = report.items[0].clone();
    let ready = report.items[1].clone();
    assert_eq!(failed.status, PipelineStatus::Failed);
    assert_eq!(ready.status, PipelineStatus::Ready);

    let err = pipeline.approve(Some(&s), &failed.id).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidTransition {
            from: PipelineStatus::Failed,
            ..
        }
    ));

    let approved = pipeline.approve(Some(&s), &ready.id).await.unwrap();
    assert_eq!(approved.status, PipelineStatus::Approved);

    let err = pipeline.approve(Some(&s), &ready.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    let err = pipeline
        .refine(Some(&s), &ready.id, "make it shorter")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidTransition {
            from: PipelineStatus::Approved,
            ..
        }
    ));
}

#[tokio::test]
async fn publish_moves_approved_content_into_library() {
    let (store, _generator, pipeline) = setup().await;
    let s = admin();
    let item = ready_item(&pipeline, Format::SocialPost).await;

    let err = pipeline.publish(Some(&s), &item.id).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidTransition {
            from: PipelineStatus::Ready,
            ..
        }
    ));

    pipeline.approve(Some(&s), &item.id).await.unwrap();
    let with_platforms = pipeline
        .set_platforms(Some(&s), &item.id, vec!["facebook".into(), " ".into(), "x".into()])
        .await
        .unwrap();
    assert_eq!(
        with_platforms.platforms,
        Some(vec!["facebook".to_string(), "x".to_string()])
    );

    let published = pipeline.publish(Some(&s), &item.id).await.unwrap();
    assert!(published.posted_at.is_some());
    assert_eq!(published.status, PipelineStatus::Approved);
    assert!(pipeline.items().await.unwrap().is_empty());

    let saved = Library::new(store).saved().await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0], item.content);

    let err = pipeline.publish(Some(&s), &item.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));
}

#[tokio::test]
async fn publishing_same_content_twice_keeps_one_library_copy() {
    let (store, _generator, pipeline) = setup().await;
    let s = admin();
    for _ in 0..2 {
        let item = ready_item(&pipeline, Format::Sms).await;
        pipeline.approve(Some(&s), &item.id).await.unwrap();
        pipeline.publish(Some(&s), &item.id).await.unwrap();
    }
    assert_eq!(Library::new(store).saved().await.unwrap().len(), 1);
}

#[tokio::test]
async fn refine_text_sends_existing_content_and_adjustment() {
    let (_store, generator, pipeline) = setup().await;
    let s = admin();
    let item = ready_item(&pipeline, Format::Email).await;
    generator
        .queue_devotional(Ok(content("Courage Refined", "Joshua 1:9")))
        .await;

    let refined = pipeline
        .refine(Some(&s), &item.id, "  make it shorter ")
        .await
        .unwrap();
    assert_eq!(refined.id, item.id);
    assert_eq!(refined.status, PipelineStatus::Ready);
    assert_eq!(refined.content.title, "Courage Refined");

    let calls = generator.calls().await;
    let last = calls.last().unwrap();
    assert!(last.starts_with("devotional Email Joshua 1:9"));
    assert!(last.contains(&format!(
        "EXISTING CONTENT: {}. ADJUSTMENT: make it shorter",
        item.content.devotional_message
    )));

    let err = pipeline.refine(Some(&s), &item.id, "   ").await.unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
}

#[tokio::test]
async fn refine_media_appends_adjustment_to_prompt() {
    let (_store, generator, pipeline) = setup().await;
    let s = admin();
    let item = ready_item(&pipeline, Format::ImagePrompt).await;
    generator
        .queue_media(Ok("data:image/png;base64,BBBB".into()))
        .await;

    let refined = pipeline
        .refine(Some(&s), &item.id, "warmer colours")
        .await
        .unwrap();
    assert_eq!(
        refined.content.image_url.as_deref(),
        Some("data:image/png;base64,BBBB")
    );
    assert_eq!(
        generator.calls().await.last().unwrap(),
        "image 1K | Sacred spiritual art of Courage. Verse: Joshua 1:9 ADJUSTMENT: warmer colours"
    );
}

#[tokio::test]
async fn failed_refine_leaves_item_unchanged() {
    let (_store, generator, pipeline) = setup().await;
    let s = admin();
    let item = ready_item(&pipeline, Format::Sms).await;
    generator.queue_devotional(Err(anyhow!("timeout"))).await;

    let err = pipeline.refine(Some(&s), &item.id, "again").await.unwrap_err();
    assert!(matches!(err, PipelineError::Generation(_)));
    let after = pipeline.item(&item.id).await.unwrap().unwrap();
    assert_eq!(after, item);
}

#[tokio::test]
async fn mutations_require_an_admin_session() {
    let (_store, _generator, pipeline) = setup().await;
    let new = || entry("2026-03-01", Theme::Wisdom, "Nehemiah 8:10", &[Format::Sms]);

    let err = pipeline.schedule(None, new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Auth(AuthError::Unauthenticated)));

    let member = session_for(Role::User, Duration::hours(1));
    let err = pipeline.schedule(Some(&member), new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Auth(AuthError::Forbidden)));

    let expired = session_for(Role::Admin, Duration::minutes(-1));
    let err = pipeline.schedule(Some(&expired), new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Auth(AuthError::Unauthenticated)));

    let err = pipeline.discard(Some(&member), "anything").await.unwrap_err();
    assert!(matches!(err, PipelineError::Auth(AuthError::Forbidden)));

    // Reads are open.
    assert!(pipeline.calendar().await.unwrap().is_empty());
    assert!(pipeline.items().await.unwrap().is_empty());
}

#[tokio::test]
async fn schedule_validates_and_deduplicates_formats() {
    let (_store, _generator, pipeline) = setup().await;
    let s = admin();

    let err = pipeline
        .schedule(Some(&s), entry("2026-03-01", Theme::Hope, "Psalm 23:1", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    let err = pipeline
        .schedule(Some(&s), entry("2026-03-01", Theme::Hope, "  ", &[Format::Sms]))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    let e = pipeline
        .schedule(
            Some(&s),
            entry(
                "2026-03-01",
                Theme::Hope,
                " Psalm 23:1 ",
                &[Format::Sms, Format::Email, Format::Sms],
            ),
        )
        .await
        .unwrap();
    assert_eq!(e.verse, "Psalm 23:1");
    assert_eq!(e.requested_formats, vec![Format::Sms, Format::Email]);
    assert_eq!(pipeline.calendar().await.unwrap(), vec![e.clone()]);

    assert!(pipeline.unschedule(Some(&s), &e.id).await.unwrap());
    assert!(!pipeline.unschedule(Some(&s), &e.id).await.unwrap());
}

#[tokio::test]
async fn expanding_entry_without_formats_is_rejected() {
    let (store, _generator, pipeline) = setup().await;
    let s = admin();
    // Only reachable through imported data.
    let raw = serde_json::json!([{
        "id": "legacy-1",
        "date": "2026-03-01",
        "theme": "Hope",
        "verse": "Psalm 23:1",
        "requestedFormats": []
    }]);
    store
        .import_raw(Collection::Calendar, &raw.to_string())
        .await
        .unwrap();

    let err = pipeline.expand(Some(&s), "legacy-1").await.unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    let left: Vec<CalendarEntry> = store.list(Collection::Calendar).await.unwrap();
    assert_eq!(left.len(), 1);
}

#[tokio::test]
async fn process_due_expands_past_and_present_entries_oldest_first() {
    let (_store, generator, pipeline) = setup().await;
    let s = admin();
    let tomorrow = pipeline
        .schedule(Some(&s), entry("2026-03-03", Theme::Wisdom, "Psalm 16:11", &[Format::Sms]))
        .await
        .unwrap();
    let today = pipeline
        .schedule(Some(&s), entry("2026-03-02", Theme::Love, "1 John 4:8", &[Format::Sms]))
        .await
        .unwrap();
    let yesterday = pipeline
        .schedule(Some(&s), entry("2026-03-01", Theme::Hope, "Psalm 23:1", &[Format::Sms]))
        .await
        .unwrap();

    let run = pipeline
        .process_due(Some(&s), date("2026-03-02"))
        .await
        .unwrap();
    let expanded: Vec<&str> = run.expanded.iter().map(|r| r.entry_id.as_str()).collect();
    assert_eq!(expanded, vec![yesterday.id.as_str(), today.id.as_str()]);
    assert!(run.skipped.is_empty());

    assert_eq!(pipeline.calendar().await.unwrap(), vec![tomorrow]);
    assert_eq!(pipeline.items().await.unwrap().len(), 2);
    let calls = generator.calls().await;
    assert!(calls[0].contains("Psalm 23:1"));
    assert!(calls[1].contains("1 John 4:8"));
}

#[tokio::test]
async fn process_due_skips_an_unexpandable_entry_and_keeps_going() {
    let (store, _generator, pipeline) = setup().await;
    let s = admin();
    // Imported from an older export that requests no formats.
    let raw = serde_json::json!([{
        "id": "legacy-1",
        "date": "2026-02-01",
        "theme": "Hope",
        "verse": "Psalm 23:1",
        "requestedFormats": []
    }]);
    store
        .import_raw(Collection::Calendar, &raw.to_string())
        .await
        .unwrap();
    let good = pipeline
        .schedule(Some(&s), entry("2026-03-01", Theme::Hope, "Psalm 23:1", &[Format::Sms]))
        .await
        .unwrap();

    let run = pipeline
        .process_due(Some(&s), date("2026-03-02"))
        .await
        .unwrap();

    assert_eq!(run.expanded.len(), 1);
    assert_eq!(run.expanded[0].entry_id, good.id);
    assert_eq!(run.skipped.len(), 1);
    assert_eq!(run.skipped[0].0, "legacy-1");
    assert!(matches!(run.skipped[0].1, PipelineError::Validation(_)));

    let left = pipeline.calendar().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, "legacy-1");
    let items = pipeline.items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].calendar_id, good.id);
}

#[tokio::test]
async fn store_failure_mid_expansion_removes_its_items() {
    let store = Store::in_memory().await.unwrap();
    let s = admin();
    let seeding = Pipeline::new(store.clone(), Arc::new(RecordingGenerator::new()));
    let e = seeding
        .schedule(
            Some(&s),
            entry("2026-03-01", Theme::Faith, "Hebrews 11:1", &[Format::Sms, Format::Email]),
        )
        .await
        .unwrap();
    let earlier = ready_item(&seeding, Format::Sms).await;

    let generator = RecordingGenerator {
        interference: Some(Interference::CorruptCalendar(store.clone())),
        ..Default::default()
    };
    let pipeline = Pipeline::new(store.clone(), Arc::new(generator.clone()));

    let err = pipeline.expand(Some(&s), &e.id).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Store(StoreError::Json {
            collection: Collection::Calendar,
            ..
        })
    ));
    assert_eq!(generator.calls().await.len(), 2);
    // Only the item from the earlier, completed expansion remains.
    assert_eq!(pipeline.items().await.unwrap(), vec![earlier]);
}

#[tokio::test]
async fn retry_replaces_a_failed_item() {
    let (_store, generator, pipeline) = setup().await;
    let s = admin();
    generator
        .queue_devotional(Err(anyhow!("quota exceeded")))
        .await;
    let e = pipeline
        .schedule(Some(&s), entry("2026-03-01", Theme::Healing, "Psalm 147:3", &[Format::Email]))
        .await
        .unwrap();
    let report = pipeline.expand(Some(&s), &e.id).await.unwrap();
    let failed = report.items[0].clone();
    assert_eq!(failed.status, PipelineStatus::Failed);

    let retried = pipeline.retry(Some(&s), &failed.id).await.unwrap();
    assert_eq!(retried.status, PipelineStatus::Ready);
    assert_ne!(retried.id, failed.id);
    assert_eq!(retried.calendar_id, e.id);
    assert_eq!(retried.format, Format::Email);
    assert_eq!(retried.theme, Some(Theme::Healing));
    assert_eq!(retried.content.bible_verse, "Psalm 147:3");
    assert_eq!(retried.error, None);

    assert_eq!(pipeline.items().await.unwrap(), vec![retried]);
    let calls = generator.calls().await;
    assert_eq!(calls.len(), 2);
    assert!(calls[1].starts_with("devotional Email Psalm 147:3"));
}

#[tokio::test]
async fn retry_that_fails_again_leaves_one_failed_item() {
    let (_store, generator, pipeline) = setup().await;
    let s = admin();
    generator.queue_media(Err(anyhow!("safety block"))).await;
    generator.queue_media(Err(anyhow!("still blocked"))).await;
    let e = pipeline
        .schedule(Some(&s), entry("2026-03-01", Theme::Faith, "Hebrews 11:1", &[Format::ImagePrompt]))
        .await
        .unwrap();
    let failed = pipeline.expand(Some(&s), &e.id).await.unwrap().items[0].clone();

    let again = pipeline.retry(Some(&s), &failed.id).await.unwrap();
    assert_eq!(again.status, PipelineStatus::Failed);
    assert!(again.error.as_deref().unwrap().contains("still blocked"));
    let items = pipeline.items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, again.id);

    // The new failure can itself be retried.
    let ready = pipeline.retry(Some(&s), &again.id).await.unwrap();
    assert_eq!(ready.status, PipelineStatus::Ready);
    assert_eq!(ready.content.devotional_message, "Prophetic Concept Manifested");
}

#[tokio::test]
async fn only_failed_items_can_be_retried() {
    let (_store, _generator, pipeline) = setup().await;
    let s = admin();
    let item = ready_item(&pipeline, Format::Sms).await;

    let err = pipeline.retry(Some(&s), &item.id).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidTransition {
            from: PipelineStatus::Ready,
            action: "retry"
        }
    ));
    let err = pipeline.retry(Some(&s), "missing").await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));
    let user = session_for(Role::User, Duration::hours(1));
    let err = pipeline.retry(Some(&user), &item.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Auth(_)));
    assert_eq!(pipeline.items().await.unwrap(), vec![item]);
}

#[tokio::test]
async fn discard_removes_items_in_any_state() {
    let (_store, _generator, pipeline) = setup().await;
    let s = admin();
    let item = ready_item(&pipeline, Format::Sms).await;
    pipeline.approve(Some(&s), &item.id).await.unwrap();

    assert!(pipeline.discard(Some(&s), &item.id).await.unwrap());
    assert!(!pipeline.discard(Some(&s), &item.id).await.unwrap());
    assert!(pipeline.items().await.unwrap().is_empty());
}

#[tokio::test]
async fn pipeline_changes_are_announced() {
    let (store, _generator, pipeline) = setup().await;
    let mut events = store.subscribe();
    let s = admin();
    pipeline
        .schedule(Some(&s), entry("2026-03-01", Theme::Hope, "Psalm 23:1", &[Format::Sms]))
        .await
        .unwrap();
    let event = events.recv().await.unwrap();
    assert_eq!(event.collection, Collection::Calendar);
}
