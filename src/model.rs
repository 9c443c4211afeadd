use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Theme {
    Hope,
    Anxiety,
    Courage,
    Faith,
    Healing,
    Wisdom,
    Strength,
    Love,
    BibleStories,
    Teaching,
    Family,
    Tribulation,
}

impl Theme {
    pub const ALL: [Theme; 12] = [
        Theme::Hope,
        Theme::Anxiety,
        Theme::Courage,
        Theme::Faith,
        Theme::Healing,
        Theme::Wisdom,
        Theme::Strength,
        Theme::Love,
        Theme::BibleStories,
        Theme::Teaching,
        Theme::Family,
        Theme::Tribulation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Hope => "Hope",
            Theme::Anxiety => "Anxiety",
            Theme::Courage => "Courage",
            Theme::Faith => "Faith",
            Theme::Healing => "Healing",
            Theme::Wisdom => "Wisdom",
            Theme::Strength => "Strength",
            Theme::Love => "Love",
            Theme::BibleStories => "Bible Stories",
            Theme::Teaching => "Teaching",
            Theme::Family => "Family",
            Theme::Tribulation => "Tribulation",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        Theme::ALL
            .into_iter()
            .find(|t| format!("{t:?}").eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| format!("unknown theme: {s}"))
    }
}

/// Generation path a format is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Text,
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Format {
    #[serde(rename = "SMS", alias = "SMS Message")]
    Sms,
    #[serde(alias = "Email Newsletter")]
    Email,
    #[serde(alias = "Social Media Post")]
    SocialPost,
    #[serde(alias = "Sermon Notes")]
    SermonNotes,
    #[serde(alias = "Video Script")]
    VideoScript,
    #[serde(alias = "Image Concept")]
    ImagePrompt,
}

impl Format {
    pub const ALL: [Format; 6] = [
        Format::Sms,
        Format::Email,
        Format::SocialPost,
        Format::SermonNotes,
        Format::VideoScript,
        Format::ImagePrompt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Sms => "SMS",
            Format::Email => "Email",
            Format::SocialPost => "SocialPost",
            Format::SermonNotes => "SermonNotes",
            Format::VideoScript => "VideoScript",
            Format::ImagePrompt => "ImagePrompt",
        }
    }

    /// Human label used when prompting the generator.
    pub fn label(&self) -> &'static str {
        match self {
            Format::Sms => "SMS Message",
            Format::Email => "Email Newsletter",
            Format::SocialPost => "Social Media Post",
            Format::SermonNotes => "Sermon Notes",
            Format::VideoScript => "Video Script",
            Format::ImagePrompt => "Image Concept",
        }
    }

    pub fn kind(&self) -> FormatKind {
        match self {
            Format::ImagePrompt => FormatKind::Image,
            Format::VideoScript => FormatKind::Video,
            _ => FormatKind::Text,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Format::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s) || f.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown format: {s}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Length {
    Short,
    #[default]
    Medium,
    Long,
}

impl Length {
    pub fn label(&self) -> &'static str {
        match self {
            Length::Short => "Short (100 words)",
            Length::Medium => "Medium (300 words)",
            Length::Long => "Long (500+ words)",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Audience {
    Children,
    Teens,
    #[default]
    Adults,
    Seniors,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Style {
    #[default]
    Inspirational,
    Storytelling,
    Teaching,
    Liturgical,
}

/// Review state of a pipeline item. `Scheduled` is the calendar entry itself and
/// publishing removes the item, so neither appears here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PipelineStatus {
    Generating,
    Ready,
    Failed,
    Approved,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Generating => "Generating",
            PipelineStatus::Ready => "Ready",
            PipelineStatus::Failed => "Failed",
            PipelineStatus::Approved => "Approved",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            PipelineStatus::Generating => 0,
            PipelineStatus::Ready | PipelineStatus::Failed => 1,
            PipelineStatus::Approved => 2,
        }
    }

    /// Whether `self -> next` is an edge of the review state machine.
    pub fn can_transition_to(&self, next: PipelineStatus) -> bool {
        use PipelineStatus::*;
        matches!(
            (self, next),
            (Generating, Ready) | (Generating, Failed) | (Ready, Approved)
        )
    }

    /// True when `next` is not behind `self` along the state machine.
    pub fn is_forward(&self, next: PipelineStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedContent {
    pub title: String,
    pub bible_verse: String,
    pub devotional_message: String,
    pub practical_application: String,
    pub call_to_action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashtags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
}

impl GeneratedContent {
    /// Placeholder payload shown while an item is generating.
    pub fn placeholder(verse: &str) -> Self {
        Self {
            title: "Generating…".to_string(),
            bible_verse: verse.to_string(),
            devotional_message: String::new(),
            practical_application: String::new(),
            call_to_action: String::new(),
            hashtags: None,
            image_url: None,
            video_url: None,
            format: None,
        }
    }

    /// Natural key used to detect duplicates in the library: trimmed, lowercased
    /// title and scripture reference.
    pub fn natural_key(&self) -> (String, String) {
        (
            self.title.trim().to_lowercase(),
            self.bible_verse.trim().to_lowercase(),
        )
    }

    pub fn same_key(&self, other: &GeneratedContent) -> bool {
        self.natural_key() == other.natural_key()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEntry {
    pub id: String,
    pub date: NaiveDate,
    pub theme: Theme,
    pub verse: String,
    pub requested_formats: Vec<Format>,
}

/// Input for scheduling a calendar entry.
#[derive(Debug, Clone)]
pub struct NewCalendarEntry {
    pub date: NaiveDate,
    pub theme: Theme,
    pub verse: String,
    pub formats: Vec<Format>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineItem {
    pub id: String,
    pub calendar_id: String,
    pub format: Format,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
    pub status: PipelineStatus,
    pub content: GeneratedContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "timestamp::deserialize_opt"
    )]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub is_verified: bool,
    #[serde(rename = "is2FAEnabled")]
    pub is_2fa_enabled: bool,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user: User,
    pub token: String,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorChallenge {
    pub user_id: String,
    pub code_hash: String,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub expires_at: DateTime<Utc>,
    /// Wrong codes entered so far.
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub timestamp: DateTime<Utc>,
}

/// Timestamps are written as RFC 3339. Older exports store epoch milliseconds,
/// so both are accepted on read.
mod timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(i64),
        Text(DateTime<Utc>),
    }

    fn resolve<E: Error>(repr: Repr) -> Result<DateTime<Utc>, E> {
        match repr {
            Repr::Text(t) => Ok(t),
            Repr::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| E::custom(format!("timestamp out of range: {ms}"))),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        resolve(Repr::deserialize(d)?)
    }

    pub fn deserialize_opt<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<Repr>::deserialize(d)?.map(resolve).transpose()
    }
}
