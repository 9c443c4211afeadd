//! Named collections held by the store and their raw-import validation.

use crate::model::{CalendarEntry, GeneratedContent, PipelineItem, Session, TwoFactorChallenge, User};
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Session,
    PendingTwoFactor,
    Saved,
    Drafts,
    Calendar,
    Pipeline,
    Blacklist,
}

impl Collection {
    pub const ALL: [Collection; 8] = [
        Collection::Users,
        Collection::Session,
        Collection::PendingTwoFactor,
        Collection::Saved,
        Collection::Drafts,
        Collection::Calendar,
        Collection::Pipeline,
        Collection::Blacklist,
    ];

    /// Storage key of the collection's blob.
    pub fn key(&self) -> &'static str {
        match self {
            Collection::Users => "devotional_auth_users",
            Collection::Session => "devotional_auth_session",
            Collection::PendingTwoFactor => "devotional_auth_pending_2fa",
            Collection::Saved => "devotional_ai_saved",
            Collection::Drafts => "devotional_ai_drafts",
            Collection::Calendar => "devotional_admin_calendar",
            Collection::Pipeline => "devotional_admin_pipeline",
            Collection::Blacklist => "devotional_admin_blacklist",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Session => "session",
            Collection::PendingTwoFactor => "pending-2fa",
            Collection::Saved => "saved",
            Collection::Drafts => "drafts",
            Collection::Calendar => "calendar",
            Collection::Pipeline => "pipeline",
            Collection::Blacklist => "blacklist",
        }
    }

    /// Check that `raw` is well-formed JSON decoding as this collection's shape.
    pub fn validate(&self, raw: &str) -> Result<(), serde_json::Error> {
        match self {
            Collection::Users => check::<Vec<User>>(raw),
            Collection::Session => check::<Session>(raw),
            Collection::PendingTwoFactor => check::<TwoFactorChallenge>(raw),
            Collection::Saved | Collection::Drafts => check::<Vec<GeneratedContent>>(raw),
            Collection::Calendar => check::<Vec<CalendarEntry>>(raw),
            Collection::Pipeline => check::<Vec<PipelineItem>>(raw),
            Collection::Blacklist => check::<Vec<String>>(raw),
        }
    }
}

fn check<T: DeserializeOwned>(raw: &str) -> Result<(), serde_json::Error> {
    serde_json::from_str::<T>(raw).map(|_| ())
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Collection::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s) || c.key() == s)
            .ok_or_else(|| format!("unknown collection: {s}"))
    }
}
