//! Saved devotionals and drafts.
//!
//! Both collections de-duplicate by the content's natural key (title plus
//! scripture reference, trimmed and case-insensitive): saving the same key again
//! replaces the stored copy in place.

use tracing::{info, instrument};

use crate::model::GeneratedContent;
use crate::store::{Collection, Result, Store};

#[derive(Debug, Clone)]
pub struct Library {
    store: Store,
}

impl Library {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Returns `true` when the content was not in the library before.
    #[instrument(skip_all, fields(title = %content.title))]
    pub async fn save_devotional(&self, content: &GeneratedContent) -> Result<bool> {
        let inserted = self
            .store
            .upsert(Collection::Saved, content, |c: &GeneratedContent| {
                c.same_key(content)
            })
            .await?;
        if inserted {
            info!("devotional saved");
        }
        Ok(inserted)
    }

    pub async fn unsave_devotional(&self, content: &GeneratedContent) -> Result<bool> {
        let removed = self
            .store
            .remove_where(Collection::Saved, |c: &GeneratedContent| {
                c.same_key(content)
            })
            .await?;
        Ok(removed > 0)
    }

    pub async fn is_saved(&self, content: &GeneratedContent) -> Result<bool> {
        Ok(self.saved().await?.iter().any(|c| c.same_key(content)))
    }

    pub async fn saved(&self) -> Result<Vec<GeneratedContent>> {
        self.store.list(Collection::Saved).await
    }

    pub async fn save_draft(&self, content: &GeneratedContent) -> Result<bool> {
        self.store
            .upsert(Collection::Drafts, content, |c: &GeneratedContent| {
                c.same_key(content)
            })
            .await
    }

    pub async fn discard_draft(&self, content: &GeneratedContent) -> Result<bool> {
        let removed = self
            .store
            .remove_where(Collection::Drafts, |c: &GeneratedContent| {
                c.same_key(content)
            })
            .await?;
        Ok(removed > 0)
    }

    pub async fn drafts(&self) -> Result<Vec<GeneratedContent>> {
        self.store.list(Collection::Drafts).await
    }
}
