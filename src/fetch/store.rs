use anyhow::Result;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::storage::entities::NewPost;
use crate::storage::Storage;

/// A feed selected for fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueFeed {
    pub id: Uuid,

    /// The URL as stored; it is validated when the feed is fetched.
    pub url: String,
    pub last_fetched_at: Option<OffsetDateTime>,
}

/// The part of the store the scheduler relies on.
///
/// Implementations must be safe to call from many fetch tasks at once.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Up to `limit` feeds, least recently fetched first, never-fetched feeds before all others.
    ///
    /// Every stored feed is eligible, including one whose URL no longer parses.
    async fn select_due_feeds(&self, limit: u32) -> Result<Vec<DueFeed>>;

    /// Advances the feed's `last_fetched_at` to `at`. Never moves it backwards.
    async fn mark_fetched(&self, feed_id: Uuid, at: OffsetDateTime) -> Result<()>;

    /// Returns `false` if the feed already has a post with the same URL.
    async fn insert_post(&self, post: NewPost) -> Result<bool>;
}

#[async_trait]
impl FeedStore for Storage {
    async fn select_due_feeds(&self, limit: u32) -> Result<Vec<DueFeed>> {
        let mut tx = self.begin().await?;
        let feeds = tx.get_due_feeds(limit).await?;
        tx.commit().await?;

        Ok(feeds
            .into_iter()
            .map(|feed| DueFeed {
                id: feed.id,
                url: feed.url,
                last_fetched_at: feed.last_fetched_at,
            })
            .collect())
    }

    async fn mark_fetched(&self, feed_id: Uuid, at: OffsetDateTime) -> Result<()> {
        let mut tx = self.begin().await?;
        tx.mark_feed_fetched(feed_id, at).await?;
        tx.commit().await
    }

    async fn insert_post(&self, post: NewPost) -> Result<bool> {
        let mut tx = self.begin().await?;
        let inserted = tx.insert_post(post).await?;
        tx.commit().await?;

        Ok(inserted)
    }
}
