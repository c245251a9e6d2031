pub mod entities;

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use reqwest::Url;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use time::OffsetDateTime;
use tracing::{info, instrument, trace};
use uuid::Uuid;

use self::entities::{Feed, FeedFollow, NewPost, Post, User};

const API_KEY_BYTES: usize = 32;

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        let pool = SqlitePoolOptions::new()
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .foreign_keys(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .create_if_missing(true),
            )
            .await
            .with_context(|| anyhow!("could not open a SQLite database `{}`", db_path.display()))?;
        info!("Using an SQLite database `{}`", db_path.display());

        Self::migrate(pool).await
    }

    /// Opens a private in-memory database.
    ///
    /// The pool is pinned to a single connection that is never recycled: every SQLite connection
    /// to `:memory:` gets its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await
            .context("could not open an in-memory SQLite database")?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!()
            .run(&pool)
            .await
            .with_context(|| anyhow!("could not prepare a database schema"))?;

        Ok(Self { pool })
    }

    pub async fn begin(&self) -> Result<Tx> {
        self.pool
            .begin()
            .await
            .context("could not begin a new DB transaction")
            .map(Tx)
    }
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);

    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct Tx(Transaction<'static, Sqlite>);

impl Tx {
    pub async fn commit(self) -> Result<()> {
        self.0
            .commit()
            .await
            .context("could not commit a DB transaction")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn create_user(&mut self, name: &str) -> Result<User> {
        let now = OffsetDateTime::now_utc();

        sqlx::query_as(
            "INSERT
            INTO users (id, created_at, updated_at, name, api_key)
            VALUES (?1, ?2, ?2, ?3, ?4)
            RETURNING id, created_at, updated_at, name, api_key",
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(name)
        .bind(generate_api_key())
        .fetch_one(self.0.as_mut())
        .await
        .context("could not create a user")
    }

    #[instrument(level = "TRACE", skip_all)]
    pub async fn get_user_by_api_key(&mut self, api_key: &str) -> Result<Option<User>> {
        sqlx::query_as(
            "SELECT id, created_at, updated_at, name, api_key
            FROM users
            WHERE api_key = ?1",
        )
        .bind(api_key)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not look up a user by the API key")
    }

    /// Creates a feed owned by `user_id`.
    ///
    /// Returns `None` if a feed with the same URL already exists.
    #[instrument(level = "TRACE", skip(self, url), fields(%url))]
    pub async fn create_feed(
        &mut self,
        user_id: Uuid,
        name: &str,
        url: &Url,
    ) -> Result<Option<Feed>> {
        let now = OffsetDateTime::now_utc();

        sqlx::query_as(
            "INSERT
            INTO feeds (id, created_at, updated_at, name, url, user_id, last_fetched_at)
            VALUES (?1, ?2, ?2, ?3, ?4, ?5, NULL)
            ON CONFLICT (url) DO NOTHING
            RETURNING id, created_at, updated_at, name, url, user_id, last_fetched_at",
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(name)
        .bind(url.as_str())
        .bind(user_id)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not create a feed")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_feed(&mut self, feed_id: Uuid) -> Result<Option<Feed>> {
        sqlx::query_as(
            "SELECT id, created_at, updated_at, name, url, user_id, last_fetched_at
            FROM feeds
            WHERE id = ?1",
        )
        .bind(feed_id)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not retrieve the feed")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_feeds(&mut self) -> Result<Vec<Feed>> {
        sqlx::query_as(
            "SELECT id, created_at, updated_at, name, url, user_id, last_fetched_at
            FROM feeds
            ORDER BY julianday(created_at) ASC, name ASC",
        )
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the feed list")
    }

    /// Returns up to `limit` feeds, least recently fetched first.
    ///
    /// Feeds that were never fetched come before any others. Ties are broken by creation time.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_due_feeds(&mut self, limit: u32) -> Result<Vec<Feed>> {
        sqlx::query_as(
            "SELECT id, created_at, updated_at, name, url, user_id, last_fetched_at
            FROM feeds
            ORDER BY
              julianday(last_fetched_at) ASC NULLS FIRST,
              julianday(created_at) ASC,
              id ASC
            LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the feeds due for fetching")
    }

    /// Records a fetch attempt.
    ///
    /// `last_fetched_at` never moves backwards: an older `at` leaves the stored value unchanged.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn mark_feed_fetched(&mut self, feed_id: Uuid, at: OffsetDateTime) -> Result<()> {
        let result = sqlx::query(
            "UPDATE feeds
            SET
              last_fetched_at = CASE
                WHEN last_fetched_at IS NULL OR julianday(last_fetched_at) < julianday(?2)
                  THEN ?2
                ELSE last_fetched_at
              END,
              updated_at = ?2
            WHERE id = ?1",
        )
        .bind(feed_id)
        .bind(at)
        .execute(self.0.as_mut())
        .await
        .context("could not mark the feed as fetched")?;

        if result.rows_affected() == 0 {
            trace!("The feed no longer exists");
        }

        Ok(())
    }

    /// Stores a post unless the feed already has one with the same URL.
    ///
    /// Returns whether a new row was inserted.
    #[instrument(level = "TRACE", skip(self, post), fields(post_id = %post.id, url = %post.url))]
    pub async fn insert_post(&mut self, post: NewPost) -> Result<bool> {
        let now = OffsetDateTime::now_utc();

        let result = sqlx::query(
            "INSERT
            INTO posts (
              id,
              created_at,
              updated_at,
              feed_id,
              title,
              url,
              description,
              published_at
            ) VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (feed_id, url) DO NOTHING",
        )
        .bind(post.id)
        .bind(now)
        .bind(post.feed_id)
        .bind(post.title)
        .bind(post.url)
        .bind(post.description)
        .bind(post.published_at)
        .execute(self.0.as_mut())
        .await
        .context("could not insert a post")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_feed_posts(&mut self, feed_id: Uuid, limit: u32) -> Result<Vec<Post>> {
        sqlx::query_as(
            "SELECT
              id,
              created_at,
              updated_at,
              feed_id,
              title,
              url,
              description,
              published_at
            FROM posts
            WHERE feed_id = ?1
            ORDER BY julianday(published_at) DESC, url ASC
            LIMIT ?2",
        )
        .bind(feed_id)
        .bind(i64::from(limit))
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the feed posts")
    }

    /// Returns the newest posts across all feeds the user follows.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_user_posts(&mut self, user_id: Uuid, limit: u32) -> Result<Vec<Post>> {
        sqlx::query_as(
            "SELECT
              posts.id AS id,
              posts.created_at AS created_at,
              posts.updated_at AS updated_at,
              posts.feed_id AS feed_id,
              posts.title AS title,
              posts.url AS url,
              posts.description AS description,
              posts.published_at AS published_at
            FROM posts
              JOIN feed_follows ON (feed_follows.feed_id = posts.feed_id)
            WHERE feed_follows.user_id = ?1
            ORDER BY julianday(posts.published_at) DESC, posts.url ASC
            LIMIT ?2",
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the user's posts")
    }

    /// Makes the user follow the feed.
    ///
    /// Returns `None` if the feed does not exist or the user already follows it.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn create_feed_follow(
        &mut self,
        user_id: Uuid,
        feed_id: Uuid,
    ) -> Result<Option<FeedFollow>> {
        let now = OffsetDateTime::now_utc();

        sqlx::query_as(
            "INSERT
            INTO feed_follows (id, created_at, updated_at, user_id, feed_id)
            SELECT ?1, ?2, ?2, ?3, id
            FROM feeds
            WHERE id = ?4
            ON CONFLICT (user_id, feed_id) DO NOTHING
            RETURNING id, created_at, updated_at, user_id, feed_id",
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(user_id)
        .bind(feed_id)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not follow the feed")
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn get_feed_follows(&mut self, user_id: Uuid) -> Result<Vec<FeedFollow>> {
        sqlx::query_as(
            "SELECT id, created_at, updated_at, user_id, feed_id
            FROM feed_follows
            WHERE user_id = ?1
            ORDER BY julianday(created_at) ASC",
        )
        .bind(user_id)
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve the feed follows")
    }

    /// Deletes a follow owned by the user. Returns whether anything was deleted.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn delete_feed_follow(&mut self, user_id: Uuid, follow_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE
            FROM feed_follows
            WHERE id = ?1 AND user_id = ?2",
        )
        .bind(follow_id)
        .bind(user_id)
        .execute(self.0.as_mut())
        .await
        .context("could not unfollow the feed")?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use time::Duration;

    use super::*;
    use crate::fetch::reader::FeedReader;
    use crate::fetch::store::FeedStore;
    use crate::fetch::Scheduler;

    async fn storage_with_user() -> (Storage, User) {
        let storage = Storage::in_memory().await.unwrap();
        let mut tx = storage.begin().await.unwrap();
        let user = tx.create_user("alice").await.unwrap();
        tx.commit().await.unwrap();

        (storage, user)
    }

    async fn add_feed(storage: &Storage, user: &User, url: &str) -> Feed {
        let mut tx = storage.begin().await.unwrap();
        let feed = tx
            .create_feed(user.id, url, &Url::parse(url).unwrap())
            .await
            .unwrap()
            .unwrap();
        tx.commit().await.unwrap();

        feed
    }

    fn new_post(feed_id: Uuid, url: &str) -> NewPost {
        NewPost {
            id: Uuid::new_v4(),
            feed_id,
            title: "title".into(),
            url: url.into(),
            description: Some("description".into()),
            published_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn api_keys_are_random_hex() {
        let a = generate_api_key();
        let b = generate_api_key();

        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn user_is_found_by_api_key() {
        let (storage, user) = storage_with_user().await;
        let mut tx = storage.begin().await.unwrap();

        let found = tx.get_user_by_api_key(&user.api_key).await.unwrap();
        assert_eq!(found, Some(user));
        assert_eq!(tx.get_user_by_api_key("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_feed_url_is_rejected() {
        let (storage, user) = storage_with_user().await;
        add_feed(&storage, &user, "https://example.com/rss").await;

        let mut tx = storage.begin().await.unwrap();
        let url = Url::parse("https://example.com/rss").unwrap();
        assert!(tx.create_feed(user.id, "again", &url).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_feeds_put_never_fetched_first() {
        let (storage, user) = storage_with_user().await;
        let a = add_feed(&storage, &user, "https://a.example.com/rss").await;
        let b = add_feed(&storage, &user, "https://b.example.com/rss").await;
        let c = add_feed(&storage, &user, "https://c.example.com/rss").await;
        let now = OffsetDateTime::now_utc();

        let mut tx = storage.begin().await.unwrap();
        tx.mark_feed_fetched(a.id, now - Duration::minutes(5))
            .await
            .unwrap();
        tx.mark_feed_fetched(b.id, now - Duration::hours(1))
            .await
            .unwrap();

        let ids = |feeds: Vec<Feed>| feeds.into_iter().map(|f| f.id).collect::<Vec<_>>();
        assert_eq!(ids(tx.get_due_feeds(10).await.unwrap()), [c.id, b.id, a.id]);
        assert_eq!(ids(tx.get_due_feeds(2).await.unwrap()), [c.id, b.id]);
        assert!(tx.get_due_feeds(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn feeds_with_malformed_urls_rotate_out_of_the_batch() {
        let (storage, user) = storage_with_user().await;
        let valid = add_feed(&storage, &user, "http://127.0.0.1:1/rss").await;
        let broken = add_feed(&storage, &user, "https://broken.example.com/rss").await;

        let mut tx = storage.begin().await.unwrap();
        sqlx::query("UPDATE feeds SET url = 'not a url', created_at = ?2 WHERE id = ?1")
            .bind(broken.id)
            .bind(OffsetDateTime::now_utc() - Duration::days(1))
            .execute(tx.0.as_mut())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let storage = Arc::new(storage);
        let reader = FeedReader::new(StdDuration::from_secs(5)).unwrap();
        let scheduler = Scheduler::new(storage.clone(), reader, 1, StdDuration::from_secs(60));

        let due = storage.select_due_feeds(1).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, broken.id);

        scheduler.tick().await;
        scheduler.tick().await;

        let mut tx = storage.begin().await.unwrap();
        let broken = tx.get_feed(broken.id).await.unwrap().unwrap();
        let valid = tx.get_feed(valid.id).await.unwrap().unwrap();
        assert!(broken.last_fetched_at.is_some());
        assert!(valid.last_fetched_at.is_some());
    }

    #[tokio::test]
    async fn last_fetched_at_never_goes_backwards() {
        let (storage, user) = storage_with_user().await;
        let feed = add_feed(&storage, &user, "https://example.com/rss").await;
        let now = OffsetDateTime::now_utc();

        let mut tx = storage.begin().await.unwrap();
        tx.mark_feed_fetched(feed.id, now).await.unwrap();
        tx.mark_feed_fetched(feed.id, now - Duration::hours(2))
            .await
            .unwrap();

        let stored = tx.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(stored.last_fetched_at, Some(now));
    }

    #[tokio::test]
    async fn marking_a_missing_feed_is_not_an_error() {
        let (storage, _) = storage_with_user().await;
        let mut tx = storage.begin().await.unwrap();

        tx.mark_feed_fetched(Uuid::new_v4(), OffsetDateTime::now_utc())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_posts_are_ignored() {
        let (storage, user) = storage_with_user().await;
        let feed = add_feed(&storage, &user, "https://example.com/rss").await;

        let mut tx = storage.begin().await.unwrap();
        assert!(tx
            .insert_post(new_post(feed.id, "https://example.com/1"))
            .await
            .unwrap());
        assert!(!tx
            .insert_post(new_post(feed.id, "https://example.com/1"))
            .await
            .unwrap());
        assert_eq!(tx.get_feed_posts(feed.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn user_posts_come_from_followed_feeds_only() {
        let (storage, user) = storage_with_user().await;
        let followed = add_feed(&storage, &user, "https://a.example.com/rss").await;

        let mut tx = storage.begin().await.unwrap();
        let bob = tx.create_user("bob").await.unwrap();
        tx.commit().await.unwrap();
        let other = add_feed(&storage, &bob, "https://b.example.com/rss").await;

        let mut tx = storage.begin().await.unwrap();
        tx.create_feed_follow(user.id, followed.id).await.unwrap();
        tx.insert_post(new_post(followed.id, "https://a.example.com/1"))
            .await
            .unwrap();
        tx.insert_post(new_post(other.id, "https://b.example.com/1"))
            .await
            .unwrap();

        let posts = tx.get_user_posts(user.id, 10).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].feed_id, followed.id);
    }

    #[tokio::test]
    async fn following_a_missing_feed_creates_nothing() {
        let (storage, user) = storage_with_user().await;
        let mut tx = storage.begin().await.unwrap();

        assert!(tx
            .create_feed_follow(user.id, Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
        assert!(tx.get_feed_follows(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn follows_are_unique_and_deletable_by_owner_only() {
        let (storage, user) = storage_with_user().await;
        let feed = add_feed(&storage, &user, "https://example.com/rss").await;

        let mut tx = storage.begin().await.unwrap();
        let follow = tx
            .create_feed_follow(user.id, feed.id)
            .await
            .unwrap()
            .unwrap();
        assert!(tx
            .create_feed_follow(user.id, feed.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(tx.get_feed_follows(user.id).await.unwrap(), [follow.clone()]);

        assert!(!tx
            .delete_feed_follow(Uuid::new_v4(), follow.id)
            .await
            .unwrap());
        assert!(tx.delete_feed_follow(user.id, follow.id).await.unwrap());
        assert!(tx.get_feed_follows(user.id).await.unwrap().is_empty());
    }
}
