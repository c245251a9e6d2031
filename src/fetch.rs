pub mod reader;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use ::time::format_description::well_known::Rfc2822;
use ::time::OffsetDateTime;
use anyhow::{ensure, Result};
use reqwest::Url;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::storage::entities::NewPost;

use self::reader::{FeedReader, FetchError, ParsedFeed, ParsedItem};
use self::store::{DueFeed, FeedStore};

/// Periodically fetches the most stale feeds, one task per feed.
pub struct Scheduler {
    store: Arc<dyn FeedStore>,
    reader: FeedReader,
    batch_size: u32,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn FeedStore>,
        reader: FeedReader,
        batch_size: u32,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            reader,
            batch_size,
            interval,
        }
    }

    /// Runs the fetch loop until `cancel` fires.
    ///
    /// The first batch is fetched one interval after the start. A batch that runs past the next
    /// tick delays only that tick; later ticks stay on the original schedule.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        ensure!(!self.interval.is_zero(), "the fetch interval must not be zero");

        async move {
            info!(
                batch_size = self.batch_size,
                "Fetching feeds every {}s",
                self.interval.as_secs_f64()
            );

            let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                select! {
                    _ = cancel.cancelled() => {
                        debug!("Received a cancellation signal; exiting");
                        break;
                    }

                    _ = ticker.tick() => {}
                }

                self.tick().instrument(info_span!("tick")).await;
            }

            Ok(())
        }
        .instrument(info_span!("scheduler"))
        .await
    }

    /// Fetches one batch of feeds and waits until every feed in it has been processed.
    pub async fn tick(&self) {
        let feeds = match self.store.select_due_feeds(self.batch_size).await {
            Ok(feeds) => feeds,

            Err(e) => {
                error!("Could not select the feeds to fetch: {e:#}");
                return;
            }
        };

        if feeds.is_empty() {
            debug!("No feeds to fetch");
            return;
        }

        info!("Fetching {} feed(s)", feeds.len());
        let mut tasks = JoinSet::new();

        for feed in feeds {
            let span = info_span!("feed", feed_id = %feed.id, url = %feed.url);
            let task = Task {
                store: self.store.clone(),
                reader: self.reader.clone(),
                feed,
            };

            tasks.spawn(task.run().instrument(span));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("A feed task terminated abnormally: {e}");
            }
        }

        debug!("Finished the batch");
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Summary {
    inserted: usize,
    duplicate: usize,
    skipped: usize,
    failed: usize,
}

struct Task {
    store: Arc<dyn FeedStore>,
    reader: FeedReader,
    feed: DueFeed,
}

impl Task {
    async fn run(self) {
        let fetched = match Url::parse(&self.feed.url) {
            Ok(url) => self.reader.fetch(&url).await,
            Err(e) => Err(FetchError::InvalidUrl(e.to_string())),
        };

        if let Err(e) = &fetched {
            warn!("Could not fetch the feed: {e:#}");
        }

        // A failed attempt still counts as a fetch; otherwise a dead feed would head every batch.
        if let Err(e) = self
            .store
            .mark_fetched(self.feed.id, OffsetDateTime::now_utc())
            .await
        {
            error!("Could not mark the feed as fetched: {e:#}");
        }

        let Ok(parsed) = fetched else {
            return;
        };

        let summary = self.store_items(parsed).await;
        info!(
            inserted = summary.inserted,
            duplicate = summary.duplicate,
            skipped = summary.skipped,
            failed = summary.failed,
            "Processed the feed",
        );
    }

    async fn store_items(&self, parsed: ParsedFeed) -> Summary {
        let mut summary = Summary::default();

        for (idx, item) in parsed.items.into_iter().enumerate() {
            let idx = idx + 1;

            let post = match to_post(self.feed.id, item) {
                Ok(post) => post,

                Err(reason) => {
                    warn!("Skipping item #{idx}: {reason}");
                    summary.skipped += 1;
                    continue;
                }
            };

            match self.store.insert_post(post).await {
                Ok(true) => summary.inserted += 1,
                Ok(false) => summary.duplicate += 1,

                Err(e) => {
                    error!("Could not store item #{idx}: {e:#}");
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

fn to_post(feed_id: Uuid, item: ParsedItem) -> Result<NewPost, String> {
    let url = match item.link.as_deref().map(str::trim) {
        Some(link) if !link.is_empty() => link.to_owned(),
        _ => return Err("the item has no link".into()),
    };

    let Some(pub_date) = item.pub_date else {
        return Err("the item has no publication date".into());
    };

    let published_at = parse_pub_date(&pub_date)
        .map_err(|e| format!("could not parse the publication date `{pub_date}`: {e}"))?;

    Ok(NewPost {
        id: Uuid::new_v4(),
        feed_id,
        title: item.title.unwrap_or_default(),
        url,
        description: item.description,
        published_at,
    })
}

/// Parses an RSS `pubDate` (RFC 2822, e.g. `Mon, 02 Jan 2006 15:04:05 -0700`).
pub fn parse_pub_date(s: &str) -> Result<OffsetDateTime, ::time::error::Parse> {
    OffsetDateTime::parse(s.trim(), &Rfc2822)
}
