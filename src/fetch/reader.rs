use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{StatusCode, Url};
use rss::Channel;
use thiserror::Error;
use tracing::{debug, instrument};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DOCUMENT_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("the feed URL is malformed: {0}")]
    InvalidUrl(String),

    #[error("the request timed out")]
    Timeout,

    #[error("the request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("the server responded with {0}")]
    Status(StatusCode),

    #[error("the document exceeds the size limit")]
    TooLarge,

    #[error("could not decode the RSS document: {0}")]
    Decode(#[from] rss::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e)
        }
    }
}

/// An RSS channel reduced to the fields the aggregator stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFeed {
    pub title: String,
    pub link: String,
    pub description: String,
    pub language: Option<String>,
    pub items: Vec<ParsedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,

    /// The raw `pubDate` text; parsing is left to the caller.
    pub pub_date: Option<String>,
}

impl ParsedFeed {
    pub fn parse(document: &[u8]) -> Result<Self, FetchError> {
        let channel = Channel::read_from(document)?;

        Ok(channel.into())
    }
}

impl From<Channel> for ParsedFeed {
    fn from(channel: Channel) -> Self {
        let items = channel
            .items
            .into_iter()
            .map(|item| ParsedItem {
                title: item.title,
                link: item.link,
                description: item.description,
                pub_date: item.pub_date,
            })
            .collect();

        Self {
            title: channel.title,
            link: channel.link,
            description: channel.description,
            language: channel.language,
            items,
        }
    }
}

/// Retrieves and decodes RSS documents. One request per call, no retries.
#[derive(Clone)]
pub struct FeedReader {
    http_client: reqwest::Client,
}

impl FeedReader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("feedagg/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .read_timeout(READ_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .context("could not create an HTTP client")?;

        Ok(Self { http_client })
    }

    #[instrument(level = "DEBUG", skip(self, url), fields(%url))]
    pub async fn fetch(&self, url: &Url) -> Result<ParsedFeed, FetchError> {
        let mut response = self.http_client.get(url.clone()).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        if response
            .content_length()
            .is_some_and(|len| len > MAX_DOCUMENT_SIZE as u64)
        {
            return Err(FetchError::TooLarge);
        }

        let mut body = Vec::new();

        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > MAX_DOCUMENT_SIZE {
                return Err(FetchError::TooLarge);
            }

            body.extend_from_slice(&chunk);
        }

        debug!(size = body.len(), "Received the document");

        ParsedFeed::parse(&body)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const VALID_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example blog</title>
    <link>https://blog.example.com/</link>
    <description>Posts</description>
    <language>en-us</language>
    <item>
      <title>First</title>
      <link>https://blog.example.com/first</link>
      <description>The first post</description>
      <pubDate>Mon, 01 Jan 2024 10:00:00 +0000</pubDate>
    </item>
    <item>
      <title>Second</title>
      <link>https://blog.example.com/second</link>
    </item>
  </channel>
</rss>"#;

    async fn serve(template: ResponseTemplate) -> (MockServer, Url) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rss"))
            .respond_with(template)
            .mount(&server)
            .await;
        let url = Url::parse(&format!("{}/rss", server.uri())).unwrap();

        (server, url)
    }

    #[test]
    fn parses_channel_and_items_in_order() {
        let feed = ParsedFeed::parse(VALID_RSS.as_bytes()).unwrap();

        assert_eq!(feed.title, "Example blog");
        assert_eq!(feed.link, "https://blog.example.com/");
        assert_eq!(feed.language.as_deref(), Some("en-us"));
        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.items[0].title.as_deref(), Some("First"));
        assert_eq!(
            feed.items[0].pub_date.as_deref(),
            Some("Mon, 01 Jan 2024 10:00:00 +0000")
        );
        assert_eq!(
            feed.items[1].link.as_deref(),
            Some("https://blog.example.com/second")
        );
        assert_eq!(feed.items[1].pub_date, None);
    }

    #[test]
    fn rejects_documents_that_are_not_rss() {
        let result = ParsedFeed::parse(b"<html><body>hello</body></html>");
        assert!(matches!(result, Err(FetchError::Decode(_))));

        let result = ParsedFeed::parse(b"not xml at all");
        assert!(matches!(result, Err(FetchError::Decode(_))));
    }

    #[tokio::test]
    async fn fetches_and_decodes() {
        let (_server, url) = serve(
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .insert_header("Content-Type", "application/rss+xml"),
        )
        .await;
        let reader = FeedReader::new(Duration::from_secs(5)).unwrap();

        let feed = reader.fetch(&url).await.unwrap();
        assert_eq!(feed.items.len(), 2);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (_server, url) = serve(ResponseTemplate::new(404)).await;
        let reader = FeedReader::new(Duration::from_secs(5)).unwrap();

        let result = reader.fetch(&url).await;
        assert!(matches!(result, Err(FetchError::Status(StatusCode::NOT_FOUND))));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let (_server, url) = serve(
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .set_delay(Duration::from_secs(5)),
        )
        .await;
        let reader = FeedReader::new(Duration::from_millis(200)).unwrap();

        let result = reader.fetch(&url).await;
        assert!(matches!(result, Err(FetchError::Timeout)), "{result:?}");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        let reader = FeedReader::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse("http://127.0.0.1:1/rss").unwrap();

        let result = reader.fetch(&url).await;
        assert!(
            matches!(result, Err(FetchError::Transport(_) | FetchError::Timeout)),
            "{result:?}"
        );
    }
}
