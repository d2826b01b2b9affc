use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, MAX_PAGE_SIZE},
    domain::{ChannelId, ChatMessage, MessageId},
    source::port::MessageSource,
    Error, Result,
};

#[derive(Clone, Copy, Debug)]
pub struct PagerConfig {
    pub page_size: u32,
    /// Pause before each follow-up page request (rate-limit courtesy).
    pub page_delay: Duration,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            page_delay: Duration::from_millis(100),
        }
    }
}

impl From<&Config> for PagerConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            page_size: cfg.page_size,
            page_delay: cfg.page_delay,
        }
    }
}

/// Threshold plus the cursor of the current pagination walk.
#[derive(Clone, Debug)]
pub struct FetchWindow {
    pub threshold: DateTime<Utc>,
    pub cursor: Option<MessageId>,
}

impl FetchWindow {
    pub fn new(threshold: DateTime<Utc>) -> Self {
        Self {
            threshold,
            cursor: None,
        }
    }

    /// A message exactly at the threshold is still inside the window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.threshold
    }
}

/// Walks a channel backwards page by page until the window threshold is crossed.
pub struct PageFetcher {
    source: Arc<dyn MessageSource>,
    cfg: PagerConfig,
}

impl PageFetcher {
    pub fn new(source: Arc<dyn MessageSource>, cfg: PagerConfig) -> Self {
        Self { source, cfg }
    }

    /// Collect every message at or after `threshold`, in the order the source returns them.
    ///
    /// Stops on an empty page or on the first message older than the threshold; in the
    /// latter case no further page is requested. Transport errors abort the walk.
    pub async fn fetch_since(
        &self,
        channel: &ChannelId,
        threshold: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChatMessage>> {
        let mut window = FetchWindow::new(threshold);
        let mut collected: Vec<ChatMessage> = Vec::new();
        let mut pages = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let page = self
                .source
                .fetch_page(channel, self.cfg.page_size, window.cursor.as_ref())
                .await?;
            pages += 1;

            tracing::debug!(
                page = pages,
                size = page.len(),
                before = window.cursor.as_ref().map(|c| c.0.as_str()).unwrap_or("<latest>"),
                "fetched page"
            );

            let Some(last) = page.last() else {
                // Reached the start of the channel.
                break;
            };
            let next_cursor = last.id.clone();

            for msg in page {
                if !window.contains(msg.created_at) {
                    tracing::debug!(
                        pages,
                        collected = collected.len(),
                        "crossed threshold at message {}",
                        msg.id
                    );
                    return Ok(collected);
                }
                collected.push(msg);
            }

            window.cursor = Some(next_cursor);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep(self.cfg.page_delay) => {}
            }
        }

        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserId;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct FakeSource {
        pages: Mutex<VecDeque<Result<Vec<ChatMessage>>>>,
        requests: Mutex<Vec<(u32, Option<String>)>>,
        request_times: Mutex<Vec<Instant>>,
        cancel_after_first: Option<CancellationToken>,
    }

    impl FakeSource {
        fn new(pages: Vec<Result<Vec<ChatMessage>>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                requests: Mutex::new(Vec::new()),
                request_times: Mutex::new(Vec::new()),
                cancel_after_first: None,
            }
        }

        fn requests(&self) -> Vec<(u32, Option<String>)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        async fn fetch_page(
            &self,
            _channel: &ChannelId,
            limit: u32,
            before: Option<&MessageId>,
        ) -> Result<Vec<ChatMessage>> {
            self.requests
                .lock()
                .unwrap()
                .push((limit, before.map(|b| b.0.clone())));
            self.request_times.lock().unwrap().push(Instant::now());
            if let Some(tok) = &self.cancel_after_first {
                tok.cancel();
            }
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn threshold() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn msg(id: &str, offset_secs: i64) -> ChatMessage {
        ChatMessage {
            id: MessageId(id.to_string()),
            channel_id: ChannelId("c1".to_string()),
            author_id: UserId("u1".to_string()),
            author_name: "alice".to_string(),
            content: format!("message {id}"),
            created_at: threshold() + chrono::Duration::seconds(offset_secs),
            attachment_count: 0,
        }
    }

    fn fetcher(source: Arc<FakeSource>) -> PageFetcher {
        PageFetcher::new(
            source,
            PagerConfig {
                page_size: 3,
                page_delay: Duration::ZERO,
            },
        )
    }

    fn ids(msgs: &[ChatMessage]) -> Vec<&str> {
        msgs.iter().map(|m| m.id.0.as_str()).collect()
    }

    #[tokio::test]
    async fn stops_at_first_message_older_than_threshold() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(vec![msg("a", 30), msg("b", 10), msg("c", -5)]),
            Ok(vec![msg("d", 20)]),
        ]));
        let out = fetcher(source.clone())
            .fetch_since(&ChannelId("c1".into()), threshold(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ids(&out), vec!["a", "b"]);
        assert_eq!(source.requests().len(), 1, "no follow-up page after crossing");
    }

    #[tokio::test]
    async fn walks_pages_with_cursor_until_threshold() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(vec![msg("9", 90), msg("8", 80), msg("7", 70)]),
            Ok(vec![msg("6", 60), msg("5", -1), msg("4", 40)]),
            Ok(vec![msg("3", 30)]),
        ]));
        let out = fetcher(source.clone())
            .fetch_since(&ChannelId("c1".into()), threshold(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ids(&out), vec!["9", "8", "7", "6"]);
        assert_eq!(
            source.requests(),
            vec![(3, None), (3, Some("7".to_string()))]
        );
    }

    #[tokio::test]
    async fn empty_first_page_yields_nothing() {
        let source = Arc::new(FakeSource::new(vec![Ok(Vec::new())]));
        let out = fetcher(source.clone())
            .fetch_since(&ChannelId("c1".into()), threshold(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(out.is_empty());
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test]
    async fn empty_page_after_full_pages_ends_walk() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(vec![msg("3", 30), msg("2", 20), msg("1", 10)]),
            Ok(Vec::new()),
        ]));
        let out = fetcher(source.clone())
            .fetch_since(&ChannelId("c1".into()), threshold(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ids(&out), vec!["3", "2", "1"]);
        assert_eq!(source.requests().len(), 2);
    }

    #[tokio::test]
    async fn threshold_boundary_is_inclusive() {
        let mut older = msg("old", 0);
        older.created_at = threshold() - chrono::Duration::microseconds(1);
        let source = Arc::new(FakeSource::new(vec![Ok(vec![msg("edge", 0), older])]));
        let out = fetcher(source)
            .fetch_since(&ChannelId("c1".into()), threshold(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ids(&out), vec!["edge"]);
    }

    #[tokio::test]
    async fn transport_error_aborts_fetch() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(vec![msg("3", 30), msg("2", 20), msg("1", 10)]),
            Err(Error::Source("HTTP 502".to_string())),
        ]));
        let err = fetcher(source)
            .fetch_since(&ChannelId("c1".into()), threshold(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Source(_)));
    }

    #[tokio::test]
    async fn cancellation_is_honored_between_pages() {
        let token = CancellationToken::new();
        let mut source = FakeSource::new(vec![
            Ok(vec![msg("3", 30), msg("2", 20), msg("1", 10)]),
            Ok(vec![msg("0", 5)]),
        ]);
        source.cancel_after_first = Some(token.clone());
        let source = Arc::new(source);

        let err = fetcher(source.clone())
            .fetch_since(&ChannelId("c1".into()), threshold(), &token)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn follow_up_pages_wait_for_page_delay() {
        let delay = Duration::from_millis(250);
        let source = Arc::new(FakeSource::new(vec![
            Ok(vec![msg("9", 90), msg("8", 80), msg("7", 70)]),
            Ok(vec![msg("6", 60), msg("5", 50), msg("4", 40)]),
            Ok(Vec::new()),
        ]));
        let fetcher = PageFetcher::new(
            source.clone(),
            PagerConfig {
                page_size: 3,
                page_delay: delay,
            },
        );

        let start = Instant::now();
        let out = fetcher
            .fetch_since(&ChannelId("c1".into()), threshold(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.len(), 6);

        let times = source.request_times.lock().unwrap().clone();
        assert_eq!(times.len(), 3);
        assert_eq!(times[0], start, "first page is requested immediately");
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= delay, "{:?}", pair[1] - pair[0]);
        }
    }
}
