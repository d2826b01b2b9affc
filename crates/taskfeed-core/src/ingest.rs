//! One ingestion run: fetch → persist → forward.
//!
//! A run is a single batch; recurring ingestion comes from re-invoking the
//! binary (cron, systemd timer). There is no scheduling loop in here.

use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    classifier::forwarder::ClassificationForwarder,
    config::Config,
    domain::{ChannelId, ChatMessage, MessageId},
    errors::Error,
    source::pager::PageFetcher,
    store::MessageStore,
    Result,
};

/// Which fetched messages are handed to the classifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ForwardPolicy {
    /// Every fetched message, including ones an earlier run already stored.
    #[default]
    All,
    /// Only messages this run inserted.
    NewOnly,
}

#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub channel: ChannelId,
    pub lookback: Duration,
    pub forward_policy: ForwardPolicy,
    pub use_watermark: bool,
}

impl From<&Config> for IngestOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            channel: cfg.channel_id.clone(),
            lookback: cfg.lookback,
            forward_policy: cfg.forward_policy,
            use_watermark: cfg.use_watermark,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub channel: ChannelId,
    pub threshold: DateTime<Utc>,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed_rows: usize,
    pub forwarded: usize,
    pub forward_failures: Vec<MessageId>,
    /// Forwarding stopped early on cancellation (the store commit had already happened).
    pub cancelled: bool,
}

pub struct Ingestor {
    store: MessageStore,
    fetcher: PageFetcher,
    forwarder: ClassificationForwarder,
    opts: IngestOptions,
}

impl Ingestor {
    pub fn new(
        store: MessageStore,
        fetcher: PageFetcher,
        forwarder: ClassificationForwarder,
        opts: IngestOptions,
    ) -> Self {
        Self {
            store,
            fetcher,
            forwarder,
            opts,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Run one ingestion pass relative to `now`.
    ///
    /// Fetch and commit failures are returned as errors. Forwarding failures are
    /// logged and recorded in the report; they never fail the run.
    pub async fn run_once(
        &mut self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        self.store.ensure_schema()?;

        let watermark = if self.opts.use_watermark {
            self.store.watermark(&self.opts.channel)?
        } else {
            None
        };
        let threshold = compute_threshold(now, self.opts.lookback, watermark)?;
        tracing::info!(
            channel = %self.opts.channel,
            "fetching messages since {}",
            threshold.to_rfc3339()
        );

        let messages = self
            .fetcher
            .fetch_since(&self.opts.channel, threshold, cancel)
            .await?;

        let insert = self.store.bulk_insert(&messages)?;
        tracing::info!(
            fetched = messages.len(),
            inserted = insert.inserted_count(),
            duplicates = insert.duplicates,
            failed = insert.failed,
            "persisted batch"
        );

        if self.opts.use_watermark {
            if let Some(newest) = messages.iter().map(|m| m.created_at).max() {
                if let Err(e) = self.store.set_watermark(&self.opts.channel, newest) {
                    tracing::warn!("failed to advance watermark: {e}");
                }
            }
        }

        let mut report = RunReport {
            channel: self.opts.channel.clone(),
            threshold,
            fetched: messages.len(),
            inserted: insert.inserted_count(),
            duplicates: insert.duplicates,
            failed_rows: insert.failed,
            forwarded: 0,
            forward_failures: Vec::new(),
            cancelled: false,
        };

        let to_forward: Vec<&ChatMessage> = match self.opts.forward_policy {
            ForwardPolicy::All => messages.iter().collect(),
            ForwardPolicy::NewOnly => {
                let fresh: HashSet<&MessageId> = insert.inserted.iter().collect();
                messages.iter().filter(|m| fresh.contains(&m.id)).collect()
            }
        };

        for msg in to_forward {
            if cancel.is_cancelled() {
                tracing::warn!(
                    forwarded = report.forwarded,
                    "cancelled; remaining messages were not forwarded"
                );
                report.cancelled = true;
                break;
            }
            match self.forwarder.forward(msg).await {
                Ok(out) => {
                    tracing::debug!(
                        stdout_len = out.stdout.len(),
                        stderr_len = out.stderr.len(),
                        "classified message {}",
                        msg.id
                    );
                    report.forwarded += 1;
                }
                Err(e) => {
                    tracing::warn!("forwarding message {} failed: {e}", msg.id);
                    report.forward_failures.push(msg.id.clone());
                }
            }
        }

        tracing::info!(
            fetched = report.fetched,
            inserted = report.inserted,
            forwarded = report.forwarded,
            forward_failures = report.forward_failures.len(),
            "ingestion run complete"
        );
        Ok(report)
    }
}

/// `now - lookback`, pulled further back to the stored watermark when there is one.
///
/// The watermark never narrows the window: it only closes gaps between runs
/// that were further apart than the lookback.
pub fn compute_threshold(
    now: DateTime<Utc>,
    lookback: Duration,
    watermark: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    let span = chrono::Duration::from_std(lookback)
        .map_err(|e| Error::Config(format!("lookback out of range: {e}")))?;
    let base = now
        .checked_sub_signed(span)
        .ok_or_else(|| Error::Config("lookback reaches before the epoch range".to_string()))?;
    Ok(match watermark {
        Some(wm) if wm < base => wm,
        _ => base,
    })
}
