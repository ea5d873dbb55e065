//! Per-principal usage metering.
//!
//! Every principal gets one aggregation task, started the first time the
//! principal is tracked. Reporters push amounts through [`UsageSink`]s and
//! never touch the counters; the aggregation task is their only writer and
//! applies updates in the order they were sent. The registry lock is held
//! only to look up or add a principal.

use crate::models::usage::Usage;
use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug)]
enum UsageEvent {
    UploadBytes(u64),
    UploadRequests(u64),
    DownloadBytes(u64),
    DownloadRequests(u64),
    Snapshot(oneshot::Sender<Usage>),
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    UploadBytes,
    UploadRequests,
    DownloadBytes,
    DownloadRequests,
}

impl Counter {
    fn event(self, amount: u64) -> UsageEvent {
        match self {
            Counter::UploadBytes => UsageEvent::UploadBytes(amount),
            Counter::UploadRequests => UsageEvent::UploadRequests(amount),
            Counter::DownloadBytes => UsageEvent::DownloadBytes(amount),
            Counter::DownloadRequests => UsageEvent::DownloadRequests(amount),
        }
    }
}

/// Write-only handle onto one counter of one principal.
#[derive(Debug, Clone)]
pub struct UsageSink {
    tx: mpsc::UnboundedSender<UsageEvent>,
    counter: Counter,
}

impl UsageSink {
    /// Queue `amount` for the principal's aggregation task. Never blocks.
    pub fn record(&self, amount: u64) {
        // The aggregation task lives as long as the registry entry, so a
        // send only fails while the runtime is shutting down.
        let _ = self.tx.send(self.counter.event(amount));
    }
}

/// Registry of per-principal aggregation tasks. Cheap to clone.
#[derive(Clone, Default)]
pub struct UsageTracker {
    records: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<UsageEvent>>>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sinks for `(uploaded bytes, upload requests)`.
    pub fn track_uploads(&self, principal: &str) -> (UsageSink, UsageSink) {
        let tx = self.sender(principal);
        (
            UsageSink {
                tx: tx.clone(),
                counter: Counter::UploadBytes,
            },
            UsageSink {
                tx,
                counter: Counter::UploadRequests,
            },
        )
    }

    /// Sinks for `(downloaded bytes, download requests)`.
    pub fn track_downloads(&self, principal: &str) -> (UsageSink, UsageSink) {
        let tx = self.sender(principal);
        (
            UsageSink {
                tx: tx.clone(),
                counter: Counter::DownloadBytes,
            },
            UsageSink {
                tx,
                counter: Counter::DownloadRequests,
            },
        )
    }

    /// Current counters for `principal`, or `None` if it was never tracked.
    ///
    /// The request travels through the same channel as the reports, so the
    /// snapshot includes everything recorded before this call.
    pub async fn usage(&self, principal: &str) -> Option<Usage> {
        let tx = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(principal)
            .cloned()?;
        let (reply, response) = oneshot::channel();
        tx.send(UsageEvent::Snapshot(reply)).ok()?;
        response.await.ok()
    }

    /// Sender for `principal`, spawning its aggregation task on first use.
    fn sender(&self, principal: &str) -> mpsc::UnboundedSender<UsageEvent> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .entry(principal.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(aggregate(principal.to_string(), rx));
                debug!(principal, "started usage aggregation");
                tx
            })
            .clone()
    }
}

async fn aggregate(principal: String, mut rx: mpsc::UnboundedReceiver<UsageEvent>) {
    let mut usage = Usage::default();
    while let Some(event) = rx.recv().await {
        match event {
            UsageEvent::UploadBytes(n) => {
                usage.uploaded_bytes = usage.uploaded_bytes.saturating_add(n)
            }
            UsageEvent::UploadRequests(n) => {
                usage.upload_requests = usage.upload_requests.saturating_add(n)
            }
            UsageEvent::DownloadBytes(n) => {
                usage.downloaded_bytes = usage.downloaded_bytes.saturating_add(n)
            }
            UsageEvent::DownloadRequests(n) => {
                usage.download_requests = usage.download_requests.saturating_add(n)
            }
            UsageEvent::Snapshot(reply) => {
                let _ = reply.send(usage.clone());
                continue;
            }
        }
        usage.last_activity = Some(Utc::now());
    }
    debug!(principal, "usage aggregation stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unseen_principal_has_no_usage() {
        let tracker = UsageTracker::new();
        assert!(tracker.usage("nobody").await.is_none());
    }

    #[tokio::test]
    async fn uploads_and_downloads_accumulate_separately() {
        let tracker = UsageTracker::new();
        let (bytes, requests) = tracker.track_uploads("alice");
        bytes.record(10);
        requests.record(1);
        bytes.record(5);
        requests.record(1);
        let (bytes, requests) = tracker.track_downloads("alice");
        bytes.record(7);
        requests.record(1);

        let usage = tracker.usage("alice").await.unwrap();
        assert_eq!(usage.uploaded_bytes, 15);
        assert_eq!(usage.upload_requests, 2);
        assert_eq!(usage.downloaded_bytes, 7);
        assert_eq!(usage.download_requests, 1);
        assert!(usage.last_activity.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reporters_lose_nothing() {
        let tracker = UsageTracker::new();
        let handles: Vec<_> = (1..=50u64)
            .map(|size| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    let (bytes, requests) = tracker.track_uploads("bob");
                    bytes.record(size);
                    requests.record(1);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let usage = tracker.usage("bob").await.unwrap();
        assert_eq!(usage.uploaded_bytes, (1..=50).sum::<u64>());
        assert_eq!(usage.upload_requests, 50);
    }

    #[tokio::test]
    async fn principals_are_isolated() {
        let tracker = UsageTracker::new();
        tracker.track_uploads("alice").0.record(3);
        tracker.track_uploads("bob").0.record(4);

        assert_eq!(tracker.usage("alice").await.unwrap().uploaded_bytes, 3);
        assert_eq!(tracker.usage("bob").await.unwrap().uploaded_bytes, 4);
    }
}
