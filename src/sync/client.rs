//! Client for the sync engine's local control endpoint.
//!
//! The engine exposes a small REST surface on localhost. Access goes through
//! [`SyncGateway`] so the polling logic can be exercised against a scripted
//! engine in tests. All waits are bounded: `wait_for_sync` by the caller's
//! timeout, `watch` by a fixed upper bound on the order of a day.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, trace};

use super::SyncStatus;

/// Interval between polls of the event endpoint.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on a watch session.
pub const WATCH_BOUND: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-request timeout against the local endpoint.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Folder completion as reported by the engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderCompletion {
    pub completion: f64,
    #[serde(default)]
    pub need_items: u64,
    #[serde(default)]
    pub need_deletes: u64,
}

impl FolderCompletion {
    pub fn is_complete(&self) -> bool {
        self.completion >= 100.0 && self.need_items == 0 && self.need_deletes == 0
    }
}

/// A folder-completion event. Event ids are assigned by the engine and are
/// strictly increasing.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncEvent {
    pub id: u64,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// The two queries and one command the client needs from the engine.
#[async_trait]
pub trait SyncGateway: Send + Sync {
    async fn completion(&self) -> Result<FolderCompletion>;

    /// Folder-completion events with id strictly greater than `since`.
    async fn events_after(&self, since: u64) -> Result<Vec<SyncEvent>>;

    /// Force-reconcile by overwriting remote state from local.
    async fn override_remote(&self) -> Result<()>;
}

/// Production gateway speaking HTTP to the engine's GUI/API port.
pub struct HttpSyncGateway {
    http: reqwest::Client,
    base: String,
    api_key: String,
    folder: String,
}

impl HttpSyncGateway {
    pub fn new(port: u16, api_key: String, folder: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building http client for sync engine")?;
        Ok(Self {
            http,
            base: format!("http://127.0.0.1:{}", port),
            api_key,
            folder,
        })
    }
}

#[async_trait]
impl SyncGateway for HttpSyncGateway {
    async fn completion(&self) -> Result<FolderCompletion> {
        let url = format!("{}/rest/db/completion", self.base);
        let completion = self
            .http
            .get(&url)
            .query(&[("folder", self.folder.as_str())])
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("querying folder completion")?
            .error_for_status()
            .context("folder completion query rejected")?
            .json::<FolderCompletion>()
            .await
            .context("decoding folder completion")?;
        trace!(completion = completion.completion, "folder completion");
        Ok(completion)
    }

    async fn events_after(&self, since: u64) -> Result<Vec<SyncEvent>> {
        let url = format!("{}/rest/events", self.base);
        let events = self
            .http
            .get(&url)
            .query(&[
                ("events", "FolderCompletion".to_string()),
                ("since", since.to_string()),
                // Return immediately instead of long-polling; pacing is ours.
                ("timeout", "0".to_string()),
            ])
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("querying sync events")?
            .error_for_status()
            .context("sync event query rejected")?
            .json::<Vec<SyncEvent>>()
            .await
            .context("decoding sync events")?;
        Ok(events)
    }

    async fn override_remote(&self) -> Result<()> {
        let url = format!("{}/rest/db/override", self.base);
        self.http
            .post(&url)
            .query(&[("folder", self.folder.as_str())])
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("requesting folder override")?
            .error_for_status()
            .context("folder override rejected")?;
        Ok(())
    }
}

pub struct SyncStatusClient {
    gateway: Box<dyn SyncGateway>,
    poll_interval: Duration,
}

impl SyncStatusClient {
    pub fn new(gateway: Box<dyn SyncGateway>) -> Self {
        Self {
            gateway,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Single synchronous status query. Never blocks beyond one request.
    pub async fn get_status(&self) -> SyncStatus {
        match self.gateway.completion().await {
            Ok(c) if c.is_complete() => SyncStatus::idle("files are synced"),
            Ok(c) => SyncStatus::syncing(
                format!("syncing, {:.0}% complete", c.completion),
                format!("{} items out of sync", c.need_items + c.need_deletes),
            ),
            Err(e) => SyncStatus::error(
                format!("failed to query sync engine: {:#}", e),
                "check that the sync engine is still running",
            ),
        }
    }

    /// Poll until a folder-completion event is observed or `timeout`
    /// elapses. Always returns a terminal status.
    pub async fn wait_for_sync(&self, timeout: Duration) -> SyncStatus {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return SyncStatus::error("wait for sync finished timeout", "");
            }
            tokio::time::sleep(self.poll_interval).await;

            match self.gateway.events_after(0).await {
                Ok(events) if !events.is_empty() => {
                    return SyncStatus::idle("sync finished");
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "event query failed, retrying until deadline");
                }
            }
        }
    }

    /// One watch step: query events strictly after `cursor`, advance the
    /// cursor by the count received, and report a record when new events
    /// arrived. A previously seen event is never reported again.
    pub async fn watch_poll(&self, cursor: u64) -> (u64, Option<SyncStatus>) {
        match self.gateway.events_after(cursor).await {
            Ok(events) if !events.is_empty() => {
                let next = cursor + events.len() as u64;
                trace!(cursor, next, "new sync events");
                (next, Some(SyncStatus::idle("sync finished")))
            }
            Ok(_) => (cursor, None),
            Err(e) => {
                debug!(error = %e, "event query failed");
                (cursor, None)
            }
        }
    }

    /// Long-running poll. Emits one record per poll that yielded new events,
    /// bounded by [`WATCH_BOUND`]; cancellation is the caller's select.
    pub async fn watch<F: FnMut(&SyncStatus)>(&self, mut emit: F) {
        let deadline = tokio::time::Instant::now() + WATCH_BOUND;

        // Prime the cursor so history is not replayed.
        let mut cursor = match self.gateway.events_after(0).await {
            Ok(events) => events.len() as u64,
            Err(_) => 0,
        };

        while tokio::time::Instant::now() < deadline {
            let (next, status) = self.watch_poll(cursor).await;
            cursor = next;
            match status {
                Some(status) => emit(&status),
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    /// Fire-and-forget force-reconcile; reports only success/failure.
    pub async fn override_remote(&self) -> Result<()> {
        self.gateway.override_remote().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncState;
    use std::sync::Mutex;

    /// Scripted engine: a growing list of event ids and a fixed completion.
    struct FakeGateway {
        event_ids: Mutex<Vec<u64>>,
        completion: Mutex<Option<FolderCompletion>>,
    }

    impl FakeGateway {
        fn new(ids: &[u64]) -> Self {
            Self {
                event_ids: Mutex::new(ids.to_vec()),
                completion: Mutex::new(None),
            }
        }

        fn push_events(&self, ids: &[u64]) {
            self.event_ids.lock().unwrap().extend_from_slice(ids);
        }

        fn set_completion(&self, completion: FolderCompletion) {
            *self.completion.lock().unwrap() = Some(completion);
        }
    }

    #[async_trait]
    impl SyncGateway for FakeGateway {
        async fn completion(&self) -> Result<FolderCompletion> {
            self.completion
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }

        async fn events_after(&self, since: u64) -> Result<Vec<SyncEvent>> {
            Ok(self
                .event_ids
                .lock()
                .unwrap()
                .iter()
                .filter(|id| **id > since)
                .map(|id| SyncEvent {
                    id: *id,
                    kind: "FolderCompletion".to_string(),
                })
                .collect())
        }

        async fn override_remote(&self) -> Result<()> {
            Ok(())
        }
    }

    fn client(gateway: FakeGateway) -> (SyncStatusClient, std::sync::Arc<FakeGateway>) {
        let shared = std::sync::Arc::new(gateway);
        struct Shared(std::sync::Arc<FakeGateway>);
        #[async_trait]
        impl SyncGateway for Shared {
            async fn completion(&self) -> Result<FolderCompletion> {
                self.0.completion().await
            }
            async fn events_after(&self, since: u64) -> Result<Vec<SyncEvent>> {
                self.0.events_after(since).await
            }
            async fn override_remote(&self) -> Result<()> {
                self.0.override_remote().await
            }
        }
        (
            SyncStatusClient::new(Box::new(Shared(shared.clone()))),
            shared,
        )
    }

    #[tokio::test]
    async fn get_status_maps_complete_to_idle() {
        let gateway = FakeGateway::new(&[]);
        gateway.set_completion(FolderCompletion {
            completion: 100.0,
            need_items: 0,
            need_deletes: 0,
        });
        let (client, _) = client(gateway);
        assert_eq!(client.get_status().await.status, SyncState::Idle);
    }

    #[tokio::test]
    async fn get_status_maps_partial_to_syncing_with_out_of_sync_listing() {
        let gateway = FakeGateway::new(&[]);
        gateway.set_completion(FolderCompletion {
            completion: 40.0,
            need_items: 2,
            need_deletes: 1,
        });
        let (client, _) = client(gateway);
        let status = client.get_status().await;
        assert_eq!(status.status, SyncState::Syncing);
        assert_eq!(status.out_of_sync, "3 items out of sync");
    }

    #[tokio::test]
    async fn get_status_maps_query_failure_to_error() {
        let (client, _) = client(FakeGateway::new(&[]));
        let status = client.get_status().await;
        assert_eq!(status.status, SyncState::Error);
        assert!(status.msg.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_sync_returns_timeout_within_bounds() {
        // Engine never reports a completion event.
        let (client, _) = client(FakeGateway::new(&[]));

        let started = tokio::time::Instant::now();
        let status = client.wait_for_sync(Duration::from_secs(1)).await;
        let elapsed = started.elapsed();

        assert_eq!(status.status, SyncState::Error);
        assert!(status.msg.contains("timeout"));
        assert!(elapsed >= Duration::from_secs(1), "returned early: {:?}", elapsed);
        assert!(
            elapsed <= Duration::from_millis(1200),
            "unbounded wait: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn wait_for_sync_converges_on_completion_event() {
        let (client, _) = client(FakeGateway::new(&[1]));
        let status = client.wait_for_sync(Duration::from_secs(5)).await;
        assert_eq!(status.status, SyncState::Idle);
        assert_eq!(status.msg, "sync finished");
    }

    #[tokio::test]
    async fn watch_cursor_never_reemits_seen_events() {
        let (client, gateway) = client(FakeGateway::new(&[1, 2, 3]));

        // Prime exactly the way watch() does.
        let mut cursor = gateway.events_after(0).await.unwrap().len() as u64;
        assert_eq!(cursor, 3);

        // Nothing new yet: no record.
        let (next, status) = client.watch_poll(cursor).await;
        assert_eq!(next, 3);
        assert!(status.is_none());
        cursor = next;

        // Ids 4 and 5 arrive: exactly one record for the batch.
        gateway.push_events(&[4, 5]);
        let (next, status) = client.watch_poll(cursor).await;
        assert_eq!(next, 5);
        assert!(status.is_some());
        cursor = next;

        // Cursor advanced past them: never re-emitted.
        let (next, status) = client.watch_poll(cursor).await;
        assert_eq!(next, 5);
        assert!(status.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_primes_cursor_and_emits_once_per_batch() {
        let (client, gateway) = client(FakeGateway::new(&[1, 2, 3]));

        let mut records = Vec::new();
        tokio::select! {
            _ = client.watch(|status| records.push(status.clone())) => {}
            _ = async {
                // Let the prime and a few idle polls pass.
                tokio::time::sleep(Duration::from_millis(350)).await;
                gateway.push_events(&[4, 5]);
                tokio::time::sleep(Duration::from_millis(350)).await;
            } => {}
        }

        // History [1, 2, 3] was consumed by the prime and never replayed;
        // the 4-5 batch produced exactly one record.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SyncState::Idle);
        assert_eq!(records[0].msg, "sync finished");
    }

    #[tokio::test]
    async fn watch_poll_holds_cursor_on_query_failure() {
        struct Failing;
        #[async_trait]
        impl SyncGateway for Failing {
            async fn completion(&self) -> Result<FolderCompletion> {
                anyhow::bail!("down")
            }
            async fn events_after(&self, _since: u64) -> Result<Vec<SyncEvent>> {
                anyhow::bail!("down")
            }
            async fn override_remote(&self) -> Result<()> {
                anyhow::bail!("down")
            }
        }
        let client = SyncStatusClient::new(Box::new(Failing));
        let (next, status) = client.watch_poll(7).await;
        assert_eq!(next, 7);
        assert!(status.is_none());
    }
}
