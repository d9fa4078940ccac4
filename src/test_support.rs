//! Fakes shared by the unit tests: a scripted profile source, an in-memory
//! blob store, a recording notifier and a fully wired fetcher over a temp
//! database.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::blob::{BlobError, BlobStore};
use crate::db::{test_utils::shared_test_db, SharedDb};
use crate::fetcher::retry::RetryPolicy;
use crate::fetcher::{FetchSettings, ProfileFetcher};
use crate::notification::{Notification, Notifier, NotifyError};
use crate::profile_api::{ApiProfile, FetchOutcome, FetchedProfile, GeoData, ProfileSource};
use crate::quota::QuotaManager;
use crate::types::{PROFILE_FETCHER_JOB, QUOTA_RESET_JOB};

/// A `Found` outcome for `identifier` with a small but complete profile.
pub fn found(identifier: &str) -> FetchOutcome {
    let profile = ApiProfile {
        urn: Some(identifier.to_string()),
        username: Some(format!("user-{}", identifier)),
        first_name: Some("Test".into()),
        last_name: Some("Person".into()),
        headline: Some("Engineer".into()),
        geo: Some(GeoData {
            country: Some("Norway".into()),
            city: Some("Oslo".into()),
            ..Default::default()
        }),
        educations: Some(vec![]),
        full_positions: Some(vec![serde_json::json!({"companyName": "Acme"})]),
        skills: Some(vec![]),
    };
    let raw = serde_json::to_vec(&serde_json::json!({"success": true, "data": &profile}))
        .unwrap_or_default();
    FetchOutcome::Found(FetchedProfile { profile, raw })
}

/// Replays queued outcomes per identifier, then answers `Found`.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<FetchOutcome>>>,
    calls: Mutex<HashMap<String, usize>>,
    hanging: Mutex<HashSet<String>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, identifier: &str, outcome: FetchOutcome) {
        self.scripts
            .lock()
            .entry(identifier.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Calls for `identifier` never complete.
    pub fn hang(&self, identifier: &str) {
        self.hanging.lock().insert(identifier.to_string());
    }

    pub fn calls(&self, identifier: &str) -> usize {
        self.calls.lock().get(identifier).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl ProfileSource for ScriptedSource {
    async fn fetch_profile(&self, identifier: &str) -> FetchOutcome {
        *self.calls.lock().entry(identifier.to_string()).or_default() += 1;
        if self.hanging.lock().contains(identifier) {
            std::future::pending::<()>().await;
        }
        let next = self
            .scripts
            .lock()
            .get_mut(identifier)
            .and_then(|q| q.pop_front());
        next.unwrap_or_else(|| found(identifier))
    }
}

/// In-memory blob store. Keys containing a registered fragment fail.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn fail_keys_containing(&self, fragment: &str) {
        self.failing.lock().push(fragment.to_string());
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        if self.failing.lock().iter().any(|f| key.contains(f.as_str())) {
            return Err(BlobError::Upload(format!("simulated outage for {}", key)));
        }
        self.objects.lock().insert(key.to_string(), bytes);
        Ok(())
    }
}

/// Keeps every delivered notification; can be told to fail the next N sends.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failures_left: AtomicUsize,
}

impl RecordingNotifier {
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent.lock().iter().map(|n| n.subject()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(NotifyError::Rejected(503));
        }
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

/// Fetcher wired to fakes over a fresh temp database.
pub struct Harness {
    pub db: SharedDb,
    pub source: Arc<ScriptedSource>,
    pub blobs: Arc<MemoryBlobStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub quota: Arc<QuotaManager>,
    pub fetcher: Arc<ProfileFetcher>,
}

impl Harness {
    pub fn new(monthly_limit: i64) -> Self {
        let db = shared_test_db();
        let source = Arc::new(ScriptedSource::new());
        let blobs = Arc::new(MemoryBlobStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let quota = Arc::new(QuotaManager::new(
            db.clone(),
            notifier.clone(),
            monthly_limit,
        ));
        let settings = FetchSettings {
            retry: RetryPolicy {
                max_retries: 3,
                backoff_base: Duration::from_secs(1),
                backoff_max: Duration::from_secs(60),
                error_delay: Duration::from_secs(1),
            },
            inter_item_delay: Duration::from_secs(5),
            timezone: chrono_tz::UTC,
            claim_ttl: Duration::from_secs(240),
        };
        let fetcher = Arc::new(ProfileFetcher::new(
            db.clone(),
            source.clone(),
            blobs.clone(),
            quota.clone(),
            notifier.clone(),
            settings,
        ));
        Self {
            db,
            source,
            blobs,
            notifier,
            quota,
            fetcher,
        }
    }

    /// Seed the `profile_fetcher` job row.
    pub fn with_fetch_job(self, batch_size: i64, respect_quota: bool) -> Self {
        self.db
            .lock()
            .insert_cron_job_if_absent(
                PROFILE_FETCHER_JOB,
                "profile_fetcher",
                "0 2 * * *",
                batch_size,
                respect_quota,
                None,
            )
            .expect("seed fetch job");
        self
    }

    pub fn with_reset_job(self) -> Self {
        self.db
            .lock()
            .insert_cron_job_if_absent(QUOTA_RESET_JOB, "quota_reset", "0 0 1 * *", 10, true, None)
            .expect("seed reset job");
        self
    }

    /// Queue identifiers as pending entries, returning their ids in order.
    pub fn queue(&self, identifiers: &[&str]) -> Vec<String> {
        let db = self.db.lock();
        identifiers
            .iter()
            .map(|i| db.insert_profile_entry(i, None).expect("queue entry").id)
            .collect()
    }

    /// Pre-load this month's call count.
    pub fn use_calls(&self, calls: i64) {
        let current = self.quota.current_status().expect("quota status");
        self.db
            .lock()
            .increment_quota_calls(current.month, current.year, calls, current.quota_limit)
            .expect("increment quota");
    }
}
