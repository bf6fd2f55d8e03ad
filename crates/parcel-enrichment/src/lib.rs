//! Per-address enrichment locking and status reporting.
//!
//! Every `acquire` is one conditional write in the store. Provider calls happen
//! outside the manager, between `acquire` and `complete`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parcel_core::{EnrichmentState, EnrichmentStatus, OwnerRecord};
use parcel_storage::{chunked_lookup, EnrichmentStore, LockRelease, LockRequest, StoreError, DEFAULT_CHUNK_SIZE};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "parcel-enrichment";

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("address hash must not be blank")]
    BlankAddressHash,
    #[error("duration out of range: {0:?}")]
    DurationOutOfRange(Duration),
}

impl EnrichmentError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_unavailable())
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Locks older than this may be taken over by a later `acquire`. `None` never reclaims.
    pub lock_ttl: Option<Duration>,
    pub chunk_size: usize,
    pub provider_timeout: Duration,
    pub worker_concurrency: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            lock_ttl: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            provider_timeout: Duration::from_secs(30),
            worker_concurrency: 4,
        }
    }
}

impl EnrichmentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            lock_ttl: parsed("PARCEL_LOCK_TTL_SECS").map(Duration::from_secs),
            chunk_size: parsed("PARCEL_CHUNK_SIZE")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.chunk_size),
            provider_timeout: parsed("PARCEL_PROVIDER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.provider_timeout),
            worker_concurrency: parsed("PARCEL_ENRICHMENT_CONCURRENCY")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.worker_concurrency),
        }
    }
}

/// Proof of holding the lock for one address. Completing with a ticket whose
/// token no longer matches the row is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub address_hash: String,
    pub lock_token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(Ticket),
    AlreadyInProgress,
    /// No active listing references the address; it is never locked again.
    Orphaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    Enriched,
    NoData,
    Failed,
}

impl EnrichmentOutcome {
    pub fn status(self) -> EnrichmentStatus {
        match self {
            EnrichmentOutcome::Enriched => EnrichmentStatus::Enriched,
            EnrichmentOutcome::NoData => EnrichmentStatus::NoData,
            EnrichmentOutcome::Failed => EnrichmentStatus::Failed,
        }
    }
}

fn to_chrono(d: Duration) -> Result<chrono::Duration, EnrichmentError> {
    chrono::Duration::from_std(d).map_err(|_| EnrichmentError::DurationOutOfRange(d))
}

fn lock_release(
    ticket: &Ticket,
    outcome: EnrichmentOutcome,
    reason: Option<&str>,
    source_used: Option<&str>,
) -> LockRelease {
    LockRelease {
        address_hash: ticket.address_hash.clone(),
        lock_token: ticket.lock_token,
        status: outcome.status(),
        failure_reason: match outcome {
            EnrichmentOutcome::Failed => reason.map(ToString::to_string),
            _ => None,
        },
        source_used: source_used.map(ToString::to_string),
        checked_at: Utc::now(),
    }
}

fn log_release(ticket: &Ticket, release: &LockRelease, released: bool) {
    if released {
        debug!(address_hash = %ticket.address_hash, status = %release.status, "enrichment lock released");
    } else {
        warn!(
            address_hash = %ticket.address_hash,
            lock_token = %ticket.lock_token,
            "ignoring completion for a lock this ticket no longer holds"
        );
    }
}

pub struct EnrichmentManager {
    store: Arc<dyn EnrichmentStore>,
    config: EnrichmentConfig,
}

impl EnrichmentManager {
    pub fn new(store: Arc<dyn EnrichmentStore>, config: EnrichmentConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    pub async fn acquire(&self, address_hash: &str) -> Result<AcquireOutcome, EnrichmentError> {
        self.acquire_for_listing(address_hash, None).await
    }

    /// Like `acquire`, recording which listing source asked for the lookup.
    pub async fn acquire_for_listing(
        &self,
        address_hash: &str,
        listing_source: Option<&str>,
    ) -> Result<AcquireOutcome, EnrichmentError> {
        if address_hash.trim().is_empty() {
            return Err(EnrichmentError::BlankAddressHash);
        }
        let now = Utc::now();
        let reclaim_before = match self.config.lock_ttl {
            Some(ttl) => Some(now - to_chrono(ttl)?),
            None => None,
        };
        let request = LockRequest {
            address_hash: address_hash.to_string(),
            lock_token: Uuid::new_v4(),
            now,
            reclaim_before,
            listing_source: listing_source.map(ToString::to_string),
        };

        if self.store.try_lock_enrichment(&request).await? {
            debug!(address_hash, lock_token = %request.lock_token, "enrichment lock acquired");
            return Ok(AcquireOutcome::Acquired(Ticket {
                address_hash: request.address_hash,
                lock_token: request.lock_token,
                acquired_at: now,
            }));
        }

        let states = self.store.enrichment_states(&[request.address_hash]).await?;
        match states.get(address_hash).map(|s| s.status) {
            Some(EnrichmentStatus::Orphaned) => Ok(AcquireOutcome::Orphaned),
            _ => Ok(AcquireOutcome::AlreadyInProgress),
        }
    }

    /// Releases the lock and records the outcome. Returns false when the ticket is stale.
    pub async fn complete(
        &self,
        ticket: &Ticket,
        outcome: EnrichmentOutcome,
        reason: Option<&str>,
    ) -> Result<bool, EnrichmentError> {
        self.release(ticket, outcome, reason, None).await
    }

    /// Completes as `enriched` and stores the owner record in the same store
    /// operation. A stale ticket writes neither.
    pub async fn complete_enriched(
        &self,
        ticket: &Ticket,
        mut record: OwnerRecord,
        source_used: Option<&str>,
    ) -> Result<bool, EnrichmentError> {
        record.address_hash = ticket.address_hash.clone();
        if record.source.is_none() {
            record.source = source_used.map(ToString::to_string);
        }
        let release = lock_release(ticket, EnrichmentOutcome::Enriched, None, source_used);
        let released = self.store.complete_with_owner(&release, &record).await?;
        log_release(ticket, &release, released);
        Ok(released)
    }

    async fn release(
        &self,
        ticket: &Ticket,
        outcome: EnrichmentOutcome,
        reason: Option<&str>,
        source_used: Option<&str>,
    ) -> Result<bool, EnrichmentError> {
        let release = lock_release(ticket, outcome, reason, source_used);
        let released = self.store.release_enrichment(&release).await?;
        log_release(ticket, &release, released);
        Ok(released)
    }

    /// Owner data with any contact field reports `enriched` regardless of the state row.
    pub async fn current_status(&self, address_hash: &str) -> Result<EnrichmentStatus, EnrichmentError> {
        let statuses = self.statuses(&[address_hash.to_string()]).await?;
        Ok(statuses
            .get(address_hash)
            .copied()
            .unwrap_or(EnrichmentStatus::NeverChecked))
    }

    pub async fn statuses(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, EnrichmentStatus>, EnrichmentError> {
        let (states, owners) = tokio::try_join!(self.states(hashes), self.owner_records(hashes))?;
        Ok(hashes
            .iter()
            .filter(|h| !h.trim().is_empty())
            .map(|h| {
                let status = if owners.get(h).is_some_and(OwnerRecord::has_contact) {
                    EnrichmentStatus::Enriched
                } else {
                    states
                        .get(h)
                        .map(|s| s.status)
                        .unwrap_or(EnrichmentStatus::NeverChecked)
                };
                (h.clone(), status)
            })
            .collect())
    }

    pub async fn states(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, EnrichmentState>, EnrichmentError> {
        let store = &self.store;
        Ok(chunked_lookup(hashes, self.config.chunk_size, |chunk| async move {
            store.enrichment_states(&chunk).await
        })
        .await?)
    }

    pub async fn owner_records(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, OwnerRecord>, EnrichmentError> {
        let store = &self.store;
        Ok(chunked_lookup(hashes, self.config.chunk_size, |chunk| async move {
            store.owner_records(&chunk).await
        })
        .await?)
    }

    pub async fn mark_orphans(&self) -> Result<Vec<String>, EnrichmentError> {
        let orphaned = self.store.orphan_unreferenced(Utc::now()).await?;
        info!(count = orphaned.len(), "marked enrichment states orphaned");
        Ok(orphaned)
    }

    /// Rows still `checking` whose lock is older than `older_than`.
    pub async fn stale_locks(&self, older_than: Duration) -> Result<Vec<EnrichmentState>, EnrichmentError> {
        let cutoff = Utc::now() - to_chrono(older_than)?;
        Ok(self.store.locked_before(cutoff).await?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentRequest {
    pub address_hash: String,
    pub address: Option<String>,
    pub listing_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderLookup {
    Found(OwnerRecord),
    NotFound,
}

/// External owner-data lookup. Implementations live outside this workspace.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, request: &EnrichmentRequest) -> anyhow::Result<ProviderLookup>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentRunSummary {
    pub requested: usize,
    pub enriched: usize,
    pub no_data: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub in_progress: usize,
    pub orphaned: usize,
    /// Completions dropped because the lock had been reclaimed meanwhile.
    pub stale: usize,
    /// Items whose store calls were rejected; the rest of the run still finishes.
    pub errors: usize,
}

enum ItemOutcome {
    Completed(EnrichmentOutcome, bool),
    TimedOut(bool),
    InProgress,
    Orphaned,
}

pub struct EnrichmentWorker<P> {
    manager: Arc<EnrichmentManager>,
    provider: P,
}

impl<P: EnrichmentProvider> EnrichmentWorker<P> {
    pub fn new(manager: Arc<EnrichmentManager>, provider: P) -> Self {
        Self { manager, provider }
    }

    /// Acquire, look up under the provider timeout, complete. Every item runs to
    /// completion before the run returns, so no acquired lock is abandoned
    /// mid-flight. Rejected store calls are counted in `errors`; an unavailable
    /// store fails the run once all items have settled.
    pub async fn run(&self, requests: &[EnrichmentRequest]) -> Result<EnrichmentRunSummary, EnrichmentError> {
        let concurrency = self.manager.config.worker_concurrency.max(1);
        let results = stream::iter(requests)
            .map(|request| async move { (request, self.process(request).await) })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut summary = EnrichmentRunSummary {
            requested: requests.len(),
            ..Default::default()
        };
        let mut unavailable = None;
        for (request, result) in results {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) if err.is_unavailable() => {
                    unavailable.get_or_insert(err);
                    continue;
                }
                Err(err) => {
                    warn!(address_hash = %request.address_hash, error = %err, "enrichment item failed");
                    summary.errors += 1;
                    continue;
                }
            };
            let released = match outcome {
                ItemOutcome::Completed(EnrichmentOutcome::Enriched, released) => {
                    summary.enriched += 1;
                    released
                }
                ItemOutcome::Completed(EnrichmentOutcome::NoData, released) => {
                    summary.no_data += 1;
                    released
                }
                ItemOutcome::Completed(EnrichmentOutcome::Failed, released) => {
                    summary.failed += 1;
                    released
                }
                ItemOutcome::TimedOut(released) => {
                    summary.timed_out += 1;
                    released
                }
                ItemOutcome::InProgress => {
                    summary.in_progress += 1;
                    true
                }
                ItemOutcome::Orphaned => {
                    summary.orphaned += 1;
                    true
                }
            };
            if !released {
                summary.stale += 1;
            }
        }
        info!(
            provider = self.provider.name(),
            requested = summary.requested,
            enriched = summary.enriched,
            no_data = summary.no_data,
            failed = summary.failed,
            timed_out = summary.timed_out,
            in_progress = summary.in_progress,
            errors = summary.errors,
            "enrichment run finished"
        );
        if let Some(err) = unavailable {
            return Err(err);
        }
        Ok(summary)
    }

    async fn process(&self, request: &EnrichmentRequest) -> Result<ItemOutcome, EnrichmentError> {
        let ticket = match self
            .manager
            .acquire_for_listing(&request.address_hash, request.listing_source.as_deref())
            .await?
        {
            AcquireOutcome::Acquired(ticket) => ticket,
            AcquireOutcome::AlreadyInProgress => return Ok(ItemOutcome::InProgress),
            AcquireOutcome::Orphaned => return Ok(ItemOutcome::Orphaned),
        };

        let timeout = self.manager.config.provider_timeout;
        let source = self.provider.name();
        match tokio::time::timeout(timeout, self.provider.lookup(request)).await {
            Ok(Ok(ProviderLookup::Found(record))) if record.has_contact() => {
                let released = self
                    .manager
                    .complete_enriched(&ticket, record, Some(source))
                    .await?;
                Ok(ItemOutcome::Completed(EnrichmentOutcome::Enriched, released))
            }
            Ok(Ok(_)) => {
                let released = self
                    .manager
                    .complete(&ticket, EnrichmentOutcome::NoData, None)
                    .await?;
                Ok(ItemOutcome::Completed(EnrichmentOutcome::NoData, released))
            }
            Ok(Err(err)) => {
                let reason = format!("{err:#}");
                warn!(address_hash = %request.address_hash, provider = source, error = %reason, "owner lookup failed");
                let released = self
                    .manager
                    .complete(&ticket, EnrichmentOutcome::Failed, Some(&reason))
                    .await?;
                Ok(ItemOutcome::Completed(EnrichmentOutcome::Failed, released))
            }
            Err(_) => {
                warn!(address_hash = %request.address_hash, provider = source, ?timeout, "owner lookup timed out");
                let released = self
                    .manager
                    .complete(&ticket, EnrichmentOutcome::Failed, Some("timeout"))
                    .await?;
                Ok(ItemOutcome::TimedOut(released))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcel_core::{address_hash, RawListing, StoredListing};
    use parcel_storage::MemoryStore;

    fn manager_with(store: Arc<MemoryStore>, config: EnrichmentConfig) -> EnrichmentManager {
        EnrichmentManager::new(store, config)
    }

    fn owner(hash: &str, name: Option<&str>) -> OwnerRecord {
        OwnerRecord {
            address_hash: hash.to_string(),
            owner_name: name.map(ToString::to_string),
            owner_email: None,
            owner_phone: None,
            mailing_address: None,
            source: None,
        }
    }

    fn state(hash: &str, status: EnrichmentStatus) -> EnrichmentState {
        EnrichmentState {
            address_hash: hash.to_string(),
            status,
            locked: false,
            lock_token: None,
            locked_at: None,
            checked_at: None,
            failure_reason: None,
            listing_source: None,
            source_used: None,
            updated_at: Utc::now(),
        }
    }

    fn ticket_of(outcome: AcquireOutcome) -> Ticket {
        match outcome {
            AcquireOutcome::Acquired(ticket) => ticket,
            other => panic!("expected a ticket, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn owner_data_overrides_failed_state() {
        let store = Arc::new(MemoryStore::new());
        store.seed_state(state("H", EnrichmentStatus::Failed)).await;
        store.seed_owner(owner("H", Some("Jane Doe"))).await;
        let manager = manager_with(store, EnrichmentConfig::default());

        assert_eq!(manager.current_status("H").await.expect("status"), EnrichmentStatus::Enriched);
    }

    #[tokio::test]
    async fn blank_owner_record_does_not_override() {
        let store = Arc::new(MemoryStore::new());
        store.seed_state(state("H", EnrichmentStatus::NoData)).await;
        store.seed_owner(owner("H", Some("  "))).await;
        let manager = manager_with(store, EnrichmentConfig::default());

        assert_eq!(manager.current_status("H").await.expect("status"), EnrichmentStatus::NoData);
        assert_eq!(
            manager.current_status("unknown").await.expect("status"),
            EnrichmentStatus::NeverChecked
        );
    }

    #[tokio::test]
    async fn acquire_then_complete_cycles_through_states() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with(store.clone(), EnrichmentConfig::default());

        let ticket = ticket_of(manager.acquire("H").await.expect("acquire"));
        let row = store.state_for("H").await.expect("row created");
        assert!(row.locked);
        assert_eq!(row.status, EnrichmentStatus::Checking);
        assert_eq!(manager.acquire("H").await.expect("second"), AcquireOutcome::AlreadyInProgress);

        let released = manager
            .complete(&ticket, EnrichmentOutcome::Failed, Some("provider 503"))
            .await
            .expect("complete");
        assert!(released);
        let row = store.state_for("H").await.expect("row");
        assert!(!row.locked);
        assert_eq!(row.status, EnrichmentStatus::Failed);
        assert_eq!(row.failure_reason.as_deref(), Some("provider 503"));
        assert!(row.checked_at.is_some());

        let again = ticket_of(manager.acquire("H").await.expect("re-enter"));
        manager
            .complete(&again, EnrichmentOutcome::NoData, Some("ignored"))
            .await
            .expect("complete");
        let row = store.state_for("H").await.expect("row");
        assert_eq!(row.status, EnrichmentStatus::NoData);
        assert_eq!(row.failure_reason, None);
    }

    #[tokio::test]
    async fn duplicate_completion_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager_with(store.clone(), EnrichmentConfig::default());
        let ticket = ticket_of(manager.acquire("H").await.expect("acquire"));

        assert!(manager.complete(&ticket, EnrichmentOutcome::NoData, None).await.expect("first"));
        let next = ticket_of(manager.acquire("H").await.expect("next holder"));
        assert!(!manager
            .complete(&ticket, EnrichmentOutcome::Failed, Some("late"))
            .await
            .expect("duplicate"));

        let row = store.state_for("H").await.expect("row");
        assert!(row.locked);
        assert_eq!(row.lock_token, Some(next.lock_token));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_acquires_yield_exactly_one_ticket() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(manager_with(store, EnrichmentConfig::default()));

        let handles = (0..32)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.acquire("H").await })
            })
            .collect::<Vec<_>>();

        let mut acquired = 0;
        let mut in_progress = 0;
        for handle in handles {
            match handle.await.expect("join").expect("acquire") {
                AcquireOutcome::Acquired(_) => acquired += 1,
                AcquireOutcome::AlreadyInProgress => in_progress += 1,
                AcquireOutcome::Orphaned => panic!("not orphaned"),
            }
        }
        assert_eq!(acquired, 1);
        assert_eq!(in_progress, 31);
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimed_and_old_ticket_goes_stale() {
        let store = Arc::new(MemoryStore::new());
        let old_token = Uuid::new_v4();
        let mut stuck = state("H", EnrichmentStatus::Checking);
        stuck.locked = true;
        stuck.lock_token = Some(old_token);
        stuck.locked_at = Some(Utc::now() - chrono::Duration::hours(2));
        store.seed_state(stuck).await;

        let no_ttl = manager_with(store.clone(), EnrichmentConfig::default());
        assert_eq!(no_ttl.acquire("H").await.expect("no reclaim"), AcquireOutcome::AlreadyInProgress);
        assert_eq!(no_ttl.stale_locks(Duration::from_secs(3600)).await.expect("stale").len(), 1);

        let with_ttl = manager_with(
            store.clone(),
            EnrichmentConfig {
                lock_ttl: Some(Duration::from_secs(600)),
                ..EnrichmentConfig::default()
            },
        );
        let fresh = ticket_of(with_ttl.acquire("H").await.expect("reclaim"));
        assert_ne!(fresh.lock_token, old_token);

        let old_ticket = Ticket {
            address_hash: "H".into(),
            lock_token: old_token,
            acquired_at: Utc::now(),
        };
        assert!(!with_ttl
            .complete(&old_ticket, EnrichmentOutcome::Enriched, None)
            .await
            .expect("stale complete"));
        assert_eq!(store.state_for("H").await.expect("row").lock_token, Some(fresh.lock_token));
        assert!(with_ttl.stale_locks(Duration::from_secs(3600)).await.expect("stale").is_empty());
    }

    #[tokio::test]
    async fn stale_enriched_completion_writes_no_owner_record() {
        let store = Arc::new(MemoryStore::new());
        let old_token = Uuid::new_v4();
        let mut stuck = state("H", EnrichmentStatus::Checking);
        stuck.locked = true;
        stuck.lock_token = Some(old_token);
        stuck.locked_at = Some(Utc::now() - chrono::Duration::hours(2));
        store.seed_state(stuck).await;

        let manager = manager_with(
            store.clone(),
            EnrichmentConfig {
                lock_ttl: Some(Duration::from_secs(600)),
                ..EnrichmentConfig::default()
            },
        );
        let fresh = ticket_of(manager.acquire("H").await.expect("reclaim"));
        assert!(manager
            .complete(&fresh, EnrichmentOutcome::NoData, None)
            .await
            .expect("current holder completes"));

        let old_ticket = Ticket {
            address_hash: "H".into(),
            lock_token: old_token,
            acquired_at: Utc::now(),
        };
        let released = manager
            .complete_enriched(&old_ticket, owner("H", Some("Stale Writer")), Some("county"))
            .await
            .expect("stale complete");
        assert!(!released);

        let owners = manager.owner_records(&["H".to_string()]).await.expect("owners");
        assert!(owners.is_empty());
        assert_eq!(manager.current_status("H").await.expect("status"), EnrichmentStatus::NoData);
    }

    #[tokio::test]
    async fn orphans_are_marked_and_never_locked() {
        let store = Arc::new(MemoryStore::new());
        let live = address_hash("1 main");
        let now = Utc::now();
        store
            .seed_listing(StoredListing {
                id: Uuid::new_v4(),
                source_id: "zillow".into(),
                fields: RawListing {
                    address: Some("1 Main St".into()),
                    ..Default::default()
                },
                address_hash: Some(live.clone()),
                is_active: true,
                removed_at: None,
                scrape_timestamp: now,
                created_at: now,
                updated_at: now,
            })
            .await;
        store.seed_state(state(&live, EnrichmentStatus::Enriched)).await;
        store.seed_state(state("gone", EnrichmentStatus::NoData)).await;
        let manager = manager_with(store, EnrichmentConfig::default());

        assert_eq!(manager.mark_orphans().await.expect("orphans"), vec!["gone".to_string()]);
        assert_eq!(manager.acquire("gone").await.expect("acquire"), AcquireOutcome::Orphaned);
        assert_eq!(manager.current_status("gone").await.expect("status"), EnrichmentStatus::Orphaned);
        assert!(matches!(manager.acquire(&live).await.expect("live"), AcquireOutcome::Acquired(_)));
    }

    #[tokio::test]
    async fn batched_reads_are_chunked_and_merged() {
        let store = Arc::new(MemoryStore::with_key_limit(3));
        for i in 0..10 {
            store.seed_state(state(&format!("h{i}"), EnrichmentStatus::NoData)).await;
        }
        store.seed_owner(owner("h7", Some("Ada Owner"))).await;
        let manager = manager_with(
            store.clone(),
            EnrichmentConfig {
                chunk_size: 3,
                ..EnrichmentConfig::default()
            },
        );

        let hashes = (0..12).map(|i| format!("h{i}")).collect::<Vec<_>>();
        let statuses = manager.statuses(&hashes).await.expect("statuses");
        assert_eq!(statuses.len(), 12);
        assert_eq!(statuses["h7"], EnrichmentStatus::Enriched);
        assert_eq!(statuses["h3"], EnrichmentStatus::NoData);
        assert_eq!(statuses["h11"], EnrichmentStatus::NeverChecked);
        assert_eq!(store.keyed_queries(), 8);
    }

    #[tokio::test]
    async fn blank_hash_is_rejected() {
        let manager = manager_with(Arc::new(MemoryStore::new()), EnrichmentConfig::default());
        assert!(matches!(manager.acquire("  ").await, Err(EnrichmentError::BlankAddressHash)));
    }

    struct ScriptedProvider;

    #[async_trait]
    impl EnrichmentProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn lookup(&self, request: &EnrichmentRequest) -> anyhow::Result<ProviderLookup> {
            match request.address_hash.as_str() {
                "found" => Ok(ProviderLookup::Found(owner("ignored", Some("Jane Doe")))),
                "empty" => Ok(ProviderLookup::Found(owner("ignored", None))),
                "missing" => Ok(ProviderLookup::NotFound),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(ProviderLookup::NotFound)
                }
                "lagging" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(ProviderLookup::NotFound)
                }
                _ => anyhow::bail!("upstream returned 500"),
            }
        }
    }

    fn request(hash: &str) -> EnrichmentRequest {
        EnrichmentRequest {
            address_hash: hash.to_string(),
            address: None,
            listing_source: Some("zillow".into()),
        }
    }

    #[tokio::test]
    async fn worker_maps_provider_results_and_releases_every_lock() {
        let store = Arc::new(MemoryStore::new());
        let mut busy = state("busy", EnrichmentStatus::Checking);
        busy.locked = true;
        busy.lock_token = Some(Uuid::new_v4());
        busy.locked_at = Some(Utc::now());
        store.seed_state(busy).await;

        let manager = Arc::new(manager_with(
            store.clone(),
            EnrichmentConfig {
                provider_timeout: Duration::from_millis(50),
                ..EnrichmentConfig::default()
            },
        ));
        let worker = EnrichmentWorker::new(Arc::clone(&manager), ScriptedProvider);
        let summary = worker
            .run(&["found", "empty", "missing", "slow", "broken", "busy"].map(request))
            .await
            .expect("run");

        assert_eq!(
            summary,
            EnrichmentRunSummary {
                requested: 6,
                enriched: 1,
                no_data: 2,
                failed: 1,
                timed_out: 1,
                in_progress: 1,
                orphaned: 0,
                stale: 0,
                errors: 0,
            }
        );

        let found = store.state_for("found").await.expect("found");
        assert_eq!(found.status, EnrichmentStatus::Enriched);
        assert_eq!(found.source_used.as_deref(), Some("scripted"));
        assert_eq!(found.listing_source.as_deref(), Some("zillow"));
        let owners = manager.owner_records(&["found".to_string()]).await.expect("owners");
        assert_eq!(owners["found"].address_hash, "found");

        let slow = store.state_for("slow").await.expect("slow");
        assert!(!slow.locked);
        assert_eq!(slow.status, EnrichmentStatus::Failed);
        assert_eq!(slow.failure_reason.as_deref(), Some("timeout"));

        let broken = store.state_for("broken").await.expect("broken");
        assert_eq!(broken.failure_reason.as_deref(), Some("upstream returned 500"));
    }

    #[tokio::test]
    async fn rejected_release_is_counted_and_other_items_still_finish() {
        let store = Arc::new(MemoryStore::new());
        store.fail_releases_for("bad").await;
        let manager = Arc::new(manager_with(store.clone(), EnrichmentConfig::default()));
        let worker = EnrichmentWorker::new(Arc::clone(&manager), ScriptedProvider);

        let summary = worker
            .run(&["bad", "lagging"].map(request))
            .await
            .expect("rejections do not abort the run");
        assert_eq!(summary.requested, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.no_data, 1);
        assert_eq!(summary.failed, 0);

        let lagging = store.state_for("lagging").await.expect("lagging");
        assert!(!lagging.locked);
        assert_eq!(lagging.status, EnrichmentStatus::NoData);
        assert!(store.state_for("bad").await.expect("bad").locked);
    }

    #[tokio::test]
    async fn worker_aborts_when_store_is_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let manager = Arc::new(manager_with(store, EnrichmentConfig::default()));
        let worker = EnrichmentWorker::new(manager, ScriptedProvider);
        let err = worker.run(&[request("found")]).await.expect_err("offline");
        assert!(matches!(err, EnrichmentError::Store(StoreError::Unavailable(_))));
    }
}
