//! Store adapter contracts, chunked lookups and the in-memory + Postgres stores for Parcel.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use parcel_core::{
    normalize_link_key, EnrichmentState, EnrichmentStatus, OwnerRecord, RawListing, StoredListing,
};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

mod postgres;

pub use postgres::PgStore;

pub const CRATE_NAME: &str = "parcel-storage";

/// Upper bound on keys sent in one hash-keyed query.
pub const DEFAULT_CHUNK_SIZE: usize = 200;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected operation: {0}")]
    Rejected(String),
    #[error("listing {id} was modified concurrently")]
    Conflict { id: Uuid },
    #[error("row not found: {0}")]
    NotFound(String),
    #[error("query asked for {requested} keys, store limit is {limit}")]
    TooManyKeys { requested: usize, limit: usize },
    #[error("could not decode stored row: {0}")]
    Decode(String),
}

impl StoreError {
    /// Connectivity-class failures abort a whole pass; everything else is per record.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Insert (no `id`) or optimistic update (with `id`) of one listing.
/// A written listing was seen in a scrape, so the store always leaves it active.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingWrite {
    pub id: Option<Uuid>,
    pub expected_updated_at: Option<DateTime<Utc>>,
    pub source_id: String,
    pub fields: RawListing,
    pub scraped_at: DateTime<Utc>,
}

impl ListingWrite {
    pub fn insert(source_id: impl Into<String>, fields: RawListing, scraped_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            expected_updated_at: None,
            source_id: source_id.into(),
            fields: fields.normalized(),
            scraped_at,
        }
    }

    pub fn update(current: &StoredListing, fields: RawListing, scraped_at: DateTime<Utc>) -> Self {
        Self {
            id: Some(current.id),
            expected_updated_at: Some(current.updated_at),
            source_id: current.source_id.clone(),
            fields: fields.normalized(),
            scraped_at,
        }
    }
}

/// Conditional lock request: succeeds only when the row is unlocked, or locked
/// before `reclaim_before`, and not orphaned.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRequest {
    pub address_hash: String,
    pub lock_token: Uuid,
    pub now: DateTime<Utc>,
    pub reclaim_before: Option<DateTime<Utc>>,
    pub listing_source: Option<String>,
}

/// Clears a lock held under `lock_token` and records the outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRelease {
    pub address_hash: String,
    pub lock_token: Uuid,
    pub status: EnrichmentStatus,
    pub failure_reason: Option<String>,
    pub source_used: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn listings_for_source(
        &self,
        source_id: &str,
        include_inactive: bool,
    ) -> Result<Vec<StoredListing>, StoreError>;

    async fn active_listings(&self, source_id: &str) -> Result<Vec<StoredListing>, StoreError> {
        self.listings_for_source(source_id, false).await
    }

    async fn listing_by_id(&self, id: Uuid) -> Result<Option<StoredListing>, StoreError>;

    async fn upsert_listing(&self, write: &ListingWrite) -> Result<StoredListing, StoreError>;

    /// Soft delete. Already-inactive rows are left untouched.
    async fn mark_inactive(&self, id: Uuid, removed_at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EnrichmentStore: Send + Sync {
    async fn enrichment_states(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, EnrichmentState>, StoreError>;

    /// Single atomic read-or-create + conditional lock. Returns whether the lock was taken.
    async fn try_lock_enrichment(&self, request: &LockRequest) -> Result<bool, StoreError>;

    /// Returns false when the row is no longer locked under the given token.
    async fn release_enrichment(&self, release: &LockRelease) -> Result<bool, StoreError>;

    async fn owner_records(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, OwnerRecord>, StoreError>;

    /// Releases the lock as `enriched` and stores `record` in one atomic step.
    /// Nothing is written when the token no longer holds the lock.
    async fn complete_with_owner(
        &self,
        release: &LockRelease,
        record: &OwnerRecord,
    ) -> Result<bool, StoreError>;

    /// Marks unlocked states with no active listing as orphaned; returns their hashes.
    async fn orphan_unreferenced(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    async fn locked_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<EnrichmentState>, StoreError>;
}

/// Splits `keys` into bounded chunks, issues the chunk queries concurrently and
/// merges the per-chunk maps. Blank and repeated keys are dropped first.
pub async fn chunked_lookup<V, F, Fut>(
    keys: &[String],
    chunk_size: usize,
    fetch: F,
) -> Result<HashMap<String, V>, StoreError>
where
    F: Fn(Vec<String>) -> Fut,
    Fut: Future<Output = Result<HashMap<String, V>, StoreError>>,
{
    let unique = keys
        .iter()
        .filter(|k| !k.trim().is_empty())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    if unique.is_empty() {
        return Ok(HashMap::new());
    }

    let parts = try_join_all(unique.chunks(chunk_size.max(1)).map(|chunk| fetch(chunk.to_vec()))).await?;
    let mut merged = HashMap::with_capacity(unique.len());
    for part in parts {
        merged.extend(part);
    }
    Ok(merged)
}

fn next_updated_at(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous + Duration::microseconds(1))
}

#[derive(Debug, Default)]
struct MemoryState {
    listings: Vec<StoredListing>,
    states: HashMap<String, EnrichmentState>,
    owners: HashMap<String, OwnerRecord>,
    failing_links: HashSet<String>,
    failing_releases: HashSet<String>,
}

/// In-process store used by tests and dry runs. All operations run under one
/// async mutex, so every trait method is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    key_limit: Option<usize>,
    keyed_queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects hash-keyed queries carrying more than `limit` keys.
    pub fn with_key_limit(limit: usize) -> Self {
        Self {
            key_limit: Some(limit.max(1)),
            ..Self::default()
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes every listing write whose link normalizes to `link` fail.
    pub async fn fail_writes_for_link(&self, link: &str) {
        self.state
            .lock()
            .await
            .failing_links
            .insert(normalize_link_key(link));
    }

    /// Makes every lock release for `address_hash` fail with `Rejected`.
    pub async fn fail_releases_for(&self, address_hash: &str) {
        self.state
            .lock()
            .await
            .failing_releases
            .insert(address_hash.to_string());
    }

    pub fn keyed_queries(&self) -> usize {
        self.keyed_queries.load(Ordering::SeqCst)
    }

    pub async fn seed_listing(&self, listing: StoredListing) {
        self.state.lock().await.listings.push(listing);
    }

    pub async fn seed_state(&self, state: EnrichmentState) {
        self.state
            .lock()
            .await
            .states
            .insert(state.address_hash.clone(), state);
    }

    pub async fn seed_owner(&self, owner: OwnerRecord) {
        self.state
            .lock()
            .await
            .owners
            .insert(owner.address_hash.clone(), owner);
    }

    /// Every stored listing row, active or not, in insertion order.
    pub async fn listings(&self) -> Vec<StoredListing> {
        self.state.lock().await.listings.clone()
    }

    pub async fn state_for(&self, address_hash: &str) -> Option<EnrichmentState> {
        self.state.lock().await.states.get(address_hash).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn check_keys(&self, keys: &[String]) -> Result<(), StoreError> {
        self.keyed_queries.fetch_add(1, Ordering::SeqCst);
        match self.key_limit {
            Some(limit) if keys.len() > limit => Err(StoreError::TooManyKeys {
                requested: keys.len(),
                limit,
            }),
            _ => Ok(()),
        }
    }
}

fn injected_failure(state: &MemoryState, fields: &RawListing) -> Option<StoreError> {
    let link_key = fields.identity().link_key;
    if !link_key.is_empty() && state.failing_links.contains(&link_key) {
        Some(StoreError::Rejected(format!("injected write failure for {link_key}")))
    } else {
        None
    }
}

fn apply_release(state: &mut MemoryState, release: &LockRelease) -> Result<bool, StoreError> {
    if state.failing_releases.contains(&release.address_hash) {
        return Err(StoreError::Rejected(format!(
            "injected release failure for {}",
            release.address_hash
        )));
    }
    let Some(row) = state.states.get_mut(&release.address_hash) else {
        return Ok(false);
    };
    if !row.locked || row.lock_token != Some(release.lock_token) {
        return Ok(false);
    }
    row.locked = false;
    row.lock_token = None;
    row.locked_at = None;
    row.status = release.status;
    row.checked_at = Some(release.checked_at);
    row.failure_reason = release.failure_reason.clone();
    if release.source_used.is_some() {
        row.source_used = release.source_used.clone();
    }
    row.updated_at = release.checked_at;
    Ok(true)
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn listings_for_source(
        &self,
        source_id: &str,
        include_inactive: bool,
    ) -> Result<Vec<StoredListing>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .listings
            .iter()
            .filter(|row| row.source_id == source_id && (include_inactive || row.is_active))
            .cloned()
            .collect())
    }

    async fn listing_by_id(&self, id: Uuid) -> Result<Option<StoredListing>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.listings.iter().find(|row| row.id == id).cloned())
    }

    async fn upsert_listing(&self, write: &ListingWrite) -> Result<StoredListing, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(err) = injected_failure(&state, &write.fields) {
            return Err(err);
        }
        let address_hash = write.fields.identity().address_hash();

        let Some(id) = write.id else {
            let now = Utc::now();
            let row = StoredListing {
                id: Uuid::new_v4(),
                source_id: write.source_id.clone(),
                fields: write.fields.clone(),
                address_hash,
                is_active: true,
                removed_at: None,
                scrape_timestamp: write.scraped_at,
                created_at: now,
                updated_at: now,
            };
            state.listings.push(row.clone());
            return Ok(row);
        };

        let row = state
            .listings
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("listing {id}")))?;
        if let Some(expected) = write.expected_updated_at {
            if row.updated_at != expected {
                return Err(StoreError::Conflict { id });
            }
        }
        row.fields = write.fields.clone();
        row.address_hash = address_hash;
        row.is_active = true;
        row.removed_at = None;
        row.scrape_timestamp = write.scraped_at;
        row.updated_at = next_updated_at(row.updated_at);
        Ok(row.clone())
    }

    async fn mark_inactive(&self, id: Uuid, removed_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let fields = state
            .listings
            .iter()
            .find(|row| row.id == id)
            .map(|row| row.fields.clone())
            .ok_or_else(|| StoreError::NotFound(format!("listing {id}")))?;
        if let Some(err) = injected_failure(&state, &fields) {
            return Err(err);
        }
        if let Some(row) = state.listings.iter_mut().find(|row| row.id == id && row.is_active) {
            row.is_active = false;
            row.removed_at = Some(removed_at);
            row.updated_at = next_updated_at(row.updated_at);
        }
        Ok(())
    }
}

#[async_trait]
impl EnrichmentStore for MemoryStore {
    async fn enrichment_states(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, EnrichmentState>, StoreError> {
        self.check_available()?;
        self.check_keys(hashes)?;
        let state = self.state.lock().await;
        Ok(hashes
            .iter()
            .filter_map(|h| state.states.get(h).map(|s| (h.clone(), s.clone())))
            .collect())
    }

    async fn try_lock_enrichment(&self, request: &LockRequest) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let row = state
            .states
            .entry(request.address_hash.clone())
            .or_insert_with(|| EnrichmentState {
                address_hash: request.address_hash.clone(),
                status: EnrichmentStatus::NeverChecked,
                locked: false,
                lock_token: None,
                locked_at: None,
                checked_at: None,
                failure_reason: None,
                listing_source: None,
                source_used: None,
                updated_at: request.now,
            });

        if row.status == EnrichmentStatus::Orphaned {
            return Ok(false);
        }
        if row.locked {
            let reclaimable = match (request.reclaim_before, row.locked_at) {
                (Some(cutoff), Some(locked_at)) => locked_at < cutoff,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !reclaimable {
                return Ok(false);
            }
        }

        row.status = EnrichmentStatus::Checking;
        row.locked = true;
        row.lock_token = Some(request.lock_token);
        row.locked_at = Some(request.now);
        row.failure_reason = None;
        if request.listing_source.is_some() {
            row.listing_source = request.listing_source.clone();
        }
        row.updated_at = request.now;
        Ok(true)
    }

    async fn release_enrichment(&self, release: &LockRelease) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        apply_release(&mut state, release)
    }

    async fn complete_with_owner(
        &self,
        release: &LockRelease,
        record: &OwnerRecord,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if !apply_release(&mut state, release)? {
            return Ok(false);
        }
        state.owners.insert(record.address_hash.clone(), record.clone());
        Ok(true)
    }

    async fn owner_records(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, OwnerRecord>, StoreError> {
        self.check_available()?;
        self.check_keys(hashes)?;
        let state = self.state.lock().await;
        Ok(hashes
            .iter()
            .filter_map(|h| state.owners.get(h).map(|o| (h.clone(), o.clone())))
            .collect())
    }

    async fn orphan_unreferenced(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let referenced = state
            .listings
            .iter()
            .filter(|row| row.is_active)
            .filter_map(|row| row.address_hash.clone())
            .collect::<HashSet<_>>();

        let mut orphaned = Vec::new();
        for row in state.states.values_mut() {
            if row.locked
                || row.status == EnrichmentStatus::Orphaned
                || referenced.contains(&row.address_hash)
            {
                continue;
            }
            row.status = EnrichmentStatus::Orphaned;
            row.updated_at = now;
            orphaned.push(row.address_hash.clone());
        }
        orphaned.sort();
        Ok(orphaned)
    }

    async fn locked_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<EnrichmentState>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut rows = state
            .states
            .values()
            .filter(|row| row.locked && row.locked_at.map_or(true, |at| at < cutoff))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|row| row.locked_at);
        Ok(rows)
    }
}
