//! Diffing one scraped batch against the stored snapshot of its source.
//!
//! Planning is pure and single-threaded over the whole batch; the `Reconciler`
//! then applies the plan in order. Rows are only ever soft-deleted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parcel_core::{IdentityKeys, RawListing, StoredListing, SyncStats};
use parcel_storage::{ListingStore, ListingWrite, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

/// Re-reads after an optimistic-concurrency conflict before a record counts as failed.
const MAX_CONFLICT_RETRIES: usize = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    Insert {
        fields: RawListing,
    },
    Update {
        current: StoredListing,
        fields: RawListing,
        changed: Vec<&'static str>,
    },
    Reactivate {
        current: StoredListing,
    },
    Unchanged {
        current: StoredListing,
    },
    Remove {
        current: StoredListing,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub source_id: String,
    pub scraped: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub actions: Vec<PlannedAction>,
}

struct SnapshotIndex<'a> {
    rows: &'a [StoredListing],
    identities: Vec<IdentityKeys>,
    by_link: HashMap<String, Vec<usize>>,
    by_address: HashMap<String, Vec<usize>>,
}

impl<'a> SnapshotIndex<'a> {
    fn build(rows: &'a [StoredListing]) -> Self {
        let identities = rows.iter().map(StoredListing::identity).collect::<Vec<_>>();
        let mut by_link: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_address: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, keys) in identities.iter().enumerate() {
            if !keys.link_key.is_empty() {
                by_link.entry(keys.link_key.clone()).or_default().push(idx);
            }
            if !keys.address_key.is_empty() {
                by_address.entry(keys.address_key.clone()).or_default().push(idx);
            }
        }
        Self {
            rows,
            identities,
            by_link,
            by_address,
        }
    }

    fn find_by_link(&self, keys: &IdentityKeys, taken: &HashSet<usize>) -> Option<usize> {
        self.best(self.by_link.get(&keys.link_key), taken, |_| true)
    }

    /// Address lookup restricted to identity-compatible rows.
    fn find_by_address(&self, keys: &IdentityKeys, taken: &HashSet<usize>) -> Option<usize> {
        self.best(self.by_address.get(&keys.address_key), taken, |idx| {
            keys.same_identity(&self.identities[idx])
        })
    }

    /// Active rows beat inactive ones; among equals the oldest row wins. Writes
    /// never change the ranking of rows that stay active, so a repeated batch
    /// picks the same rows again.
    fn best(
        &self,
        candidates: Option<&Vec<usize>>,
        taken: &HashSet<usize>,
        accept: impl Fn(usize) -> bool,
    ) -> Option<usize> {
        candidates?
            .iter()
            .copied()
            .filter(|idx| !taken.contains(idx) && accept(*idx))
            .max_by(|a, b| {
                let (ra, rb) = (&self.rows[*a], &self.rows[*b]);
                ra.is_active
                    .cmp(&rb.is_active)
                    .then(rb.created_at.cmp(&ra.created_at))
                    .then(b.cmp(a))
            })
    }
}

/// Scraped identities that survived in-batch deduplication.
#[derive(Default)]
struct BatchIdentities {
    links: HashSet<String>,
    by_address: HashMap<String, Vec<IdentityKeys>>,
}

impl BatchIdentities {
    fn contains(&self, keys: &IdentityKeys) -> bool {
        if !keys.link_key.is_empty() && self.links.contains(&keys.link_key) {
            return true;
        }
        self.by_address
            .get(&keys.address_key)
            .is_some_and(|seen| seen.iter().any(|prev| prev.same_identity(keys)))
    }

    fn insert(&mut self, keys: &IdentityKeys) {
        if !keys.link_key.is_empty() {
            self.links.insert(keys.link_key.clone());
        }
        if !keys.address_key.is_empty() {
            self.by_address
                .entry(keys.address_key.clone())
                .or_default()
                .push(keys.clone());
        }
    }
}

/// Decides every add/update/reactivate/remove for one batch without touching the store.
pub fn plan_reconciliation(
    source_id: &str,
    batch: &[RawListing],
    snapshot: &[StoredListing],
) -> ReconcilePlan {
    let index = SnapshotIndex::build(snapshot);
    let mut seen = BatchIdentities::default();
    let mut taken = HashSet::new();
    let mut skipped = 0usize;
    let mut duplicates = 0usize;

    let mut survivors = Vec::with_capacity(batch.len());
    for raw in batch {
        let keys = raw.identity();
        if keys.is_empty() {
            skipped += 1;
            continue;
        }
        if seen.contains(&keys) {
            duplicates += 1;
            continue;
        }
        seen.insert(&keys);
        survivors.push((raw, keys));
    }

    // Every link match is claimed before any address match, so a record
    // without a link never takes a row that a later record names by link.
    let mut matches: Vec<Option<usize>> = vec![None; survivors.len()];
    for (slot, (_, keys)) in matches.iter_mut().zip(&survivors) {
        if let Some(idx) = index.find_by_link(keys, &taken) {
            taken.insert(idx);
            *slot = Some(idx);
        }
    }
    for (slot, (_, keys)) in matches.iter_mut().zip(&survivors) {
        if slot.is_some() {
            continue;
        }
        if let Some(idx) = index.find_by_address(keys, &taken) {
            taken.insert(idx);
            *slot = Some(idx);
        }
    }

    let mut actions = Vec::with_capacity(batch.len());
    for ((raw, _), matched) in survivors.iter().zip(matches) {
        let Some(idx) = matched else {
            actions.push(PlannedAction::Insert {
                fields: raw.normalized(),
            });
            continue;
        };

        let current = snapshot[idx].clone();
        let changed = raw.changed_fields(&current.fields);
        let action = if !changed.is_empty() {
            PlannedAction::Update {
                fields: current.fields.merge_tracked(raw),
                current,
                changed,
            }
        } else if !current.is_active {
            PlannedAction::Reactivate { current }
        } else {
            PlannedAction::Unchanged { current }
        };
        actions.push(action);
    }

    for (idx, row) in snapshot.iter().enumerate() {
        if row.is_active && !taken.contains(&idx) && !seen.contains(&index.identities[idx]) {
            actions.push(PlannedAction::Remove {
                current: row.clone(),
            });
        }
    }

    ReconcilePlan {
        source_id: source_id.to_string(),
        scraped: batch.len(),
        skipped,
        duplicates,
        actions,
    }
}

enum WriteOutcome {
    Updated,
    Unchanged,
}

/// Applies reconciliation plans through an injected store. Passes over the same
/// source are serialized in-process.
pub struct Reconciler {
    store: Arc<dyn ListingStore>,
    passes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self {
            store,
            passes: Mutex::new(HashMap::new()),
        }
    }

    async fn pass_guard(&self, source_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.passes.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Loads every stored row of the source (active and inactive) and reconciles `batch` against it.
    pub async fn reconcile(
        &self,
        source_id: &str,
        batch: &[RawListing],
    ) -> Result<SyncStats, StoreError> {
        let pass = self.pass_guard(source_id).await;
        let _held = pass.lock().await;

        let span = info_span!("reconcile", source_id, scraped = batch.len());
        async {
            let snapshot = self.store.listings_for_source(source_id, true).await?;
            self.run_pass(source_id, batch, &snapshot).await
        }
        .instrument(span)
        .await
    }

    /// Reconciles against a caller-supplied snapshot. Still serialized per source.
    pub async fn reconcile_with_snapshot(
        &self,
        source_id: &str,
        batch: &[RawListing],
        snapshot: &[StoredListing],
    ) -> Result<SyncStats, StoreError> {
        let pass = self.pass_guard(source_id).await;
        let _held = pass.lock().await;
        let span = info_span!("reconcile", source_id, scraped = batch.len());
        self.run_pass(source_id, batch, snapshot).instrument(span).await
    }

    async fn run_pass(
        &self,
        source_id: &str,
        batch: &[RawListing],
        snapshot: &[StoredListing],
    ) -> Result<SyncStats, StoreError> {
        let started = Instant::now();
        let now = Utc::now();
        let plan = plan_reconciliation(source_id, batch, snapshot);

        let mut stats = SyncStats::empty(source_id, now);
        stats.scraped = plan.scraped;
        stats.skipped = plan.skipped;
        stats.duplicates = plan.duplicates;

        for action in plan.actions {
            match action {
                PlannedAction::Insert { fields } => {
                    let write = ListingWrite::insert(source_id, fields.clone(), now);
                    match self.store.upsert_listing(&write).await {
                        Ok(row) => {
                            debug!(listing_id = %row.id, "listing added");
                            stats.added += 1;
                        }
                        Err(err) => record_failure(&mut stats, &fields, "insert", err)?,
                    }
                }
                PlannedAction::Update {
                    current,
                    fields,
                    changed,
                } => {
                    debug!(listing_id = %current.id, ?changed, "listing changed");
                    match self.write_with_retry(current, &fields, now).await {
                        Ok(WriteOutcome::Updated) => stats.updated += 1,
                        Ok(WriteOutcome::Unchanged) => stats.unchanged += 1,
                        Err(err) => record_failure(&mut stats, &fields, "update", err)?,
                    }
                }
                PlannedAction::Reactivate { current } => {
                    let fields = current.fields.clone();
                    debug!(listing_id = %current.id, "listing reactivated");
                    match self.write_with_retry(current, &fields, now).await {
                        Ok(_) => stats.unchanged += 1,
                        Err(err) => record_failure(&mut stats, &fields, "reactivate", err)?,
                    }
                }
                PlannedAction::Unchanged { .. } => stats.unchanged += 1,
                PlannedAction::Remove { current } => {
                    match self.store.mark_inactive(current.id, now).await {
                        Ok(()) => {
                            debug!(listing_id = %current.id, "listing removed");
                            stats.removed += 1;
                        }
                        Err(err) => record_failure(&mut stats, &current.fields, "remove", err)?,
                    }
                }
            }
        }

        stats.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            added = stats.added,
            updated = stats.updated,
            removed = stats.removed,
            unchanged = stats.unchanged,
            skipped = stats.skipped,
            duplicates = stats.duplicates,
            failed = stats.failed,
            duration_seconds = stats.duration_seconds,
            "reconciliation pass complete"
        );
        Ok(stats)
    }

    /// Optimistic update; on conflict the row is re-read and re-diffed.
    async fn write_with_retry(
        &self,
        mut current: StoredListing,
        fields: &RawListing,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        let mut attempt = 0;
        loop {
            let changed = !fields.changed_fields(&current.fields).is_empty();
            let write = ListingWrite::update(&current, current.fields.merge_tracked(fields), now);
            match self.store.upsert_listing(&write).await {
                Ok(_) if changed => return Ok(WriteOutcome::Updated),
                Ok(_) => return Ok(WriteOutcome::Unchanged),
                Err(StoreError::Conflict { id }) if attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    warn!(listing_id = %id, attempt, "listing modified concurrently; re-reading");
                    let fresh = self
                        .store
                        .listing_by_id(id)
                        .await?
                        .ok_or_else(|| StoreError::NotFound(format!("listing {id}")))?;
                    if fresh.is_active && fields.changed_fields(&fresh.fields).is_empty() {
                        return Ok(WriteOutcome::Unchanged);
                    }
                    current = fresh;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Connectivity failures abort the pass; anything else excludes the record and continues.
fn record_failure(
    stats: &mut SyncStats,
    fields: &RawListing,
    operation: &'static str,
    err: StoreError,
) -> Result<(), StoreError> {
    if err.is_unavailable() {
        return Err(err);
    }
    let keys = fields.identity();
    warn!(
        operation,
        link_key = %keys.link_key,
        address_key = %keys.address_key,
        error = %err,
        "listing write failed; record excluded from counts"
    );
    stats.failed += 1;
    Ok(())
}
