//! Postgres-backed store. Every lock transition is a single conditional statement;
//! completing with owner data runs that statement and the owner upsert in one transaction.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parcel_core::{EnrichmentState, EnrichmentStatus, OwnerRecord, RawListing, StoredListing};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{EnrichmentStore, ListingStore, ListingWrite, LockRelease, LockRequest, StoreError};

const LISTING_COLUMNS: &str = "id, source_id, address, price, beds, baths, square_feet, listing_link, \
     time_of_post, address_hash, is_active, removed_at, scrape_timestamp, created_at, updated_at";

const STATE_COLUMNS: &str = "address_hash, status, locked, lock_token, locked_at, checked_at, \
     failure_reason, listing_source, source_used, updated_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => StoreError::Unavailable(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StoreError::Decode(err.to_string()),
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Rejected(format!("running migrations: {e}")))
    }

    async fn listing_exists(&self, id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM listings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn release_query(release: &LockRelease) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        UPDATE enrichment_state
           SET locked = FALSE,
               lock_token = NULL,
               locked_at = NULL,
               status = $3,
               checked_at = $4,
               failure_reason = $5,
               source_used = COALESCE($6, source_used),
               updated_at = $4
         WHERE address_hash = $1 AND locked AND lock_token = $2
        "#,
    )
    .bind(&release.address_hash)
    .bind(release.lock_token)
    .bind(release.status.as_str())
    .bind(release.checked_at)
    .bind(&release.failure_reason)
    .bind(&release.source_used)
}

fn upsert_owner_query(record: &OwnerRecord) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO owner_records
               (address_hash, owner_name, owner_email, owner_phone, mailing_address, source,
                created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, clock_timestamp(), clock_timestamp())
        ON CONFLICT (address_hash) DO UPDATE
           SET owner_name = EXCLUDED.owner_name,
               owner_email = EXCLUDED.owner_email,
               owner_phone = EXCLUDED.owner_phone,
               mailing_address = EXCLUDED.mailing_address,
               source = EXCLUDED.source,
               updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&record.address_hash)
    .bind(&record.owner_name)
    .bind(&record.owner_email)
    .bind(&record.owner_phone)
    .bind(&record.mailing_address)
    .bind(&record.source)
}

fn listing_from_row(row: &PgRow) -> Result<StoredListing, sqlx::Error> {
    Ok(StoredListing {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        fields: RawListing {
            address: row.try_get("address")?,
            price: row.try_get("price")?,
            beds: row.try_get("beds")?,
            baths: row.try_get("baths")?,
            square_feet: row.try_get("square_feet")?,
            listing_link: row.try_get("listing_link")?,
            time_of_post: row.try_get("time_of_post")?,
        },
        address_hash: row.try_get("address_hash")?,
        is_active: row.try_get("is_active")?,
        removed_at: row.try_get("removed_at")?,
        scrape_timestamp: row.try_get("scrape_timestamp")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn state_from_row(row: &PgRow) -> Result<EnrichmentState, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(EnrichmentState {
        address_hash: row.try_get("address_hash")?,
        status: status
            .parse::<EnrichmentStatus>()
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        locked: row.try_get("locked")?,
        lock_token: row.try_get("lock_token")?,
        locked_at: row.try_get("locked_at")?,
        checked_at: row.try_get("checked_at")?,
        failure_reason: row.try_get("failure_reason")?,
        listing_source: row.try_get("listing_source")?,
        source_used: row.try_get("source_used")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ListingStore for PgStore {
    async fn listings_for_source(
        &self,
        source_id: &str,
        include_inactive: bool,
    ) -> Result<Vec<StoredListing>, StoreError> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings \
              WHERE source_id = $1 AND (is_active OR $2) \
              ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(source_id)
            .bind(include_inactive)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(listing_from_row(row)?);
        }
        Ok(out)
    }

    async fn listing_by_id(&self, id: Uuid) -> Result<Option<StoredListing>, StoreError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(listing_from_row).transpose()?)
    }

    async fn upsert_listing(&self, write: &ListingWrite) -> Result<StoredListing, StoreError> {
        let fields = &write.fields;
        let address_hash = fields.identity().address_hash();

        let Some(id) = write.id else {
            let sql = format!(
                "INSERT INTO listings (id, source_id, address, price, beds, baths, square_feet, \
                     listing_link, time_of_post, address_hash, is_active, removed_at, \
                     scrape_timestamp, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE, NULL, $11, \
                     clock_timestamp(), clock_timestamp()) \
                 RETURNING {LISTING_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(Uuid::new_v4())
                .bind(&write.source_id)
                .bind(&fields.address)
                .bind(&fields.price)
                .bind(&fields.beds)
                .bind(&fields.baths)
                .bind(&fields.square_feet)
                .bind(&fields.listing_link)
                .bind(&fields.time_of_post)
                .bind(&address_hash)
                .bind(write.scraped_at)
                .fetch_one(&self.pool)
                .await?;
            return Ok(listing_from_row(&row)?);
        };

        let sql = format!(
            "UPDATE listings \
                SET address = $2, price = $3, beds = $4, baths = $5, square_feet = $6, \
                    listing_link = $7, time_of_post = $8, address_hash = $9, \
                    is_active = TRUE, removed_at = NULL, scrape_timestamp = $10, \
                    updated_at = GREATEST(clock_timestamp(), updated_at + INTERVAL '1 microsecond') \
              WHERE id = $1 AND ($11::timestamptz IS NULL OR updated_at = $11) \
              RETURNING {LISTING_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&fields.address)
            .bind(&fields.price)
            .bind(&fields.beds)
            .bind(&fields.baths)
            .bind(&fields.square_feet)
            .bind(&fields.listing_link)
            .bind(&fields.time_of_post)
            .bind(&address_hash)
            .bind(write.scraped_at)
            .bind(write.expected_updated_at)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(listing_from_row(&row)?),
            None if self.listing_exists(id).await? => Err(StoreError::Conflict { id }),
            None => Err(StoreError::NotFound(format!("listing {id}"))),
        }
    }

    async fn mark_inactive(&self, id: Uuid, removed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET is_active = FALSE,
                   removed_at = $2,
                   updated_at = GREATEST(clock_timestamp(), updated_at + INTERVAL '1 microsecond')
             WHERE id = $1 AND is_active
            "#,
        )
        .bind(id)
        .bind(removed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && !self.listing_exists(id).await? {
            return Err(StoreError::NotFound(format!("listing {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl EnrichmentStore for PgStore {
    async fn enrichment_states(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, EnrichmentState>, StoreError> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM enrichment_state WHERE address_hash = ANY($1)");
        let rows = sqlx::query(&sql).bind(hashes).fetch_all(&self.pool).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let state = state_from_row(row)?;
            out.insert(state.address_hash.clone(), state);
        }
        Ok(out)
    }

    async fn try_lock_enrichment(&self, request: &LockRequest) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO enrichment_state
                   (address_hash, status, locked, lock_token, locked_at, listing_source, created_at, updated_at)
            VALUES ($1, 'checking', TRUE, $2, $3, $4, $3, $3)
            ON CONFLICT (address_hash) DO UPDATE
               SET status = 'checking',
                   locked = TRUE,
                   lock_token = EXCLUDED.lock_token,
                   locked_at = EXCLUDED.locked_at,
                   failure_reason = NULL,
                   listing_source = COALESCE(EXCLUDED.listing_source, enrichment_state.listing_source),
                   updated_at = EXCLUDED.updated_at
             WHERE enrichment_state.status <> 'orphaned'
               AND (NOT enrichment_state.locked
                    OR ($5::timestamptz IS NOT NULL
                        AND (enrichment_state.locked_at IS NULL OR enrichment_state.locked_at < $5)))
            RETURNING lock_token
            "#,
        )
        .bind(&request.address_hash)
        .bind(request.lock_token)
        .bind(request.now)
        .bind(&request.listing_source)
        .bind(request.reclaim_before)
        .fetch_optional(&self.pool)
        .await?;

        debug!(address_hash = %request.address_hash, acquired = row.is_some(), "enrichment lock attempt");
        Ok(row.is_some())
    }

    async fn release_enrichment(&self, release: &LockRelease) -> Result<bool, StoreError> {
        let result = release_query(release).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_with_owner(
        &self,
        release: &LockRelease,
        record: &OwnerRecord,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = release_query(release).execute(&mut *tx).await?;
        if result.rows_affected() != 1 {
            tx.rollback().await?;
            debug!(address_hash = %release.address_hash, "completion skipped; lock no longer held");
            return Ok(false);
        }
        upsert_owner_query(record).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn owner_records(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, OwnerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT address_hash, owner_name, owner_email, owner_phone, mailing_address, source
              FROM owner_records
             WHERE address_hash = ANY($1)
            "#,
        )
        .bind(hashes)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let record = OwnerRecord {
                address_hash: row.try_get("address_hash")?,
                owner_name: row.try_get("owner_name")?,
                owner_email: row.try_get("owner_email")?,
                owner_phone: row.try_get("owner_phone")?,
                mailing_address: row.try_get("mailing_address")?,
                source: row.try_get("source")?,
            };
            out.insert(record.address_hash.clone(), record);
        }
        Ok(out)
    }

    async fn orphan_unreferenced(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE enrichment_state es
               SET status = 'orphaned', updated_at = $1
             WHERE NOT es.locked
               AND es.status <> 'orphaned'
               AND NOT EXISTS (
                   SELECT 1 FROM listings l
                    WHERE l.address_hash = es.address_hash AND l.is_active
               )
            RETURNING es.address_hash
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut hashes = Vec::with_capacity(rows.len());
        for row in rows {
            hashes.push(row.try_get::<String, _>("address_hash")?);
        }
        hashes.sort();
        Ok(hashes)
    }

    async fn locked_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<EnrichmentState>, StoreError> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM enrichment_state \
              WHERE locked AND (locked_at IS NULL OR locked_at < $1) \
              ORDER BY locked_at NULLS FIRST"
        );
        let rows = sqlx::query(&sql).bind(cutoff).fetch_all(&self.pool).await?;
        rows.iter().map(state_from_row).collect()
    }
}
