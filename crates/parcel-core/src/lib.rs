//! Core domain model and listing identity keys for Parcel.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "parcel-core";

/// Tokens dropped from address keys so suffix spelling variants collapse together.
pub const STREET_SUFFIXES: &[&str] = &[
    "street", "st", "avenue", "ave", "road", "rd", "boulevard", "blvd", "drive", "dr", "lane", "ln",
    "way", "court", "ct", "place", "pl",
];

const LISTING_PATH_COMPONENT: &str = "/listing/";

/// Fields compared when deciding whether a matched listing changed.
pub const TRACKED_FIELDS: &[&str] = &[
    "address",
    "price",
    "beds",
    "baths",
    "square_feet",
    "time_of_post",
];

/// Canonical listing id taken from the path segment after `/listing/`,
/// or the lower-cased trimmed URL when the link has no such segment.
pub fn normalize_link_key(link: &str) -> String {
    canonical_listing_id(link).unwrap_or_else(|| link.trim().to_lowercase())
}

fn canonical_listing_id(link: &str) -> Option<String> {
    let lower = link.trim().to_lowercase();
    let start = lower.find(LISTING_PATH_COMPONENT)? + LISTING_PATH_COMPONENT.len();
    let segment = lower[start..]
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .trim();
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

pub fn normalize_address_key(address: &str) -> String {
    address
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .filter(|token| !STREET_SUFFIXES.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic join key between listings, enrichment state and owner records.
pub fn address_hash(address_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(address_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Both comparison keys for one listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentityKeys {
    pub link_key: String,
    /// True when `link_key` came from a `/listing/<id>` segment rather than the URL fallback.
    pub link_canonical: bool,
    pub address_key: String,
}

impl IdentityKeys {
    pub fn from_parts(link: Option<&str>, address: Option<&str>) -> Self {
        let link = link.map(str::trim).unwrap_or_default();
        let link_canonical = canonical_listing_id(link).is_some();
        Self {
            link_key: normalize_link_key(link),
            link_canonical,
            address_key: address.map(normalize_address_key).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.link_key.is_empty() && self.address_key.is_empty()
    }

    /// Link keys decide when both links are canonical; otherwise address keys are compared.
    pub fn same_identity(&self, other: &IdentityKeys) -> bool {
        if !self.link_key.is_empty() && self.link_key == other.link_key {
            return true;
        }
        if self.link_canonical && other.link_canonical {
            return false;
        }
        !self.address_key.is_empty() && self.address_key == other.address_key
    }

    pub fn address_hash(&self) -> Option<String> {
        if self.address_key.is_empty() {
            None
        } else {
            Some(address_hash(&self.address_key))
        }
    }
}

/// One scraped item as handed over by an ingestion adapter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawListing {
    pub address: Option<String>,
    pub price: Option<String>,
    pub beds: Option<String>,
    pub baths: Option<String>,
    pub square_feet: Option<String>,
    pub listing_link: Option<String>,
    pub time_of_post: Option<String>,
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

impl RawListing {
    pub fn identity(&self) -> IdentityKeys {
        IdentityKeys::from_parts(self.listing_link.as_deref(), self.address.as_deref())
    }

    /// Trims every field and turns blank values into `None`.
    pub fn normalized(&self) -> Self {
        Self {
            address: clean(&self.address),
            price: clean(&self.price),
            beds: clean(&self.beds),
            baths: clean(&self.baths),
            square_feet: clean(&self.square_feet),
            listing_link: clean(&self.listing_link),
            time_of_post: clean(&self.time_of_post),
        }
    }

    pub fn tracked_value(&self, field: &str) -> Option<&str> {
        match field {
            "address" => self.address.as_deref(),
            "price" => self.price.as_deref(),
            "beds" => self.beds.as_deref(),
            "baths" => self.baths.as_deref(),
            "square_feet" => self.square_feet.as_deref(),
            "time_of_post" => self.time_of_post.as_deref(),
            _ => None,
        }
    }

    /// Names of tracked fields whose normalized values differ from `stored`.
    pub fn changed_fields(&self, stored: &RawListing) -> Vec<&'static str> {
        let incoming = self.normalized();
        let current = stored.normalized();
        TRACKED_FIELDS
            .iter()
            .copied()
            .filter(|field| incoming.tracked_value(field) != current.tracked_value(field))
            .collect()
    }

    /// Copies tracked fields from `incoming`, keeping the stored link.
    pub fn merge_tracked(&self, incoming: &RawListing) -> Self {
        let incoming = incoming.normalized();
        Self {
            address: incoming.address,
            price: incoming.price,
            beds: incoming.beds,
            baths: incoming.baths,
            square_feet: incoming.square_feet,
            listing_link: self.listing_link.clone(),
            time_of_post: incoming.time_of_post,
        }
    }
}

/// Persisted listing row. Rows are never deleted; `is_active=false` marks removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub id: Uuid,
    pub source_id: String,
    pub fields: RawListing,
    pub address_hash: Option<String>,
    pub is_active: bool,
    pub removed_at: Option<DateTime<Utc>>,
    pub scrape_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredListing {
    pub fn identity(&self) -> IdentityKeys {
        self.fields.identity()
    }
}

/// Summary of one reconciliation pass over one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub source_id: String,
    pub scraped: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Records with neither a usable link nor address.
    pub skipped: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl SyncStats {
    pub fn empty(source_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            scraped: 0,
            added: 0,
            updated: 0,
            removed: 0,
            unchanged: 0,
            skipped: 0,
            duplicates: 0,
            failed: 0,
            timestamp,
            duration_seconds: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    NeverChecked,
    Checking,
    Enriched,
    NoData,
    Failed,
    Orphaned,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeverChecked => "never_checked",
            Self::Checking => "checking",
            Self::Enriched => "enriched",
            Self::NoData => "no_data",
            Self::Failed => "failed",
            Self::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown enrichment status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for EnrichmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never_checked" => Ok(Self::NeverChecked),
            "checking" => Ok(Self::Checking),
            "enriched" => Ok(Self::Enriched),
            "no_data" => Ok(Self::NoData),
            "failed" => Ok(Self::Failed),
            "orphaned" => Ok(Self::Orphaned),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One row per address hash. `locked=true` implies `status=Checking`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentState {
    pub address_hash: String,
    pub status: EnrichmentStatus,
    pub locked: bool,
    pub lock_token: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub checked_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub listing_source: Option<String>,
    pub source_used: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub address_hash: String,
    pub owner_name: Option<String>,
    pub owner_email: Option<String>,
    pub owner_phone: Option<String>,
    pub mailing_address: Option<String>,
    pub source: Option<String>,
}

impl OwnerRecord {
    /// True when any of name, email or phone carries a non-blank value.
    pub fn has_contact(&self) -> bool {
        [&self.owner_name, &self.owner_email, &self.owner_phone]
            .iter()
            .any(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn suffix_variants_collapse_to_one_address_key() {
        assert_eq!(
            normalize_address_key("123 Main Street"),
            normalize_address_key("123 main st.")
        );
        assert_eq!(normalize_address_key("  42  Oak   Blvd, Apt #3 "), "42 oak apt 3");
        assert_eq!(normalize_address_key("7 Elm Ct"), "7 elm");
    }

    #[test]
    fn link_key_uses_listing_segment() {
        assert_eq!(
            normalize_link_key("https://homes.example.com/listing/123-Main-St?ref=feed"),
            "123-main-st"
        );
        assert_eq!(normalize_link_key("/listing/123-main-st/"), "123-main-st");
        assert_eq!(
            normalize_link_key("  HTTPS://Example.com/rentals/99  "),
            "https://example.com/rentals/99"
        );
        assert_eq!(normalize_link_key("https://x.test/listing/"), "https://x.test/listing/");
        assert_eq!(normalize_link_key(""), "");
    }

    #[test]
    fn matching_links_win_over_addresses() {
        let a = IdentityKeys::from_parts(Some("/listing/abc"), Some("1 Main St"));
        let b = IdentityKeys::from_parts(Some("/listing/abc"), Some("99 Other Rd"));
        assert!(a.same_identity(&b));

        let c = IdentityKeys::from_parts(Some("/listing/xyz"), Some("1 Main Street"));
        assert!(!a.same_identity(&c));
    }

    #[test]
    fn address_decides_when_a_link_is_missing_or_falls_back() {
        let linked = IdentityKeys::from_parts(Some("/listing/abc"), Some("1 Main St"));
        let unlinked = IdentityKeys::from_parts(None, Some("1 main street"));
        assert!(linked.same_identity(&unlinked));
        assert!(unlinked.same_identity(&linked));

        let fallback = IdentityKeys::from_parts(Some("https://other.test/p/1"), Some("1 Main St"));
        assert!(!fallback.link_canonical);
        assert!(linked.same_identity(&fallback));
    }

    #[test]
    fn blank_parts_have_no_identity() {
        let keys = IdentityKeys::from_parts(Some("   "), Some(" ,. "));
        assert!(keys.is_empty());
        assert_eq!(keys.address_hash(), None);
        assert!(!keys.same_identity(&keys.clone()));
    }

    #[test]
    fn address_hash_is_stable_across_spellings() {
        let a = IdentityKeys::from_parts(None, Some("123 Main Street"));
        let b = IdentityKeys::from_parts(None, Some("123 MAIN ST"));
        assert_eq!(a.address_hash(), b.address_hash());
        assert_eq!(a.address_hash().map(|h| h.len()), Some(64));
    }

    #[test]
    fn changed_fields_ignore_whitespace_and_the_link() {
        let stored = RawListing {
            price: Some("300000".into()),
            listing_link: Some("/listing/a".into()),
            ..Default::default()
        };
        let same = RawListing {
            price: Some(" 300000 ".into()),
            listing_link: Some("/listing/A?x=1".into()),
            beds: Some("".into()),
            ..Default::default()
        };
        assert!(same.changed_fields(&stored).is_empty());

        let cheaper = RawListing {
            price: Some("290000".into()),
            beds: Some("3".into()),
            ..Default::default()
        };
        assert_eq!(cheaper.changed_fields(&stored), vec!["price", "beds"]);
    }

    #[test]
    fn owner_contact_requires_a_non_blank_value() {
        let mut owner = OwnerRecord {
            address_hash: "h".into(),
            owner_name: Some("  ".into()),
            owner_email: None,
            owner_phone: None,
            mailing_address: Some("PO Box 1".into()),
            source: None,
        };
        assert!(!owner.has_contact());
        owner.owner_phone = Some("555-0100".into());
        assert!(owner.has_contact());
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [
            EnrichmentStatus::NeverChecked,
            EnrichmentStatus::Checking,
            EnrichmentStatus::Enriched,
            EnrichmentStatus::NoData,
            EnrichmentStatus::Failed,
            EnrichmentStatus::Orphaned,
        ] {
            assert_eq!(status.as_str().parse::<EnrichmentStatus>().unwrap(), status);
        }
        assert!("done".parse::<EnrichmentStatus>().is_err());
    }

    proptest! {
        #[test]
        fn address_key_is_idempotent(raw in "[ -~À-ÿ]{0,48}") {
            let once = normalize_address_key(&raw);
            prop_assert_eq!(normalize_address_key(&once), once);
        }

        #[test]
        fn link_key_is_idempotent(raw in "[ -~]{0,48}") {
            let once = normalize_link_key(&raw);
            prop_assert_eq!(normalize_link_key(&once), once);
        }

        #[test]
        fn suffixed_and_bare_street_share_a_key(num in 1u32..9999, name in "[A-Za-z]{2,12}") {
            let long = format!("{num} {name} Avenue");
            let short = format!("{num} {name} ave.");
            prop_assert_eq!(normalize_address_key(&long), normalize_address_key(&short));
        }
    }
}
