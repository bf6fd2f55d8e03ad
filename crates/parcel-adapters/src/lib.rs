//! Scraped batch bundles + per-source field mapping into `RawListing`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parcel_core::RawListing;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "parcel-adapters";

/// One scraper drop for one source. `records` may live inline or in a sibling
/// file named by `records_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedBatch {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub records_path: Option<String>,
    #[serde(default)]
    pub records: Vec<JsonValue>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("batch source_id={found} does not match adapter source_id={expected}")]
    SourceMismatch { expected: String, found: String },
}

/// Ordered raw-field candidates per canonical field. Candidates are dotted
/// JSON paths; the first one resolving to a non-blank string or a number wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub address: Vec<String>,
    pub price: Vec<String>,
    pub beds: Vec<String>,
    pub baths: Vec<String>,
    pub square_feet: Vec<String>,
    pub listing_link: Vec<String>,
    pub time_of_post: Vec<String>,
}

fn paths(candidates: &[&str]) -> Vec<String> {
    candidates.iter().map(ToString::to_string).collect()
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            address: paths(&["address", "full_address", "street_address"]),
            price: paths(&["price", "list_price", "asking_price"]),
            beds: paths(&["beds", "bedrooms"]),
            baths: paths(&["baths", "bathrooms"]),
            square_feet: paths(&["square_feet", "sqft", "living_area"]),
            listing_link: paths(&["listing_link", "link", "url"]),
            time_of_post: paths(&["time_of_post", "posted_at", "listed_at"]),
        }
    }
}

impl FieldMapping {
    /// Fills every field left empty in `self` from `fallback`.
    pub fn or_fallback(mut self, fallback: &FieldMapping) -> Self {
        let fill = |slot: &mut Vec<String>, from: &Vec<String>| {
            if slot.is_empty() {
                *slot = from.clone();
            }
        };
        fill(&mut self.address, &fallback.address);
        fill(&mut self.price, &fallback.price);
        fill(&mut self.beds, &fallback.beds);
        fill(&mut self.baths, &fallback.baths);
        fill(&mut self.square_feet, &fallback.square_feet);
        fill(&mut self.listing_link, &fallback.listing_link);
        fill(&mut self.time_of_post, &fallback.time_of_post);
        self
    }

    pub fn resolve(&self, record: &JsonValue) -> RawListing {
        RawListing {
            address: first_match(record, &self.address),
            price: first_match(record, &self.price),
            beds: first_match(record, &self.beds),
            baths: first_match(record, &self.baths),
            square_feet: first_match(record, &self.square_feet),
            listing_link: first_match(record, &self.listing_link),
            time_of_post: first_match(record, &self.time_of_post),
        }
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path.split('.') {
        cur = cur.get(segment)?;
    }
    Some(cur)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_match(record: &JsonValue, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .find_map(|path| json_at(record, path).and_then(scalar_text))
}

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn mapping(&self) -> &FieldMapping;

    fn map_batch(&self, batch: &ScrapedBatch) -> Result<Vec<RawListing>, AdapterError> {
        if batch.source_id != self.source_id() {
            return Err(AdapterError::SourceMismatch {
                expected: self.source_id().to_string(),
                found: batch.source_id.clone(),
            });
        }
        Ok(batch
            .records
            .iter()
            .map(|record| self.mapping().resolve(record))
            .collect())
    }
}

#[derive(Debug, Clone)]
struct MappedSourceAdapter {
    source_id: String,
    mapping: FieldMapping,
}

impl SourceAdapter for MappedSourceAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }
}

/// Field spellings of the sources Parcel ships support for.
pub fn builtin_mapping(source_id: &str) -> Option<FieldMapping> {
    match source_id {
        "zillow" => Some(FieldMapping {
            address: paths(&["address.streetAddress", "streetAddress", "address"]),
            price: paths(&["unformattedPrice", "price"]),
            beds: paths(&["beds", "bedrooms"]),
            baths: paths(&["baths", "bathrooms"]),
            square_feet: paths(&["area", "livingArea"]),
            listing_link: paths(&["detailUrl", "url"]),
            time_of_post: paths(&["datePosted", "timeOnZillow"]),
        }),
        "redfin" => Some(FieldMapping {
            address: paths(&["streetLine.value", "streetLine", "address"]),
            price: paths(&["price.value", "price"]),
            beds: paths(&["beds"]),
            baths: paths(&["baths"]),
            square_feet: paths(&["sqFt.value", "sqFt"]),
            listing_link: paths(&["url"]),
            time_of_post: paths(&["listingAddedDate", "dom.value"]),
        }),
        "craigslist" => Some(FieldMapping {
            address: paths(&["location.address", "mapaddress", "address"]),
            price: paths(&["price"]),
            beds: paths(&["housing.bedrooms", "bedrooms"]),
            baths: paths(&["housing.bathrooms", "bathrooms"]),
            square_feet: paths(&["housing.sqft", "sqft"]),
            listing_link: paths(&["url", "link"]),
            time_of_post: paths(&["datetime", "posted"]),
        }),
        _ => None,
    }
}

/// Explicit mapping wins, then the built-in table for the source, then the defaults.
pub fn adapter_for_source(source_id: &str, fields: Option<FieldMapping>) -> Box<dyn SourceAdapter> {
    let defaults = FieldMapping::default();
    let builtin = builtin_mapping(source_id).map(|m| m.or_fallback(&defaults));
    let mapping = match (fields, builtin) {
        (Some(explicit), Some(builtin)) => explicit.or_fallback(&builtin),
        (Some(explicit), None) => explicit.or_fallback(&defaults),
        (None, Some(builtin)) => builtin,
        (None, None) => defaults,
    };
    Box::new(MappedSourceAdapter {
        source_id: source_id.to_string(),
        mapping,
    })
}

pub fn load_scraped_batch(path: impl AsRef<Path>) -> Result<ScrapedBatch> {
    let path = path.as_ref();
    let mut batch: ScrapedBatch = read_json_file(path)?;
    hydrate_external_records(path, &mut batch)?;
    Ok(batch)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_external_records(batch_path: &Path, batch: &mut ScrapedBatch) -> Result<()> {
    if !batch.records.is_empty() {
        return Ok(());
    }
    let Some(rel_path) = &batch.records_path else {
        return Ok(());
    };
    let records_path = batch_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    batch.records = read_json_file(&records_path)
        .with_context(|| format!("loading records for batch {}", batch_path.display()))?;
    Ok(())
}

pub fn deterministic_batch_id(batch: &ScrapedBatch) -> Uuid {
    let source = format!(
        "{}:{}:{}",
        batch.source_id,
        batch.fetched_at.to_rfc3339(),
        batch.records.len()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn batch(source_id: &str, records: Vec<JsonValue>) -> ScrapedBatch {
        ScrapedBatch {
            source_id: source_id.to_string(),
            fetched_at: DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            records_path: None,
            records,
        }
    }

    #[test]
    fn default_mapping_takes_first_non_blank_candidate() {
        let record = json!({
            "address": "  ",
            "full_address": "12 Birch Lane",
            "list_price": 425000,
            "bathrooms": 2.5,
            "url": "https://homes.test/listing/12-birch",
        });
        let raw = FieldMapping::default().resolve(&record);
        assert_eq!(raw.address.as_deref(), Some("12 Birch Lane"));
        assert_eq!(raw.price.as_deref(), Some("425000"));
        assert_eq!(raw.baths.as_deref(), Some("2.5"));
        assert_eq!(raw.listing_link.as_deref(), Some("https://homes.test/listing/12-birch"));
        assert_eq!(raw.beds, None);
    }

    #[test]
    fn builtin_mapping_walks_nested_paths() {
        let adapter = adapter_for_source("redfin", None);
        let listings = adapter
            .map_batch(&batch(
                "redfin",
                vec![json!({
                    "streetLine": {"value": "9 Harbor Way"},
                    "price": {"value": 610000},
                    "sqFt": {"value": 1800},
                    "url": "/CA/listing/9-harbor",
                    "beds": 3,
                })],
            ))
            .expect("map");
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].address.as_deref(), Some("9 Harbor Way"));
        assert_eq!(listings[0].price.as_deref(), Some("610000"));
        assert_eq!(listings[0].square_feet.as_deref(), Some("1800"));
        assert_eq!(listings[0].beds.as_deref(), Some("3"));
    }

    #[test]
    fn explicit_mapping_overrides_and_falls_back_per_field() {
        let explicit = FieldMapping {
            address: vec!["addr.line1".into()],
            price: Vec::new(),
            beds: Vec::new(),
            baths: Vec::new(),
            square_feet: Vec::new(),
            listing_link: vec!["href".into()],
            time_of_post: Vec::new(),
        };
        let adapter = adapter_for_source("local-mls", Some(explicit));
        let raw = adapter.mapping().resolve(&json!({
            "addr": {"line1": "4 Pine Ct"},
            "address": "ignored",
            "href": "/listing/4-pine",
            "price": "350000",
        }));
        assert_eq!(raw.address.as_deref(), Some("4 Pine Ct"));
        assert_eq!(raw.listing_link.as_deref(), Some("/listing/4-pine"));
        assert_eq!(raw.price.as_deref(), Some("350000"));
    }

    #[test]
    fn mismatched_batch_source_is_rejected() {
        let adapter = adapter_for_source("zillow", None);
        let err = adapter.map_batch(&batch("redfin", vec![])).expect_err("mismatch");
        let AdapterError::SourceMismatch { expected, found } = err;
        assert_eq!(expected, "zillow");
        assert_eq!(found, "redfin");
        assert_eq!(
            err_message("zillow", "redfin"),
            "batch source_id=redfin does not match adapter source_id=zillow"
        );
    }

    fn err_message(expected: &str, found: &str) -> String {
        AdapterError::SourceMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
        .to_string()
    }

    #[test]
    fn batch_records_load_from_sibling_file() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("records.json"),
            r#"[{"address": "1 Main St", "price": "300000"}, {"link": "/listing/2"}]"#,
        )
        .expect("records");
        std::fs::write(
            dir.path().join("batch.json"),
            r#"{"source_id": "craigslist", "fetched_at": "2026-03-01T12:00:00Z", "records_path": "records.json"}"#,
        )
        .expect("batch");

        let loaded = load_scraped_batch(dir.path().join("batch.json")).expect("load");
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(deterministic_batch_id(&loaded), deterministic_batch_id(&loaded.clone()));

        let listings = adapter_for_source("craigslist", None)
            .map_batch(&loaded)
            .expect("map");
        assert_eq!(listings[0].address.as_deref(), Some("1 Main St"));
        assert_eq!(listings[1].listing_link.as_deref(), Some("/listing/2"));
    }

    #[test]
    fn missing_batch_file_is_reported_with_path() {
        let dir = tempdir().expect("tempdir");
        let err = load_scraped_batch(dir.path().join("nope.json")).expect_err("missing");
        assert!(err.to_string().contains("nope.json"));
    }
}
