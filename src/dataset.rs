// Static fallback dataset for the listing engine

use crate::config::ListingConfig;
use crate::record::ListedRecord;
use eyre::{Context, Result};
use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const BUNDLED: &str = include_str!("../data/updates.json");

/// The listing order: timestamp descending, then id descending
pub fn listing_order(a: &ListedRecord, b: &ListedRecord) -> Ordering {
    b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id))
}

/// Records held in listing order with normalized timestamps
#[derive(Debug, Clone, Default)]
pub struct StaticDataset {
    records: Vec<ListedRecord>,
}

impl StaticDataset {
    pub fn new(records: Vec<ListedRecord>) -> Result<Self> {
        let mut records = records
            .into_iter()
            .map(ListedRecord::normalized)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(listing_order);
        Ok(Self { records })
    }

    /// The dataset compiled into the binary
    pub fn bundled() -> Result<Self> {
        Self::from_json(BUNDLED).context("Failed to load bundled dataset")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let records: Vec<ListedRecord> = serde_json::from_str(json).context("Failed to parse dataset")?;
        Self::new(records)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).context("Failed to read dataset file")?;
        Self::from_json(&json)
    }

    /// Configured dataset, else the bundled one. Never fails.
    pub fn load(config: &ListingConfig) -> Self {
        if let Some(path) = &config.dataset {
            match Self::from_file(path) {
                Ok(dataset) => {
                    debug!(path = ?path, count = dataset.len(), "Loaded fallback dataset");
                    return dataset;
                }
                Err(e) => warn!(path = ?path, error = ?e, "Failed to load dataset file, using bundled dataset"),
            }
        }

        Self::bundled().unwrap_or_else(|e| {
            warn!(error = ?e, "Bundled dataset unusable, fallback listings will be empty");
            Self::default()
        })
    }

    pub fn records(&self) -> &[ListedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
