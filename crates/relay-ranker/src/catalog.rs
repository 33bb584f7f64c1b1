use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use relay_types::EnrichedModel;

use crate::scoring::NormParams;
use crate::sources::BenchRow;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceStatus {
    pub name: String,
    pub ok: bool,
    /// Last fetch failed; the rows below are carried from an earlier refresh.
    #[serde(default)]
    pub stale: bool,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immutable catalog state. Refresh builds a complete replacement and swaps
/// the `Arc`; readers never observe a partially merged catalog.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatalogSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub models: HashMap<String, EnrichedModel>,
    #[serde(default)]
    pub norm_params: HashMap<String, NormParams>,
    #[serde(default)]
    pub sources: HashMap<String, SourceStatus>,
    /// Last-known-good rows per auxiliary source, kept so a failing feed
    /// degrades to its previous data instead of disappearing.
    #[serde(default)]
    pub source_rows: HashMap<String, Vec<BenchRow>>,
}

impl CatalogSnapshot {
    pub async fn load(path: &Path) -> Self {
        let Ok(raw) = fs::read_to_string(path).await else {
            return Self::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_string_pretty(self)?;
        fs::write(path, payload).await?;
        Ok(())
    }
}
