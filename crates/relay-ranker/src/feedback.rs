use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use relay_types::{Category, CommunityScore, PersonalScore};

/// Community ratings accepted per instance per hour.
pub const COMMUNITY_HOURLY_LIMIT: u32 = 10;

pub fn feedback_key(model: &str, category: Category) -> String {
    format!("{}|{}", model, category.as_str())
}

pub fn context_key(model: &str, category: Category, tag: &str) -> String {
    format!("{}|{}|{}", model, category.as_str(), tag.to_lowercase())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
struct RateWindow {
    hour: i64,
    count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FeedbackTables {
    personal: HashMap<String, PersonalScore>,
    context: HashMap<String, PersonalScore>,
    community: HashMap<String, CommunityScore>,
    community_contributors: HashMap<String, BTreeSet<String>>,
    rate: HashMap<String, RateWindow>,
}

/// Read-only snapshot handed to the selection math.
#[derive(Debug, Clone, Default)]
pub struct FeedbackView {
    pub personal: HashMap<String, PersonalScore>,
    pub context: HashMap<String, PersonalScore>,
    pub community: HashMap<String, CommunityScore>,
}

/// Personal, per-context and community observations, flushed to a JSON file
/// the same way the run store persists its tables.
pub struct FeedbackStore {
    path: PathBuf,
    inner: RwLock<FeedbackTables>,
}

impl FeedbackStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let path = base.join("feedback.json");
        let tables = if path.exists() {
            let raw = fs::read_to_string(&path).await?;
            serde_json::from_str::<FeedbackTables>(&raw).unwrap_or_default()
        } else {
            FeedbackTables::default()
        };
        Ok(Self {
            path,
            inner: RwLock::new(tables),
        })
    }

    pub async fn record_personal(
        &self,
        model: &str,
        category: Category,
        success: bool,
    ) -> anyhow::Result<PersonalScore> {
        let updated = {
            let mut tables = self.inner.write().await;
            let entry = tables
                .personal
                .entry(feedback_key(model, category))
                .or_default();
            if success {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
            *entry
        };
        self.flush().await?;
        Ok(updated)
    }

    pub async fn record_context(
        &self,
        model: &str,
        category: Category,
        tag: &str,
        success: bool,
    ) -> anyhow::Result<PersonalScore> {
        let updated = {
            let mut tables = self.inner.write().await;
            let entry = tables
                .context
                .entry(context_key(model, category, tag))
                .or_default();
            if success {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
            *entry
        };
        self.flush().await?;
        Ok(updated)
    }

    /// Returns `Ok(None)` when the instance exhausted its hourly allowance.
    pub async fn record_community(
        &self,
        model: &str,
        category: Category,
        rating: f64,
        instance: &str,
    ) -> anyhow::Result<Option<CommunityScore>> {
        let rating = rating.clamp(0.0, 5.0);
        let hour = Utc::now().timestamp() / 3600;
        let updated = {
            let mut tables = self.inner.write().await;
            let window = tables.rate.entry(instance.to_string()).or_default();
            if window.hour == hour && window.count >= COMMUNITY_HOURLY_LIMIT {
                return Ok(None);
            }
            if window.hour != hour {
                window.hour = hour;
                window.count = 0;
            }
            window.count += 1;

            let key = feedback_key(model, category);
            tables
                .community_contributors
                .entry(key.clone())
                .or_default()
                .insert(instance.to_string());
            let contributors = tables.community_contributors[&key].len() as u64;
            let entry = tables.community.entry(key).or_default();
            entry.total_ratings += 1;
            entry.sum_ratings += rating;
            entry.contributors = contributors;
            *entry
        };
        self.flush().await?;
        Ok(Some(updated))
    }

    pub async fn view(&self) -> FeedbackView {
        let tables = self.inner.read().await;
        FeedbackView {
            personal: tables.personal.clone(),
            context: tables.context.clone(),
            community: tables.community.clone(),
        }
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.inner.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&self.path, payload).await?;
        Ok(())
    }
}
