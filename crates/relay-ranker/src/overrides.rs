use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use relay_types::{Category, EnrichedModel, ModelTier};

/// Operator-supplied corrections, authoritative over everything derived.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Overrides {
    #[serde(default)]
    pub models: HashMap<String, OverrideEntry>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OverrideEntry {
    #[serde(default)]
    pub categories: Option<Vec<Category>>,
    #[serde(default)]
    pub scores: Option<HashMap<Category, f64>>,
    #[serde(default)]
    pub tier: Option<ModelTier>,
}

impl Overrides {
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_yaml::from_str::<Overrides>(&raw) {
            Ok(overrides) => overrides,
            Err(err) => {
                tracing::warn!("ignoring malformed overrides file {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn apply(&self, models: &mut HashMap<String, EnrichedModel>) {
        for (id, entry) in &self.models {
            let Some(model) = models.get_mut(id) else {
                continue;
            };
            if let Some(categories) = &entry.categories {
                model.categories = categories.iter().copied().collect();
                model.categories.insert(Category::General);
            }
            if let Some(scores) = &entry.scores {
                for (category, score) in scores {
                    model.scores.insert(*category, score.clamp(0.0, 100.0));
                }
            }
            if let Some(tier) = entry.tier {
                model.tier = tier;
            }
        }
    }
}
