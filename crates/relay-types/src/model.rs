use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Coding,
    Reasoning,
    Creative,
    Research,
    General,
    FastCheap,
    Vision,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Coding,
        Category::Reasoning,
        Category::Creative,
        Category::Research,
        Category::General,
        Category::FastCheap,
        Category::Vision,
    ];

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "coding" => Some(Self::Coding),
            "reasoning" => Some(Self::Reasoning),
            "creative" => Some(Self::Creative),
            "research" => Some(Self::Research),
            "general" => Some(Self::General),
            "fast-cheap" => Some(Self::FastCheap),
            "vision" => Some(Self::Vision),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Reasoning => "reasoning",
            Self::Creative => "creative",
            Self::Research => "research",
            Self::General => "general",
            Self::FastCheap => "fast-cheap",
            Self::Vision => "vision",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Premium,
    #[default]
    Standard,
    Budget,
}

impl ModelTier {
    /// Baseline score used when a category has no benchmark inputs at all.
    pub fn baseline(self) -> f64 {
        match self {
            Self::Premium => 70.0,
            Self::Standard => 50.0,
            Self::Budget => 30.0,
        }
    }
}

/// USD per 1M tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct Pricing {
    pub prompt: f64,
    pub completion: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Capabilities {
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub function_calling: bool,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub reasoning: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct SpeedStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens_per_second: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token: Option<f64>,
}

impl SpeedStats {
    pub fn is_empty(&self) -> bool {
        self.output_tokens_per_second.is_none() && self.time_to_first_token.is_none()
    }
}

/// A catalog entry after ingestion: OpenRouter identity plus merged benchmark
/// signals and derived scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedModel {
    /// Canonical `provider/model` id; variants append `:<suffix>`.
    pub id: String,
    pub provider: String,
    pub context_length: u64,
    pub pricing: Pricing,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub categories: BTreeSet<Category>,
    #[serde(default)]
    pub scores: BTreeMap<Category, f64>,
    #[serde(default)]
    pub cost_efficiency: BTreeMap<Category, f64>,
    #[serde(default)]
    pub tier: ModelTier,
    #[serde(default)]
    pub benchmarks: BTreeMap<String, f64>,
    #[serde(default)]
    pub speed: SpeedStats,
    #[serde(default)]
    pub sources_covered: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hugging_face_id: Option<String>,
}

impl EnrichedModel {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let provider = id.split('/').next().unwrap_or_default().to_string();
        Self {
            id,
            provider,
            context_length: 0,
            pricing: Pricing::default(),
            capabilities: Capabilities::default(),
            categories: BTreeSet::from([Category::General]),
            scores: BTreeMap::new(),
            cost_efficiency: BTreeMap::new(),
            tier: ModelTier::Standard,
            benchmarks: BTreeMap::new(),
            speed: SpeedStats::default(),
            sources_covered: Vec::new(),
            hugging_face_id: None,
        }
    }

    /// Base id of a variant (`a/b:free` -> `a/b`), or `None` for base ids.
    pub fn variant_base(&self) -> Option<&str> {
        self.id.split_once(':').map(|(base, _)| base)
    }

    pub fn mark_source(&mut self, source: &str) {
        if !self.sources_covered.iter().any(|s| s == source) {
            self.sources_covered.push(source.to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct PersonalScore {
    pub successes: u64,
    pub failures: u64,
}

impl PersonalScore {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn score(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct CommunityScore {
    pub total_ratings: u64,
    pub sum_ratings: f64,
    pub contributors: u64,
}

impl CommunityScore {
    pub fn avg_rating(&self) -> f64 {
        if self.total_ratings == 0 {
            0.0
        } else {
            self.sum_ratings / self.total_ratings as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_serializes_kebab_case() {
        let value = serde_json::to_value(Category::FastCheap).expect("serialize");
        assert_eq!(value, "fast-cheap");
        assert_eq!(Category::parse("fast-cheap"), Some(Category::FastCheap));
    }

    #[test]
    fn new_model_always_carries_general() {
        let model = EnrichedModel::new("openai/gpt-4o");
        assert!(model.categories.contains(&Category::General));
        assert_eq!(model.provider, "openai");
    }

    #[test]
    fn variant_base_splits_on_colon() {
        let model = EnrichedModel::new("meta-llama/llama-3.1-8b:free");
        assert_eq!(model.variant_base(), Some("meta-llama/llama-3.1-8b"));
        assert_eq!(EnrichedModel::new("openai/gpt-4o").variant_base(), None);
    }

    #[test]
    fn personal_score_is_success_ratio() {
        let score = PersonalScore {
            successes: 3,
            failures: 1,
        };
        assert_eq!(score.total(), 4);
        assert!((score.score() - 0.75).abs() < f64::EPSILON);
    }
}
