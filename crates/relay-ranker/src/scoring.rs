//! Catalog post-processing: variant propagation, tier assignment, category
//! membership, z-score normalization and per-category composite scores.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use relay_types::{Category, EnrichedModel, ModelTier};

/// Minimum samples before a benchmark's mean/stddev is trusted.
pub const MIN_NORM_SAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct NormParams {
    pub mean: f64,
    pub stddev: f64,
    pub count: usize,
}

impl NormParams {
    pub fn is_meaningful(&self) -> bool {
        self.count >= MIN_NORM_SAMPLES && self.stddev > f64::EPSILON
    }
}

pub fn compute_norm_params(
    models: &HashMap<String, EnrichedModel>,
) -> HashMap<String, NormParams> {
    let mut samples: HashMap<&str, Vec<f64>> = HashMap::new();
    for model in models.values() {
        for (key, value) in &model.benchmarks {
            samples.entry(key.as_str()).or_default().push(*value);
        }
    }
    samples
        .into_iter()
        .map(|(key, values)| {
            let count = values.len();
            let mean = values.iter().sum::<f64>() / count as f64;
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
            (
                key.to_string(),
                NormParams {
                    mean,
                    stddev: variance.sqrt(),
                    count,
                },
            )
        })
        .collect()
}

pub fn zscore(params: &HashMap<String, NormParams>, key: &str, value: f64) -> Option<f64> {
    let p = params.get(key)?;
    if !p.is_meaningful() {
        return None;
    }
    Some((value - p.mean) / p.stddev)
}

/// Map a raw benchmark value onto the 0-100 convention via `50 + 20z`.
/// Falls back to the raw value (already 0-100) when the catalog is too small
/// for meaningful statistics.
fn normalized_input(
    params: &HashMap<String, NormParams>,
    model: &EnrichedModel,
    key: &str,
) -> Option<f64> {
    let raw = *model.benchmarks.get(key)?;
    match zscore(params, key, raw) {
        Some(z) => Some((50.0 + 20.0 * z).clamp(0.0, 100.0)),
        None => Some(raw.clamp(0.0, 100.0)),
    }
}

/// Weighted average over the present inputs; absent inputs drop out and
/// their weight is redistributed proportionally.
fn weighted(inputs: &[(Option<f64>, f64)]) -> Option<f64> {
    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for (value, weight) in inputs {
        if let Some(value) = value {
            sum += value * weight;
            weight_sum += weight;
        }
    }
    if weight_sum > 0.0 {
        Some(sum / weight_sum)
    } else {
        None
    }
}

pub fn tier_from_pricing(prompt_price: f64) -> ModelTier {
    if prompt_price >= 2.0 {
        ModelTier::Premium
    } else if prompt_price >= 0.4 {
        ModelTier::Standard
    } else {
        ModelTier::Budget
    }
}

/// Copy benchmarks and speed from `a/b` onto every `a/b:<suffix>` that has
/// none of its own.
pub fn propagate_variants(models: &mut HashMap<String, EnrichedModel>) {
    let variant_ids = models
        .values()
        .filter(|m| m.variant_base().is_some())
        .map(|m| m.id.clone())
        .collect::<Vec<_>>();
    for id in variant_ids {
        let Some(base_id) = id.split_once(':').map(|(base, _)| base.to_string()) else {
            continue;
        };
        let Some(base) = models.get(&base_id).cloned() else {
            continue;
        };
        let Some(variant) = models.get_mut(&id) else {
            continue;
        };
        if variant.benchmarks.is_empty() {
            variant.benchmarks = base.benchmarks.clone();
        }
        if variant.speed.is_empty() {
            variant.speed = base.speed;
        }
    }
}

const CODING_KEYS: [&str; 4] = [
    "liveCodeBench",
    "liveBenchAgenticCoding",
    "liveBenchCoding",
    "codingIndex",
];
const REASONING_KEYS: [&str; 3] = ["liveBenchReasoning", "mathIndex", "gpqa"];

/// Membership is derived purely from capabilities, pricing and benchmark
/// presence; every model carries at least `general`.
pub fn derive_categories(model: &mut EnrichedModel) {
    model.categories.clear();
    model.categories.insert(Category::General);
    if CODING_KEYS.iter().any(|k| model.benchmarks.contains_key(*k)) {
        model.categories.insert(Category::Coding);
    }
    if model.capabilities.reasoning
        || REASONING_KEYS
            .iter()
            .any(|k| model.benchmarks.contains_key(*k))
    {
        model.categories.insert(Category::Reasoning);
    }
    if model.benchmarks.contains_key("liveBenchLanguage")
        || (model.tier == ModelTier::Premium && model.benchmarks.contains_key("arena"))
    {
        model.categories.insert(Category::Creative);
    }
    if model.capabilities.vision {
        model.categories.insert(Category::Vision);
    }
    if model.pricing.prompt < 2.0 {
        model.categories.insert(Category::FastCheap);
    }
    if model.context_length >= 100_000 {
        model.categories.insert(Category::Research);
    }
}

/// The per-category composite table. `general` always resolves (tier
/// baseline as the floor case) and feeds several other categories.
pub fn compute_scores(model: &mut EnrichedModel, params: &HashMap<String, NormParams>) {
    let input = |key: &str| normalized_input(params, model, key);

    let general = weighted(&[
        (input("arena"), 3.0),
        (input("mmluPro"), 2.0),
        (input("gpqa"), 2.0),
        (input("intelligenceIndex"), 1.0),
    ])
    .unwrap_or_else(|| model.tier.baseline());

    let coding = weighted(&[
        (input("liveCodeBench"), 4.0),
        (input("liveBenchAgenticCoding"), 3.0),
        (input("liveBenchCoding"), 2.0),
        (input("codingIndex"), 1.0),
    ])
    .unwrap_or_else(|| (0.85 * general).round());

    let mut reasoning = weighted(&[
        (input("liveBenchReasoning"), 3.0),
        (input("gpqa"), 3.0),
        (input("mathIndex"), 2.0),
        (input("arena"), 1.0),
        (input("intelligenceIndex"), 1.0),
    ])
    .unwrap_or_else(|| model.tier.baseline());
    if model.capabilities.reasoning {
        reasoning = reasoning.max(65.0);
    }

    let creative = weighted(&[
        (input("arena"), 4.0),
        (input("liveBenchLanguage"), 2.0),
        (Some(general), 1.0),
    ]);
    let creative = match creative {
        Some(score) => Some(score),
        None if model.tier == ModelTier::Premium => Some(general),
        None => None,
    };

    model.scores.clear();
    model.scores.insert(Category::General, clamp(general));
    model.scores.insert(Category::Coding, clamp(coding));
    model.scores.insert(Category::Reasoning, clamp(reasoning));
    if let Some(creative) = creative {
        model.scores.insert(Category::Creative, clamp(creative));
    }
    if model.capabilities.vision {
        model.scores.insert(Category::Vision, clamp(general));
    }
    if model.pricing.prompt < 2.0 {
        model.scores.insert(
            Category::FastCheap,
            clamp((100.0 - 50.0 * model.pricing.prompt).round()),
        );
    }
    if model.context_length >= 100_000 {
        let boost = (20.0 * model.context_length as f64 / 1e6).min(20.0);
        model.scores.insert(Category::Research, clamp(general + boost));
    }

    model.cost_efficiency.clear();
    let price = model.pricing.prompt + model.pricing.completion;
    if price > 0.0 {
        for (category, score) in &model.scores {
            model
                .cost_efficiency
                .insert(*category, (100.0 * score / price).round() / 100.0);
        }
    }
}

fn clamp(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// Full post-merge pass over a freshly merged catalog.
pub fn finalize_catalog(
    models: &mut HashMap<String, EnrichedModel>,
) -> HashMap<String, NormParams> {
    propagate_variants(models);
    for model in models.values_mut() {
        model.tier = tier_from_pricing(model.pricing.prompt);
    }
    let params = compute_norm_params(models);
    for model in models.values_mut() {
        derive_categories(model);
        compute_scores(model, &params);
    }
    params
}
