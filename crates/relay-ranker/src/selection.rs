//! Blended model selection: benchmark score plus personal, context and
//! community feedback signals, weighted by which signals actually exist.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use relay_types::{BudgetTier, Category, EnrichedModel};

use crate::feedback::{context_key, feedback_key, FeedbackView};
use crate::scoring::{zscore, NormParams};

/// Observations required before a personal or per-context signal counts.
pub const MIN_FEEDBACK_OBSERVATIONS: u64 = 3;
/// Ratings required before the community signal counts.
pub const MIN_COMMUNITY_RATINGS: u64 = 10;
/// Upper bound on the additive context boost.
pub const MAX_CONTEXT_BOOST: f64 = 15.0;

/// Per-tag benchmark weight recipes for the context boost.
pub type ContextRecipes = HashMap<String, HashMap<String, f64>>;

pub fn load_context_recipes() -> ContextRecipes {
    let raw = include_str!("../assets/context_recipes.yaml");
    serde_yaml::from_str::<ContextRecipes>(raw).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct PickQuery {
    pub category: Category,
    pub budget: BudgetTier,
    pub context_tags: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub model: EnrichedModel,
    pub score: f64,
    pub confidence: f64,
}

/// Weight rows keyed by which of (personal, context, community) exist.
/// Absent signals contribute nothing; rows sum to 1 over present signals.
fn blend_weights(p: bool, x: bool, c: bool) -> (f64, f64, f64, f64) {
    match (p, x, c) {
        (false, false, false) => (1.0, 0.0, 0.0, 0.0),
        (true, false, false) => (0.70, 0.30, 0.0, 0.0),
        (false, true, false) => (0.80, 0.0, 0.20, 0.0),
        (false, false, true) => (0.70, 0.0, 0.0, 0.30),
        (true, true, false) => (0.60, 0.20, 0.20, 0.0),
        (true, false, true) => (0.50, 0.25, 0.0, 0.25),
        (false, true, true) => (0.55, 0.0, 0.20, 0.25),
        (true, true, true) => (0.45, 0.20, 0.15, 0.20),
    }
}

/// `max(0, z) * weight * 10` summed over every context tag's recipe, capped.
fn context_boost(
    model: &EnrichedModel,
    tags: &[String],
    recipes: &ContextRecipes,
    params: &HashMap<String, NormParams>,
) -> f64 {
    let mut boost = 0.0;
    for tag in tags {
        let Some(recipe) = recipes.get(&tag.to_lowercase()) else {
            continue;
        };
        for (key, weight) in recipe {
            let Some(value) = model.benchmarks.get(key) else {
                continue;
            };
            if let Some(z) = zscore(params, key, *value) {
                boost += z.max(0.0) * weight * 10.0;
            }
        }
    }
    boost.min(MAX_CONTEXT_BOOST)
}

pub fn blended_score(
    model: &EnrichedModel,
    query: &PickQuery,
    view: &FeedbackView,
    recipes: &ContextRecipes,
    params: &HashMap<String, NormParams>,
) -> f64 {
    let benchmark = model
        .scores
        .get(&query.category)
        .or_else(|| model.scores.get(&Category::General))
        .copied()
        .unwrap_or_else(|| model.tier.baseline());

    let personal = view
        .personal
        .get(&feedback_key(&model.id, query.category))
        .filter(|s| s.total() > MIN_FEEDBACK_OBSERVATIONS)
        .map(|s| s.score());

    // The strongest per-tag signal stands in for the context dimension.
    let context = query
        .context_tags
        .iter()
        .filter_map(|tag| {
            view.context
                .get(&context_key(&model.id, query.category, tag))
                .filter(|s| s.total() > MIN_FEEDBACK_OBSERVATIONS)
                .map(|s| s.score())
        })
        .fold(None::<f64>, |acc, s| Some(acc.map_or(s, |a| a.max(s))));

    let community = view
        .community
        .get(&feedback_key(&model.id, query.category))
        .filter(|s| s.total_ratings >= MIN_COMMUNITY_RATINGS)
        .map(|s| s.avg_rating() / 5.0);

    let (wb, wp, wx, wc) = blend_weights(
        personal.is_some(),
        context.is_some(),
        community.is_some(),
    );

    benchmark * wb
        + 100.0 * personal.unwrap_or(0.0) * wp
        + 100.0 * context.unwrap_or(0.0) * wx
        + 100.0 * community.unwrap_or(0.0) * wc
        + context_boost(model, &query.context_tags, recipes, params)
}

/// Candidates inside the budget band, carrying the category (or general, which
/// every model carries) and not excluded, ranked by blended score. Ties break
/// lexicographically on id so selection is deterministic.
pub fn rank<'a>(
    models: impl Iterator<Item = &'a EnrichedModel>,
    query: &PickQuery,
    view: &FeedbackView,
    recipes: &ContextRecipes,
    params: &HashMap<String, NormParams>,
) -> Vec<(f64, &'a EnrichedModel)> {
    let (lo, hi) = query.budget.range();
    let mut ranked = models
        .filter(|m| m.pricing.prompt >= lo && m.pricing.prompt <= hi)
        .filter(|m| {
            m.categories.contains(&query.category) || m.categories.contains(&Category::General)
        })
        .filter(|m| !query.exclude.iter().any(|e| e == &m.id))
        .map(|m| (blended_score(m, query, view, recipes, params), m))
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });
    ranked
}

pub fn pick<'a>(
    models: impl Iterator<Item = &'a EnrichedModel>,
    query: &PickQuery,
    view: &FeedbackView,
    recipes: &ContextRecipes,
    params: &HashMap<String, NormParams>,
) -> Option<(f64, &'a EnrichedModel)> {
    rank(models, query, view, recipes, params).into_iter().next()
}

/// N winners with provider diversity: one slot per distinct provider in
/// descending score, then remaining slots by pure score.
pub fn recommend<'a>(
    models: impl Iterator<Item = &'a EnrichedModel>,
    query: &PickQuery,
    count: usize,
    view: &FeedbackView,
    recipes: &ContextRecipes,
    params: &HashMap<String, NormParams>,
) -> Vec<Recommendation> {
    let ranked = rank(models, query, view, recipes, params);
    let mut taken: Vec<usize> = Vec::new();
    let mut providers_seen: Vec<&str> = Vec::new();

    for (index, (_, model)) in ranked.iter().enumerate() {
        if taken.len() >= count {
            break;
        }
        if !providers_seen.contains(&model.provider.as_str()) {
            providers_seen.push(model.provider.as_str());
            taken.push(index);
        }
    }
    for index in 0..ranked.len() {
        if taken.len() >= count {
            break;
        }
        if !taken.contains(&index) {
            taken.push(index);
        }
    }
    taken.sort_unstable();

    taken
        .into_iter()
        .map(|index| {
            let (score, model) = ranked[index];
            Recommendation {
                confidence: confidence(model, query.category, view),
                model: model.clone(),
                score,
            }
        })
        .collect()
}

/// Bounded sum of priors over the evidence backing a recommendation.
pub fn confidence(model: &EnrichedModel, category: Category, view: &FeedbackView) -> f64 {
    let mut confidence = 0.5 + 0.1 * model.sources_covered.len() as f64;
    if model.scores.contains_key(&category) {
        confidence += 0.1;
    }
    if model.benchmarks.contains_key("arena") {
        confidence += 0.1;
    }
    if view
        .personal
        .get(&feedback_key(&model.id, category))
        .is_some()
    {
        confidence += 0.15;
    }
    confidence.min(0.99)
}
