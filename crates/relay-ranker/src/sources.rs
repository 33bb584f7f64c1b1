//! Benchmark feed parsing. Every feed is duck-typed `serde_json::Value`:
//! the providers reshape their payloads often enough that tolerant field
//! lookup beats strict deserialization. All numeric output lands on the
//! 0-100 convention.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_types::{Capabilities, Pricing, SpeedStats};

pub const SOURCE_OPENROUTER: &str = "openrouter";
pub const SOURCE_ARTIFICIAL_ANALYSIS: &str = "artificial-analysis";
pub const SOURCE_OPEN_LLM: &str = "open-llm";
pub const SOURCE_LMARENA: &str = "lmarena";
pub const SOURCE_LIVEBENCH: &str = "livebench";

/// Auxiliary feeds in write priority order: earlier sources win conflicting
/// benchmark keys.
pub const AUX_SOURCES: [&str; 4] = [
    SOURCE_ARTIFICIAL_ANALYSIS,
    SOURCE_OPEN_LLM,
    SOURCE_LMARENA,
    SOURCE_LIVEBENCH,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub openrouter_url: String,
    pub artificial_analysis_url: String,
    pub open_llm_url: String,
    pub lmarena_url: String,
    pub livebench_url: String,
    pub source_timeout: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            openrouter_url: "https://openrouter.ai/api/v1/models".to_string(),
            artificial_analysis_url: "https://artificialanalysis.ai/api/v2/data/llms/models"
                .to_string(),
            open_llm_url:
                "https://open-llm-leaderboard-open-llm-leaderboard.hf.space/api/leaderboard/formatted"
                    .to_string(),
            lmarena_url: "https://lmarena.ai/api/leaderboard".to_string(),
            livebench_url: "https://livebench.ai/api/leaderboard".to_string(),
            source_timeout: Duration::from_secs(45),
        }
    }
}

impl SourceConfig {
    pub fn url_for(&self, source: &str) -> &str {
        match source {
            SOURCE_ARTIFICIAL_ANALYSIS => &self.artificial_analysis_url,
            SOURCE_OPEN_LLM => &self.open_llm_url,
            SOURCE_LMARENA => &self.lmarena_url,
            SOURCE_LIVEBENCH => &self.livebench_url,
            _ => &self.openrouter_url,
        }
    }
}

/// Catalog identity pulled from OpenRouter, the authoritative feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSeed {
    pub id: String,
    pub context_length: u64,
    pub pricing: Pricing,
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hugging_face_id: Option<String>,
}

/// One model row from an auxiliary feed, normalized to 0-100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchRow {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hugging_face_id: Option<String>,
    #[serde(default)]
    pub benchmarks: BTreeMap<String, f64>,
    #[serde(default)]
    pub speed: SpeedStats,
    /// Representative raw value used to break duplicate-name ties.
    #[serde(default)]
    pub raw_score: f64,
    /// The raw name hints at a reasoning variant.
    #[serde(default)]
    pub reasoning_hint: bool,
}

pub fn parse_source(source: &str, value: &Value) -> Vec<BenchRow> {
    match source {
        SOURCE_ARTIFICIAL_ANALYSIS => parse_artificial_analysis(value),
        SOURCE_OPEN_LLM => parse_open_llm(value),
        SOURCE_LMARENA => parse_lmarena(value),
        SOURCE_LIVEBENCH => parse_livebench(value),
        _ => Vec::new(),
    }
}

pub fn parse_openrouter(value: &Value) -> Vec<CatalogSeed> {
    let mut out = Vec::new();
    for row in rows_of(value) {
        let Some(id) = text(row, &["id"]) else {
            continue;
        };
        let pricing_obj = row.get("pricing").cloned().unwrap_or_default();
        // OpenRouter prices are USD per token; the catalog speaks USD per 1M.
        let pricing = Pricing {
            prompt: (num_value(pricing_obj.get("prompt")).unwrap_or(0.0) * 1e6).max(0.0),
            completion: (num_value(pricing_obj.get("completion")).unwrap_or(0.0) * 1e6).max(0.0),
        };

        let parameters = row
            .get("supported_parameters")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let has_param = |name: &str| parameters.iter().any(|p| p == name);

        let input_modalities = row
            .get("architecture")
            .and_then(|v| v.get("input_modalities"))
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let modality = row
            .get("architecture")
            .and_then(|v| v.get("modality"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        out.push(CatalogSeed {
            id,
            context_length: row
                .get("context_length")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            pricing,
            capabilities: Capabilities {
                vision: input_modalities.iter().any(|m| m == "image")
                    || modality.contains("image"),
                function_calling: has_param("tools"),
                streaming: true,
                json: has_param("response_format") || has_param("structured_outputs"),
                reasoning: has_param("reasoning") || has_param("include_reasoning"),
            },
            hugging_face_id: text(row, &["hugging_face_id"]).filter(|s| !s.trim().is_empty()),
        });
    }
    out
}

fn parse_artificial_analysis(value: &Value) -> Vec<BenchRow> {
    let mut out = Vec::new();
    for row in rows_of(value) {
        let Some(name) = text(row, &["slug", "name", "model"]) else {
            continue;
        };
        let empty = Value::Null;
        let evals = row.get("evaluations").unwrap_or(&empty);

        let mut benchmarks = BTreeMap::new();
        // AA indices live on a [-100, +100] scale.
        for (key, field) in [
            ("intelligenceIndex", "artificial_analysis_intelligence_index"),
            ("codingIndex", "artificial_analysis_coding_index"),
            ("mathIndex", "artificial_analysis_math_index"),
        ] {
            if let Some(raw) = num(evals, &[field]) {
                benchmarks.insert(key.to_string(), aa_index(raw));
            }
        }
        // AA accuracy fields are fractions.
        for (key, fields) in [
            ("mmluPro", ["mmlu_pro", "mmlu_pro_accuracy"]),
            ("gpqa", ["gpqa", "gpqa_diamond"]),
            ("liveCodeBench", ["livecodebench", "live_code_bench"]),
        ] {
            if let Some(raw) = num(evals, &fields) {
                benchmarks.insert(key.to_string(), clamp_0_100(raw * 100.0));
            }
        }

        if benchmarks.is_empty() {
            continue;
        }
        let raw_score = num(evals, &["artificial_analysis_intelligence_index"]).unwrap_or(0.0);
        out.push(BenchRow {
            reasoning_hint: reasoning_hint(&name),
            speed: SpeedStats {
                output_tokens_per_second: num(row, &["median_output_tokens_per_second"]),
                time_to_first_token: num(row, &["median_time_to_first_token_seconds"]),
            },
            hugging_face_id: None,
            name,
            benchmarks,
            raw_score,
        });
    }
    out
}

fn parse_open_llm(value: &Value) -> Vec<BenchRow> {
    let mut out = Vec::new();
    for row in rows_of(value) {
        let Some(name) = text(row, &["fullname", "model", "model_name", "eval_name"]) else {
            continue;
        };
        let mut benchmarks = BTreeMap::new();
        // Leaderboard values are already 0-100.
        if let Some(raw) = num(row, &["mmlu_pro", "MMLU-PRO", "mmlu_pro_acc_norm"]) {
            benchmarks.insert("mmluPro".to_string(), clamp_0_100(raw));
        }
        if let Some(raw) = num(row, &["gpqa", "GPQA", "gpqa_acc_norm"]) {
            benchmarks.insert("gpqa".to_string(), clamp_0_100(raw));
        }
        if benchmarks.is_empty() {
            continue;
        }
        let raw_score = num(row, &["average", "Average", "score"])
            .unwrap_or_else(|| benchmarks.values().sum::<f64>() / benchmarks.len() as f64);
        out.push(BenchRow {
            reasoning_hint: reasoning_hint(&name),
            hugging_face_id: text(row, &["fullname", "model"]),
            speed: SpeedStats::default(),
            name,
            benchmarks,
            raw_score,
        });
    }
    out
}

fn parse_lmarena(value: &Value) -> Vec<BenchRow> {
    let mut out = Vec::new();
    for row in rows_of(value) {
        let Some(name) = text(row, &["model", "model_name", "name"]) else {
            continue;
        };
        let Some(elo) = num(row, &["elo", "rating", "arena_score", "score"]) else {
            continue;
        };
        out.push(BenchRow {
            reasoning_hint: reasoning_hint(&name),
            hugging_face_id: None,
            speed: SpeedStats::default(),
            benchmarks: BTreeMap::from([("arena".to_string(), arena_elo(elo))]),
            raw_score: elo,
            name,
        });
    }
    out
}

fn parse_livebench(value: &Value) -> Vec<BenchRow> {
    let mut out = Vec::new();
    for row in rows_of(value) {
        let Some(name) = text(row, &["model", "model_name", "name"]) else {
            continue;
        };
        let mut benchmarks = BTreeMap::new();
        for (key, fields) in [
            (
                "liveBenchReasoning",
                ["reasoning_average", "Reasoning Average"],
            ),
            ("liveBenchCoding", ["coding_average", "Coding Average"]),
            (
                "liveBenchAgenticCoding",
                ["agentic_coding_average", "Agentic Coding Average"],
            ),
            ("liveBenchLanguage", ["language_average", "Language Average"]),
        ] {
            if let Some(raw) = num(row, &fields) {
                benchmarks.insert(key.to_string(), clamp_0_100(raw));
            }
        }
        if benchmarks.is_empty() {
            continue;
        }
        let raw_score = num(row, &["global_average", "Global Average"])
            .unwrap_or_else(|| benchmarks.values().sum::<f64>() / benchmarks.len() as f64);
        out.push(BenchRow {
            reasoning_hint: reasoning_hint(&name),
            hugging_face_id: None,
            speed: SpeedStats::default(),
            name,
            benchmarks,
            raw_score,
        });
    }
    out
}

fn rows_of(value: &Value) -> Vec<&Value> {
    let array = if let Some(array) = value.as_array() {
        Some(array)
    } else {
        ["data", "models", "rows", "leaderboard"]
            .iter()
            .find_map(|key| value.get(*key).and_then(|v| v.as_array()))
    };
    array
        .map(|a| a.iter().filter(|v| v.is_object()).collect())
        .unwrap_or_default()
}

fn text(row: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| row.get(*key).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
}

fn num(row: &Value, keys: impl IntoIterator<Item = impl AsRef<str>>) -> Option<f64> {
    for key in keys {
        if let Some(found) = num_value(row.get(key.as_ref())) {
            return Some(found);
        }
    }
    None
}

/// Numbers arrive as JSON numbers or numeric strings depending on the feed.
fn num_value(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn clamp_0_100(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// AA indices: [-100, +100] -> [0, 100].
pub fn aa_index(raw: f64) -> f64 {
    clamp_0_100((raw + 100.0) / 2.0)
}

/// LMArena ELO mapped linearly from the 1000-1500 band.
pub fn arena_elo(elo: f64) -> f64 {
    clamp_0_100((elo - 1000.0) / 500.0 * 100.0)
}

pub fn reasoning_hint(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("thinking")
        || lower.contains("reasoning")
        || lower.contains("reasoner")
        || lower.ends_with("-r1")
        || lower.contains("-r1-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn openrouter_pricing_converts_to_per_million() {
        let value = json!({"data": [{
            "id": "openai/gpt-4o",
            "context_length": 128000,
            "pricing": {"prompt": "0.0000025", "completion": "0.00001"},
            "architecture": {"modality": "text+image->text", "input_modalities": ["text", "image"]},
            "supported_parameters": ["tools", "response_format"],
            "hugging_face_id": ""
        }]});
        let seeds = parse_openrouter(&value);
        assert_eq!(seeds.len(), 1);
        let seed = &seeds[0];
        assert!((seed.pricing.prompt - 2.5).abs() < 1e-9);
        assert!((seed.pricing.completion - 10.0).abs() < 1e-9);
        assert!(seed.capabilities.vision);
        assert!(seed.capabilities.function_calling);
        assert!(seed.capabilities.json);
        assert!(!seed.capabilities.reasoning);
        assert!(seed.hugging_face_id.is_none());
    }

    #[test]
    fn aa_indices_are_rescaled_and_fractions_multiplied() {
        let value = json!({"data": [{
            "slug": "gpt-4o",
            "evaluations": {
                "artificial_analysis_intelligence_index": 40.0,
                "mmlu_pro": 0.74,
                "gpqa": 0.5
            },
            "median_output_tokens_per_second": 88.0
        }]});
        let rows = parse_source(SOURCE_ARTIFICIAL_ANALYSIS, &value);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!((row.benchmarks["intelligenceIndex"] - 70.0).abs() < 1e-9);
        assert!((row.benchmarks["mmluPro"] - 74.0).abs() < 1e-9);
        assert!((row.benchmarks["gpqa"] - 50.0).abs() < 1e-9);
        assert_eq!(row.speed.output_tokens_per_second, Some(88.0));
    }

    #[test]
    fn arena_elo_maps_linearly_and_clamps() {
        assert!((arena_elo(1250.0) - 50.0).abs() < 1e-9);
        assert_eq!(arena_elo(900.0), 0.0);
        assert_eq!(arena_elo(2000.0), 100.0);
    }

    #[test]
    fn livebench_rows_keep_their_scale() {
        let value = json!([{
            "model": "claude-4.5-sonnet",
            "reasoning_average": 81.2,
            "coding_average": 74.9,
            "global_average": 77.0
        }]);
        let rows = parse_source(SOURCE_LIVEBENCH, &value);
        assert_eq!(rows.len(), 1);
        assert!((rows[0].benchmarks["liveBenchReasoning"] - 81.2).abs() < 1e-9);
        assert!((rows[0].raw_score - 77.0).abs() < 1e-9);
    }

    #[test]
    fn reasoning_hint_reads_the_name() {
        assert!(reasoning_hint("gemini-2.5-pro-thinking"));
        assert!(reasoning_hint("deepseek-r1"));
        assert!(!reasoning_hint("gpt-4o-mini"));
    }
}
