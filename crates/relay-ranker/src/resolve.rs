//! Resolution of raw feed names to canonical catalog ids. Three strategies
//! in order: the static alias asset, OpenRouter's `hugging_face_id`, and
//! iterative stripping of variant/date/effort suffix tokens.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use relay_types::EnrichedModel;

/// Trailing tokens that name a variant, a release date or an effort level
/// rather than a distinct model.
const STRIPPABLE_TOKENS: [&str; 16] = [
    "instruct",
    "it",
    "chat",
    "preview",
    "exp",
    "experimental",
    "beta",
    "latest",
    "thinking",
    "reasoning",
    "high",
    "medium",
    "low",
    "free",
    "fp8",
    "bf16",
];

pub struct CatalogIndex {
    by_norm: HashMap<String, String>,
    by_hf: HashMap<String, String>,
}

impl CatalogIndex {
    pub fn build<'a>(models: impl Iterator<Item = &'a EnrichedModel>) -> Self {
        let mut by_norm: HashMap<String, String> = HashMap::new();
        let mut by_hf = HashMap::new();
        let mut insert_norm = |key: String, id: &str| {
            match by_norm.get(&key) {
                // Collisions prefer the shortest id, which is the base model
                // rather than one of its variants.
                Some(existing) if existing.len() <= id.len() => {}
                _ => {
                    by_norm.insert(key, id.to_string());
                }
            }
        };
        for model in models {
            insert_norm(normalize(&model.id), &model.id);
            if let Some((_, model_part)) = model.id.split_once('/') {
                insert_norm(normalize(model_part), &model.id);
                // Variants also answer to their base model part.
                if let Some((base_part, _)) = model_part.split_once(':') {
                    insert_norm(normalize(base_part), &model.id);
                }
            }
            if let Some(hf) = model.hugging_face_id.as_deref() {
                by_hf.insert(hf.to_lowercase(), model.id.clone());
            }
        }
        Self { by_norm, by_hf }
    }

    pub fn resolve(
        &self,
        raw_name: &str,
        hf_hint: Option<&str>,
        aliases: &HashMap<String, String>,
    ) -> Option<String> {
        if let Some(id) = aliases
            .get(raw_name)
            .or_else(|| aliases.get(&raw_name.to_lowercase()))
        {
            return Some(id.clone());
        }

        if let Some(hf) = hf_hint {
            if let Some(id) = self.by_hf.get(&hf.to_lowercase()) {
                return Some(id.clone());
            }
        }
        if let Some(id) = self.by_hf.get(&raw_name.to_lowercase()) {
            return Some(id.clone());
        }

        let mut candidate = normalize(raw_name);
        loop {
            if let Some(id) = self.by_norm.get(&candidate) {
                return Some(id.clone());
            }
            let Some(stripped) = strip_one_suffix(&candidate) else {
                return None;
            };
            candidate = stripped;
        }
    }
}

fn date_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{2,8}$").expect("valid regex"))
}

fn paren_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([^)]*\)").expect("valid regex"))
}

pub fn normalize(name: &str) -> String {
    let cleaned = paren_re().replace_all(name, "");
    let mut out = String::with_capacity(cleaned.len());
    let mut last_dash = false;
    for c in cleaned.trim().chars() {
        let mapped = match c {
            ' ' | '_' => '-',
            other => other.to_ascii_lowercase(),
        };
        if mapped == '-' && last_dash {
            continue;
        }
        last_dash = mapped == '-';
        out.push(mapped);
    }
    out.trim_matches('-').to_string()
}

/// Drop the final `-token` when it is a known variant marker or looks like a
/// date fragment. Returns `None` when nothing strippable remains.
fn strip_one_suffix(candidate: &str) -> Option<String> {
    let (rest, token) = candidate.rsplit_once('-')?;
    if rest.is_empty() {
        return None;
    }
    let strippable =
        STRIPPABLE_TOKENS.contains(&token) || date_token_re().is_match(token);
    if strippable {
        Some(rest.to_string())
    } else {
        None
    }
}

pub fn load_aliases() -> HashMap<String, String> {
    let raw = include_str!("../assets/model_aliases.yaml");
    serde_yaml::from_str::<HashMap<String, String>>(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(ids: &[&str]) -> Vec<EnrichedModel> {
        ids.iter().map(|id| EnrichedModel::new(*id)).collect()
    }

    #[test]
    fn exact_model_part_resolves() {
        let models = catalog(&["openai/gpt-4o", "anthropic/claude-sonnet-4.5"]);
        let index = CatalogIndex::build(models.iter());
        assert_eq!(
            index.resolve("GPT-4o", None, &HashMap::new()).as_deref(),
            Some("openai/gpt-4o")
        );
    }

    #[test]
    fn date_and_variant_suffixes_strip_iteratively() {
        let models = catalog(&["openai/gpt-4o"]);
        let index = CatalogIndex::build(models.iter());
        assert_eq!(
            index
                .resolve("gpt-4o-2024-11-20", None, &HashMap::new())
                .as_deref(),
            Some("openai/gpt-4o")
        );
        assert_eq!(
            index
                .resolve("gpt-4o-chat-latest", None, &HashMap::new())
                .as_deref(),
            Some("openai/gpt-4o")
        );
    }

    #[test]
    fn meaningful_tokens_are_not_stripped() {
        let models = catalog(&["openai/gpt-4o"]);
        let index = CatalogIndex::build(models.iter());
        assert!(index
            .resolve("gpt-4o-mini", None, &HashMap::new())
            .is_none());
    }

    #[test]
    fn hugging_face_hint_wins_over_stripping() {
        let mut model = EnrichedModel::new("meta-llama/llama-3.1-70b-instruct");
        model.hugging_face_id = Some("meta-llama/Llama-3.1-70B-Instruct".to_string());
        let index = CatalogIndex::build([&model].into_iter());
        assert_eq!(
            index
                .resolve(
                    "some vendor name",
                    Some("meta-llama/Llama-3.1-70B-Instruct"),
                    &HashMap::new()
                )
                .as_deref(),
            Some("meta-llama/llama-3.1-70b-instruct")
        );
    }

    #[test]
    fn aliases_take_priority() {
        let models = catalog(&["openai/gpt-4o"]);
        let index = CatalogIndex::build(models.iter());
        let aliases = HashMap::from([(
            "ChatGPT-4o-latest".to_string(),
            "openai/gpt-4o".to_string(),
        )]);
        assert_eq!(
            index
                .resolve("ChatGPT-4o-latest", None, &aliases)
                .as_deref(),
            Some("openai/gpt-4o")
        );
    }

    #[test]
    fn collisions_prefer_the_base_id() {
        let models = catalog(&["openai/gpt-4o", "openai/gpt-4o:extended"]);
        let index = CatalogIndex::build(models.iter());
        assert_eq!(
            index.resolve("gpt-4o", None, &HashMap::new()).as_deref(),
            Some("openai/gpt-4o")
        );
    }

    #[test]
    fn parenthesized_qualifiers_are_dropped() {
        let models = catalog(&["anthropic/claude-sonnet-4.5"]);
        let index = CatalogIndex::build(models.iter());
        assert_eq!(
            index
                .resolve("Claude Sonnet 4.5 (thinking)", None, &HashMap::new())
                .as_deref(),
            Some("anthropic/claude-sonnet-4.5")
        );
    }
}
