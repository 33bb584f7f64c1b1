//! Role-prompt composition. Five inputs (persona, stack, domain, format,
//! guardrails) resolve against a static block catalog and assemble into a
//! fixed-shape system prompt ahead of the task text.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use relay_types::RoleConfig;

const MAX_STACK_ENTRIES: usize = 10;
const MAX_GUARDRAILS: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaBlock {
    pub title: String,
    pub core: String,
    #[serde(default)]
    pub style: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoleCatalog {
    #[serde(default)]
    pub personas: HashMap<String, PersonaBlock>,
    #[serde(default)]
    pub stacks: HashMap<String, String>,
    #[serde(default)]
    pub domains: HashMap<String, String>,
    #[serde(default)]
    pub formats: HashMap<String, String>,
    #[serde(default)]
    pub guardrails: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposedPrompt {
    pub prompt: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl RoleCatalog {
    pub fn load() -> Self {
        let raw = include_str!("../assets/role_blocks.yaml");
        serde_yaml::from_str::<RoleCatalog>(raw).unwrap_or_default()
    }

    /// Unknown keys warn but never fail; a request that resolves to nothing
    /// returns the raw task.
    pub fn compose(&self, task: &str, role: &RoleConfig) -> ComposedPrompt {
        let mut warnings = Vec::new();
        let mut sections: Vec<String> = Vec::new();
        let mut style = None;

        if let Some(persona_key) = role.persona.as_deref() {
            match self.personas.get(&persona_key.to_lowercase()) {
                Some(block) => {
                    sections.push(format!("## Role: {}\n{}", block.title, block.core));
                    style = block.style.clone();
                }
                None => warnings.push(format!("unknown persona `{persona_key}`")),
            }
        }

        let stack_lines = resolve_list(
            &role.stack,
            &self.stacks,
            MAX_STACK_ENTRIES,
            "stack",
            &mut warnings,
        );
        if !stack_lines.is_empty() {
            sections.push(format!("### Stack\n{}", stack_lines.join("\n")));
        }

        if let Some(domain_key) = role.domain.as_deref() {
            match self.domains.get(&domain_key.to_lowercase()) {
                Some(block) => sections.push(format!("### Domain\n- {}", block)),
                None => warnings.push(format!("unknown domain `{domain_key}`")),
            }
        }

        if let Some(format_key) = role.format.as_deref() {
            match self.formats.get(&format_key.to_lowercase()) {
                Some(block) => sections.push(format!("### Output\n- {}", block)),
                None => warnings.push(format!("unknown format `{format_key}`")),
            }
        }

        let rule_lines = resolve_list(
            &role.guardrails,
            &self.guardrails,
            MAX_GUARDRAILS,
            "guardrail",
            &mut warnings,
        );
        if !rule_lines.is_empty() {
            sections.push(format!("### Rules\n{}", rule_lines.join("\n")));
        }

        if sections.is_empty() {
            return ComposedPrompt {
                prompt: task.to_string(),
                warnings,
            };
        }

        if let Some(style) = style {
            sections.push(format!("Style: {}", style));
        }
        sections.push(format!("## Task\n{}", task));

        ComposedPrompt {
            prompt: sections.join("\n\n"),
            warnings,
        }
    }
}

fn resolve_list(
    keys: &[String],
    blocks: &HashMap<String, String>,
    cap: usize,
    kind: &str,
    warnings: &mut Vec<String>,
) -> Vec<String> {
    let mut out = Vec::new();
    for key in keys.iter().take(cap) {
        match blocks.get(&key.to_lowercase()) {
            Some(block) => out.push(format!("- {}", block)),
            None => warnings.push(format!("unknown {kind} `{key}`")),
        }
    }
    if keys.len() > cap {
        warnings.push(format!("{kind} list truncated to {cap} entries"));
    }
    out
}
