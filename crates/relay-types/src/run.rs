use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Single,
    Collective,
    Cascade,
    Plan,
    Swarm,
}

impl RunMode {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "single" => Some(Self::Single),
            "collective" => Some(Self::Collective),
            "cascade" => Some(Self::Cascade),
            "plan" => Some(Self::Plan),
            "swarm" => Some(Self::Swarm),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Collective => "collective",
            Self::Cascade => "cascade",
            Self::Plan => "plan",
            Self::Swarm => "swarm",
        }
    }
}

/// Price band on `pricing.prompt`, USD per 1M input tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetTier {
    Low,
    #[default]
    Medium,
    High,
    Any,
}

impl BudgetTier {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Any => "any",
        }
    }

    pub fn range(self) -> (f64, f64) {
        match self {
            Self::Low => (0.0, 1.0),
            Self::Medium => (0.0, 5.0),
            Self::High => (2.0, 20.0),
            Self::Any => (0.0, f64::INFINITY),
        }
    }

    pub fn cheaper(self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium => Self::Low,
            other => other,
        }
    }

    pub fn dearer(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Task,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::Skipped
        )
    }

    /// A dependency counts as satisfied when it finished with usable output
    /// or was deliberately skipped.
    pub fn is_satisfied(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStyle {
    Concise,
    Detailed,
    Decision,
}

impl MergeStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Concise => "concise",
            Self::Detailed => "detailed",
            Self::Decision => "decision",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanningSource {
    Api,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default)]
    pub stack: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default)]
    pub guardrails: Vec<String>,
}

impl RoleConfig {
    pub fn is_empty(&self) -> bool {
        self.persona.is_none()
            && self.stack.is_empty()
            && self.domain.is_none()
            && self.format.is_none()
            && self.guardrails.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MergeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<MergeStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Mode-specific hints attached to a node by the planner. Serialized as a
/// plain map so new hints do not break stored runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<super::ModelTier>,
    #[serde(default)]
    pub conditional: bool,
    #[serde(
        default,
        rename = "mergeStyle",
        skip_serializing_if = "Option::is_none"
    )]
    pub merge_style: Option<MergeStyle>,
    #[serde(
        default,
        rename = "planningSource",
        skip_serializing_if = "Option::is_none"
    )]
    pub planning_source: Option<PlanningSource>,
    #[serde(
        default,
        rename = "pricePrompt",
        skip_serializing_if = "Option::is_none"
    )]
    pub price_prompt: Option<f64>,
    #[serde(
        default,
        rename = "priceCompletion",
        skip_serializing_if = "Option::is_none"
    )]
    pub price_completion: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub task: String,
    pub mode: RunMode,
    pub budget: BudgetTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<RoleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeConfig>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub params_json: Value,
}

impl RunRecord {
    pub fn new(req: &CreateRunRequest) -> Self {
        let now = Utc::now();
        Self {
            id: format!("run-{}", Uuid::new_v4()),
            task: req.task.clone(),
            mode: req.mode,
            budget: req.budget.unwrap_or_default(),
            context: req.context.clone(),
            role: req.role.clone(),
            merge: req.merge.clone(),
            status: RunStatus::Queued,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            params_json: serde_json::to_value(req).unwrap_or(Value::Null),
        }
    }

    /// Context tags, lowercased and comma-split.
    pub fn context_tags(&self) -> Vec<String> {
        self.context
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Globally unique `runId:localId`.
    pub id: String,
    pub run_id: String,
    pub local_id: String,
    pub kind: NodeKind,
    /// Advisory wave index for visualization. Never consulted by the
    /// scheduler; dependency state is the only ordering oracle.
    pub wave: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub task: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub meta: NodeMeta,
    pub status: NodeStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tokens_prompt: u64,
    #[serde(default)]
    pub tokens_completion: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Raw,
    Merged,
    Plan,
    Log,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Raw | Self::Plan => "json",
            Self::Merged => "md",
            Self::Log => "txt",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Merged => "merged",
            Self::Plan => "plan",
            Self::Log => "log",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub kind: ArtifactKind,
    /// Path relative to the artifacts root.
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Progress {
    pub total: usize,
    pub done: usize,
    pub running: usize,
    pub failed: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub task: String,
    pub mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(
        default,
        alias = "collectiveCount",
        skip_serializing_if = "Option::is_none"
    )]
    pub collective_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<RoleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_shift_saturates_at_the_edges() {
        assert_eq!(BudgetTier::Low.cheaper(), BudgetTier::Low);
        assert_eq!(BudgetTier::High.dearer(), BudgetTier::High);
        assert_eq!(BudgetTier::Medium.dearer(), BudgetTier::High);
        assert_eq!(BudgetTier::Any.cheaper(), BudgetTier::Any);
    }

    #[test]
    fn context_tags_are_lowercased_and_trimmed() {
        let req = CreateRunRequest {
            task: "t".to_string(),
            mode: RunMode::Single,
            budget: None,
            context: Some("TypeScript, NextJS ,".to_string()),
            collective_count: None,
            role: None,
            merge: None,
        };
        let run = RunRecord::new(&req);
        assert_eq!(run.context_tags(), vec!["typescript", "nextjs"]);
    }

    #[test]
    fn node_meta_round_trips_camel_case_keys() {
        let meta = NodeMeta {
            mode: Some(RunMode::Cascade),
            tier: Some(crate::ModelTier::Premium),
            conditional: true,
            merge_style: Some(MergeStyle::Decision),
            planning_source: Some(PlanningSource::Api),
            price_prompt: Some(0.5),
            price_completion: Some(1.5),
        };
        let value = serde_json::to_value(&meta).expect("serialize");
        assert_eq!(value["mergeStyle"], "decision");
        assert_eq!(value["planningSource"], "api");
        let back: NodeMeta = serde_json::from_value(value).expect("deserialize");
        assert!(back.conditional);
    }
}
