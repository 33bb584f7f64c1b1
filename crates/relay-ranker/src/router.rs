//! The selection boundary the planner programs against. The in-process
//! [`crate::Ranker`] implements it directly; [`crate::HttpRanker`] speaks the
//! same contract to a remote ranking service for two-tier deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relay_types::{BudgetTier, Category, ModelTier, Pricing, RoleConfig};

use crate::catalog::SourceStatus;
use crate::roles::ComposedPrompt;
use crate::split::Decomposition;

#[derive(Debug, Clone, Default)]
pub struct PickRequest {
    pub task: String,
    pub budget: BudgetTier,
    pub context: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickedModel {
    pub id: String,
    pub category: Category,
    pub score: f64,
    pub confidence: f64,
    pub pricing: Pricing,
    pub tier: ModelTier,
}

#[derive(Debug, Clone, Default)]
pub struct DecomposeRequest {
    pub task: String,
    pub budget: BudgetTier,
    pub context: Vec<String>,
    pub max_parallel: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStatus {
    pub models: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sources: Vec<SourceStatus>,
}

#[async_trait]
pub trait ModelRouter: Send + Sync {
    /// Best model for the task under the budget, or `None` when nothing in
    /// the catalog qualifies.
    async fn pick(&self, req: &PickRequest) -> anyhow::Result<Option<PickedModel>>;

    async fn recommend(&self, req: &PickRequest, count: usize)
        -> anyhow::Result<Vec<PickedModel>>;

    /// Sequential split of the task, each step carrying a model.
    async fn decompose(&self, req: &DecomposeRequest) -> anyhow::Result<Decomposition>;

    /// DAG split of the task, each sub-task carrying a model and wave.
    async fn swarm(&self, req: &DecomposeRequest) -> anyhow::Result<Decomposition>;

    async fn compose_role(&self, task: &str, role: &RoleConfig)
        -> anyhow::Result<ComposedPrompt>;

    async fn status(&self) -> anyhow::Result<RouterStatus>;
}
