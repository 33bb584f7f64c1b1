use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::timeout;

use async_trait::async_trait;
use relay_types::{BudgetTier, Category, EnrichedModel, RoleConfig};

use crate::catalog::{CatalogSnapshot, SourceStatus};
use crate::feedback::FeedbackStore;
use crate::overrides::Overrides;
use crate::resolve::{load_aliases, CatalogIndex};
use crate::roles::{ComposedPrompt, RoleCatalog};
use crate::router::{DecomposeRequest, ModelRouter, PickRequest, PickedModel, RouterStatus};
use crate::scoring::finalize_catalog;
use crate::selection::{self, load_context_recipes, ContextRecipes, PickQuery};
use crate::sources::{
    parse_openrouter, parse_source, BenchRow, SourceConfig, AUX_SOURCES, SOURCE_ARTIFICIAL_ANALYSIS,
    SOURCE_OPENROUTER,
};
use crate::split::{self, Decomposition, SubTask};

const DEFAULT_SWARM_PARALLEL: usize = 4;

#[derive(Debug, Clone)]
pub struct RankerConfig {
    pub sources: SourceConfig,
    /// Cadence of the background refresh loop.
    pub refresh_interval: Duration,
    pub overrides_path: Option<PathBuf>,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            sources: SourceConfig::default(),
            refresh_interval: Duration::from_secs(6 * 60 * 60),
            overrides_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshReport {
    pub models: usize,
    pub sources: Vec<SourceStatus>,
}

/// Model intelligence: a continually refreshed catalog of enriched models
/// plus the feedback tables, behind an atomically swapped snapshot.
pub struct Ranker {
    snapshot_path: PathBuf,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    feedback: FeedbackStore,
    overrides: Overrides,
    recipes: ContextRecipes,
    aliases: HashMap<String, String>,
    roles: RoleCatalog,
    config: RankerConfig,
    http: reqwest::Client,
}

impl Ranker {
    pub async fn load(state_dir: impl AsRef<Path>, config: RankerConfig) -> anyhow::Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        let snapshot_path = state_dir.join("catalog.json");
        let snapshot = CatalogSnapshot::load(&snapshot_path).await;
        if snapshot.models.is_empty() {
            tracing::info!("no catalog snapshot found; starting with an empty catalog");
        } else {
            tracing::info!(
                models = snapshot.models.len(),
                "loaded catalog snapshot from disk"
            );
        }
        let overrides = config
            .overrides_path
            .as_deref()
            .map(Overrides::load)
            .unwrap_or_default();
        Ok(Self {
            snapshot_path,
            snapshot: RwLock::new(Arc::new(snapshot)),
            feedback: FeedbackStore::new(&state_dir).await?,
            overrides,
            recipes: load_context_recipes(),
            aliases: load_aliases(),
            roles: RoleCatalog::load(),
            config,
            http: reqwest::Client::new(),
        })
    }

    pub fn refresh_interval(&self) -> Duration {
        self.config.refresh_interval
    }

    pub fn feedback(&self) -> &FeedbackStore {
        &self.feedback
    }

    pub async fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Replace the catalog with the given models, running the full
    /// post-merge pass. Used by tests and offline seeding.
    pub async fn install_models(&self, models: Vec<EnrichedModel>) -> anyhow::Result<usize> {
        let mut map: HashMap<String, EnrichedModel> =
            models.into_iter().map(|m| (m.id.clone(), m)).collect();
        let norm_params = finalize_catalog(&mut map);
        self.overrides.apply(&mut map);
        let count = map.len();
        let snapshot = CatalogSnapshot {
            updated_at: Some(Utc::now()),
            models: map,
            norm_params,
            sources: HashMap::new(),
            source_rows: HashMap::new(),
        };
        self.swap_and_persist(snapshot).await?;
        Ok(count)
    }

    /// One full refresh: OpenRouter is authoritative and aborts the merge
    /// when empty; auxiliary feeds degrade to their last-known-good rows.
    pub async fn refresh(&self) -> anyhow::Result<RefreshReport> {
        let previous = self.snapshot().await;
        let now = Utc::now();

        let seeds = parse_openrouter(
            &self
                .fetch_json(&self.config.sources.openrouter_url)
                .await
                .map_err(|err| anyhow::anyhow!("openrouter fetch failed: {err}"))?,
        );
        if seeds.is_empty() {
            anyhow::bail!("openrouter returned zero models; refresh aborted");
        }

        let mut models: HashMap<String, EnrichedModel> = HashMap::new();
        for seed in &seeds {
            let mut model = EnrichedModel::new(&seed.id);
            model.context_length = seed.context_length;
            model.pricing = seed.pricing;
            model.capabilities = seed.capabilities;
            model.hugging_face_id = seed.hugging_face_id.clone();
            model.mark_source(SOURCE_OPENROUTER);
            models.insert(model.id.clone(), model);
        }

        let mut sources = HashMap::from([(
            SOURCE_OPENROUTER.to_string(),
            SourceStatus {
                name: SOURCE_OPENROUTER.to_string(),
                ok: true,
                stale: false,
                count: seeds.len(),
                fetched_at: Some(now),
                error: None,
            },
        )]);

        // The auxiliary feeds are independent; pull them concurrently.
        let fetched = futures::future::join_all(AUX_SOURCES.iter().map(|source| async move {
            let url = self.config.sources.url_for(source);
            let result = self
                .fetch_json(url)
                .await
                .map(|value| parse_source(source, &value));
            (*source, result)
        }))
        .await;

        let index = CatalogIndex::build(models.values());
        let mut source_rows: HashMap<String, Vec<BenchRow>> = HashMap::new();
        for (source, result) in fetched {
            let (rows, status) = match result {
                Ok(rows) => (
                    rows.clone(),
                    SourceStatus {
                        name: source.to_string(),
                        ok: true,
                        stale: false,
                        count: rows.len(),
                        fetched_at: Some(now),
                        error: None,
                    },
                ),
                Err(err) => {
                    let prior = previous.sources.get(source);
                    let rows = previous
                        .source_rows
                        .get(source)
                        .cloned()
                        .unwrap_or_default();
                    tracing::warn!(source, "feed failed, keeping last-known-good data: {err}");
                    (
                        rows,
                        SourceStatus {
                            name: source.to_string(),
                            ok: false,
                            stale: true,
                            count: prior.map(|p| p.count).unwrap_or(0),
                            fetched_at: prior.and_then(|p| p.fetched_at),
                            error: Some(err.to_string()),
                        },
                    )
                }
            };
            merge_source(&mut models, &index, source, &rows, &self.aliases);
            source_rows.insert(source.to_string(), rows);
            sources.insert(source.to_string(), status);
        }

        let norm_params = finalize_catalog(&mut models);
        self.overrides.apply(&mut models);

        let report = RefreshReport {
            models: models.len(),
            sources: sources.values().cloned().collect(),
        };
        let snapshot = CatalogSnapshot {
            updated_at: Some(now),
            models,
            norm_params,
            sources,
            source_rows,
        };
        self.swap_and_persist(snapshot).await?;
        tracing::info!(models = report.models, "catalog refresh complete");
        Ok(report)
    }

    async fn swap_and_persist(&self, snapshot: CatalogSnapshot) -> anyhow::Result<()> {
        let shared = Arc::new(snapshot);
        *self.snapshot.write().await = shared.clone();
        shared.save(&self.snapshot_path).await
    }

    async fn fetch_json(&self, url: &str) -> anyhow::Result<Value> {
        let fut = async {
            let response = self.http.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                anyhow::bail!("request failed with status {status}");
            }
            Ok(response.json::<Value>().await?)
        };
        timeout(self.config.sources.source_timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("source timed out"))?
    }

    async fn pick_category(
        &self,
        category: Category,
        budget: BudgetTier,
        context: &[String],
        exclude: &[String],
    ) -> Option<PickedModel> {
        let snapshot = self.snapshot().await;
        let view = self.feedback.view().await;
        let query = PickQuery {
            category,
            budget,
            context_tags: context.to_vec(),
            exclude: exclude.to_vec(),
        };
        let (score, model) = selection::pick(
            snapshot.models.values(),
            &query,
            &view,
            &self.recipes,
            &snapshot.norm_params,
        )?;
        Some(PickedModel {
            id: model.id.clone(),
            category,
            score,
            confidence: selection::confidence(model, category, &view),
            pricing: model.pricing,
            tier: model.tier,
        })
    }

    async fn assign_models(&self, subtasks: &mut [SubTask], context: &[String]) {
        for subtask in subtasks {
            if let Some(picked) = self
                .pick_category(subtask.category, subtask.budget, context, &[])
                .await
            {
                subtask.cost_estimate = split::estimate_cost(Some(picked.pricing));
                subtask.model_pricing = Some(picked.pricing);
                subtask.model = Some(picked.id);
            }
        }
    }
}

/// Resolve a source's rows onto catalog ids and write each benchmark key
/// only when no higher-priority source already set it.
fn merge_source(
    models: &mut HashMap<String, EnrichedModel>,
    index: &CatalogIndex,
    source: &str,
    rows: &[BenchRow],
    aliases: &HashMap<String, String>,
) {
    let mut chosen: HashMap<String, &BenchRow> = HashMap::new();
    for row in rows {
        let Some(id) = index.resolve(&row.name, row.hugging_face_id.as_deref(), aliases) else {
            continue;
        };
        let replace = match chosen.get(&id) {
            None => true,
            Some(existing) => {
                if source == SOURCE_ARTIFICIAL_ANALYSIS
                    && row.reasoning_hint != existing.reasoning_hint
                {
                    // AA publishes base and reasoning variants side by side;
                    // the reasoning one carries the intended numbers.
                    row.reasoning_hint
                } else {
                    row.raw_score > existing.raw_score
                }
            }
        };
        if replace {
            chosen.insert(id, row);
        }
    }

    for (id, row) in chosen {
        let Some(model) = models.get_mut(&id) else {
            continue;
        };
        for (key, value) in &row.benchmarks {
            model.benchmarks.entry(key.clone()).or_insert(*value);
        }
        if model.speed.is_empty() && !row.speed.is_empty() {
            model.speed = row.speed;
        }
        model.mark_source(source);
    }
}

#[async_trait]
impl ModelRouter for Ranker {
    async fn pick(&self, req: &PickRequest) -> anyhow::Result<Option<PickedModel>> {
        let category = split::classify(&req.task);
        Ok(self
            .pick_category(category, req.budget, &req.context, &req.exclude)
            .await)
    }

    async fn recommend(
        &self,
        req: &PickRequest,
        count: usize,
    ) -> anyhow::Result<Vec<PickedModel>> {
        let category = split::classify(&req.task);
        let snapshot = self.snapshot().await;
        let view = self.feedback.view().await;
        let query = PickQuery {
            category,
            budget: req.budget,
            context_tags: req.context.clone(),
            exclude: req.exclude.clone(),
        };
        let recommendations = selection::recommend(
            snapshot.models.values(),
            &query,
            count.max(1),
            &view,
            &self.recipes,
            &snapshot.norm_params,
        );
        Ok(recommendations
            .into_iter()
            .map(|r| PickedModel {
                id: r.model.id.clone(),
                category,
                score: r.score,
                confidence: r.confidence,
                pricing: r.model.pricing,
                tier: r.model.tier,
            })
            .collect())
    }

    async fn decompose(&self, req: &DecomposeRequest) -> anyhow::Result<Decomposition> {
        let Some((method, parts)) = split::split_task(&req.task) else {
            return Ok(Decomposition::empty());
        };
        let mut subtasks = split::sequential_subtasks(&parts, req.budget);
        self.assign_models(&mut subtasks, &req.context).await;
        Ok(Decomposition {
            decomposed: true,
            method: Some(method),
            subtasks,
            warning: None,
        })
    }

    async fn swarm(&self, req: &DecomposeRequest) -> anyhow::Result<Decomposition> {
        let Some((method, parts)) = split::split_task(&req.task) else {
            return Ok(Decomposition::empty());
        };
        let max_parallel = if req.max_parallel == 0 {
            DEFAULT_SWARM_PARALLEL
        } else {
            req.max_parallel
        };
        let (mut subtasks, warning) =
            split::swarm_subtasks(&parts, method, req.budget, max_parallel);
        self.assign_models(&mut subtasks, &req.context).await;
        Ok(Decomposition {
            decomposed: true,
            method: Some(method),
            subtasks,
            warning,
        })
    }

    async fn compose_role(
        &self,
        task: &str,
        role: &RoleConfig,
    ) -> anyhow::Result<ComposedPrompt> {
        Ok(self.roles.compose(task, role))
    }

    async fn status(&self) -> anyhow::Result<RouterStatus> {
        let snapshot = self.snapshot().await;
        let mut sources = snapshot.sources.values().cloned().collect::<Vec<_>>();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(RouterStatus {
            models: snapshot.models.len(),
            updated_at: snapshot.updated_at,
            sources,
        })
    }
}
