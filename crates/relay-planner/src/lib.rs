//! Turns `(task, mode)` into a static DAG of task nodes plus one terminal
//! merge node, choosing a concrete model per node through the model router.
//! The planner never executes anything and the executor never re-plans.

use serde::{Deserialize, Serialize};

use relay_ranker::{DecomposeRequest, ModelRouter, PickRequest, PickedModel};
use relay_types::{
    BudgetTier, Category, MergeStyle, ModelTier, NodeKind, NodeMeta, PlanningSource, Pricing,
    RoleConfig, RunMode, RunRecord,
};

pub const MERGE_NODE_ID: &str = "merged";
const COLLECTIVE_DEFAULT: u32 = 3;
const COLLECTIVE_MIN: u32 = 2;
const COLLECTIVE_MAX: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedNode {
    pub local_id: String,
    pub kind: NodeKind,
    pub wave: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub task: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub meta: NodeMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedRun {
    pub planner_summary: String,
    pub nodes: Vec<PlannedNode>,
}

struct Choice {
    model: String,
    source: PlanningSource,
    pricing: Option<Pricing>,
}

/// Opinionated defaults that keep the system operational when the router is
/// absent or failing. Not part of the product surface.
fn fallback_model(category: Category, budget: BudgetTier) -> &'static str {
    match budget {
        BudgetTier::Low => "openai/gpt-4o-mini",
        BudgetTier::High => "anthropic/claude-3.5-sonnet",
        _ => match category {
            Category::Coding => "anthropic/claude-3.5-sonnet",
            Category::Reasoning => "deepseek/deepseek-r1",
            Category::Creative => "anthropic/claude-3.5-sonnet",
            Category::Research => "google/gemini-2.0-flash-001",
            Category::Vision => "openai/gpt-4o",
            Category::FastCheap => "meta-llama/llama-3.1-8b-instruct",
            Category::General => "openai/gpt-4o-mini",
        },
    }
}

fn choice_from(picked: Option<PickedModel>, task: &str, budget: BudgetTier) -> Choice {
    match picked {
        Some(picked) => Choice {
            model: picked.id,
            source: PlanningSource::Api,
            pricing: Some(picked.pricing),
        },
        None => Choice {
            model: fallback_model(relay_ranker::classify(task), budget).to_string(),
            source: PlanningSource::Fallback,
            pricing: None,
        },
    }
}

async fn choose(
    router: &dyn ModelRouter,
    task: &str,
    budget: BudgetTier,
    context: &[String],
    exclude: &[String],
) -> Choice {
    let request = PickRequest {
        task: task.to_string(),
        budget,
        context: context.to_vec(),
        exclude: exclude.to_vec(),
    };
    match router.pick(&request).await {
        Ok(picked) => choice_from(picked, task, budget),
        Err(err) => {
            tracing::warn!("model pick failed, using fallback: {err}");
            choice_from(None, task, budget)
        }
    }
}

fn base_meta(mode: RunMode, choice: &Choice) -> NodeMeta {
    NodeMeta {
        mode: Some(mode),
        planning_source: Some(choice.source),
        price_prompt: choice.pricing.map(|p| p.prompt),
        price_completion: choice.pricing.map(|p| p.completion),
        ..NodeMeta::default()
    }
}

async fn composed_prompt(router: &dyn ModelRouter, run: &RunRecord) -> String {
    let Some(role) = run.role.as_ref().filter(|r| !r.is_empty()) else {
        return run.task.clone();
    };
    match router.compose_role(&run.task, role).await {
        Ok(composed) => {
            for warning in &composed.warnings {
                tracing::warn!("role composition: {warning}");
            }
            composed.prompt
        }
        Err(err) => {
            tracing::warn!("role composition failed, using raw task: {err}");
            run.task.clone()
        }
    }
}

fn merge_style(run: &RunRecord, default: MergeStyle) -> MergeStyle {
    run.merge
        .as_ref()
        .and_then(|m| m.style)
        .unwrap_or(default)
}

fn merge_node(
    run: &RunRecord,
    wave: u32,
    depends_on: Vec<String>,
    model: String,
    style: MergeStyle,
    source: PlanningSource,
) -> PlannedNode {
    let model = run
        .merge
        .as_ref()
        .and_then(|m| m.model.clone())
        .unwrap_or(model);
    PlannedNode {
        local_id: MERGE_NODE_ID.to_string(),
        kind: NodeKind::Merge,
        wave,
        depends_on,
        task: run.task.clone(),
        model,
        prompt: String::new(),
        meta: NodeMeta {
            mode: Some(run.mode),
            merge_style: Some(style),
            planning_source: Some(source),
            ..NodeMeta::default()
        },
    }
}

pub async fn plan(run: &RunRecord, router: &dyn ModelRouter) -> anyhow::Result<PlannedRun> {
    match run.mode {
        RunMode::Single => plan_single(run, router).await,
        RunMode::Collective => plan_collective(run, router).await,
        RunMode::Cascade => plan_cascade(run, router).await,
        RunMode::Plan => plan_sequential(run, router).await,
        RunMode::Swarm => plan_swarm(run, router).await,
    }
}

async fn plan_single(run: &RunRecord, router: &dyn ModelRouter) -> anyhow::Result<PlannedRun> {
    let context = run.context_tags();
    let choice = choose(router, &run.task, run.budget, &context, &[]).await;
    let prompt = composed_prompt(router, run).await;
    let summary = format!("single run on {}", choice.model);
    Ok(PlannedRun {
        planner_summary: summary,
        nodes: vec![PlannedNode {
            local_id: "task".to_string(),
            kind: NodeKind::Task,
            wave: 0,
            depends_on: Vec::new(),
            task: run.task.clone(),
            model: choice.model.clone(),
            prompt,
            meta: base_meta(RunMode::Single, &choice),
        }],
    })
}

async fn plan_collective(run: &RunRecord, router: &dyn ModelRouter) -> anyhow::Result<PlannedRun> {
    let count = run
        .params_json
        .get("collective_count")
        .or_else(|| run.params_json.get("collectiveCount"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .unwrap_or(COLLECTIVE_DEFAULT)
        .clamp(COLLECTIVE_MIN, COLLECTIVE_MAX);

    let context = run.context_tags();
    let request = PickRequest {
        task: run.task.clone(),
        budget: run.budget,
        context: context.clone(),
        exclude: Vec::new(),
    };
    let mut choices: Vec<Choice> = match router.recommend(&request, count as usize).await {
        Ok(picked) => picked
            .into_iter()
            .map(|p| choice_from(Some(p), &run.task, run.budget))
            .collect(),
        Err(err) => {
            tracing::warn!("recommend failed, using fallbacks: {err}");
            Vec::new()
        }
    };
    while (choices.len() as u32) < count {
        choices.push(choice_from(None, &run.task, run.budget));
    }

    let prompt = composed_prompt(router, run).await;
    let mut nodes = Vec::new();
    for (i, choice) in choices.iter().enumerate() {
        nodes.push(PlannedNode {
            local_id: format!("candidate-{}", i + 1),
            kind: NodeKind::Task,
            wave: 0,
            depends_on: Vec::new(),
            task: run.task.clone(),
            model: choice.model.clone(),
            prompt: prompt.clone(),
            meta: base_meta(RunMode::Collective, choice),
        });
    }

    let depends = nodes.iter().map(|n| n.local_id.clone()).collect();
    let merge_model = choices[0].model.clone();
    let source = choices[0].source;
    let summary = format!(
        "collective of {} models: {}",
        nodes.len(),
        nodes
            .iter()
            .map(|n| n.model.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    nodes.push(merge_node(
        run,
        1,
        depends,
        merge_model,
        merge_style(run, MergeStyle::Detailed),
        source,
    ));
    Ok(PlannedRun {
        planner_summary: summary,
        nodes,
    })
}

async fn plan_cascade(run: &RunRecord, router: &dyn ModelRouter) -> anyhow::Result<PlannedRun> {
    let context = run.context_tags();
    let cheap = choose(router, &run.task, BudgetTier::Low, &context, &[]).await;
    let premium = choose(
        router,
        &run.task,
        BudgetTier::High,
        &context,
        &[cheap.model.clone()],
    )
    .await;
    let prompt = composed_prompt(router, run).await;

    let mut cheap_meta = base_meta(RunMode::Cascade, &cheap);
    cheap_meta.tier = Some(ModelTier::Budget);
    let mut premium_meta = base_meta(RunMode::Cascade, &premium);
    premium_meta.tier = Some(ModelTier::Premium);
    premium_meta.conditional = true;

    let summary = format!(
        "cascade: {} first, {} on conditional escalation",
        cheap.model, premium.model
    );
    let nodes = vec![
        PlannedNode {
            local_id: "cheap".to_string(),
            kind: NodeKind::Task,
            wave: 0,
            depends_on: Vec::new(),
            task: run.task.clone(),
            model: cheap.model.clone(),
            prompt: prompt.clone(),
            meta: cheap_meta,
        },
        PlannedNode {
            local_id: "premium".to_string(),
            kind: NodeKind::Task,
            wave: 1,
            depends_on: vec!["cheap".to_string()],
            task: run.task.clone(),
            model: premium.model.clone(),
            prompt,
            meta: premium_meta,
        },
        merge_node(
            run,
            2,
            vec!["cheap".to_string(), "premium".to_string()],
            premium.model.clone(),
            merge_style(run, MergeStyle::Decision),
            premium.source,
        ),
    ];
    Ok(PlannedRun {
        planner_summary: summary,
        nodes,
    })
}

async fn plan_sequential(run: &RunRecord, router: &dyn ModelRouter) -> anyhow::Result<PlannedRun> {
    let context = run.context_tags();
    let request = DecomposeRequest {
        task: run.task.clone(),
        budget: run.budget,
        context: context.clone(),
        max_parallel: 1,
    };
    let decomposition = match router.decompose(&request).await {
        Ok(d) => d,
        Err(err) => {
            tracing::warn!("decompose failed, falling back to single: {err}");
            return plan_single(run, router).await;
        }
    };
    if !decomposition.decomposed || decomposition.subtasks.len() < 2 {
        return plan_single(run, router).await;
    }

    let mut nodes = Vec::new();
    let mut previous: Option<String> = None;
    for (i, subtask) in decomposition.subtasks.iter().enumerate() {
        let choice = match &subtask.model {
            Some(model) => Choice {
                model: model.clone(),
                source: PlanningSource::Api,
                pricing: subtask.model_pricing,
            },
            None => choice_from(None, &subtask.text, subtask.budget),
        };
        let local_id = format!("step-{}", i + 1);
        nodes.push(PlannedNode {
            local_id: local_id.clone(),
            kind: NodeKind::Task,
            wave: i as u32,
            depends_on: previous.take().into_iter().collect(),
            task: subtask.text.clone(),
            model: choice.model.clone(),
            prompt: subtask.text.clone(),
            meta: base_meta(RunMode::Plan, &choice),
        });
        previous = Some(local_id);
    }

    let depends: Vec<String> = nodes.iter().map(|n| n.local_id.clone()).collect();
    let steps = nodes.len();
    let merge_model = nodes[0].model.clone();
    let source = nodes[0]
        .meta
        .planning_source
        .unwrap_or(PlanningSource::Fallback);
    nodes.push(merge_node(
        run,
        steps as u32,
        depends,
        merge_model,
        merge_style(run, MergeStyle::Detailed),
        source,
    ));
    Ok(PlannedRun {
        planner_summary: format!("plan of {} sequential steps", steps),
        nodes,
    })
}

async fn plan_swarm(run: &RunRecord, router: &dyn ModelRouter) -> anyhow::Result<PlannedRun> {
    let context = run.context_tags();
    let request = DecomposeRequest {
        task: run.task.clone(),
        budget: run.budget,
        context: context.clone(),
        max_parallel: 0,
    };
    let decomposition = match router.swarm(&request).await {
        Ok(d) => d,
        Err(err) => {
            tracing::warn!("swarm decomposition failed, falling back to single: {err}");
            return plan_single(run, router).await;
        }
    };
    if !decomposition.decomposed || decomposition.subtasks.len() < 2 {
        return plan_single(run, router).await;
    }
    if let Some(warning) = &decomposition.warning {
        tracing::warn!("swarm: {warning}");
    }

    let local_id = |index: usize| format!("node-{}", index + 1);
    let mut nodes = Vec::new();
    let mut max_wave = 0u32;
    for subtask in &decomposition.subtasks {
        let choice = match &subtask.model {
            Some(model) => Choice {
                model: model.clone(),
                source: PlanningSource::Api,
                pricing: subtask.model_pricing,
            },
            None => choice_from(None, &subtask.text, subtask.budget),
        };
        max_wave = max_wave.max(subtask.wave);
        nodes.push(PlannedNode {
            local_id: local_id(subtask.index),
            kind: NodeKind::Task,
            wave: subtask.wave,
            depends_on: subtask.depends_on.iter().map(|d| local_id(*d)).collect(),
            task: subtask.text.clone(),
            model: choice.model.clone(),
            prompt: subtask.text.clone(),
            meta: base_meta(RunMode::Swarm, &choice),
        });
    }

    let depends: Vec<String> = nodes.iter().map(|n| n.local_id.clone()).collect();
    let tasks = nodes.len();
    let merge_model = nodes[0].model.clone();
    let source = nodes[0]
        .meta
        .planning_source
        .unwrap_or(PlanningSource::Fallback);
    nodes.push(merge_node(
        run,
        max_wave + 1,
        depends,
        merge_model,
        merge_style(run, MergeStyle::Detailed),
        source,
    ));
    Ok(PlannedRun {
        planner_summary: format!("swarm of {} tasks", tasks),
        nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_ranker::{ComposedPrompt, Decomposition, RouterStatus};
    use relay_types::{Category, CreateRunRequest, MergeConfig};

    /// Scripted router: picks a fixed model or fails, decomposes through the
    /// real splitter without a catalog.
    struct StubRouter {
        pick_result: Option<String>,
        fail: bool,
    }

    impl StubRouter {
        fn with_model(model: &str) -> Self {
            Self {
                pick_result: Some(model.to_string()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                pick_result: None,
                fail: true,
            }
        }
    }

    #[async_trait]
    impl ModelRouter for StubRouter {
        async fn pick(&self, _req: &PickRequest) -> anyhow::Result<Option<PickedModel>> {
            if self.fail {
                anyhow::bail!("ranking service unreachable");
            }
            Ok(self.pick_result.as_ref().map(|id| PickedModel {
                id: id.clone(),
                category: Category::General,
                score: 80.0,
                confidence: 0.8,
                pricing: Pricing {
                    prompt: 1.0,
                    completion: 2.0,
                },
                tier: ModelTier::Standard,
            }))
        }

        async fn recommend(
            &self,
            req: &PickRequest,
            count: usize,
        ) -> anyhow::Result<Vec<PickedModel>> {
            if self.fail {
                anyhow::bail!("ranking service unreachable");
            }
            let mut out = Vec::new();
            for i in 0..count {
                let mut picked = self.pick(req).await?.expect("stub pick");
                picked.id = format!("{}-{}", picked.id, i + 1);
                out.push(picked);
            }
            Ok(out)
        }

        async fn decompose(&self, req: &DecomposeRequest) -> anyhow::Result<Decomposition> {
            if self.fail {
                anyhow::bail!("ranking service unreachable");
            }
            let Some((method, parts)) = relay_ranker::split_task(&req.task) else {
                return Ok(Decomposition::empty());
            };
            Ok(Decomposition {
                decomposed: true,
                method: Some(method),
                subtasks: relay_ranker::sequential_subtasks(&parts, req.budget),
                warning: None,
            })
        }

        async fn swarm(&self, req: &DecomposeRequest) -> anyhow::Result<Decomposition> {
            if self.fail {
                anyhow::bail!("ranking service unreachable");
            }
            let Some((method, parts)) = relay_ranker::split_task(&req.task) else {
                return Ok(Decomposition::empty());
            };
            let (subtasks, warning) = relay_ranker::swarm_subtasks(
                &parts,
                method,
                req.budget,
                req.max_parallel.max(4),
            );
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
            _role: &RoleConfig,
        ) -> anyhow::Result<ComposedPrompt> {
            Ok(ComposedPrompt {
                prompt: format!("## Role: Stub\n\n## Task\n{task}"),
                warnings: Vec::new(),
            })
        }

        async fn status(&self) -> anyhow::Result<RouterStatus> {
            Ok(RouterStatus {
                models: 1,
                updated_at: None,
                sources: Vec::new(),
            })
        }
    }

    fn run(task: &str, mode: RunMode) -> RunRecord {
        RunRecord::new(&CreateRunRequest {
            task: task.to_string(),
            mode,
            budget: None,
            context: None,
            collective_count: None,
            role: None,
            merge: None,
        })
    }

    #[tokio::test]
    async fn single_produces_one_node_and_no_merge() {
        let router = StubRouter::with_model("openai/gpt-4o-mini");
        let planned = plan(&run("Write a haiku about caches.", RunMode::Single), &router)
            .await
            .expect("plan");
        assert_eq!(planned.nodes.len(), 1);
        assert_eq!(planned.nodes[0].kind, NodeKind::Task);
        assert_eq!(
            planned.nodes[0].meta.planning_source,
            Some(PlanningSource::Api)
        );
    }

    #[tokio::test]
    async fn cascade_is_always_three_nodes() {
        let router = StubRouter::with_model("openai/gpt-4o-mini");
        let planned = plan(&run("Summarize the design doc", RunMode::Cascade), &router)
            .await
            .expect("plan");
        assert_eq!(planned.nodes.len(), 3);

        let premium = planned
            .nodes
            .iter()
            .find(|n| n.local_id == "premium")
            .expect("premium node");
        assert!(premium.meta.conditional);
        assert_eq!(premium.meta.tier, Some(ModelTier::Premium));
        assert_eq!(premium.depends_on, vec!["cheap"]);

        let merge = planned
            .nodes
            .iter()
            .find(|n| n.kind == NodeKind::Merge)
            .expect("merge node");
        assert_eq!(merge.local_id, MERGE_NODE_ID);
        assert_eq!(merge.meta.merge_style, Some(MergeStyle::Decision));
        assert_eq!(merge.depends_on.len(), 2);
    }

    #[tokio::test]
    async fn collective_count_is_clamped() {
        let router = StubRouter::with_model("openai/gpt-4o-mini");
        let mut record = run("Compare three options", RunMode::Collective);
        record.params_json = serde_json::json!({"collective_count": 9});
        let planned = plan(&record, &router).await.expect("plan");
        // 5 candidates (clamped) + merge.
        assert_eq!(planned.nodes.len(), 6);

        record.params_json = serde_json::json!({"collective_count": 1});
        let planned = plan(&record, &router).await.expect("plan");
        assert_eq!(planned.nodes.len(), 3);
    }

    #[tokio::test]
    async fn plan_mode_chains_steps_and_merges() {
        let router = StubRouter::with_model("openai/gpt-4o-mini");
        let planned = plan(
            &run("draft the outline, then expand it, finally polish it", RunMode::Plan),
            &router,
        )
        .await
        .expect("plan");
        // K steps + merge.
        assert_eq!(planned.nodes.len(), 4);
        assert_eq!(planned.nodes[1].depends_on, vec!["step-1"]);
        assert_eq!(planned.nodes[2].depends_on, vec!["step-2"]);
        let merge = planned.nodes.last().expect("merge");
        assert_eq!(merge.kind, NodeKind::Merge);
        assert_eq!(merge.depends_on.len(), 3);
    }

    #[tokio::test]
    async fn unsplittable_plan_falls_back_to_single() {
        let router = StubRouter::with_model("openai/gpt-4o-mini");
        let planned = plan(&run("Write a haiku about caches.", RunMode::Plan), &router)
            .await
            .expect("plan");
        assert_eq!(planned.nodes.len(), 1);
    }

    #[tokio::test]
    async fn swarm_preserves_the_dag() {
        let router = StubRouter::with_model("openai/gpt-4o-mini");
        let planned = plan(
            &run("Build backend and frontend and tests", RunMode::Swarm),
            &router,
        )
        .await
        .expect("plan");
        assert!(planned.nodes.len() >= 4);
        let merge = planned.nodes.last().expect("merge");
        assert_eq!(merge.kind, NodeKind::Merge);
        assert_eq!(merge.depends_on.len(), planned.nodes.len() - 1);

        let tests_node = planned
            .nodes
            .iter()
            .find(|n| n.task.contains("tests"))
            .expect("tests node");
        assert_eq!(tests_node.depends_on.len(), 2);
        let dep_waves = planned
            .nodes
            .iter()
            .filter(|n| tests_node.depends_on.contains(&n.local_id))
            .map(|n| n.wave)
            .collect::<Vec<_>>();
        assert!(dep_waves.iter().all(|w| *w <= tests_node.wave));
    }

    #[tokio::test]
    async fn router_failure_degrades_to_fallback_models() {
        let router = StubRouter::failing();
        let planned = plan(&run("Summarize the doc", RunMode::Cascade), &router)
            .await
            .expect("plan");
        assert_eq!(planned.nodes.len(), 3);
        for node in planned.nodes.iter().filter(|n| n.kind == NodeKind::Task) {
            assert_eq!(node.meta.planning_source, Some(PlanningSource::Fallback));
        }
    }

    #[tokio::test]
    async fn merge_config_overrides_style_and_model() {
        let router = StubRouter::with_model("openai/gpt-4o-mini");
        let mut record = run("Compare options", RunMode::Collective);
        record.merge = Some(MergeConfig {
            style: Some(MergeStyle::Concise),
            model: Some("anthropic/claude-3.5-sonnet".to_string()),
        });
        let planned = plan(&record, &router).await.expect("plan");
        let merge = planned.nodes.last().expect("merge");
        assert_eq!(merge.meta.merge_style, Some(MergeStyle::Concise));
        assert_eq!(merge.model, "anthropic/claude-3.5-sonnet");
    }
}
