//! End-to-end executor scenarios against a scripted completion client:
//! happy path, cascade skip and escalation, the budget brake, node timeouts,
//! swarm DAG execution and cancellation idempotence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use relay_completion::{
    CompletionClient, CompletionRequest, CompletionResponse, TokenUsage,
};
use relay_executor::{EngineConfig, RunExecutor, RunQueue, MERGE_NODE_ID};
use relay_ranker::{
    ComposedPrompt, DecomposeRequest, Decomposition, ModelRouter, PickRequest, PickedModel,
    RouterStatus,
};
use relay_store::{ArtifactStore, RunStore};
use relay_types::{
    BudgetTier, Category, CreateRunRequest, ModelTier, NodeKind, NodeStatus, Pricing, RoleConfig,
    RunMode, RunRecord, RunStatus,
};

struct MockCompletion {
    outputs: HashMap<String, String>,
    default_output: String,
    latency: Option<Duration>,
    usage: TokenUsage,
    calls: AtomicUsize,
}

impl MockCompletion {
    fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            default_output: "Cache lines bloom bright\nwarm data nestles in place\nmisses melt away".to_string(),
            latency: None,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            },
            calls: AtomicUsize::new(0),
        }
    }

    fn with_output(mut self, model: &str, output: impl Into<String>) -> Self {
        self.outputs.insert(model.to_string(), output.into());
        self
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn with_usage(mut self, prompt: u64, completion: u64) -> Self {
        self.usage = TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        };
        self
    }
}

#[async_trait]
impl CompletionClient for MockCompletion {
    fn is_configured(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let content = self
            .outputs
            .get(&request.model)
            .cloned()
            .unwrap_or_else(|| self.default_output.clone());
        Ok(CompletionResponse {
            content,
            usage: self.usage.clone(),
        })
    }
}

/// Budget-keyed model choices so cascades pick distinct cheap/premium models.
struct StubRouter;

fn stub_model(budget: BudgetTier) -> &'static str {
    match budget {
        BudgetTier::Low => "stub/cheap",
        BudgetTier::High => "stub/premium",
        _ => "stub/general",
    }
}

#[async_trait]
impl ModelRouter for StubRouter {
    async fn pick(&self, req: &PickRequest) -> anyhow::Result<Option<PickedModel>> {
        Ok(Some(PickedModel {
            id: stub_model(req.budget).to_string(),
            category: Category::General,
            score: 80.0,
            confidence: 0.8,
            pricing: Pricing {
                prompt: 1.0,
                completion: 3.0,
            },
            tier: ModelTier::Standard,
        }))
    }

    async fn recommend(
        &self,
        req: &PickRequest,
        count: usize,
    ) -> anyhow::Result<Vec<PickedModel>> {
        let mut out = Vec::new();
        for i in 0..count {
            let mut picked = self.pick(req).await?.expect("stub pick");
            picked.id = format!("{}-{}", picked.id, i + 1);
            out.push(picked);
        }
        Ok(out)
    }

    async fn decompose(&self, req: &DecomposeRequest) -> anyhow::Result<Decomposition> {
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
        let Some((method, parts)) = relay_ranker::split_task(&req.task) else {
            return Ok(Decomposition::empty());
        };
        let (subtasks, warning) =
            relay_ranker::swarm_subtasks(&parts, method, req.budget, req.max_parallel.max(4));
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
            prompt: task.to_string(),
            warnings: Vec::new(),
        })
    }

    async fn status(&self) -> anyhow::Result<RouterStatus> {
        Ok(RouterStatus {
            models: 3,
            updated_at: None,
            sources: Vec::new(),
        })
    }
}

struct Harness {
    store: Arc<RunStore>,
    artifacts: Arc<ArtifactStore>,
    queue: Arc<RunQueue>,
    completion: Arc<MockCompletion>,
    _dir: tempfile::TempDir,
}

async fn harness(completion: MockCompletion, config: EngineConfig) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(
        RunStore::new(dir.path().join("store"))
            .await
            .expect("run store"),
    );
    let artifacts = Arc::new(
        ArtifactStore::new(dir.path().join("artifacts"))
            .await
            .expect("artifact store"),
    );
    let completion = Arc::new(completion);
    let executor = Arc::new(RunExecutor::new(
        store.clone(),
        artifacts.clone(),
        completion.clone(),
        config.clone(),
    ));
    let queue = RunQueue::new(
        store.clone(),
        artifacts.clone(),
        Arc::new(StubRouter),
        executor,
        config,
    );
    queue.clone().spawn();
    Harness {
        store,
        artifacts,
        queue,
        completion,
        _dir: dir,
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(50),
        run_timeout: Duration::from_secs(60),
        ..EngineConfig::default()
    }
}

fn request(task: &str, mode: RunMode, budget: Option<BudgetTier>) -> CreateRunRequest {
    CreateRunRequest {
        task: task.to_string(),
        mode,
        budget,
        context: None,
        collective_count: None,
        role: None,
        merge: None,
    }
}

async fn wait_terminal(store: &RunStore, run_id: &str, secs: u64) -> RunRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if let Some(run) = store.get_run(run_id).await {
            if run.status.is_terminal() {
                return run;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} did not reach a terminal state in {secs}s"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn single_happy_path_completes_with_merged_artifact() {
    let h = harness(MockCompletion::new(), test_config()).await;
    let run = h
        .queue
        .create_run(&request(
            "Write a haiku about caches.",
            RunMode::Single,
            Some(BudgetTier::Low),
        ))
        .await
        .expect("create");

    let finished = wait_terminal(&h.store, &run.id, 10).await;
    assert_eq!(finished.status, RunStatus::Completed);

    let nodes = h.store.list_nodes(&run.id).await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].kind, NodeKind::Task);
    assert_eq!(nodes[0].status, NodeStatus::Completed);

    // Single mode has no merge node; the merged artifact is synthesized.
    let (_, merged) = h
        .artifacts
        .read_latest(&run.id, MERGE_NODE_ID)
        .await
        .expect("read")
        .expect("merged artifact");
    assert!(merged.starts_with("# Merged Output\n\n"));
    assert!(merged.contains("Cache lines bloom"));

    assert!(h.store.run_cost(&run.id).await < 5.0);
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cascade_skips_premium_when_cheap_output_passes_the_gate() {
    let completion = MockCompletion::new().with_output("stub/cheap", "x".repeat(600));
    let h = harness(completion, test_config()).await;
    let run = h
        .queue
        .create_run(&request("Summarize the design doc", RunMode::Cascade, None))
        .await
        .expect("create");

    let finished = wait_terminal(&h.store, &run.id, 10).await;
    assert_eq!(finished.status, RunStatus::Completed);

    let nodes = h.store.list_nodes(&run.id).await;
    assert_eq!(nodes.len(), 3);
    let premium = nodes
        .iter()
        .find(|n| n.local_id == "premium")
        .expect("premium node");
    assert_eq!(premium.status, NodeStatus::Skipped);
    assert_eq!(
        premium.error.as_deref(),
        Some("Cascade cheap output passed quality gate")
    );

    assert!(h.artifacts.latest(&run.id, MERGE_NODE_ID).await.is_some());
    // One raw generation plus one merge call.
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cascade_escalates_on_short_cheap_output() {
    let completion = MockCompletion::new().with_output("stub/cheap", "y".repeat(100));
    let h = harness(completion, test_config()).await;
    let run = h
        .queue
        .create_run(&request("Summarize the design doc", RunMode::Cascade, None))
        .await
        .expect("create");

    let finished = wait_terminal(&h.store, &run.id, 10).await;
    assert_eq!(finished.status, RunStatus::Completed);

    let nodes = h.store.list_nodes(&run.id).await;
    let premium = nodes
        .iter()
        .find(|n| n.local_id == "premium")
        .expect("premium node");
    assert_eq!(premium.status, NodeStatus::Completed);

    // Two raw generations plus the merge.
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 3);
    assert!(h.artifacts.latest(&run.id, MERGE_NODE_ID).await.is_some());
}

#[tokio::test]
async fn budget_brake_cancels_after_the_first_node() {
    // 2000 + 2000 tokens at (1, 3) USD per 1M is 0.008 per node.
    let completion = MockCompletion::new().with_usage(2_000, 2_000);
    let config = EngineConfig {
        max_usd_per_run: 0.001,
        max_parallel_nodes_per_run: 1,
        ..test_config()
    };
    let h = harness(completion, config).await;
    let run = h
        .queue
        .create_run(&request("Compare the options", RunMode::Collective, None))
        .await
        .expect("create");

    let finished = wait_terminal(&h.store, &run.id, 10).await;
    assert_eq!(finished.status, RunStatus::Canceled);
    assert_eq!(finished.error.as_deref(), Some("Budget limit reached"));

    let nodes = h.store.list_nodes(&run.id).await;
    let completed = nodes
        .iter()
        .filter(|n| n.status == NodeStatus::Completed)
        .count();
    assert_eq!(completed, 1);
    // Everything else was canceled before dispatch.
    assert!(nodes
        .iter()
        .filter(|n| n.status != NodeStatus::Completed)
        .all(|n| n.status == NodeStatus::Canceled));
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn node_timeout_fails_the_run_after_retries() {
    let completion = MockCompletion::new().with_latency(Duration::from_millis(1_500));
    let config = EngineConfig {
        node_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let h = harness(completion, config).await;
    let run = h
        .queue
        .create_run(&request(
            "Write a haiku about caches.",
            RunMode::Single,
            None,
        ))
        .await
        .expect("create");

    let finished = wait_terminal(&h.store, &run.id, 20).await;
    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.error.as_deref(), Some("1 node(s) failed"));

    let events = h.store.list_events(&run.id).await;
    assert!(events
        .iter()
        .any(|e| e.message.contains("timed out after 1s")));

    // Initial attempt plus two retries: timeouts are retryable.
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn swarm_executes_the_dag_and_merges() {
    let h = harness(MockCompletion::new(), test_config()).await;
    let run = h
        .queue
        .create_run(&request(
            "Build backend and frontend and tests",
            RunMode::Swarm,
            None,
        ))
        .await
        .expect("create");

    let finished = wait_terminal(&h.store, &run.id, 15).await;
    assert_eq!(finished.status, RunStatus::Completed);

    let nodes = h.store.list_nodes(&run.id).await;
    assert!(nodes.len() >= 4);

    let tests_node = nodes
        .iter()
        .find(|n| n.kind == NodeKind::Task && n.task.contains("tests"))
        .expect("tests node");
    let backend = nodes
        .iter()
        .find(|n| n.kind == NodeKind::Task && n.task.contains("backend"))
        .expect("backend node");
    let frontend = nodes
        .iter()
        .find(|n| n.kind == NodeKind::Task && n.task == "frontend")
        .expect("frontend node");
    assert!(tests_node.depends_on.contains(&backend.id));
    assert!(tests_node.depends_on.contains(&frontend.id));
    assert!(tests_node.wave >= backend.wave.max(frontend.wave));

    assert!(h.artifacts.latest(&run.id, MERGE_NODE_ID).await.is_some());
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let completion = MockCompletion::new().with_latency(Duration::from_secs(5));
    let h = harness(completion, test_config()).await;
    let run = h
        .queue
        .create_run(&request("Slow task", RunMode::Single, None))
        .await
        .expect("create");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let first = h
        .queue
        .cancel_run(&run.id)
        .await
        .expect("cancel")
        .expect("record");
    assert_eq!(first.status, RunStatus::Canceled);

    let second = h
        .queue
        .cancel_run(&run.id)
        .await
        .expect("cancel again")
        .expect("record");
    assert_eq!(second.status, RunStatus::Canceled);
    assert_eq!(second.error.as_deref(), first.error.as_deref());
}
