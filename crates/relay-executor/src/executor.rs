use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use relay_completion::{CompletionClient, CompletionRequest};
use relay_observability::{emit_event, ObservabilityEvent, ProcessKind};
use relay_store::{ArtifactStore, RunStore};
use relay_types::{
    ArtifactKind, MergeStyle, ModelTier, NodeKind, NodeRecord, NodeStatus, RunEvent, RunMode,
    RunRecord, RunStatus,
};

use crate::config::EngineConfig;

pub const MERGE_NODE_ID: &str = "merged";
/// Trimmed cheap-output length that lets a cascade skip its premium node.
const CASCADE_QUALITY_GATE: usize = 500;
const DEPENDENCY_CONTEXT_LIMIT: usize = 6_000;
const MERGE_INPUT_LIMIT: usize = 10_000;
const SCHEDULER_IDLE_SLEEP: Duration = Duration::from_millis(200);
/// Conservative USD per 1M tokens when per-model pricing is unknown.
const DEFAULT_PRICE_PROMPT: f64 = 1.0;
const DEFAULT_PRICE_COMPLETION: f64 = 3.0;

/// Advances one run's DAG to a terminal state. All coordination goes through
/// the store; nothing here keeps scheduling state in memory.
pub struct RunExecutor {
    store: Arc<RunStore>,
    artifacts: Arc<ArtifactStore>,
    completion: Arc<dyn CompletionClient>,
    config: EngineConfig,
}

impl RunExecutor {
    pub fn new(
        store: Arc<RunStore>,
        artifacts: Arc<ArtifactStore>,
        completion: Arc<dyn CompletionClient>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            completion,
            config,
        }
    }

    /// The scheduler tick loop. Returns once the run is terminal or the
    /// engine is shutting down; store failures propagate.
    pub async fn drive(&self, run_id: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let Some(run) = self.store.get_run(run_id).await else {
                return Ok(());
            };
            if run.status.is_terminal() {
                return Ok(());
            }

            if let Some(started_at) = run.started_at {
                let elapsed = (Utc::now() - started_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if elapsed > self.config.run_timeout {
                    self.store
                        .finish_run(run_id, RunStatus::Failed, Some("Run timed out".to_string()))
                        .await?;
                    self.store.cancel_open_nodes(run_id).await?;
                    self.store
                        .append_event(RunEvent::error(
                            run_id,
                            format!(
                                "Run timed out after {}s",
                                self.config.run_timeout.as_secs()
                            ),
                        ))
                        .await?;
                    return Ok(());
                }
            }

            let nodes = self.store.list_nodes(run_id).await;
            if nodes.is_empty() {
                self.store
                    .finish_run(
                        run_id,
                        RunStatus::Failed,
                        Some("Planner returned no nodes".to_string()),
                    )
                    .await?;
                return Ok(());
            }

            if nodes.iter().all(|n| n.status.is_terminal()) {
                let failed = nodes
                    .iter()
                    .filter(|n| n.status == NodeStatus::Failed)
                    .count();
                if failed > 0 {
                    let reason = format!("{failed} node(s) failed");
                    self.store
                        .finish_run(run_id, RunStatus::Failed, Some(reason.clone()))
                        .await?;
                    self.store.append_event(RunEvent::error(run_id, reason)).await?;
                } else {
                    self.ensure_merged_artifact(&run).await?;
                    self.store
                        .finish_run(run_id, RunStatus::Completed, None)
                        .await?;
                    self.store
                        .append_event(RunEvent::info(run_id, "Run completed"))
                        .await?;
                }
                return Ok(());
            }

            let running = nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Running)
                .count();
            if running >= self.config.max_parallel_nodes_per_run {
                tokio::time::sleep(SCHEDULER_IDLE_SLEEP).await;
                continue;
            }

            // Ready = queued with every dependency completed or skipped.
            // Wave numbers are deliberately ignored here.
            let by_id: HashMap<&str, &NodeRecord> =
                nodes.iter().map(|n| (n.id.as_str(), n)).collect();
            let ready = nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Queued)
                .filter(|n| {
                    n.depends_on.iter().all(|dep| {
                        by_id
                            .get(dep.as_str())
                            .map(|d| d.status.is_satisfied())
                            .unwrap_or(false)
                    })
                })
                .cloned()
                .collect::<Vec<_>>();
            if ready.is_empty() {
                tokio::time::sleep(SCHEDULER_IDLE_SLEEP).await;
                continue;
            }

            let slots = self.config.max_parallel_nodes_per_run - running;
            let batch = ready.into_iter().take(slots).collect::<Vec<_>>();
            let results = futures::future::join_all(
                batch
                    .into_iter()
                    .map(|node| self.execute_node(run.clone(), node, shutdown.child_token())),
            )
            .await;
            for result in results {
                result?;
            }
        }
    }

    async fn execute_node(
        &self,
        run: RunRecord,
        node: NodeRecord,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        match node.kind {
            NodeKind::Merge => self.execute_merge(run, node, cancel).await,
            NodeKind::Task => self.execute_task(run, node, cancel).await,
        }
    }

    async fn execute_task(
        &self,
        run: RunRecord,
        node: NodeRecord,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        if self.cascade_skip_applies(&node).await? {
            self.store
                .set_node_skipped(&node.id, "Cascade cheap output passed quality gate")
                .await?;
            self.store
                .append_event(
                    RunEvent::info(
                        &run.id,
                        "premium node skipped: cheap output passed the quality gate",
                    )
                    .with_node(&node.id),
                )
                .await?;
            return Ok(());
        }

        self.store.set_node_running(&node.id).await?;
        self.store
            .append_event(
                RunEvent::info(&run.id, format!("node {} started on {}", node.local_id, node.model))
                    .with_node(&node.id),
            )
            .await?;

        let prompt = self.prompt_with_dependencies(&node).await?;
        match self
            .bounded_completion(&node.model, prompt, &node, cancel)
            .await
        {
            Ok(response) => {
                let usage = response.usage;
                let cost = node_cost(&node, usage.prompt_tokens, usage.completion_tokens);
                let body = json!({
                    "runId": node.run_id,
                    "nodeId": node.id,
                    "model": node.model,
                    "task": node.task,
                    "output": response.content,
                    "tokens": {
                        "prompt": usage.prompt_tokens,
                        "completion": usage.completion_tokens,
                        "total": usage.total_tokens,
                    },
                    "costUsd": cost,
                    "finishedAt": Utc::now(),
                });
                self.artifacts
                    .write(
                        &node.run_id,
                        &node.id,
                        ArtifactKind::Raw,
                        &serde_json::to_string_pretty(&body)?,
                    )
                    .await?;
                self.store
                    .set_node_completed(
                        &node.id,
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        cost,
                    )
                    .await?;
                self.store
                    .append_event(
                        RunEvent::info(&run.id, format!("node {} completed", node.local_id))
                            .with_node(&node.id),
                    )
                    .await?;
                self.enforce_budget(&run).await
            }
            Err(err) => self.handle_task_failure(&run, &node, err).await,
        }
    }

    /// Cost recording happens before this check, so a single node may overrun
    /// the cap; the cancellation blocks every later dispatch.
    async fn enforce_budget(&self, run: &RunRecord) -> anyhow::Result<()> {
        let total = self.store.run_cost(&run.id).await;
        if total > self.config.max_usd_per_run {
            self.store
                .finish_run(
                    &run.id,
                    RunStatus::Canceled,
                    Some("Budget limit reached".to_string()),
                )
                .await?;
            self.store.cancel_open_nodes(&run.id).await?;
            self.store
                .append_event(RunEvent::warn(
                    &run.id,
                    format!(
                        "Budget limit reached: ${total:.4} exceeds ${:.4}",
                        self.config.max_usd_per_run
                    ),
                ))
                .await?;
        }
        Ok(())
    }

    async fn handle_task_failure(
        &self,
        run: &RunRecord,
        node: &NodeRecord,
        err: anyhow::Error,
    ) -> anyhow::Result<()> {
        let text = err.to_string();
        if is_retryable(&text) && node.retry_count < node.max_retries {
            let requeued = self
                .store
                .requeue_node(&node.id)
                .await?
                .map(|n| n.retry_count)
                .unwrap_or(node.retry_count + 1);
            self.store
                .append_event(
                    RunEvent::warn(
                        &run.id,
                        format!(
                            "node {} attempt {} failed, retrying: {}",
                            node.local_id, requeued, text
                        ),
                    )
                    .with_node(&node.id),
                )
                .await?;
            tokio::time::sleep(Duration::from_millis(300 * requeued as u64)).await;
            return Ok(());
        }

        self.store.set_node_failed(&node.id, &text).await?;
        self.store
            .append_event(
                RunEvent::error(&run.id, format!("node {} failed: {}", node.local_id, text))
                    .with_node(&node.id),
            )
            .await?;
        Ok(())
    }

    async fn execute_merge(
        &self,
        run: RunRecord,
        node: NodeRecord,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.store.set_node_running(&node.id).await?;
        self.store
            .append_event(
                RunEvent::info(&run.id, format!("merging {} inputs", node.depends_on.len()))
                    .with_node(&node.id),
            )
            .await?;

        let mut inputs = String::new();
        for (i, dep) in node.depends_on.iter().enumerate() {
            let Some(output) = self.raw_output(&node.run_id, dep).await? else {
                continue;
            };
            let local = dep.rsplit(':').next().unwrap_or(dep);
            inputs.push_str(&format!(
                "\n### Input {} ({})\n{}\n",
                i + 1,
                local,
                truncate_with_marker(&output, MERGE_INPUT_LIMIT)
            ));
        }
        let style = node
            .meta
            .merge_style
            .unwrap_or(MergeStyle::Detailed)
            .as_str();
        let prompt = format!(
            "You are merging outputs from multiple sub-agents for task: {}\nOutput style: {}.\nProduce one final answer, remove conflicts, and include the strongest concrete recommendations.\nInputs:\n{}",
            node.task, style, inputs
        );

        match self
            .bounded_completion(&node.model, prompt, &node, cancel)
            .await
        {
            Ok(response) => {
                let usage = response.usage;
                let cost = node_cost(&node, usage.prompt_tokens, usage.completion_tokens);
                let body = format!("# Merged Output\n\n{}\n", response.content.trim());
                self.artifacts
                    .write(&node.run_id, MERGE_NODE_ID, ArtifactKind::Merged, &body)
                    .await?;
                self.store
                    .set_node_completed(
                        &node.id,
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        cost,
                    )
                    .await?;
                self.store
                    .append_event(RunEvent::info(&run.id, "merge completed").with_node(&node.id))
                    .await?;
                self.enforce_budget(&run).await
            }
            Err(err) => {
                // Merge nodes fail permanently on first error.
                let text = err.to_string();
                self.store.set_node_failed(&node.id, &text).await?;
                self.store
                    .append_event(
                        RunEvent::error(&run.id, format!("merge failed: {text}"))
                            .with_node(&node.id),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn bounded_completion(
        &self,
        model: &str,
        prompt: String,
        node: &NodeRecord,
        cancel: CancellationToken,
    ) -> anyhow::Result<relay_completion::CompletionResponse> {
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "completion.call.start",
                component: "executor",
                run_id: Some(&node.run_id),
                node_id: Some(&node.id),
                model_id: Some(model),
                ..ObservabilityEvent::default()
            },
        );
        let request = CompletionRequest::new(model, prompt);
        let call = self.completion.complete(request, cancel.clone());
        let result = match tokio::time::timeout(self.config.node_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(anyhow::anyhow!(
                    "node {} timed out after {}s",
                    node.local_id,
                    self.config.node_timeout.as_secs()
                ))
            }
        };
        let (level, status, detail) = match &result {
            Ok(_) => (Level::INFO, "ok", String::new()),
            Err(err) => (Level::WARN, "error", err.to_string()),
        };
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "completion.call.finish",
                component: "executor",
                run_id: Some(&node.run_id),
                node_id: Some(&node.id),
                model_id: Some(model),
                status: Some(status),
                detail: Some(&detail),
                ..ObservabilityEvent::default()
            },
        );
        result
    }

    /// The only conditional dependency rule: a cascade premium node is
    /// skipped when its cheap sibling already produced a long-enough answer.
    async fn cascade_skip_applies(&self, node: &NodeRecord) -> anyhow::Result<bool> {
        let meta = &node.meta;
        if meta.mode != Some(RunMode::Cascade)
            || meta.tier != Some(ModelTier::Premium)
            || !meta.conditional
        {
            return Ok(false);
        }
        let Some(cheap_id) = node.depends_on.first() else {
            return Ok(false);
        };
        let Some(cheap) = self.store.get_node(cheap_id).await else {
            return Ok(false);
        };
        if cheap.status != NodeStatus::Completed {
            return Ok(false);
        }
        let Some(output) = self.raw_output(&node.run_id, cheap_id).await? else {
            return Ok(false);
        };
        Ok(output.trim().len() >= CASCADE_QUALITY_GATE)
    }

    async fn prompt_with_dependencies(&self, node: &NodeRecord) -> anyhow::Result<String> {
        if node.depends_on.is_empty() {
            return Ok(node.prompt.clone());
        }
        let mut context = String::new();
        for dep in &node.depends_on {
            let Some(output) = self.raw_output(&node.run_id, dep).await? else {
                continue;
            };
            let local = dep.rsplit(':').next().unwrap_or(dep);
            context.push_str(&format!(
                "[{}]\n{}\n\n",
                local,
                truncate_with_marker(&output, DEPENDENCY_CONTEXT_LIMIT)
            ));
        }
        if context.is_empty() {
            return Ok(node.prompt.clone());
        }
        Ok(format!(
            "## Dependency context\n\n{}{}",
            context, node.prompt
        ))
    }

    /// The `output` field of a node's raw artifact; the raw body when the
    /// artifact is not parseable JSON.
    async fn raw_output(&self, run_id: &str, node_id: &str) -> anyhow::Result<Option<String>> {
        let Some((_, body)) = self.artifacts.read_latest(run_id, node_id).await? else {
            return Ok(None);
        };
        let output = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("output")
                    .and_then(|o| o.as_str())
                    .map(|s| s.to_string())
            })
            .unwrap_or(body);
        Ok(Some(output))
    }

    /// A completed run always carries a merged artifact. When no merge node
    /// produced one, synthesize it from the newest raw output.
    async fn ensure_merged_artifact(&self, run: &RunRecord) -> anyhow::Result<()> {
        if self.artifacts.latest(&run.id, MERGE_NODE_ID).await.is_some() {
            return Ok(());
        }
        let output = match self.artifacts.latest_raw(&run.id).await {
            Some(record) => self
                .raw_output(&run.id, &record.node_id)
                .await?
                .unwrap_or_default(),
            None => String::new(),
        };
        let body = format!("# Merged Output\n\n{}\n", output.trim());
        self.artifacts
            .write(&run.id, MERGE_NODE_ID, ArtifactKind::Merged, &body)
            .await?;
        Ok(())
    }
}

fn node_cost(node: &NodeRecord, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    let price_prompt = node.meta.price_prompt.unwrap_or(DEFAULT_PRICE_PROMPT);
    let price_completion = node
        .meta
        .price_completion
        .unwrap_or(DEFAULT_PRICE_COMPLETION);
    (prompt_tokens as f64 * price_prompt + completion_tokens as f64 * price_completion) / 1e6
}

/// Substring classifier over the provider error text. The bare `5` of the
/// legacy rule is narrowed to a standalone 5xx status token; `timed out`
/// stays retryable so transient endpoint hangs get one more attempt.
pub fn is_retryable(error_text: &str) -> bool {
    let lower = error_text.to_lowercase();
    if lower.contains("429")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("temporarily")
    {
        return true;
    }
    has_5xx_token(&lower)
}

fn has_5xx_token(text: &str) -> bool {
    let bytes = text.as_bytes();
    for (i, window) in bytes.windows(3).enumerate() {
        if window[0] != b'5' || !window[1].is_ascii_digit() || !window[2].is_ascii_digit() {
            continue;
        }
        let before_ok = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
        let after_ok = i + 3 >= bytes.len() || !bytes[i + 3].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
    }
    false
}

fn truncate_with_marker(input: &str, limit: usize) -> String {
    if input.len() <= limit {
        return input.to_string();
    }
    let mut cut = limit;
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = input.len() - cut;
    format!("{} [truncated {} chars]", &input[..cut], dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classifier_matches_the_published_markers() {
        assert!(is_retryable("429 Too Many Requests"));
        assert!(is_retryable("connection timeout"));
        assert!(is_retryable("node cheap timed out after 1s"));
        assert!(is_retryable("service temporarily unavailable"));
        assert!(is_retryable("upstream returned 503"));
        assert!(is_retryable("request failed with status 502 Bad Gateway"));
    }

    #[test]
    fn retry_classifier_ignores_incidental_fives() {
        assert!(!is_retryable("expected 5 items in response"));
        assert!(!is_retryable("model mistral-5x failed validation"));
        assert!(!is_retryable("input exceeds 5000 token limit"));
        assert!(!is_retryable("401 unauthorized"));
    }

    #[test]
    fn truncation_appends_the_marker() {
        let long = "a".repeat(6_100);
        let cut = truncate_with_marker(&long, 6_000);
        assert!(cut.ends_with("[truncated 100 chars]"));
        assert!(cut.starts_with("aaaa"));
    }

    #[test]
    fn short_input_is_untouched() {
        assert_eq!(truncate_with_marker("hello", 6_000), "hello");
    }

    #[test]
    fn default_pricing_is_conservative() {
        let node = sample_node();
        // 2000 prompt + 2000 completion at (1, 3) USD per 1M.
        let cost = node_cost(&node, 2_000, 2_000);
        assert!((cost - 0.008).abs() < 1e-12);
    }

    fn sample_node() -> NodeRecord {
        let now = Utc::now();
        NodeRecord {
            id: "run-1:task".to_string(),
            run_id: "run-1".to_string(),
            local_id: "task".to_string(),
            kind: NodeKind::Task,
            wave: 0,
            depends_on: Vec::new(),
            task: "t".to_string(),
            model: "m".to_string(),
            prompt: "t".to_string(),
            meta: Default::default(),
            status: NodeStatus::Queued,
            retry_count: 0,
            max_retries: 2,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            tokens_prompt: 0,
            tokens_completion: 0,
            cost_usd: 0.0,
        }
    }
}
