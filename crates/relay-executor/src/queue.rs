use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use relay_planner::{PlannedNode, PlannedRun};
use relay_ranker::ModelRouter;
use relay_store::{ArtifactStore, RunStore};
use relay_types::{
    ArtifactKind, CreateRunRequest, NodeRecord, NodeStatus, RunEvent, RunRecord, RunStatus,
};

use crate::config::EngineConfig;
use crate::executor::RunExecutor;

const DEFAULT_MAX_RETRIES: u32 = 2;
const PLAN_NODE_ID: &str = "plan";

/// Process-wide admission controller: at most `max_parallel_runs` runs in
/// flight, each driven by exactly one worker. The in-flight set lives in
/// memory and is consulted before every dispatch.
pub struct RunQueue {
    store: Arc<RunStore>,
    artifacts: Arc<ArtifactStore>,
    router: Arc<dyn ModelRouter>,
    executor: Arc<RunExecutor>,
    config: EngineConfig,
    in_flight: Arc<RwLock<HashSet<String>>>,
    wakeup: Notify,
    last_tick_ms: AtomicI64,
    shutdown: CancellationToken,
}

impl RunQueue {
    pub fn new(
        store: Arc<RunStore>,
        artifacts: Arc<ArtifactStore>,
        router: Arc<dyn ModelRouter>,
        executor: Arc<RunExecutor>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            artifacts,
            router,
            executor,
            config,
            in_flight: Arc::new(RwLock::new(HashSet::new())),
            wakeup: Notify::new(),
            last_tick_ms: AtomicI64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the poll loop. The returned token stops it.
    pub fn spawn(self: Arc<Self>) -> CancellationToken {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { self.poll_loop().await });
        shutdown
    }

    pub async fn create_run(&self, request: &CreateRunRequest) -> anyhow::Result<RunRecord> {
        let run = RunRecord::new(request);
        self.store.insert_run(run.clone()).await?;
        self.store
            .append_event(RunEvent::info(
                &run.id,
                format!("run created in {} mode", run.mode.as_str()),
            ))
            .await?;
        self.wakeup.notify_one();
        Ok(run)
    }

    /// Idempotent: canceling a terminal run returns the record unchanged.
    pub async fn cancel_run(&self, run_id: &str) -> anyhow::Result<Option<RunRecord>> {
        let Some(existing) = self.store.get_run(run_id).await else {
            return Ok(None);
        };
        if existing.status.is_terminal() {
            return Ok(Some(existing));
        }
        let updated = self
            .store
            .finish_run(run_id, RunStatus::Canceled, Some("Canceled by user".to_string()))
            .await?;
        self.store.cancel_open_nodes(run_id).await?;
        self.store
            .append_event(RunEvent::warn(run_id, "run canceled by user"))
            .await?;
        Ok(updated)
    }

    /// Worker liveness for the health surface.
    pub fn is_alive(&self) -> bool {
        let last = self.last_tick_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let age = Utc::now().timestamp_millis() - last;
        age <= (self.config.poll_interval.as_millis() as i64) * 3 + 2_000
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            self.last_tick_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            self.clone().admit_pending().await;

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Earliest-created active runs first, skipping anything already driven.
    async fn admit_pending(self: Arc<Self>) {
        let active = self.store.list_active_runs().await;
        let mut in_flight = self.in_flight.write().await;
        for run in active {
            if in_flight.len() >= self.config.max_parallel_runs {
                break;
            }
            if in_flight.contains(&run.id) {
                continue;
            }
            in_flight.insert(run.id.clone());
            let queue = self.clone();
            tokio::spawn(async move {
                queue.drive_run(run).await;
            });
        }
    }

    async fn drive_run(self: Arc<Self>, run: RunRecord) {
        let run_id = run.id.clone();
        if let Err(err) = self.drive_run_inner(run).await {
            tracing::error!(run_id = %run_id, "run worker failed: {err}");
            let reason = format!("executor error: {err}");
            let _ = self
                .store
                .finish_run(&run_id, RunStatus::Failed, Some(reason.clone()))
                .await;
            let _ = self.store.append_event(RunEvent::error(&run_id, reason)).await;
        }
        self.in_flight.write().await.remove(&run_id);
        self.wakeup.notify_one();
    }

    async fn drive_run_inner(&self, run: RunRecord) -> anyhow::Result<()> {
        // First admission: plan, persist the plan artifact, insert the DAG.
        if self.store.list_nodes(&run.id).await.is_empty() {
            let planned = relay_planner::plan(&run, self.router.as_ref()).await?;
            self.artifacts
                .write(
                    &run.id,
                    PLAN_NODE_ID,
                    ArtifactKind::Plan,
                    &serde_json::to_string_pretty(&planned)?,
                )
                .await?;
            if planned.nodes.is_empty() {
                self.store
                    .finish_run(
                        &run.id,
                        RunStatus::Failed,
                        Some("Planner returned no nodes".to_string()),
                    )
                    .await?;
                return Ok(());
            }
            let records = materialize_nodes(&run, &planned);
            self.store.create_nodes(records).await?;
            self.store
                .append_event(RunEvent::info(&run.id, planned.planner_summary.clone()))
                .await?;
        }

        self.store.mark_run_running(&run.id).await?;
        self.store
            .append_event(RunEvent::info(&run.id, "run admitted"))
            .await?;
        self.executor
            .drive(&run.id, self.shutdown.child_token())
            .await
    }
}

/// Rewrite planner-local ids into the globally unique `runId:localId` form,
/// including every `depends_on` reference.
fn materialize_nodes(run: &RunRecord, planned: &PlannedRun) -> Vec<NodeRecord> {
    planned
        .nodes
        .iter()
        .map(|node| node_record(run, node))
        .collect()
}

fn node_record(run: &RunRecord, planned: &PlannedNode) -> NodeRecord {
    let now = Utc::now();
    NodeRecord {
        id: format!("{}:{}", run.id, planned.local_id),
        run_id: run.id.clone(),
        local_id: planned.local_id.clone(),
        kind: planned.kind,
        wave: planned.wave,
        depends_on: planned
            .depends_on
            .iter()
            .map(|dep| format!("{}:{}", run.id, dep))
            .collect(),
        task: planned.task.clone(),
        model: planned.model.clone(),
        prompt: planned.prompt.clone(),
        meta: planned.meta.clone(),
        status: NodeStatus::Queued,
        retry_count: 0,
        max_retries: DEFAULT_MAX_RETRIES,
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

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::{NodeKind, NodeMeta, RunMode};

    #[test]
    fn node_ids_are_rewritten_to_global_form() {
        let run = RunRecord::new(&CreateRunRequest {
            task: "t".to_string(),
            mode: RunMode::Cascade,
            budget: None,
            context: None,
            collective_count: None,
            role: None,
            merge: None,
        });
        let planned = PlannedRun {
            planner_summary: "s".to_string(),
            nodes: vec![
                PlannedNode {
                    local_id: "cheap".to_string(),
                    kind: NodeKind::Task,
                    wave: 0,
                    depends_on: vec![],
                    task: "t".to_string(),
                    model: "m".to_string(),
                    prompt: "p".to_string(),
                    meta: NodeMeta::default(),
                },
                PlannedNode {
                    local_id: "premium".to_string(),
                    kind: NodeKind::Task,
                    wave: 1,
                    depends_on: vec!["cheap".to_string()],
                    task: "t".to_string(),
                    model: "m".to_string(),
                    prompt: "p".to_string(),
                    meta: NodeMeta::default(),
                },
            ],
        };
        let records = materialize_nodes(&run, &planned);
        assert_eq!(records[0].id, format!("{}:cheap", run.id));
        assert_eq!(records[1].depends_on, vec![format!("{}:cheap", run.id)]);
    }
}
