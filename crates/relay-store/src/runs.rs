use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use tokio::fs;
use tokio::sync::RwLock;

use relay_types::{NodeRecord, NodeStatus, RunEvent, RunRecord, RunStatus};

/// Durable record of runs, nodes and events. Tables live in memory behind a
/// single writer lock and are flushed to pretty JSON files; one write guard
/// plus one flush per mutation is the transaction boundary.
pub struct RunStore {
    base: PathBuf,
    runs: RwLock<HashMap<String, RunRecord>>,
    nodes: RwLock<HashMap<String, NodeRecord>>,
    events: RwLock<Vec<RunEvent>>,
}

impl RunStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;

        let runs = read_table::<HashMap<String, RunRecord>>(&base.join("runs.json")).await;
        let nodes = read_table::<HashMap<String, NodeRecord>>(&base.join("nodes.json")).await;
        let events = read_table::<Vec<RunEvent>>(&base.join("events.json")).await;

        Ok(Self {
            base,
            runs: RwLock::new(runs),
            nodes: RwLock::new(nodes),
            events: RwLock::new(events),
        })
    }

    // --- runs ---

    pub async fn insert_run(&self, run: RunRecord) -> anyhow::Result<()> {
        self.runs.write().await.insert(run.id.clone(), run);
        self.flush_runs().await
    }

    pub async fn get_run(&self, id: &str) -> Option<RunRecord> {
        self.runs.read().await.get(id).cloned()
    }

    /// Newest first, optionally filtered by status.
    pub async fn list_runs(&self, status: Option<RunStatus>, limit: usize) -> Vec<RunRecord> {
        let mut out = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        out
    }

    /// Queued or running runs, oldest first: admission order for the queue.
    pub async fn list_active_runs(&self) -> Vec<RunRecord> {
        let mut out = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| matches!(r.status, RunStatus::Queued | RunStatus::Running))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// `queued -> running`, stamping `started_at`. No-op on any other state.
    pub async fn mark_run_running(&self, id: &str) -> anyhow::Result<Option<RunRecord>> {
        let updated = {
            let mut runs = self.runs.write().await;
            let Some(run) = runs.get_mut(id) else {
                return Ok(None);
            };
            if run.status != RunStatus::Queued {
                return Ok(Some(run.clone()));
            }
            let now = Utc::now();
            run.status = RunStatus::Running;
            run.started_at = Some(now);
            run.updated_at = now;
            run.clone()
        };
        self.flush_runs().await?;
        Ok(Some(updated))
    }

    /// Transition a run to a terminal status. Terminal runs are never
    /// resurrected; the existing record is returned unchanged instead.
    pub async fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> anyhow::Result<Option<RunRecord>> {
        let updated = {
            let mut runs = self.runs.write().await;
            let Some(run) = runs.get_mut(id) else {
                return Ok(None);
            };
            if run.status.is_terminal() {
                return Ok(Some(run.clone()));
            }
            let now = Utc::now();
            run.status = status;
            run.error = error;
            run.finished_at = Some(now);
            run.updated_at = now;
            run.clone()
        };
        self.flush_runs().await?;
        Ok(Some(updated))
    }

    // --- nodes ---

    /// Insert a run's full DAG in one transaction. Ids must already be in the
    /// global `runId:localId` form; a collision aborts the whole insert.
    pub async fn create_nodes(&self, batch: Vec<NodeRecord>) -> anyhow::Result<()> {
        {
            let mut nodes = self.nodes.write().await;
            for node in &batch {
                if nodes.contains_key(&node.id) {
                    anyhow::bail!("node id `{}` already exists", node.id);
                }
            }
            for node in batch {
                nodes.insert(node.id.clone(), node);
            }
        }
        self.flush_nodes().await
    }

    pub async fn get_node(&self, id: &str) -> Option<NodeRecord> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn list_nodes(&self, run_id: &str) -> Vec<NodeRecord> {
        let mut out = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.run_id == run_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| (a.wave, &a.local_id).cmp(&(b.wave, &b.local_id)));
        out
    }

    pub async fn set_node_running(&self, id: &str) -> anyhow::Result<Option<NodeRecord>> {
        self.update_node(id, |node| {
            let now = Utc::now();
            node.status = NodeStatus::Running;
            node.started_at = Some(now);
            node.updated_at = now;
        })
        .await
    }

    pub async fn set_node_completed(
        &self,
        id: &str,
        tokens_prompt: u64,
        tokens_completion: u64,
        cost_usd: f64,
    ) -> anyhow::Result<Option<NodeRecord>> {
        self.update_node(id, |node| {
            let now = Utc::now();
            node.status = NodeStatus::Completed;
            node.error = None;
            node.tokens_prompt = tokens_prompt;
            node.tokens_completion = tokens_completion;
            node.cost_usd = cost_usd;
            node.finished_at = Some(now);
            node.updated_at = now;
        })
        .await
    }

    pub async fn set_node_failed(
        &self,
        id: &str,
        error: impl Into<String>,
    ) -> anyhow::Result<Option<NodeRecord>> {
        let error = error.into();
        self.update_node(id, move |node| {
            let now = Utc::now();
            node.status = NodeStatus::Failed;
            node.error = Some(error);
            node.finished_at = Some(now);
            node.updated_at = now;
        })
        .await
    }

    pub async fn set_node_skipped(
        &self,
        id: &str,
        reason: impl Into<String>,
    ) -> anyhow::Result<Option<NodeRecord>> {
        let reason = reason.into();
        self.update_node(id, move |node| {
            let now = Utc::now();
            node.status = NodeStatus::Skipped;
            node.error = Some(reason);
            node.finished_at = Some(now);
            node.updated_at = now;
        })
        .await
    }

    pub async fn cancel_open_nodes(&self, run_id: &str) -> anyhow::Result<usize> {
        let canceled = {
            let mut nodes = self.nodes.write().await;
            let now = Utc::now();
            let mut count = 0;
            for node in nodes.values_mut() {
                if node.run_id == run_id && !node.status.is_terminal() {
                    node.status = NodeStatus::Canceled;
                    node.finished_at = Some(now);
                    node.updated_at = now;
                    count += 1;
                }
            }
            count
        };
        if canceled > 0 {
            self.flush_nodes().await?;
        }
        Ok(canceled)
    }

    /// Put a node back in the queue for another attempt. Everything except
    /// `status` and `error` is preserved.
    pub async fn requeue_node(&self, id: &str) -> anyhow::Result<Option<NodeRecord>> {
        self.update_node(id, |node| {
            node.status = NodeStatus::Queued;
            node.error = None;
            node.retry_count += 1;
            node.updated_at = Utc::now();
        })
        .await
    }

    pub async fn run_cost(&self, run_id: &str) -> f64 {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.run_id == run_id)
            .map(|n| n.cost_usd)
            .sum()
    }

    async fn update_node(
        &self,
        id: &str,
        apply: impl FnOnce(&mut NodeRecord),
    ) -> anyhow::Result<Option<NodeRecord>> {
        let updated = {
            let mut nodes = self.nodes.write().await;
            let Some(node) = nodes.get_mut(id) else {
                return Ok(None);
            };
            apply(node);
            node.clone()
        };
        self.flush_nodes().await?;
        Ok(Some(updated))
    }

    // --- events ---

    pub async fn append_event(&self, event: RunEvent) -> anyhow::Result<()> {
        self.events.write().await.push(event);
        self.flush_events().await
    }

    pub async fn list_events(&self, run_id: &str) -> Vec<RunEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }

    pub async fn last_event(&self, run_id: &str) -> Option<RunEvent> {
        self.events
            .read()
            .await
            .iter()
            .rev()
            .find(|e| e.run_id == run_id)
            .cloned()
    }

    /// Writability probe for the health endpoint.
    pub async fn healthcheck(&self) -> anyhow::Result<()> {
        let probe = self.base.join(".healthcheck");
        fs::write(&probe, b"ok").await.context("store not writable")?;
        let _ = fs::remove_file(&probe).await;
        Ok(())
    }

    // --- persistence ---

    async fn flush_runs(&self) -> anyhow::Result<()> {
        let snapshot = self.runs.read().await.clone();
        write_table(&self.base.join("runs.json"), &snapshot).await
    }

    async fn flush_nodes(&self) -> anyhow::Result<()> {
        let snapshot = self.nodes.read().await.clone();
        write_table(&self.base.join("nodes.json"), &snapshot).await
    }

    async fn flush_events(&self) -> anyhow::Result<()> {
        let snapshot = self.events.read().await.clone();
        write_table(&self.base.join("events.json"), &snapshot).await
    }
}

async fn read_table<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    let Ok(raw) = fs::read_to_string(path).await else {
        return T::default();
    };
    serde_json::from_str(&raw).unwrap_or_default()
}

async fn write_table<T: serde::Serialize>(path: &Path, table: &T) -> anyhow::Result<()> {
    let payload = serde_json::to_string_pretty(table)?;
    fs::write(path, payload)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
