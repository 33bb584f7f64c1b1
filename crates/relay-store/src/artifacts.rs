use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use relay_types::{ArtifactKind, ArtifactRecord};

/// Content-addressed artifact blobs. Bodies live on disk under
/// `<root>/<run_id>/<node_id>.<ext>`; the index keeps every record ever
/// written for a `(run, node)` pair and lookups return the newest one.
pub struct ArtifactStore {
    root: PathBuf,
    index: RwLock<Vec<ArtifactRecord>>,
}

impl ArtifactStore {
    pub async fn new(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        let index_file = root.join("index.json");
        let index = if index_file.exists() {
            let raw = fs::read_to_string(&index_file).await?;
            serde_json::from_str::<Vec<ArtifactRecord>>(&raw).unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    /// Write a blob and append its record. Retries for the same node reuse
    /// the path, so the file always holds the newest body while the index
    /// retains the full history.
    pub async fn write(
        &self,
        run_id: &str,
        node_id: &str,
        kind: ArtifactKind,
        body: &str,
    ) -> anyhow::Result<ArtifactRecord> {
        let dir = self.root.join(run_id);
        fs::create_dir_all(&dir).await?;
        let file_name = format!("{}.{}", sanitize_component(node_id), kind.extension());
        let path = dir.join(&file_name);
        fs::write(&path, body.as_bytes())
            .await
            .with_context(|| format!("writing artifact {}", path.display()))?;

        let record = ArtifactRecord {
            id: format!("art-{}", Uuid::new_v4()),
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            kind,
            path: format!("{}/{}", run_id, file_name),
            bytes: body.len() as u64,
            sha256: hash_hex(body.as_bytes()),
            created_at: Utc::now(),
        };
        self.index.write().await.push(record.clone());
        self.flush().await?;
        Ok(record)
    }

    /// Newest record for `(run, node)`; insertion order breaks timestamp ties.
    pub async fn latest(&self, run_id: &str, node_id: &str) -> Option<ArtifactRecord> {
        self.index
            .read()
            .await
            .iter()
            .filter(|a| a.run_id == run_id && a.node_id == node_id)
            .max_by_key(|a| a.created_at)
            .cloned()
    }

    pub async fn read_latest(
        &self,
        run_id: &str,
        node_id: &str,
    ) -> anyhow::Result<Option<(ArtifactRecord, String)>> {
        let Some(record) = self.latest(run_id, node_id).await else {
            return Ok(None);
        };
        let body = fs::read_to_string(self.root.join(&record.path))
            .await
            .with_context(|| format!("reading artifact {}", record.path))?;
        Ok(Some((record, body)))
    }

    /// Newest record per node for a run, ordered by creation time.
    pub async fn list_latest(&self, run_id: &str) -> Vec<ArtifactRecord> {
        let index = self.index.read().await;
        let mut newest: HashMap<&str, &ArtifactRecord> = HashMap::new();
        for record in index.iter().filter(|a| a.run_id == run_id) {
            match newest.get(record.node_id.as_str()) {
                Some(existing) if existing.created_at > record.created_at => {}
                _ => {
                    newest.insert(record.node_id.as_str(), record);
                }
            }
        }
        let mut out = newest.into_values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// The newest raw artifact of a run, across all nodes.
    pub async fn latest_raw(&self, run_id: &str) -> Option<ArtifactRecord> {
        self.index
            .read()
            .await
            .iter()
            .filter(|a| a.run_id == run_id && a.kind == ArtifactKind::Raw)
            .max_by_key(|a| a.created_at)
            .cloned()
    }

    pub async fn healthcheck(&self) -> anyhow::Result<()> {
        let probe = self.root.join(".healthcheck");
        fs::write(&probe, b"ok")
            .await
            .context("artifact root not writable")?;
        let _ = fs::remove_file(&probe).await;
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.index.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.root.join("index.json"), payload).await?;
        Ok(())
    }
}

fn hash_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}

/// Node ids carry the `runId:localId` form; keep the file name flat.
fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
