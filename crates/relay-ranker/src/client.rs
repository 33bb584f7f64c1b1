//! HTTP implementation of [`ModelRouter`] against a remote ranking service,
//! for deployments that split the orchestrator and the ranker into two
//! processes. Responses arrive in a `{data}` / `{error:{code,message}}`
//! envelope.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use relay_types::RoleConfig;

use crate::roles::ComposedPrompt;
use crate::router::{DecomposeRequest, ModelRouter, PickRequest, PickedModel, RouterStatus};
use crate::split::Decomposition;

pub struct HttpRanker {
    base_url: String,
    client: Client,
}

impl HttpRanker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let value: Value = self
            .client
            .get(url)
            .query(query)
            .send()
            .await?
            .json()
            .await?;
        unwrap_envelope(value)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> anyhow::Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let value: Value = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        unwrap_envelope(value)
    }
}

fn unwrap_envelope<T: DeserializeOwned>(value: Value) -> anyhow::Result<T> {
    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(|v| v.as_str()).unwrap_or("?");
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("ranking service error");
        anyhow::bail!("ranking service error {code}: {message}");
    }
    let Some(data) = value.get("data") else {
        anyhow::bail!("ranking service returned no data envelope");
    };
    Ok(serde_json::from_value(data.clone())?)
}

fn joined(values: &[String]) -> String {
    values.join(",")
}

#[async_trait]
impl ModelRouter for HttpRanker {
    async fn pick(&self, req: &PickRequest) -> anyhow::Result<Option<PickedModel>> {
        self.get(
            "/pick",
            &[
                ("task", req.task.clone()),
                ("budget", req.budget.as_str().to_string()),
                ("context", joined(&req.context)),
                ("exclude", joined(&req.exclude)),
            ],
        )
        .await
    }

    async fn recommend(
        &self,
        req: &PickRequest,
        count: usize,
    ) -> anyhow::Result<Vec<PickedModel>> {
        self.get(
            "/recommend",
            &[
                ("task", req.task.clone()),
                ("budget", req.budget.as_str().to_string()),
                ("count", count.to_string()),
                ("context", joined(&req.context)),
                ("exclude", joined(&req.exclude)),
            ],
        )
        .await
    }

    async fn decompose(&self, req: &DecomposeRequest) -> anyhow::Result<Decomposition> {
        self.post(
            "/decompose",
            json!({
                "task": req.task,
                "budget": req.budget.as_str(),
                "context": joined(&req.context),
            }),
        )
        .await
    }

    async fn swarm(&self, req: &DecomposeRequest) -> anyhow::Result<Decomposition> {
        self.post(
            "/swarm",
            json!({
                "task": req.task,
                "budget": req.budget.as_str(),
                "context": joined(&req.context),
                "maxParallel": req.max_parallel,
            }),
        )
        .await
    }

    async fn compose_role(
        &self,
        task: &str,
        role: &RoleConfig,
    ) -> anyhow::Result<ComposedPrompt> {
        self.post(
            "/roles/compose",
            json!({
                "task": task,
                "persona": role.persona,
                "stack": role.stack,
                "domain": role.domain,
                "format": role.format,
                "guardrails": role.guardrails,
            }),
        )
        .await
    }

    async fn status(&self) -> anyhow::Result<RouterStatus> {
        self.get("/status", &[]).await
    }
}
