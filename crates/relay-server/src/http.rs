use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use relay_ranker::{DecomposeRequest, ModelRouter, PickRequest};
use relay_types::{
    BudgetTier, Category, CreateRunRequest, MergeConfig, NodeKind, NodeStatus, Progress,
    RoleConfig, RunMode, RunStatus,
};

use crate::error::ApiError;
use crate::AppState;

const MERGE_NODE_ID: &str = "merged";
const PLAN_NODE_ID: &str = "plan";
const RAW_OUTPUT_LIMIT: usize = 12_000;
const LIST_LIMIT_MAX: usize = 200;
const LIST_LIMIT_DEFAULT: usize = 20;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("relay engine listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/run", post(create_run).get(list_runs))
        .route("/run/{id}/status", get(run_status))
        .route("/run/{id}/result", get(run_result))
        .route("/run/{id}/cancel", post(cancel_run))
        .route("/run/{id}/artifact/{node_id}", get(get_artifact))
        .route("/health", get(health))
        .route("/pick", get(pick))
        .route("/recommend", get(recommend))
        .route("/decompose", post(decompose))
        .route("/swarm", post(swarm))
        .route("/roles/compose", post(roles_compose))
        .route("/status", get(ranking_status))
        .route("/catalog/refresh", post(catalog_refresh))
        .route("/feedback", post(post_feedback))
        .layer(cors)
        .with_state(state)
}

fn data(value: Value) -> Json<Value> {
    Json(json!({ "data": value }))
}

fn body_value(payload: Result<Json<Value>, JsonRejection>) -> Result<Value, ApiError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError::invalid_body(rejection.to_string())),
    }
}

fn required_str<'a>(body: &'a Value, key: &str) -> Result<&'a str, ApiError> {
    body.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::missing_param(key))
}

fn optional_budget(body: &Value) -> Result<Option<BudgetTier>, ApiError> {
    let Some(raw) = body.get("budget").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    BudgetTier::parse(raw)
        .map(Some)
        .ok_or_else(|| ApiError::invalid_param("budget", format!("`{raw}` is not a budget tier")))
}

fn split_csv(input: Option<&str>) -> Vec<String> {
    input
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Context arrives as a comma-separated string or a JSON array.
fn context_of(body: &Value) -> Vec<String> {
    match body.get("context") {
        Some(Value::String(s)) => split_csv(Some(s)),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

// --- run lifecycle ---

async fn create_run(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let body = body_value(payload)?;
    let task = required_str(&body, "task")?;
    let mode_raw = required_str(&body, "mode")?;
    let mode = RunMode::parse(mode_raw)
        .ok_or_else(|| ApiError::invalid_param("mode", format!("`{mode_raw}` is not a mode")))?;
    let budget = optional_budget(&body)?;

    let role = match body.get("role") {
        Some(value) if !value.is_null() => Some(
            serde_json::from_value::<RoleConfig>(value.clone())
                .map_err(|err| ApiError::invalid_param("role", err.to_string()))?,
        ),
        _ => None,
    };
    let merge = match body.get("merge") {
        Some(value) if !value.is_null() => Some(
            serde_json::from_value::<MergeConfig>(value.clone())
                .map_err(|err| ApiError::invalid_param("merge", err.to_string()))?,
        ),
        _ => None,
    };
    let collective_count = body
        .get("collectiveCount")
        .or_else(|| body.get("collective_count"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);
    let context = body
        .get("context")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let request = CreateRunRequest {
        task: task.to_string(),
        mode,
        budget,
        context,
        collective_count,
        role,
        merge,
    };
    let run = state.queue.create_run(&request).await?;
    Ok(data(json!({
        "run_id": run.id,
        "status": run.status.as_str(),
        "created_at": run.created_at,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct ListRunsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(parse_run_status(raw)?),
    };
    let limit = query
        .limit
        .unwrap_or(LIST_LIMIT_DEFAULT)
        .min(LIST_LIMIT_MAX);
    let runs = state
        .store
        .list_runs(status, limit)
        .await
        .into_iter()
        .map(|run| {
            json!({
                "run_id": run.id,
                "task": run.task,
                "mode": run.mode.as_str(),
                "budget": run.budget.as_str(),
                "status": run.status.as_str(),
                "created_at": run.created_at,
                "updated_at": run.updated_at,
                "error": run.error,
            })
        })
        .collect::<Vec<_>>();
    Ok(data(json!({ "runs": runs })))
}

fn parse_run_status(raw: &str) -> Result<RunStatus, ApiError> {
    match raw.trim().to_lowercase().as_str() {
        "queued" => Ok(RunStatus::Queued),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "canceled" => Ok(RunStatus::Canceled),
        other => Err(ApiError::invalid_param(
            "status",
            format!("`{other}` is not a run status"),
        )),
    }
}

async fn run_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let Some(run) = state.store.get_run(&id).await else {
        return Err(ApiError::not_found(format!("run `{id}`")));
    };
    let nodes = state.store.list_nodes(&id).await;
    let total = nodes.len();
    let done = nodes
        .iter()
        .filter(|n| n.status.is_satisfied())
        .count();
    let progress = Progress {
        total,
        done,
        running: nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Running)
            .count(),
        failed: nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Failed)
            .count(),
        percent: if total == 0 {
            0.0
        } else {
            (100.0 * done as f64 / total as f64 * 100.0).round() / 100.0
        },
    };
    let last_event = state.store.last_event(&id).await.map(|e| e.message);
    Ok(data(json!({
        "status": run.status.as_str(),
        "progress": progress,
        "last_event": last_event,
        "updated_at": run.updated_at,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct ResultQuery {
    include_raw: Option<bool>,
}

async fn run_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(run) = state.store.get_run(&id).await else {
        return Err(ApiError::not_found(format!("run `{id}`")));
    };

    let merged_output = state
        .artifacts
        .read_latest(&id, MERGE_NODE_ID)
        .await?
        .map(|(_, body)| body);

    let summary = match state.artifacts.read_latest(&id, PLAN_NODE_ID).await? {
        Some((_, body)) => serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("planner_summary")
                    .and_then(|s| s.as_str())
                    .map(|s| s.to_string())
            }),
        None => None,
    };

    let nodes = state.store.list_nodes(&id).await;
    let tokens_prompt: u64 = nodes.iter().map(|n| n.tokens_prompt).sum();
    let tokens_completion: u64 = nodes.iter().map(|n| n.tokens_completion).sum();
    let cost_usd = state.store.run_cost(&id).await;

    let artifacts = state
        .artifacts
        .list_latest(&id)
        .await
        .into_iter()
        .map(|a| {
            json!({
                "node_id": a.node_id,
                "artifact_type": a.kind.as_str(),
                "path": a.path,
                "bytes": a.bytes,
                "sha256": a.sha256,
                "createdAt": a.created_at,
            })
        })
        .collect::<Vec<_>>();

    let mut response = json!({
        "status": run.status.as_str(),
        "merged_output": merged_output,
        "summary": summary,
        "artifacts": artifacts,
        "cost": {
            "prompt": tokens_prompt,
            "completion": tokens_completion,
            "usd": cost_usd,
        },
    });

    if query.include_raw.unwrap_or(false) {
        let mut raw_outputs = Vec::new();
        for node in nodes.iter().filter(|n| n.kind == NodeKind::Task) {
            let Some((_, body)) = state.artifacts.read_latest(&id, &node.id).await? else {
                continue;
            };
            let output = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| {
                    v.get("output")
                        .and_then(|o| o.as_str())
                        .map(|s| s.to_string())
                })
                .unwrap_or(body);
            raw_outputs.push(json!({
                "node_id": node.id,
                "model": node.model,
                "output": truncate(&output, RAW_OUTPUT_LIMIT),
            }));
        }
        response["raw_outputs"] = Value::Array(raw_outputs);
    }

    Ok(data(response))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let Some(run) = state.queue.cancel_run(&id).await? else {
        return Err(ApiError::not_found(format!("run `{id}`")));
    };
    Ok(data(json!({
        "run_id": run.id,
        "status": run.status.as_str(),
    })))
}

async fn get_artifact(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let Some((record, content)) = state.artifacts.read_latest(&id, &node_id).await? else {
        return Err(ApiError::not_found(format!(
            "artifact `{node_id}` of run `{id}`"
        )));
    };
    Ok(data(json!({
        "artifact_type": record.kind.as_str(),
        "content": content,
        "metadata": {
            "bytes": record.bytes,
            "sha256": record.sha256,
            "createdAt": record.created_at,
            "path": record.path,
        },
    })))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let store_writable = state.store.healthcheck().await.is_ok();
    let artifact_writable = state.artifacts.healthcheck().await.is_ok();
    let ranking = state.ranker.status().await.ok();
    Json(json!({
        "data": {
            "completion_configured": state.completion_configured,
            "ranking_reachable": ranking.is_some(),
            "catalog_models": ranking.map(|s| s.models).unwrap_or(0),
            "store_writable": store_writable,
            "artifact_writable": artifact_writable,
            "worker_alive": state.queue.is_alive(),
        }
    }))
}

// --- ranking service ---

#[derive(Debug, Deserialize, Default)]
struct PickParams {
    task: Option<String>,
    budget: Option<String>,
    context: Option<String>,
    exclude: Option<String>,
    count: Option<usize>,
}

fn pick_request(params: &PickParams) -> Result<PickRequest, ApiError> {
    let task = params
        .task
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::missing_param("task"))?;
    let budget = match params.budget.as_deref() {
        None | Some("") => BudgetTier::Any,
        Some(raw) => BudgetTier::parse(raw).ok_or_else(|| {
            ApiError::invalid_param("budget", format!("`{raw}` is not a budget tier"))
        })?,
    };
    Ok(PickRequest {
        task: task.to_string(),
        budget,
        context: split_csv(params.context.as_deref()),
        exclude: params
            .exclude
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect(),
    })
}

async fn pick(
    State(state): State<AppState>,
    Query(params): Query<PickParams>,
) -> Result<Json<Value>, ApiError> {
    let request = pick_request(&params)?;
    let Some(picked) = state.ranker.pick(&request).await? else {
        return Err(ApiError::no_model());
    };
    Ok(data(serde_json::to_value(picked).map_err(ApiError::internal)?))
}

async fn recommend(
    State(state): State<AppState>,
    Query(params): Query<PickParams>,
) -> Result<Json<Value>, ApiError> {
    let request = pick_request(&params)?;
    let count = params.count.unwrap_or(3).clamp(1, 10);
    let picked = state.ranker.recommend(&request, count).await?;
    if picked.is_empty() {
        return Err(ApiError::no_model());
    }
    Ok(data(serde_json::to_value(picked).map_err(ApiError::internal)?))
}

async fn decompose(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let body = body_value(payload)?;
    let request = decompose_request(&body, 1)?;
    let result = state.ranker.decompose(&request).await?;
    Ok(data(serde_json::to_value(result).map_err(ApiError::internal)?))
}

async fn swarm(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let body = body_value(payload)?;
    let max_parallel = body
        .get("maxParallel")
        .or_else(|| body.get("max_parallel"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
    let request = decompose_request(&body, max_parallel)?;
    let result = state.ranker.swarm(&request).await?;
    Ok(data(serde_json::to_value(result).map_err(ApiError::internal)?))
}

fn decompose_request(body: &Value, max_parallel: usize) -> Result<DecomposeRequest, ApiError> {
    let task = required_str(body, "task")?;
    let budget = optional_budget(body)?.unwrap_or_default();
    Ok(DecomposeRequest {
        task: task.to_string(),
        budget,
        context: context_of(body),
        max_parallel,
    })
}

async fn roles_compose(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let body = body_value(payload)?;
    let task = required_str(&body, "task")?;
    let role = RoleConfig {
        persona: body
            .get("persona")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        stack: string_list(&body, "stack"),
        domain: body
            .get("domain")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        format: body
            .get("format")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        guardrails: string_list(&body, "guardrails"),
    };
    let composed = state.ranker.compose_role(task, &role).await?;
    Ok(data(serde_json::to_value(composed).map_err(ApiError::internal)?))
}

fn string_list(body: &Value, key: &str) -> Vec<String> {
    body.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

async fn ranking_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let status = state.ranker.status().await?;
    Ok(data(serde_json::to_value(status).map_err(ApiError::internal)?))
}

async fn catalog_refresh(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = state.ranker.refresh().await?;
    Ok(data(serde_json::to_value(report).map_err(ApiError::internal)?))
}

// --- feedback ---

async fn post_feedback(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let body = body_value(payload)?;
    let kind = required_str(&body, "type")?;
    let model = required_str(&body, "model")?;
    let category_raw = required_str(&body, "category")?;
    let category = Category::parse(category_raw).ok_or_else(|| {
        ApiError::invalid_param("category", format!("`{category_raw}` is not a category"))
    })?;
    let feedback = state.ranker.feedback();

    match kind {
        "personal" => {
            let success = body
                .get("success")
                .and_then(|v| v.as_bool())
                .ok_or_else(|| ApiError::missing_param("success"))?;
            let score = feedback.record_personal(model, category, success).await?;
            Ok(data(json!({
                "successes": score.successes,
                "failures": score.failures,
                "total": score.total(),
                "score": score.score(),
            })))
        }
        "context" => {
            let success = body
                .get("success")
                .and_then(|v| v.as_bool())
                .ok_or_else(|| ApiError::missing_param("success"))?;
            let tag = required_str(&body, "tag")?;
            let score = feedback
                .record_context(model, category, tag, success)
                .await?;
            Ok(data(json!({
                "successes": score.successes,
                "failures": score.failures,
                "total": score.total(),
                "score": score.score(),
            })))
        }
        "community" => {
            let rating = body
                .get("rating")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| ApiError::missing_param("rating"))?;
            let instance = body
                .get("instance")
                .and_then(|v| v.as_str())
                .unwrap_or("anonymous");
            let Some(score) = feedback
                .record_community(model, category, rating, instance)
                .await?
            else {
                return Err(ApiError::rate_limited());
            };
            Ok(data(json!({
                "total_ratings": score.total_ratings,
                "avg_rating": score.avg_rating(),
                "contributors": score.contributors,
            })))
        }
        other => Err(ApiError::invalid_param(
            "type",
            format!("`{other}` is not a feedback type"),
        )),
    }
}

fn truncate(input: &str, limit: usize) -> String {
    if input.len() <= limit {
        return input.to_string();
    }
    let mut cut = limit;
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{} [truncated {} chars]", &input[..cut], input.len() - cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use relay_completion::{
        CompletionClient, CompletionRequest, CompletionResponse, TokenUsage,
    };
    use relay_executor::{EngineConfig, RunExecutor, RunQueue};
    use relay_ranker::{Ranker, RankerConfig};
    use relay_store::{ArtifactStore, RunStore};
    use relay_types::{EnrichedModel, Pricing};

    struct StubCompletion;

    #[async_trait]
    impl CompletionClient for StubCompletion {
        fn is_configured(&self) -> bool {
            true
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<CompletionResponse> {
            Ok(CompletionResponse {
                content: "stubbed model answer".to_string(),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 10,
                    total_tokens: 20,
                },
            })
        }
    }

    async fn test_state(models: Vec<EnrichedModel>) -> (AppState, tempfile::TempDir) {
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
        let ranker = Arc::new(
            Ranker::load(dir.path().join("ranker"), RankerConfig::default())
                .await
                .expect("ranker"),
        );
        if !models.is_empty() {
            ranker.install_models(models).await.expect("install");
        }
        let config = EngineConfig {
            poll_interval: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let executor = Arc::new(RunExecutor::new(
            store.clone(),
            artifacts.clone(),
            Arc::new(StubCompletion),
            config.clone(),
        ));
        let queue = RunQueue::new(
            store.clone(),
            artifacts.clone(),
            ranker.clone(),
            executor,
            config,
        );
        queue.clone().spawn();
        (
            AppState {
                store,
                artifacts,
                queue,
                ranker,
                completion_configured: true,
            },
            dir,
        )
    }

    fn seeded_model() -> EnrichedModel {
        let mut model = EnrichedModel::new("openai/gpt-4o-mini");
        model.pricing = Pricing {
            prompt: 0.15,
            completion: 0.6,
        };
        model.context_length = 128_000;
        model
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn create_run_requires_task_and_valid_mode() {
        let (state, _dir) = test_state(vec![seeded_model()]).await;
        let app = app_router(state);

        let (status, body) = send(&app, post_json("/run", json!({"mode": "single"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "MISSING_PARAM");

        let (status, body) = send(
            &app,
            post_json("/run", json!({"task": "t", "mode": "quantum"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_PARAM");
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_body() {
        let (state, _dir) = test_state(vec![]).await;
        let app = app_router(state);
        let request = Request::builder()
            .method("POST")
            .uri("/run")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .expect("request");
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_BODY");
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let (state, _dir) = test_state(vec![]).await;
        let app = app_router(state);
        let (status, body) = send(&app, get_req("/run/run-nope/status")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn pick_with_empty_catalog_returns_no_model() {
        let (state, _dir) = test_state(vec![]).await;
        let app = app_router(state);
        let (status, body) = send(&app, get_req("/pick?task=hello&budget=low")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "NO_MODEL");
    }

    #[tokio::test]
    async fn pick_returns_the_seeded_model() {
        let (state, _dir) = test_state(vec![seeded_model()]).await;
        let app = app_router(state);
        let (status, body) = send(&app, get_req("/pick?task=hello&budget=low")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], "openai/gpt-4o-mini");

        // Excluding the only candidate surfaces NO_MODEL, not an alternate.
        let (status, body) = send(
            &app,
            get_req("/pick?task=hello&budget=low&exclude=openai/gpt-4o-mini"),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "NO_MODEL");
    }

    #[tokio::test]
    async fn health_reports_every_probe() {
        let (state, _dir) = test_state(vec![]).await;
        let app = app_router(state);
        let (status, body) = send(&app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let data = &body["data"];
        assert_eq!(data["completion_configured"], true);
        assert_eq!(data["ranking_reachable"], true);
        assert_eq!(data["store_writable"], true);
        assert_eq!(data["artifact_writable"], true);
        assert!(data["worker_alive"].is_boolean());
    }

    #[tokio::test]
    async fn single_run_round_trips_through_the_api() {
        let (state, _dir) = test_state(vec![seeded_model()]).await;
        let app = app_router(state);

        let (status, body) = send(
            &app,
            post_json(
                "/run",
                json!({"task": "Write a haiku about caches.", "mode": "single", "budget": "low"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let run_id = body["data"]["run_id"].as_str().expect("run id").to_string();
        assert_eq!(body["data"]["status"], "queued");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (status, body) = send(&app, get_req(&format!("/run/{run_id}/status"))).await;
            assert_eq!(status, StatusCode::OK);
            let run_status = body["data"]["status"].as_str().expect("status").to_string();
            if run_status == "completed" {
                assert_eq!(body["data"]["progress"]["percent"], 100.0);
                break;
            }
            assert!(
                run_status == "queued" || run_status == "running",
                "unexpected status {run_status}"
            );
            assert!(tokio::time::Instant::now() < deadline, "run never completed");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let (status, body) = send(&app, get_req(&format!("/run/{run_id}/result"))).await;
        assert_eq!(status, StatusCode::OK);
        let merged = body["data"]["merged_output"].as_str().expect("merged");
        assert!(merged.contains("stubbed model answer"));
        assert!(body["data"]["cost"]["usd"].as_f64().expect("usd") > 0.0);

        let (status, body) = send(
            &app,
            get_req(&format!("/run/{run_id}/artifact/merged")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["artifact_type"], "merged");
        assert_eq!(
            body["data"]["metadata"]["sha256"]
                .as_str()
                .expect("sha")
                .len(),
            64
        );
    }

    #[tokio::test]
    async fn repeated_status_reads_are_identical_once_terminal() {
        let (state, _dir) = test_state(vec![seeded_model()]).await;
        let app = app_router(state.clone());
        let run = state
            .queue
            .create_run(&relay_types::CreateRunRequest {
                task: "Write a haiku about caches.".to_string(),
                mode: RunMode::Single,
                budget: None,
                context: None,
                collective_count: None,
                role: None,
                merge: None,
            })
            .await
            .expect("create");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let current = state.store.get_run(&run.id).await.expect("run");
            if current.status.is_terminal() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let (_, first) = send(&app, get_req(&format!("/run/{}/status", run.id))).await;
        let (_, second) = send(&app, get_req(&format!("/run/{}/status", run.id))).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn community_feedback_is_rate_limited_per_instance() {
        let (state, _dir) = test_state(vec![seeded_model()]).await;
        let app = app_router(state);
        for _ in 0..relay_ranker::COMMUNITY_HOURLY_LIMIT {
            let (status, _) = send(
                &app,
                post_json(
                    "/feedback",
                    json!({
                        "type": "community",
                        "model": "openai/gpt-4o-mini",
                        "category": "general",
                        "rating": 4.5,
                        "instance": "inst-1",
                    }),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = send(
            &app,
            post_json(
                "/feedback",
                json!({
                    "type": "community",
                    "model": "openai/gpt-4o-mini",
                    "category": "general",
                    "rating": 4.5,
                    "instance": "inst-1",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn list_runs_clamps_the_limit() {
        let (state, _dir) = test_state(vec![]).await;
        let app = app_router(state);
        let (status, body) = send(&app, get_req("/run?limit=5000")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["runs"].as_array().expect("runs").is_empty());

        let (status, body) = send(&app, get_req("/run?status=bogus")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_PARAM");
    }
}
