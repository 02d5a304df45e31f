use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::files::{GenerationResult, ProjectFile, StrategyFailure};
use crate::generation::Progress;
use crate::manager::EnvironmentHandle;
use crate::sandbox::{ExecRequest, ExecResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/projects/{id}/generate", post(generate))
        .route("/projects/{id}/preview", post(preview).delete(destroy))
        .route("/projects/{id}/exec", post(exec))
        .route("/environments", get(environments))
}

#[derive(Deserialize)]
pub(crate) struct GenerateBody {
    pub prompt: String,
}

#[derive(Deserialize, Default)]
pub(crate) struct PreviewBody {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub files: Vec<ProjectFile>,
    /// Keep the running environment when it already serves these files.
    #[serde(default)]
    pub reuse: bool,
}

#[derive(Serialize)]
pub(crate) struct PreviewResponse {
    #[serde(flatten)]
    pub environment: EnvironmentHandle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<StrategyFailure>,
}

#[derive(Deserialize)]
pub(crate) struct ExecBody {
    pub command: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

async fn run_generation(
    state: &AppState,
    project_id: &str,
    prompt: &str,
) -> Result<GenerationResult, ApiError> {
    let progress = Progress::new(state.status.clone(), project_id);
    Ok(state.chain.generate(prompt, &progress).await?)
}

/// POST /api/projects/{id}/generate — run the strategy chain only.
#[tracing::instrument(skip_all, fields(project_id = %project_id))]
pub(crate) async fn generate(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<GenerationResult>, ApiError> {
    let result = run_generation(&state, &project_id, &body.prompt).await?;
    Ok(Json(result))
}

/// POST /api/projects/{id}/preview — generate when no files are given, then
/// provision an environment for them.
#[tracing::instrument(skip_all, fields(project_id = %project_id))]
pub(crate) async fn preview(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(body): Json<PreviewBody>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let (files, strategy, failures) = if !body.files.is_empty() {
        (body.files, None, Vec::new())
    } else {
        let prompt = body
            .prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ApiError::bad_request("either files or a prompt is required"))?;
        let result = run_generation(&state, &project_id, prompt).await?;
        (result.files, Some(result.strategy), result.failures)
    };

    let environment = if body.reuse {
        state.manager.get_or_create(&project_id, &files).await?
    } else {
        state.manager.create_managed(&project_id, &files).await?
    };

    Ok(Json(PreviewResponse {
        environment,
        strategy,
        failures,
    }))
}

/// DELETE /api/projects/{id}/preview
pub(crate) async fn destroy(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.destroy(&project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/projects/{id}/exec — one shell command in the project's environment.
pub(crate) async fn exec(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(body): Json<ExecBody>,
) -> Result<Json<ExecResult>, ApiError> {
    if body.command.trim().is_empty() {
        return Err(ApiError::bad_request("command is empty"));
    }
    let mut req = ExecRequest::shell(&body.command);
    if let Some(secs) = body.timeout_secs {
        req = req.with_timeout(Duration::from_secs(secs));
    }
    Ok(Json(state.manager.execute(&project_id, req).await?))
}

/// GET /api/environments — tracked environments, oldest first.
pub(crate) async fn environments(State(state): State<AppState>) -> Json<Vec<EnvironmentHandle>> {
    Json(state.manager.list().await)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};

    use crate::api::{AppState, build_router};
    use crate::generation::{GenerationChain, TemplateStrategy};
    use crate::manager::{EnvironmentManager, ManagerConfig};
    use crate::sandbox::testing::FakeBackend;
    use crate::status::StatusChannel;

    async fn serve(backend: FakeBackend) -> String {
        let manager = Arc::new(EnvironmentManager::new(
            Arc::new(backend),
            StatusChannel::new(),
            ManagerConfig {
                capacity_cooldown: std::time::Duration::from_millis(20),
                ..ManagerConfig::default()
            },
        ));
        let chain = Arc::new(GenerationChain::new(vec![Arc::new(TemplateStrategy::new())]));
        let app = build_router(AppState::new(manager, chain));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let base = serve(FakeBackend::new()).await;
        let body: Value = reqwest::get(format!("{base}/health")).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["live_environments"], 0);
    }

    #[tokio::test]
    async fn preview_from_prompt_then_destroy() {
        let base = serve(FakeBackend::new()).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/projects/p1/preview"))
            .json(&json!({ "prompt": "a todo list" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["project_id"], "p1");
        assert_eq!(body["strategy"], "template");
        assert_eq!(body["last_status"], "ready");
        assert!(body["preview_url"].as_str().unwrap().starts_with("http://preview.test/"));

        let listed: Vec<Value> = client
            .get(format!("{base}/api/environments"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        let resp = client.delete(format!("{base}/api/projects/p1/preview")).send().await.unwrap();
        assert_eq!(resp.status(), 204);
        let resp = client.delete(format!("{base}/api/projects/p1/preview")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "no environment for project p1");
    }

    #[tokio::test]
    async fn preview_without_files_or_prompt_is_rejected() {
        let base = serve(FakeBackend::new()).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/api/projects/p1/preview"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn capacity_rejection_sets_retry_after() {
        let backend = FakeBackend::new();
        backend.state.capacity_failures.store(1, std::sync::atomic::Ordering::SeqCst);
        let base = serve(backend).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/api/projects/p1/preview"))
            .json(&json!({ "files": [{ "path": "index.html", "content": "<p>hi</p>" }] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
        assert!(resp.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn exec_runs_in_current_environment() {
        let base = serve(FakeBackend::new()).await;
        let client = reqwest::Client::new();
        client
            .post(format!("{base}/api/projects/p1/preview"))
            .json(&json!({ "files": [{ "path": "index.html", "content": "<p>hi</p>" }] }))
            .send()
            .await
            .unwrap();

        let body: Value = client
            .post(format!("{base}/api/projects/p1/exec"))
            .json(&json!({ "command": "ls -la" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["stdout"], "ls -la");

        let resp = client
            .post(format!("{base}/api/projects/nope/exec"))
            .json(&json!({ "command": "ls" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn exec_without_backend_support_is_not_implemented() {
        let backend = FakeBackend::new();
        backend.state.no_exec.store(true, std::sync::atomic::Ordering::SeqCst);
        let base = serve(backend).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/api/projects/p1/exec"))
            .json(&json!({ "command": "ls" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 501);
    }

    #[tokio::test]
    async fn generate_returns_files_and_strategy() {
        let base = serve(FakeBackend::new()).await;
        let body: Value = reqwest::Client::new()
            .post(format!("{base}/api/projects/p9/generate"))
            .json(&json!({ "prompt": "analytics dashboard" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["strategy"], "template");
        assert!(body["files"].as_array().unwrap().len() >= 5);
    }
}
