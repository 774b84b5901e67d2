use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use anyhow::Context;
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::download::error::TransferError;
use crate::download::manager::TransferManager;
use crate::download::record::Transfer;
use crate::jobs::cleanup::CleanupReport;
use crate::jobs::preview::{PreviewError, PreviewOutcome};

/// Response data struct
#[derive(Serialize)]
struct ApiResponse<T> {
    code: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(message: &str, data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse {
        code: StatusCode::OK.as_u16(),
        message: message.to_string(),
        data: Some(data),
    }))
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            code: self.status.as_u16(),
            message: self.message,
            data: None,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        let status = match err {
            TransferError::NotFound(_) | TransferError::ChunkNotFound { .. } => StatusCode::NOT_FOUND,
            TransferError::InvalidTransition { .. } | TransferError::DestinationExists(_) => {
                StatusCode::CONFLICT
            }
            TransferError::InvalidUrl(_) | TransferError::InvalidDestination(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: err.to_string() }
    }
}

impl From<PreviewError> for ApiError {
    fn from(err: PreviewError) -> Self {
        let status = match err {
            PreviewError::FileNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self { status, message: err.to_string() }
    }
}

/// Add transfer body
#[derive(Deserialize)]
struct EnqueueBody {
    url: String,
    destination: String,
}

#[derive(Serialize)]
struct Enqueued {
    id: Uuid,
}

#[derive(Deserialize)]
struct CleanupBody {
    path: String,
    backends: Option<Vec<String>>,
}

#[derive(Serialize)]
struct Pruned {
    removed: usize,
}

pub fn router(manager: TransferManager) -> Router {
    Router::new()
        .route("/transfers", get(list_transfers).post(enqueue_transfer))
        .route("/transfers/prune", post(prune_transfers))
        .route("/transfers/:id", get(transfer_status))
        .route("/transfers/:id/pause", post(pause_transfer))
        .route("/transfers/:id/resume", post(resume_transfer))
        .route("/transfers/:id/cancel", post(cancel_transfer))
        .route("/files/:id/preview", post(generate_preview))
        .route("/cleanup", post(cleanup))
        .layer(Extension(manager))
}

pub async fn setup_server(manager: TransferManager, listen_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Bind failed: {listen_addr}"))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(manager)).await?;

    Ok(())
}

async fn list_transfers(Extension(manager): Extension<TransferManager>) -> ApiResult<Vec<Transfer>> {
    ok("ok", manager.list())
}

async fn enqueue_transfer(
    Extension(manager): Extension<TransferManager>,
    Json(body): Json<EnqueueBody>,
) -> ApiResult<Enqueued> {
    let id = manager.enqueue(&body.url, &body.destination)?;
    ok("Successfully added transfer!", Enqueued { id })
}

async fn transfer_status(
    Extension(manager): Extension<TransferManager>,
    Path(id): Path<Uuid>,
) -> ApiResult<Transfer> {
    ok("ok", manager.status(id)?)
}

async fn pause_transfer(
    Extension(manager): Extension<TransferManager>,
    Path(id): Path<Uuid>,
) -> ApiResult<Transfer> {
    ok("Transfer paused", manager.pause(id)?)
}

async fn resume_transfer(
    Extension(manager): Extension<TransferManager>,
    Path(id): Path<Uuid>,
) -> ApiResult<Transfer> {
    ok("Transfer resumed", manager.resume(id)?)
}

async fn cancel_transfer(
    Extension(manager): Extension<TransferManager>,
    Path(id): Path<Uuid>,
) -> ApiResult<Transfer> {
    ok("Transfer canceled", manager.cancel(id).await?)
}

async fn prune_transfers(Extension(manager): Extension<TransferManager>) -> ApiResult<Pruned> {
    ok("ok", Pruned { removed: manager.prune_finished() })
}

async fn generate_preview(
    Extension(manager): Extension<TransferManager>,
    Path(id): Path<Uuid>,
) -> ApiResult<PreviewOutcome> {
    ok("Preview ready", manager.generate_preview(id).await?)
}

async fn cleanup(
    Extension(manager): Extension<TransferManager>,
    Json(body): Json<CleanupBody>,
) -> ApiResult<CleanupReport> {
    let report = manager.cleanup(&body.path, body.backends.as_deref()).await;
    ok("Cleanup finished", report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::download::build_manager;
    use crate::download::config::Config;
    use crate::download::source::memory::MemorySource;
    use crate::jobs::preview::fake::FakeRenderer;

    struct Server {
        _dirs: (tempfile::TempDir, tempfile::TempDir),
        base: String,
        client: reqwest::Client,
    }

    async fn start() -> Server {
        start_with(MemorySource::new(vec![7u8; 2048]).stalling_after(1024)).await
    }

    async fn start_with(source: MemorySource) -> Server {
        let work = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        let config = Config {
            work_dir: work.path().to_path_buf(),
            library_dir: library.path().to_path_buf(),
            state_file: None,
            ..Config::default()
        };
        let renderer = Arc::new(FakeRenderer::default());
        let (manager, scheduler) = build_manager(config, Arc::new(source), renderer).unwrap();
        tokio::spawn(async move { scheduler.run().await });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, router(manager)).await });

        Server { _dirs: (work, library), base, client: reqwest::Client::new() }
    }

    impl Server {
        async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
            let url = format!("{}{}", self.base, path);
            let response = self.client.post(url).json(&body).send().await.unwrap();
            (response.status(), response.json().await.unwrap())
        }

        async fn get(&self, path: &str) -> (StatusCode, Value) {
            let response = self.client.get(format!("{}{}", self.base, path)).send().await.unwrap();
            (response.status(), response.json().await.unwrap())
        }
    }

    #[tokio::test]
    async fn should_enqueue_pause_and_cancel() {
        let server = start().await;

        let body = json!({ "url": "http://localhost/a.bin", "destination": "a.bin" });
        let (status, body) = server.post("/transfers", body).await;
        assert_eq!(status, StatusCode::OK);
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let mut downloading = false;
        for _ in 0..200 {
            let (_, body) = server.get(&format!("/transfers/{id}")).await;
            if body["data"]["bytes_transferred"] == 1024 {
                downloading = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(downloading);

        let (status, body) = server.post(&format!("/transfers/{id}/pause"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "paused");

        let (status, body) = server.post(&format!("/transfers/{id}/cancel"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "canceled");

        let (status, body) = server.post(&format!("/transfers/{id}/resume"), json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "Invalid transition: canceled -> downloading");

        let (_, body) = server.get("/transfers").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn should_report_preview_outcome() {
        let server = start_with(MemorySource::new(vec![7u8; 512]).with_content_type("image/png")).await;

        let body = json!({ "url": "http://localhost/a.png", "destination": "a.png" });
        let (_, body) = server.post("/transfers", body).await;
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let mut file_id = None;
        for _ in 0..200 {
            let (_, body) = server.get(&format!("/transfers/{id}")).await;
            if body["data"]["status"] == "completed" {
                file_id = body["data"]["file_id"].as_str().map(str::to_string);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let file_id = file_id.unwrap();

        // the pipeline rendered the preview already
        let (status, body) = server.post(&format!("/files/{file_id}/preview"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Preview ready");
        assert_eq!(body["data"], "already_present");
    }

    #[tokio::test]
    async fn should_map_errors_to_status_codes() {
        let server = start().await;

        let (status, _) = server.get(&format!("/transfers/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let body = json!({ "url": "http://localhost/a", "destination": "/etc/a" });
        let (status, _) = server.post("/transfers", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = server.post(&format!("/files/{}/preview", Uuid::new_v4()), json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cleanup_always_reports() {
        let server = start().await;

        let body = json!({ "path": "missing.bin", "backends": ["library", "s3"] });
        let (status, body) = server.post("/cleanup", body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["outcomes"][0]["result"]["status"], "missing");
        assert_eq!(body["data"]["outcomes"][1]["result"]["status"], "failed");
    }
}
