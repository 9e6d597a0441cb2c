use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Multipart, Path as HttpPath, State, multipart::MultipartError},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use ulid::Ulid;

use crate::courier::OutboxCourier;
use crate::fetch::DescriptorError;
use crate::fetch::descriptor::stage_upload;
use crate::queue::{JobQueueManager, JobSnapshot, JobStatus, SubmitError};
use crate::request::{Request, RequesterId, Source, ValidationError};

#[derive(Clone)]
pub struct AppState {
    pub manager: JobQueueManager<OutboxCourier>,
    pub courier: Arc<OutboxCourier>,
    /// Where uploaded descriptors are staged
    pub download_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.into()),
            data: Some(data),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("Invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("Missing form field {0:?}")]
    MissingField(&'static str),

    #[error("Invalid requester id {0:?}")]
    InvalidRequester(String),

    #[error("Invalid job id {0:?}")]
    InvalidJobId(String),

    #[error("No outstanding job {0}")]
    JobNotFound(Ulid),

    #[error("Failed to store upload: {0}")]
    Staging(#[from] DescriptorError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_)
            | Self::Multipart(_)
            | Self::MissingField(_)
            | Self::InvalidRequester(_)
            | Self::InvalidJobId(_) => StatusCode::BAD_REQUEST,
            Self::Submit(SubmitError::Busy { .. }) => StatusCode::CONFLICT,
            Self::Submit(SubmitError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            Self::JobNotFound(_) => StatusCode::NOT_FOUND,
            Self::Staging(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = self.to_string();
        if status.is_server_error() {
            error!(error = %message, "Request failed");
        } else {
            warn!(status = %status, error = %message, "Request rejected");
        }
        (
            status,
            Json(ApiResponse::<()> {
                status: "error".to_string(),
                message: Some(message),
                data: None,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub requester_id: RequesterId,
    pub locator: String,
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub job_id: Ulid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .nest("/api", api_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .route("/requests", post(submit_request))
        .route("/requests/upload", post(upload_descriptor))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", delete(cancel_job))
}

async fn liveness() -> &'static str {
    "Torrent courier is running ✅"
}

fn accepted(request: Request, state: &AppState) -> ApiResult<Response> {
    let ticket = state.manager.submit(request)?;
    info!(job = %ticket.id, "Request accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(
            "Request queued",
            Accepted {
                job_id: ticket.id,
                status: Some(ticket.status()),
            },
        )),
    )
        .into_response())
}

#[instrument(skip_all, fields(requester = body.requester_id))]
async fn submit_request(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<Response> {
    let source = Source::parse(&body.locator)?;
    accepted(Request::new(body.requester_id, source), &state)
}

#[instrument(skip_all)]
async fn upload_descriptor(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut requester_id = None;
    let mut file = None;

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("requester_id") => {
                let text = field.text().await?;
                let id = text
                    .trim()
                    .parse::<RequesterId>()
                    .map_err(|_| ApiError::InvalidRequester(text.clone()))?;
                requester_id = Some(id);
            }
            Some("file") => {
                let name = field.file_name().unwrap_or_default().to_string();
                Source::check_upload_name(&name)?;
                file = Some((name, field.bytes().await?));
            }
            _ => {}
        }
    }

    let requester_id = requester_id.ok_or(ApiError::MissingField("requester_id"))?;
    let (name, bytes) = file.ok_or(ApiError::MissingField("file"))?;
    if bytes.is_empty() {
        return Err(ValidationError::EmptyDescriptor.into());
    }

    let staged = stage_upload(&state.download_dir, requester_id, &bytes).await?;
    info!(requester = requester_id, file = %name, staged = ?staged, "Descriptor uploaded");

    let request = Request::new(requester_id, Source::DescriptorFile(staged.clone()));
    accepted(request, &state).inspect_err(|_| {
        // Nobody else knows about the staged file yet
        let _ = std::fs::remove_file(&staged);
    })
}

async fn list_jobs(State(state): State<AppState>) -> Json<ApiResponse<Vec<JobSnapshot>>> {
    let jobs: Vec<JobSnapshot> = state
        .manager
        .list_jobs()
        .into_iter()
        .map(|mut job| {
            job.message = state.courier.status(&job.id).map(|entry| entry.text);
            job
        })
        .collect();
    Json(ApiResponse::success(format!("{} jobs", jobs.len()), jobs))
}

#[instrument(skip_all, fields(job = %id))]
async fn cancel_job(
    State(state): State<AppState>,
    HttpPath(id): HttpPath<String>,
) -> ApiResult<Json<ApiResponse<Accepted>>> {
    let job_id = Ulid::from_string(&id).map_err(|_| ApiError::InvalidJobId(id.clone()))?;
    if !state.manager.cancel(job_id).await {
        return Err(ApiError::JobNotFound(job_id));
    }
    Ok(Json(ApiResponse::success(
        "Job canceled",
        Accepted {
            job_id,
            status: None,
        },
    )))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::BusyPolicy;
    use crate::fetch::{Aria2Options, ProcessRegistry};
    use crate::queue::QueueSettings;
    use axum::body::{Body, to_bytes};
    use http::{Request as HttpRequest, header};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tower::ServiceExt;

    const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef&dn=test";
    const BOUNDARY: &str = "courier-test-boundary";

    fn state(root: &std::path::Path) -> AppState {
        // A fetch tool that never finishes keeps submitted jobs outstanding
        let program = root.join("hang");
        std::fs::write(&program, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let download_dir = root.join("downloads");
        std::fs::create_dir_all(&download_dir).unwrap();
        let settings = QueueSettings {
            download_dir: download_dir.clone(),
            busy_policy: BusyPolicy::Reject,
            cooldown: Duration::ZERO,
            aria2: Aria2Options {
                program,
                trackers: Vec::new(),
            },
            ..Default::default()
        };

        let courier = Arc::new(OutboxCourier::new(root.join("outbox"), 1024 * 1024));
        let manager =
            JobQueueManager::new(courier.clone(), Arc::new(ProcessRegistry::new()), settings)
                .unwrap();
        AppState {
            manager,
            courier,
            download_dir,
        }
    }

    fn json_request(body: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::post("/api/requests")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn upload_request(requester: &str, file_name: &str, contents: &[u8]) -> HttpRequest<Body> {
        let mut body = Vec::new();
        body.extend(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"requester_id\"\r\n\r\n{requester}\r\n"
            )
            .as_bytes(),
        );
        body.extend(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/x-bittorrent\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend(contents);
        body.extend(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        HttpRequest::post("/api/requests/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_liveness() {
        let root = tempfile::tempdir().unwrap();
        let app = create_router(state(root.path()));
        let response = app
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_validates_and_rejects_busy_requester() {
        let root = tempfile::tempdir().unwrap();
        let state = state(root.path());
        let app = create_router(state.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                serde_json::json!({"requester_id": 1, "locator": "https://example.com/x.zip"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(json_request(
                serde_json::json!({"requester_id": 1, "locator": MAGNET}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        let job_id = body["data"]["job_id"].as_str().unwrap().to_string();
        assert!(body["data"]["status"]["state"].is_string());

        let response = app
            .clone()
            .oneshot(json_request(
                serde_json::json!({"requester_id": 1, "locator": MAGNET}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(HttpRequest::get("/api/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["data"][0]["id"], job_id.as_str());
        assert_eq!(body["data"][0]["requester_id"], 1);

        let response = app
            .oneshot(
                HttpRequest::delete(format!("/api/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        state.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_or_malformed_job() {
        let root = tempfile::tempdir().unwrap();
        let app = create_router(state(root.path()));

        let response = app
            .clone()
            .oneshot(
                HttpRequest::delete("/api/jobs/not-a-ulid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                HttpRequest::delete(format!("/api/jobs/{}", Ulid::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_descriptor() {
        let root = tempfile::tempdir().unwrap();
        let state = state(root.path());
        let app = create_router(state.clone());

        let response = app
            .clone()
            .oneshot(upload_request("5", "notes.txt", b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(upload_request("five", "show.torrent", b"d4:infoe"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(upload_request("5", "show.torrent", b"d4:infoe"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let jobs = state.manager.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert!(matches!(jobs[0].source, Source::DescriptorFile(_)));
        state.manager.shutdown().await;
    }
}
