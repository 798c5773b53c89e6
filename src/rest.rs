//! A HTTP API for uploading model updates and fetching the served model.

use std::{convert::Infallible, path::Path};

use bytes::Buf;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};
use warp::{
    http::StatusCode,
    multipart::{FormData, Part},
    reply::{Reply, Response},
    Filter,
};

use crate::{
    settings::ApiSettings,
    state_machine::{
        EventListener,
        EventSubscriber,
        LiveModelUpdate,
        TriggerError,
        TriggerHandle,
    },
    storage::{ArtifactStore, MetadataStorage, VersionRecord},
};

/// The name of the multipart field carrying an uploaded update.
const UPDATE_FIELD: &str = "model";

/// Update extensions clients are expected to upload. Others are accepted nonetheless.
const KNOWN_EXTENSIONS: [&str; 3] = ["onnx", "pt", "tflite"];

/// What the REST handlers need from the rest of the service.
#[derive(Clone)]
pub struct RestContext<S> {
    store: ArtifactStore,
    metadata: S,
    live_model: EventListener<LiveModelUpdate>,
    trigger: TriggerHandle,
    model_name: String,
}

impl<S> RestContext<S>
where
    S: MetadataStorage,
{
    pub fn new(
        store: ArtifactStore,
        metadata: S,
        events: &EventSubscriber,
        trigger: TriggerHandle,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            metadata,
            live_model: events.live_model_listener(),
            trigger,
            model_name: model_name.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    message: &'static str,
    id: String,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct MetricPoint {
    timestamp: DateTime<Utc>,
    version: String,
    accuracy: f64,
    loss: f64,
}

#[derive(Debug, Serialize, PartialEq)]
struct ModelInfo {
    name: String,
    version: String,
    size: u64,
}

impl From<VersionRecord> for ModelInfo {
    fn from(record: VersionRecord) -> Self {
        Self {
            name: record.name,
            version: record.version,
            size: record.size,
        }
    }
}

/// Starts a HTTP server at the configured address.
///
/// # Errors
/// Fails if the address cannot be bound.
pub async fn serve<S>(api_settings: ApiSettings, context: RestContext<S>) -> Result<(), RestError>
where
    S: MetadataStorage,
{
    let routes = routes(api_settings.max_upload_size, context);
    let (address, server) = warp::serve(routes).try_bind_ephemeral(api_settings.bind_address)?;
    info!("REST server listening on {}", address);
    server.await;
    Ok(())
}

/// The routes of the REST server.
///
/// * `POST /fl/update`: stages the multipart field `model` as an update.
/// * `GET /fl/global`: the artifact the live model pointer designates.
/// * `GET /fl/metrics`: the metric history, oldest first.
/// * `POST /fl/aggregate`: requests an immediate aggregation pass.
/// * `GET /models/{name}/info`: the registered version of a model.
/// * `GET /models/{name}/download`: the content of the live slot.
pub fn routes<S>(
    max_upload_size: u64,
    context: RestContext<S>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone
where
    S: MetadataStorage,
{
    let upload = warp::path!("fl" / "update")
        .and(warp::post())
        .and(warp::multipart::form().max_length(max_upload_size))
        .and(with_context(context.clone()))
        .and_then(handle_upload);

    let global = warp::path!("fl" / "global")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(handle_global);

    let metrics = warp::path!("fl" / "metrics")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(handle_metrics);

    let aggregate = warp::path!("fl" / "aggregate")
        .and(warp::post())
        .and(with_context(context.clone()))
        .and_then(handle_aggregate);

    let info = warp::path!("models" / String / "info")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(handle_model_info);

    let download = warp::path!("models" / String / "download")
        .and(warp::get())
        .and(with_context(context))
        .and_then(handle_model_download);

    upload
        .or(global)
        .or(metrics)
        .or(aggregate)
        .or(info)
        .or(download)
        .recover(handle_reject)
        .with(warp::log("http"))
}

/// Stages an uploaded update. The update is not validated.
async fn handle_upload<S>(form: FormData, context: RestContext<S>) -> Result<Response, Infallible>
where
    S: MetadataStorage,
{
    let (file_name, data) = match read_update(form).await {
        Ok(Some(update)) => update,
        Ok(None) => {
            return Ok(message(
                StatusCode::BAD_REQUEST,
                format!("no `{}` file provided", UPDATE_FIELD),
            ))
        }
        Err(err) => {
            warn!("failed to read the uploaded form: {}", err);
            return Ok(message(StatusCode::BAD_REQUEST, "malformed upload"));
        }
    };

    let known = Path::new(&file_name)
        .extension()
        .map(|ext| KNOWN_EXTENSIONS.iter().any(|known| ext == *known))
        .unwrap_or(false);
    if !known {
        debug!("accepting update {} with an unexpected extension", file_name);
    }

    match context.store.stage(&file_name, &data).await {
        Ok(update) => {
            info!("received update {} ({} bytes)", update.name(), data.len());
            Ok(warp::reply::json(&UploadResponse {
                message: "update received",
                id: update.name(),
            })
            .into_response())
        }
        Err(err) => {
            error!("failed to stage update {}: {}", file_name, err);
            Ok(message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to store the update",
            ))
        }
    }
}

/// Reads the file name and content of the update field, skipping other fields.
///
/// An update field that carries no file name is not a file and counts as missing.
async fn read_update(mut form: FormData) -> Result<Option<(String, Vec<u8>)>, warp::Error> {
    while let Some(part) = form.try_next().await? {
        if part.name() != UPDATE_FIELD {
            continue;
        }
        let file_name = match part.filename() {
            Some(file_name) => file_name.to_string(),
            None => return Ok(None),
        };
        let data = read_part(part).await?;
        return Ok(Some((file_name, data)));
    }
    Ok(None)
}

async fn read_part(part: Part) -> Result<Vec<u8>, warp::Error> {
    part.stream()
        .try_fold(Vec::new(), |mut data, chunk| async move {
            data.extend_from_slice(chunk.chunk());
            Ok(data)
        })
        .await
}

/// Responds with the artifact the live model pointer designates.
async fn handle_global<S>(context: RestContext<S>) -> Result<Response, Infallible> {
    let path = match context.live_model.get_latest().event {
        LiveModelUpdate::New(path) => path,
        LiveModelUpdate::Invalidate => {
            return Ok(message(StatusCode::NOT_FOUND, "no global model available"))
        }
    };
    Ok(artifact(&path).await)
}

/// Responds with the metric history.
async fn handle_metrics<S>(mut context: RestContext<S>) -> Result<Response, Infallible>
where
    S: MetadataStorage,
{
    Ok(match context.metadata.metrics().await {
        Ok(metrics) => {
            let points: Vec<MetricPoint> = metrics
                .into_iter()
                .map(|metric| MetricPoint {
                    timestamp: metric.created_at,
                    version: metric.version,
                    accuracy: metric.accuracy,
                    loss: metric.loss,
                })
                .collect();
            warp::reply::json(&points).into_response()
        }
        Err(err) => {
            warn!("failed to handle metrics request: {:?}", err);
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    })
}

/// Requests an aggregation pass.
async fn handle_aggregate<S>(context: RestContext<S>) -> Result<Response, Infallible> {
    Ok(match context.trigger.trigger() {
        Ok(()) => message(StatusCode::ACCEPTED, "aggregation requested"),
        Err(err @ TriggerError::Pending) => message(StatusCode::ACCEPTED, err.to_string()),
        Err(err @ TriggerError::Stopped) => {
            message(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
    })
}

/// Responds with the registered version of a model.
///
/// A model that was never registered is described by the live slot, if it is the served one.
async fn handle_model_info<S>(
    name: String,
    mut context: RestContext<S>,
) -> Result<Response, Infallible>
where
    S: MetadataStorage,
{
    match context.metadata.version(&name).await {
        Ok(Some(record)) => {
            return Ok(warp::reply::json(&ModelInfo::from(record)).into_response())
        }
        Ok(None) => {}
        Err(err) => {
            warn!("failed to handle model info request: {:?}", err);
            return Ok(empty(StatusCode::INTERNAL_SERVER_ERROR));
        }
    }

    if name != context.model_name {
        return Ok(message(StatusCode::NOT_FOUND, "unknown model"));
    }
    Ok(match context.store.live().await {
        Ok(Some(live)) => warp::reply::json(&ModelInfo {
            name,
            version: DateTime::<Utc>::from(live.modified)
                .format("%Y%m%d%H%M%S")
                .to_string(),
            size: live.size,
        })
        .into_response(),
        Ok(None) => message(StatusCode::NOT_FOUND, "unknown model"),
        Err(err) => {
            warn!("failed to handle model info request: {}", err);
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    })
}

/// Responds with the content of the live slot.
async fn handle_model_download<S>(
    name: String,
    context: RestContext<S>,
) -> Result<Response, Infallible> {
    if name != context.model_name {
        return Ok(message(StatusCode::NOT_FOUND, "unknown model"));
    }
    Ok(artifact(context.store.live_path()).await)
}

async fn artifact(path: &Path) -> Response {
    match fs::read(path).await {
        Ok(data) => {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let reply = warp::reply::with_header(data, "Content-Type", "application/octet-stream");
            warp::reply::with_header(
                reply,
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", file_name),
            )
            .into_response()
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            message(StatusCode::NOT_FOUND, "model not found")
        }
        Err(err) => {
            warn!("failed to read {}: {}", path.display(), err);
            empty(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn message(status: StatusCode, message: impl Into<String>) -> Response {
    let body = MessageResponse {
        message: message.into(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn empty(status: StatusCode) -> Response {
    warp::reply::with_status(Vec::new(), status).into_response()
}

/// Converts the shared context into a `warp` filter.
fn with_context<S>(
    context: RestContext<S>,
) -> impl Filter<Extract = (RestContext<S>,), Error = Infallible> + Clone
where
    S: MetadataStorage,
{
    warp::any().map(move || context.clone())
}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: warp::Rejection) -> Result<impl Reply, Infallible> {
    let code = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        StatusCode::PAYLOAD_TOO_LARGE
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        StatusCode::UNSUPPORTED_MEDIA_TYPE
    } else if err.find::<warp::reject::MissingHeader>().is_some()
        || err.find::<warp::reject::InvalidHeader>().is_some()
    {
        StatusCode::BAD_REQUEST
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        StatusCode::LENGTH_REQUIRED
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        error!("unhandled rejection: {:?}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    // reply with empty body; the status code is the interesting part
    Ok(warp::reply::with_status(Vec::new(), code))
}

#[derive(Debug, Error)]
/// Errors of the rest server.
pub enum RestError {
    #[error("failed to bind the REST server: {0}")]
    Bind(#[from] warp::Error),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::Value;

    use super::*;
    use crate::{
        state_machine::{
            tests::utils::{FakeEvaluator, FakeMerger, Fixture},
            Scheduler,
        },
        storage::{
            artifacts::tests::set_modified,
            metadata::tests::{metric_record, version_record},
            InMemory,
        },
    };

    const BOUNDARY: &str = "chithram-boundary";

    struct Api {
        fixture: Fixture,
        context: RestContext<InMemory>,
        // keeps the trigger channel open
        scheduler: Option<Scheduler<FakeMerger, FakeEvaluator, InMemory>>,
    }

    impl Api {
        async fn new(fixture: Fixture) -> Self {
            let (aggregator, subscriber, _backfill) = fixture.init().await;
            let (scheduler, trigger) = Scheduler::new(aggregator, Duration::from_secs(3600));
            let context = RestContext::new(
                fixture.store.clone(),
                fixture.metadata.clone(),
                &subscriber,
                trigger,
                fixture.aggregation.model_name.clone(),
            );
            Self {
                fixture,
                context,
                scheduler: Some(scheduler),
            }
        }

        async fn get(&self, path: &str) -> warp::http::Response<Bytes> {
            warp::test::request()
                .method("GET")
                .path(path)
                .reply(&routes(1024, self.context.clone()))
                .await
        }

        async fn post(&self, path: &str) -> warp::http::Response<Bytes> {
            warp::test::request()
                .method("POST")
                .path(path)
                .reply(&routes(1024, self.context.clone()))
                .await
        }

        async fn upload(
            &self,
            field: &str,
            file_name: &str,
            content: &str,
        ) -> warp::http::Response<Bytes> {
            let body = format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n{content}\r\n--{b}--\r\n",
                b = BOUNDARY,
                field = field,
                file = file_name,
                content = content,
            );
            warp::test::request()
                .method("POST")
                .path("/fl/update")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(body)
                .reply(&routes(1024, self.context.clone()))
                .await
        }
    }

    fn json(response: &warp::http::Response<Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[tokio::test]
    async fn test_upload_stages_update() {
        let api = Api::new(Fixture::new().await).await;

        let response = api.upload("model", "client.onnx", "weights").await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json(&response);
        assert_eq!(body["message"], "update received");
        let id = body["id"].as_str().unwrap();
        assert!(id.starts_with("update_"));
        assert!(id.ends_with("_client.onnx"));
        assert_eq!(api.fixture.staging_names(), vec![id.to_string()]);
        assert_eq!(
            std::fs::read_to_string(api.fixture.storage.staging_dir.join(id)).unwrap(),
            "weights"
        );
    }

    #[tokio::test]
    async fn test_upload_accepts_unexpected_extension() {
        let api = Api::new(Fixture::new().await).await;

        let response = api.upload("model", "../client.bin", "weights").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(json(&response)["id"]
            .as_str()
            .unwrap()
            .ends_with("_client.bin"));
        assert_eq!(api.fixture.staging_names().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_without_model_field() {
        let api = Api::new(Fixture::new().await).await;

        let response = api.upload("weights", "client.onnx", "weights").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(api.fixture.staging_names().is_empty());
    }

    #[tokio::test]
    async fn test_upload_requires_multipart() {
        let api = Api::new(Fixture::new().await).await;
        assert_eq!(
            api.post("/fl/update").await.status(),
            StatusCode::LENGTH_REQUIRED
        );
        assert!(api.fixture.staging_names().is_empty());
    }

    #[tokio::test]
    async fn test_upload_without_file() {
        let api = Api::new(Fixture::new().await).await;
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\n\
             weights\r\n--{b}--\r\n",
            b = BOUNDARY,
        );

        let response = warp::test::request()
            .method("POST")
            .path("/fl/update")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(body)
            .reply(&routes(1024, api.context.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(api.fixture.staging_names().is_empty());
    }

    #[tokio::test]
    async fn test_global_serves_resolved_model() {
        let fixture = Fixture::new().await;
        fixture.write_archived("global_model_1.onnx", "merged", 1_000);
        let api = Api::new(fixture).await;

        let response = api.get("/fl/global").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"merged");
        assert_eq!(
            response.headers()["Content-Type"],
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn test_global_without_model() {
        let api = Api::new(Fixture::new().await).await;
        // the pointer falls back to a default model that does not exist
        assert_eq!(api.get("/fl/global").await.status(), StatusCode::NOT_FOUND);

        std::fs::write(&api.fixture.storage.default_model, "default").unwrap();
        let response = api.get("/fl/global").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"default");
    }

    #[tokio::test]
    async fn test_metrics_are_ordered_by_time() {
        let api = Api::new(Fixture::new().await).await;
        let mut metadata = api.fixture.metadata.clone();
        metadata.append_metric(&metric_record("late", 10)).await.unwrap();
        metadata.append_metric(&metric_record("early", 0)).await.unwrap();

        let response = api.get("/fl/metrics").await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json(&response);
        let points = body.as_array().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0]["version"], "early");
        assert_eq!(points[1]["version"], "late");
        assert_eq!(points[0]["accuracy"], 0.5);
        assert_eq!(points[0]["loss"], 0.25);
        assert!(points[0]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_aggregate_requests_a_pass() {
        let mut api = Api::new(Fixture::new().await).await;

        assert_eq!(api.post("/fl/aggregate").await.status(), StatusCode::ACCEPTED);
        // a pending request is not queued twice
        assert_eq!(api.post("/fl/aggregate").await.status(), StatusCode::ACCEPTED);

        api.scheduler.take();
        assert_eq!(
            api.post("/fl/aggregate").await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_model_info() {
        let fixture = Fixture::new().await;
        fixture.write_live("v0");
        set_modified(&fixture.storage.live_path, 1_700_000_000);
        let api = Api::new(fixture).await;

        // seeded from the live slot at startup
        let response = api.get("/models/face-detection/info").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json(&response),
            serde_json::json!({"name": "face-detection", "version": "20231114221320", "size": 2})
        );

        let mut metadata = api.fixture.metadata.clone();
        metadata
            .set_version(&version_record("other", "20240101000000"))
            .await
            .unwrap();
        let response = api.get("/models/other/info").await;
        assert_eq!(json(&response)["version"], "20240101000000");
        assert_eq!(json(&response)["size"], 42);

        assert_eq!(
            api.get("/models/unknown/info").await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_model_info_falls_back_to_live_slot() {
        let api = Api::new(Fixture::new().await).await;
        assert_eq!(
            api.get("/models/face-detection/info").await.status(),
            StatusCode::NOT_FOUND
        );

        // the live slot appears after the registry was seeded
        api.fixture.write_live("v1!");
        let response = api.get("/models/face-detection/info").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(&response)["size"], 3);
    }

    #[tokio::test]
    async fn test_model_download() {
        let fixture = Fixture::new().await;
        fixture.write_live("v0");
        let api = Api::new(fixture).await;

        let response = api.get("/models/face-detection/download").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"v0");

        assert_eq!(
            api.get("/models/other/download").await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let api = Api::new(Fixture::new().await).await;
        assert_eq!(api.get("/fl/unknown").await.status(), StatusCode::NOT_FOUND);
    }
}
