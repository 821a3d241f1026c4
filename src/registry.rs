//! MLflow model registry client

use crate::config::RegistryConfig;
use crate::error::LoadError;
use futures::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Error code MLflow returns when creating something that exists
const RESOURCE_ALREADY_EXISTS: &str = "RESOURCE_ALREADY_EXISTS";

/// A registered model version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    /// MLflow reports versions as decimal strings
    pub version: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ModelVersion {
    pub fn number(&self) -> u64 {
        self.version.parse().unwrap_or(0)
    }

    /// Versions still registering or that failed to register are skipped
    fn is_ready(&self) -> bool {
        self.status.as_deref().map_or(true, |s| s == "READY")
    }
}

/// Tracking run that owns uploaded artifacts
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub artifact_uri: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    model_versions: Vec<ModelVersion>,
}

#[derive(Debug, Deserialize)]
struct DownloadUriResponse {
    artifact_uri: String,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: Run,
}

#[derive(Debug, Deserialize)]
struct Run {
    info: RunInfo,
}

#[derive(Debug, Deserialize)]
struct CreateVersionResponse {
    model_version: ModelVersion,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
}

/// Where a version's artifact directory lives
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactLocation {
    /// Served through the tracking server's artifact proxy
    Proxy(String),
    Local(PathBuf),
}

impl ArtifactLocation {
    pub fn parse(uri: &str) -> Result<Self, LoadError> {
        if let Some(rest) = uri.strip_prefix("mlflow-artifacts:") {
            // mlflow-artifacts://host:port/path or mlflow-artifacts:/path
            let path = match rest.strip_prefix("//") {
                Some(authority_and_path) => authority_and_path
                    .find('/')
                    .map(|idx| &authority_and_path[idx..])
                    .unwrap_or(""),
                None => rest,
            };
            return Ok(Self::Proxy(path.trim_matches('/').to_string()));
        }
        if let Some(rest) = uri.strip_prefix("file://") {
            return Ok(Self::Local(PathBuf::from(rest)));
        }
        if let Some(rest) = uri.strip_prefix("file:") {
            return Ok(Self::Local(PathBuf::from(rest)));
        }
        if let Some(scheme) = uri_scheme(uri) {
            return Err(LoadError::artifact(format!(
                "unsupported artifact scheme '{}' in '{}'",
                scheme, uri
            )));
        }
        Ok(Self::Local(PathBuf::from(uri)))
    }

    /// Location of a subdirectory
    pub fn join(&self, child: &str) -> Self {
        match self {
            Self::Proxy(dir) if dir.is_empty() => Self::Proxy(child.to_string()),
            Self::Proxy(dir) => Self::Proxy(format!("{}/{}", dir, child)),
            Self::Local(dir) => Self::Local(dir.join(child)),
        }
    }
}

/// `scheme` of a `scheme:rest` URI: a letter followed by letters, digits,
/// `+`, `.` or `-`
fn uri_scheme(uri: &str) -> Option<&str> {
    let (scheme, _) = uri.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
    {
        Some(scheme)
    } else {
        None
    }
}

fn proxy_path(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        format!("/api/2.0/mlflow-artifacts/artifacts/{}", file)
    } else {
        format!("/api/2.0/mlflow-artifacts/artifacts/{}/{}", dir, file)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Client for the subset of the MLflow REST API the service and the
/// registration tool need
pub struct MlflowRegistry {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl MlflowRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: &RegistryConfig) -> Self {
        Self {
            client,
            base_url: config.tracking_uri.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    fn post(&self, path: &str, body: serde_json::Value) -> RequestBuilder {
        self.request(Method::POST, path).json(&body)
    }

    /// Resolve the highest ready version registered under `name`.
    pub async fn latest_version(&self, name: &str) -> Result<ModelVersion, LoadError> {
        let filter = format!("name='{}'", name);
        let response: SearchResponse = self
            .get("/api/2.0/mlflow/model-versions/search")
            .query(&[("filter", filter.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(model = %name, candidates = response.model_versions.len(), "Registry search complete");

        response
            .model_versions
            .into_iter()
            .filter(ModelVersion::is_ready)
            .max_by_key(ModelVersion::number)
            .ok_or_else(|| LoadError::NotFound {
                name: name.to_string(),
            })
    }

    /// Artifact directory of a version
    pub async fn artifact_location(
        &self,
        version: &ModelVersion,
    ) -> Result<ArtifactLocation, LoadError> {
        let response: DownloadUriResponse = self
            .get("/api/2.0/mlflow/model-versions/get-download-uri")
            .query(&[
                ("name", version.name.as_str()),
                ("version", version.version.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(uri = %response.artifact_uri, "Resolved artifact location");
        ArtifactLocation::parse(&response.artifact_uri)
    }

    /// Copy `file` from the artifact directory to `dest`.
    ///
    /// Returns `Ok(false)` when the artifact has no such file.
    pub async fn fetch_file(
        &self,
        location: &ArtifactLocation,
        file: &str,
        dest: &Path,
    ) -> Result<bool, LoadError> {
        match location {
            ArtifactLocation::Local(dir) => {
                let source = dir.join(file);
                if !tokio::fs::try_exists(&source).await? {
                    return Ok(false);
                }
                copy_atomically(&source, dest).await?;
            }
            ArtifactLocation::Proxy(dir) => {
                let response = self.get(&proxy_path(dir, file)).send().await?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(false);
                }
                download_atomically(response.error_for_status()?, dest).await?;
            }
        }
        info!(file = %file, dest = %dest.display(), "Fetched artifact file");
        Ok(true)
    }

    /// Start a tracking run in `experiment_id`.
    pub async fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo, LoadError> {
        let response: RunResponse = self
            .post(
                "/api/2.0/mlflow/runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": now_millis(),
                }),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(run_id = %response.run.info.run_id, "Created tracking run");
        Ok(response.run.info)
    }

    /// End a run with `status` (`FINISHED` or `FAILED`).
    pub async fn end_run(&self, run_id: &str, status: &str) -> Result<(), LoadError> {
        self.post(
            "/api/2.0/mlflow/runs/update",
            json!({
                "run_id": run_id,
                "status": status,
                "end_time": now_millis(),
            }),
        )
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    /// Create the registered model unless it already exists.
    pub async fn ensure_registered_model(&self, name: &str) -> Result<(), LoadError> {
        let response = self
            .post("/api/2.0/mlflow/registered-models/create", json!({"name": name}))
            .send()
            .await?;
        if response.status() == StatusCode::BAD_REQUEST {
            let bytes = response.bytes().await?;
            let error: ApiError = serde_json::from_slice(&bytes).unwrap_or_default();
            if error.error_code == RESOURCE_ALREADY_EXISTS {
                debug!(model = %name, "Registered model already exists");
                return Ok(());
            }
            return Err(LoadError::artifact(format!(
                "failed to create registered model '{}': {}",
                name,
                String::from_utf8_lossy(&bytes)
            )));
        }
        response.error_for_status()?;
        info!(model = %name, "Created registered model");
        Ok(())
    }

    /// Register the artifact directory at `source` as a new version.
    pub async fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: &str,
    ) -> Result<ModelVersion, LoadError> {
        let response: CreateVersionResponse = self
            .post(
                "/api/2.0/mlflow/model-versions/create",
                json!({"name": name, "source": source, "run_id": run_id}),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(
            model = %name,
            version = %response.model_version.version,
            "Created model version"
        );
        Ok(response.model_version)
    }

    /// Upload `source` as `file` inside the artifact directory.
    pub async fn upload_file(
        &self,
        location: &ArtifactLocation,
        file: &str,
        source: &Path,
    ) -> Result<(), LoadError> {
        match location {
            ArtifactLocation::Local(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                copy_atomically(source, &dir.join(file)).await?;
            }
            ArtifactLocation::Proxy(dir) => {
                let handle = tokio::fs::File::open(source).await?;
                let len = handle.metadata().await?.len();
                self.request(Method::PUT, &proxy_path(dir, file))
                    .header(CONTENT_LENGTH, len)
                    .body(Body::wrap_stream(ReaderStream::new(handle)))
                    .send()
                    .await?
                    .error_for_status()?;
            }
        }
        info!(file = %file, source = %source.display(), "Uploaded artifact file");
        Ok(())
    }
}

/// Temporary sibling written before the final rename, so a crash never
/// leaves a truncated file at `dest`
fn partial_path(dest: &Path) -> PathBuf {
    dest.with_extension("partial")
}

/// Stream a response body to `dest` through a temporary sibling.
pub(crate) async fn download_atomically(response: Response, dest: &Path) -> Result<u64, LoadError> {
    let tmp = partial_path(dest);
    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);
    tokio::fs::rename(&tmp, dest).await?;
    Ok(written)
}

async fn copy_atomically(source: &Path, dest: &Path) -> std::io::Result<()> {
    let tmp = partial_path(dest);
    tokio::fs::copy(source, &tmp).await?;
    tokio::fs::rename(&tmp, dest).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Query,
        http::StatusCode as AxumStatus,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::collections::HashMap;

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn registry(base_url: String) -> MlflowRegistry {
        MlflowRegistry::new(&RegistryConfig {
            tracking_uri: base_url,
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_artifact_locations() {
        assert_eq!(
            ArtifactLocation::parse("mlflow-artifacts:/1/abc/artifacts/sam3_model").unwrap(),
            ArtifactLocation::Proxy("1/abc/artifacts/sam3_model".to_string())
        );
        assert_eq!(
            ArtifactLocation::parse("mlflow-artifacts://mlflow:5000/1/abc/artifacts/m").unwrap(),
            ArtifactLocation::Proxy("1/abc/artifacts/m".to_string())
        );
        assert_eq!(
            ArtifactLocation::parse("file:///mlruns/1/abc/artifacts/m").unwrap(),
            ArtifactLocation::Local(PathBuf::from("/mlruns/1/abc/artifacts/m"))
        );
        assert_eq!(
            ArtifactLocation::parse("/mlruns/m").unwrap(),
            ArtifactLocation::Local(PathBuf::from("/mlruns/m"))
        );
        assert_eq!(
            ArtifactLocation::parse("relative/models/m").unwrap(),
            ArtifactLocation::Local(PathBuf::from("relative/models/m"))
        );
        for uri in [
            "s3://bucket/m",
            "s3:/bucket/m",
            "dbfs:/databricks/mlflow-registry/abc/models/m",
            "runs:/abc/sam3_model",
            "gs+grpc:/x",
        ] {
            assert!(
                matches!(ArtifactLocation::parse(uri), Err(LoadError::Artifact(_))),
                "{} should be rejected",
                uri
            );
        }
    }

    #[test]
    fn test_join_artifact_locations() {
        assert_eq!(
            ArtifactLocation::Proxy("0/run/artifacts".to_string()).join("sam3_model"),
            ArtifactLocation::Proxy("0/run/artifacts/sam3_model".to_string())
        );
        assert_eq!(
            ArtifactLocation::Proxy(String::new()).join("m"),
            ArtifactLocation::Proxy("m".to_string())
        );
        assert_eq!(
            ArtifactLocation::Local(PathBuf::from("/a")).join("m"),
            ArtifactLocation::Local(PathBuf::from("/a/m"))
        );
    }

    #[test]
    fn test_version_ordering_is_numeric() {
        let v = |n: &str| ModelVersion {
            name: "m".to_string(),
            version: n.to_string(),
            run_id: None,
            source: None,
            status: None,
        };
        assert!(v("10").number() > v("9").number());
    }

    #[tokio::test]
    async fn test_latest_version_picks_highest_ready() {
        let app = Router::new().route(
            "/api/2.0/mlflow/model-versions/search",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("filter").unwrap(), "name='sam3-inference'");
                Json(json!({"model_versions": [
                    {"name": "sam3-inference", "version": "2", "run_id": "r2", "status": "READY"},
                    {"name": "sam3-inference", "version": "10", "run_id": "r10", "status": "READY"},
                    {"name": "sam3-inference", "version": "11", "run_id": "r11", "status": "FAILED_REGISTRATION"}
                ]}))
            }),
        );
        let registry = registry(spawn_server(app).await);

        let version = registry.latest_version("sam3-inference").await.unwrap();

        assert_eq!(version.version, "10");
        assert_eq!(version.run_id.as_deref(), Some("r10"));
    }

    #[tokio::test]
    async fn test_latest_version_not_found() {
        let app = Router::new().route(
            "/api/2.0/mlflow/model-versions/search",
            get(|| async { Json(json!({})) }),
        );
        let registry = registry(spawn_server(app).await);

        let err = registry.latest_version("missing").await.unwrap_err();
        assert!(matches!(err, LoadError::NotFound { name } if name == "missing"));
    }

    #[tokio::test]
    async fn test_registry_error_status_is_load_error() {
        let app = Router::new().route(
            "/api/2.0/mlflow/model-versions/search",
            get(|| async { (AxumStatus::UNAUTHORIZED, Json(Value::Null)) }),
        );
        let registry = registry(spawn_server(app).await);

        assert!(matches!(
            registry.latest_version("m").await,
            Err(LoadError::Registry(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_file_through_proxy() {
        let app = Router::new().route(
            "/api/2.0/mlflow-artifacts/artifacts/1/run/artifacts/model/model.onnx",
            get(|| async { "onnx-bytes" }),
        );
        let registry = registry(spawn_server(app).await);
        let location = ArtifactLocation::Proxy("1/run/artifacts/model".to_string());
        let dir = tempfile::tempdir().unwrap();

        let dest = dir.path().join("model.onnx");
        assert!(registry.fetch_file(&location, "model.onnx", &dest).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"onnx-bytes");

        let missing = dir.path().join("processor.json");
        assert!(!registry
            .fetch_file(&location, "processor.json", &missing)
            .await
            .unwrap());
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn test_fetch_file_from_local_directory() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("model.onnx"), b"local").unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let registry = registry("http://unused".to_string());
        let location = ArtifactLocation::Local(source.path().to_path_buf());

        let dest = dest_dir.path().join("model.onnx");
        assert!(registry.fetch_file(&location, "model.onnx", &dest).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"local");
        // Copied through a temporary sibling that is renamed away
        assert!(!dest_dir.path().join("model.partial").exists());
    }

    #[tokio::test]
    async fn test_proxy_download_streams_large_body() {
        let payload: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
        let served = payload.clone();
        let app = Router::new().route(
            "/api/2.0/mlflow-artifacts/artifacts/big/model.onnx",
            get(move || async move { served }),
        );
        let registry = registry(spawn_server(app).await);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.onnx");

        let location = ArtifactLocation::Proxy("big".to_string());
        assert!(registry.fetch_file(&location, "model.onnx", &dest).await.unwrap());

        assert_eq!(std::fs::read(&dest).unwrap(), payload);
        assert!(!dir.path().join("model.partial").exists());
    }

    #[tokio::test]
    async fn test_existing_registered_model_is_accepted() {
        let app = Router::new().route(
            "/api/2.0/mlflow/registered-models/create",
            post(|| async {
                (
                    AxumStatus::BAD_REQUEST,
                    Json(json!({"error_code": "RESOURCE_ALREADY_EXISTS", "message": "exists"})),
                )
            }),
        );
        let registry = registry(spawn_server(app).await);

        registry.ensure_registered_model("sam3-inference").await.unwrap();
    }

    #[tokio::test]
    async fn test_other_registration_errors_fail() {
        let app = Router::new().route(
            "/api/2.0/mlflow/registered-models/create",
            post(|| async {
                (
                    AxumStatus::BAD_REQUEST,
                    Json(json!({"error_code": "INVALID_PARAMETER_VALUE"})),
                )
            }),
        );
        let registry = registry(spawn_server(app).await);

        assert!(matches!(
            registry.ensure_registered_model("bad name").await,
            Err(LoadError::Artifact(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_to_local_directory() {
        let source_dir = tempfile::tempdir().unwrap();
        let source = source_dir.path().join("graph.onnx");
        std::fs::write(&source, b"graph").unwrap();
        let target = tempfile::tempdir().unwrap();
        let location = ArtifactLocation::Local(target.path().join("run").join("sam3_model"));

        registry("http://unused".to_string())
            .upload_file(&location, "model.onnx", &source)
            .await
            .unwrap();

        let uploaded = target.path().join("run").join("sam3_model").join("model.onnx");
        assert_eq!(std::fs::read(uploaded).unwrap(), b"graph");
    }
}
