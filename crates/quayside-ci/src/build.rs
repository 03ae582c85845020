//! Build stage: per-platform image builds and the multi-platform manifest.
//!
//! Each platform is built natively in its own job and pushed by digest.
//! Jobs run concurrently and independently; once all have finished the
//! successful digests are stitched into one manifest list under the run's
//! tags.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use quayside_core::{BuiltImage, ImageManifest, ImageRef, Platform, StageKind};
use quayside_state::ImageDigest;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::CiError;
use crate::runner::{run_checked, CommandExecutor};
use crate::stage::StageCommand;

/// Inputs for one platform job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub platform: Platform,
    /// Repository to push to; the tag is used only for the cache reference.
    pub image: ImageRef,
    pub context: String,
    pub dockerfile: String,
    pub commit_sha: String,
}

impl BuildRequest {
    /// Registry cache reference for this platform's layers.
    pub fn cache_ref(&self) -> String {
        format!(
            "{}:buildcache-{}",
            self.image.repository(),
            self.platform.arch()
        )
    }
}

/// Builds and publishes container images.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build one platform image and push it by digest.
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage, CiError>;

    /// Point every tag at a manifest list over `images`.
    async fn publish_manifest(
        &self,
        images: &[BuiltImage],
        tags: &[ImageRef],
    ) -> Result<ImageManifest, CiError>;
}

/// Outcome of a matrix build: successes and per-platform failures.
#[derive(Debug, Default)]
pub struct MatrixOutcome {
    pub built: Vec<BuiltImage>,
    pub failed: Vec<(Platform, CiError)>,
}

impl MatrixOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && !self.built.is_empty()
    }

    /// Fold failures into a single stage error.
    pub fn into_result(self) -> Result<Vec<BuiltImage>, CiError> {
        if self.failed.is_empty() {
            if self.built.is_empty() {
                return Err(CiError::BuildOutput("no platforms were built".to_string()));
            }
            return Ok(self.built);
        }
        let total = self.built.len() + self.failed.len();
        let details = self
            .failed
            .iter()
            .map(|(p, e)| format!("{p}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(CiError::MatrixFailed {
            failed: self.failed.len(),
            total,
            details,
        })
    }
}

/// Run every platform job concurrently; one failure never aborts the others.
pub async fn run_matrix(builder: &dyn ImageBuilder, requests: Vec<BuildRequest>) -> MatrixOutcome {
    let jobs = requests.iter().map(|req| async move {
        let result = builder.build(req).await;
        (req.platform.clone(), result)
    });

    let mut outcome = MatrixOutcome::default();
    for (platform, result) in join_all(jobs).await {
        match result {
            Ok(image) => {
                info!(platform = %platform, digest = %image.digest, "platform image pushed");
                outcome.built.push(image);
            }
            Err(e) => {
                warn!(platform = %platform, error = %e, "platform build failed");
                outcome.failed.push((platform, e));
            }
        }
    }
    outcome
}

/// `docker buildx` backed builder.
pub struct BuildxImageBuilder {
    executor: Arc<dyn CommandExecutor>,
    /// Where `--metadata-file` outputs are written.
    metadata_dir: PathBuf,
    timeout_secs: u64,
    login: Option<RegistryLogin>,
}

/// Credentials for `docker login --password-stdin`.
#[derive(Clone)]
pub struct RegistryLogin {
    pub registry: String,
    pub username: String,
    pub token: String,
}

impl std::fmt::Debug for RegistryLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryLogin")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct BuildMetadata {
    #[serde(rename = "containerimage.digest")]
    digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InspectedManifest {
    digest: String,
}

impl BuildxImageBuilder {
    pub fn new(executor: Arc<dyn CommandExecutor>, metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            metadata_dir: metadata_dir.into(),
            timeout_secs: StageKind::Build.default_timeout().as_secs(),
            login: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Log in to the registry before each push.
    pub fn with_login(mut self, login: RegistryLogin) -> Self {
        self.login = Some(login);
        self
    }

    pub fn login_command(&self) -> Option<StageCommand> {
        self.login.as_ref().map(|login| {
            StageCommand::new(
                "registry login",
                [
                    "docker",
                    "login",
                    login.registry.as_str(),
                    "--username",
                    login.username.as_str(),
                    "--password-stdin",
                ],
                60,
            )
            .with_stdin(login.token.clone())
        })
    }

    fn metadata_file(&self, platform: &Platform) -> PathBuf {
        self.metadata_dir
            .join(format!("build-{}.json", platform.arch()))
    }

    pub fn build_command(&self, req: &BuildRequest) -> StageCommand {
        let cache = req.cache_ref();
        StageCommand::new(
            format!("build {}", req.platform),
            [
                "docker".to_string(),
                "buildx".to_string(),
                "build".to_string(),
                "--platform".to_string(),
                req.platform.to_string(),
                "--file".to_string(),
                req.dockerfile.clone(),
                "--label".to_string(),
                format!("org.opencontainers.image.revision={}", req.commit_sha),
                "--cache-from".to_string(),
                format!("type=registry,ref={cache}"),
                "--cache-to".to_string(),
                format!("type=registry,ref={cache},mode=max"),
                "--output".to_string(),
                format!(
                    "type=image,name={},push-by-digest=true,name-canonical=true,push=true",
                    req.image.repository()
                ),
                "--metadata-file".to_string(),
                self.metadata_file(&req.platform).display().to_string(),
                req.context.clone(),
            ],
            self.timeout_secs,
        )
    }

    pub fn manifest_command(&self, images: &[BuiltImage], tags: &[ImageRef]) -> StageCommand {
        let mut args = vec![
            "docker".to_string(),
            "buildx".to_string(),
            "imagetools".to_string(),
            "create".to_string(),
        ];
        for tag in tags {
            args.push("-t".to_string());
            args.push(tag.to_string());
        }
        if let Some(first) = tags.first() {
            args.extend(images.iter().map(|img| first.pinned(&img.digest)));
        }
        StageCommand::new("publish manifest", args, self.timeout_secs)
    }
}

/// Digest recorded by `docker buildx build --metadata-file`.
pub fn parse_build_metadata(raw: &str) -> Result<ImageDigest, CiError> {
    let meta: BuildMetadata = serde_json::from_str(raw)
        .map_err(|e| CiError::BuildOutput(format!("invalid build metadata: {e}")))?;
    let digest = meta
        .digest
        .ok_or_else(|| CiError::BuildOutput("metadata has no containerimage.digest".to_string()))?;
    digest
        .parse()
        .map_err(|e| CiError::BuildOutput(format!("bad digest {digest}: {e}")))
}

/// Digest from `imagetools inspect --format '{{json .Manifest}}'`.
pub fn parse_manifest_digest(raw: &str) -> Result<ImageDigest, CiError> {
    let manifest: InspectedManifest = serde_json::from_str(raw.trim())
        .map_err(|e| CiError::BuildOutput(format!("invalid manifest inspect output: {e}")))?;
    manifest
        .digest
        .parse()
        .map_err(|e| CiError::BuildOutput(format!("bad manifest digest: {e}")))
}

#[async_trait]
impl ImageBuilder for BuildxImageBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage, CiError> {
        tokio::fs::create_dir_all(&self.metadata_dir).await?;
        if let Some(login) = self.login_command() {
            run_checked(self.executor.as_ref(), &login).await?;
        }
        run_checked(self.executor.as_ref(), &self.build_command(request)).await?;

        let raw = tokio::fs::read_to_string(self.metadata_file(&request.platform)).await?;
        Ok(BuiltImage {
            platform: request.platform.clone(),
            digest: parse_build_metadata(&raw)?,
            tags: Vec::new(),
        })
    }

    async fn publish_manifest(
        &self,
        images: &[BuiltImage],
        tags: &[ImageRef],
    ) -> Result<ImageManifest, CiError> {
        let first = tags
            .first()
            .ok_or_else(|| CiError::BuildOutput("no tags to publish".to_string()))?;
        run_checked(self.executor.as_ref(), &self.manifest_command(images, tags)).await?;

        let inspect = StageCommand::new(
            "inspect manifest",
            [
                "docker".to_string(),
                "buildx".to_string(),
                "imagetools".to_string(),
                "inspect".to_string(),
                first.to_string(),
                "--format".to_string(),
                "{{json .Manifest}}".to_string(),
            ],
            self.timeout_secs,
        );
        let out = run_checked(self.executor.as_ref(), &inspect).await?;
        Ok(ImageManifest {
            digest: parse_manifest_digest(&out.stdout)?,
            tags: tags.to_vec(),
            platforms: images.iter().map(|i| i.platform.clone()).collect(),
        })
    }
}
