//! Problem stores for fetching test cases
//!
//! A problem is described by a manifest listing its cases in order. The
//! S3/MinIO store reads `problems/{id}/manifest.json`; the directory store
//! reads `{root}/{id}/problem.toml`. Case file paths are relative to the
//! problem's prefix or directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::comparator::CompareMode;
use crate::core::TestCase;

/// External collaborator that owns problems and their test cases
#[async_trait]
pub trait ProblemStore: Send + Sync {
    /// Test cases of a problem, in judging order
    async fn list_test_cases(&self, problem_id: i64) -> Result<Vec<TestCase>>;

    /// Comparison mode for cases that do not declare one
    async fn comparison_mode(&self, problem_id: i64) -> Result<CompareMode>;
}

/// Problem manifest
#[derive(Debug, Clone, Deserialize)]
pub struct ProblemManifest {
    #[serde(default)]
    pub compare: CompareMode,
    /// Problem-wide limits, used by cases without their own
    #[serde(default)]
    pub time_limit_ms: Option<u32>,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    pub cases: Vec<ManifestCase>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestCase {
    pub input: String,
    pub output: String,
    #[serde(default)]
    pub time_limit_ms: Option<u32>,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    #[serde(default)]
    pub compare: Option<CompareMode>,
}

impl ProblemManifest {
    /// Resolve every case by loading its files through `fetch`
    async fn load_cases<F, Fut>(&self, mut fetch: F) -> Result<Vec<TestCase>>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<String>>,
    {
        let mut cases = Vec::with_capacity(self.cases.len());
        for entry in &self.cases {
            let input = fetch(entry.input.clone()).await?;
            let expected_output = fetch(entry.output.clone()).await?;
            cases.push(TestCase {
                input,
                expected_output,
                time_limit_ms: entry.time_limit_ms.or(self.time_limit_ms),
                memory_limit_mb: entry.memory_limit_mb.or(self.memory_limit_mb),
                compare: entry.compare,
            });
        }
        Ok(cases)
    }
}

/// S3/MinIO problem store
#[derive(Clone)]
pub struct S3ProblemStore {
    client: Client,
    bucket: String,
}

impl S3ProblemStore {
    /// Create a new store from environment variables
    pub async fn from_env() -> Result<Self> {
        let endpoint = std::env::var("MINIO_ENDPOINT").unwrap_or_else(|_| "localhost".into());
        let port = std::env::var("MINIO_PORT").unwrap_or_else(|_| "9000".into());
        let access_key = std::env::var("MINIO_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".into());
        let secret_key = std::env::var("MINIO_SECRET_KEY").unwrap_or_else(|_| "minioadmin".into());
        let bucket = std::env::var("MINIO_BUCKET").unwrap_or_else(|_| "judge-problems".into());
        let use_ssl = std::env::var("MINIO_USE_SSL")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let protocol = if use_ssl { "https" } else { "http" };
        let endpoint_url = format!("{}://{}:{}", protocol, endpoint, port);

        info!("Connecting to MinIO at {}", endpoint_url);

        let credentials = Credentials::new(access_key, secret_key, None, None, "minio");

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(&endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket,
        })
    }

    /// Download an object as a string
    pub async fn download_string(&self, key: &str) -> Result<String> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", key))?;

        let data = response
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read body of {}", key))?;
        String::from_utf8(data.into_bytes().to_vec()).context("Invalid UTF-8 content")
    }

    async fn manifest(&self, problem_id: i64) -> Result<ProblemManifest> {
        let key = format!("{}/manifest.json", problem_prefix(problem_id));
        let content = self.download_string(&key).await?;
        serde_json::from_str(&content).with_context(|| format!("Invalid manifest {}", key))
    }
}

fn problem_prefix(problem_id: i64) -> String {
    format!("problems/{}", problem_id)
}

#[async_trait]
impl ProblemStore for S3ProblemStore {
    async fn list_test_cases(&self, problem_id: i64) -> Result<Vec<TestCase>> {
        let manifest = self.manifest(problem_id).await?;
        let prefix = problem_prefix(problem_id);
        debug!(
            "Fetching {} cases for problem {} from S3",
            manifest.cases.len(),
            problem_id
        );
        manifest
            .load_cases(|path| {
                let key = format!("{}/{}", prefix, path);
                async move { self.download_string(&key).await }
            })
            .await
    }

    async fn comparison_mode(&self, problem_id: i64) -> Result<CompareMode> {
        Ok(self.manifest(problem_id).await?.compare)
    }
}

/// Problem store backed by a local directory
#[derive(Debug, Clone)]
pub struct DirProblemStore {
    root: PathBuf,
}

impl DirProblemStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn problem_dir(&self, problem_id: i64) -> PathBuf {
        self.root.join(problem_id.to_string())
    }

    async fn manifest(&self, problem_id: i64) -> Result<ProblemManifest> {
        let path = self.problem_dir(problem_id).join("problem.toml");
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Invalid problem manifest {:?}", path))
    }
}

#[async_trait]
impl ProblemStore for DirProblemStore {
    async fn list_test_cases(&self, problem_id: i64) -> Result<Vec<TestCase>> {
        let manifest = self.manifest(problem_id).await?;
        let dir = self.problem_dir(problem_id);
        manifest
            .load_cases(|file| {
                let path = dir.join(file);
                async move {
                    tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read {:?}", path))
                }
            })
            .await
    }

    async fn comparison_mode(&self, problem_id: i64) -> Result<CompareMode> {
        Ok(self.manifest(problem_id).await?.compare)
    }
}

/// Problems held in memory
#[derive(Default)]
pub struct MemoryProblemStore {
    problems: Mutex<HashMap<i64, (Vec<TestCase>, CompareMode)>>,
}

impl MemoryProblemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, problem_id: i64, cases: Vec<TestCase>, compare: CompareMode) {
        self.problems
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(problem_id, (cases, compare));
    }

    fn get(&self, problem_id: i64) -> Result<(Vec<TestCase>, CompareMode)> {
        self.problems
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&problem_id)
            .cloned()
            .with_context(|| format!("Unknown problem {}", problem_id))
    }
}

#[async_trait]
impl ProblemStore for MemoryProblemStore {
    async fn list_test_cases(&self, problem_id: i64) -> Result<Vec<TestCase>> {
        Ok(self.get(problem_id)?.0)
    }

    async fn comparison_mode(&self, problem_id: i64) -> Result<CompareMode> {
        Ok(self.get(problem_id)?.1)
    }
}
