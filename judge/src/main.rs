use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use judge_engine::api;
use judge_engine::config::EngineConfig;
use judge_engine::engine::JudgeEngine;
use judge_engine::languages::LanguageRegistry;
use judge_engine::redis_manager::{self, RedisSubmissionStore};
use judge_engine::reporter::{LogSubmissionStore, SubmissionStore};
use judge_engine::sandbox::{CgroupRoot, ProcessSandbox};
use judge_engine::storage::{DirProblemStore, ProblemStore, S3ProblemStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("judge_engine=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting judge engine...");

    let config = EngineConfig::from_env()?;
    let languages = LanguageRegistry::from_env()?;
    info!("Supported languages: {}", languages.supported().join(", "));

    let problems: Arc<dyn ProblemStore> = match std::env::var("JUDGE_PROBLEM_DIR") {
        Ok(dir) => {
            info!("Reading problems from {}", dir);
            Arc::new(DirProblemStore::new(dir))
        }
        Err(_) => Arc::new(S3ProblemStore::from_env().await?),
    };

    let redis_url = std::env::var("REDIS_URL").ok();
    let redis_store = match &redis_url {
        Some(url) => Some(Arc::new(RedisSubmissionStore::connect(url).await?)),
        None => None,
    };
    let submissions: Arc<dyn SubmissionStore> = match &redis_store {
        Some(store) => Arc::clone(store) as Arc<dyn SubmissionStore>,
        None => {
            info!("REDIS_URL not set, verdicts will only be logged");
            Arc::new(LogSubmissionStore)
        }
    };

    let mut sandbox = ProcessSandbox::new();
    if let Ok(dir) = std::env::var("JUDGE_SCRATCH_DIR") {
        sandbox = sandbox.with_scratch_root(dir);
    }
    match std::env::var("JUDGE_CGROUP_ROOT") {
        Ok(path) => {
            let mut root = CgroupRoot::open(&path)
                .with_context(|| format!("Failed to prepare cgroup root {}", path))?;
            if let Ok(max) = std::env::var("JUDGE_MAX_PROCESSES") {
                root = root.with_max_processes(
                    max.parse().context("JUDGE_MAX_PROCESSES must be a number")?,
                );
            }
            info!("Measuring executions in cgroup leaves under {}", path);
            sandbox = sandbox.with_cgroup(root);
        }
        Err(_) => warn!("JUDGE_CGROUP_ROOT not set, memory is measured from /proc"),
    }

    let engine = JudgeEngine::start(config, languages, Arc::new(sandbox), problems, submissions);

    let shutdown = CancellationToken::new();
    let ingress = match (redis_url, redis_store) {
        (Some(url), Some(store)) => Some(tokio::spawn(redis_manager::run_ingress(
            url,
            Arc::clone(&engine),
            store,
            shutdown.clone(),
        ))),
        _ => None,
    };

    let listen = std::env::var("JUDGE_LISTEN").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Listening on {}", listen);

    let signal = shutdown.clone();
    axum::serve(listener, api::router(Arc::clone(&engine)))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    engine.shutdown().await;

    if let Some(handle) = ingress {
        match handle.await {
            Ok(Err(e)) => error!("Redis ingress failed: {:#}", e),
            Err(e) => error!("Redis ingress task panicked: {}", e),
            Ok(Ok(())) => {}
        }
    }

    info!("Judge engine stopped");
    Ok(())
}
