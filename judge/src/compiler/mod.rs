//! Compiler module - Source code compilation
//!
//! This module owns the per-submission artifact directory:
//! - The submitted source is written into it once
//! - The language's compile step runs in the sandbox and its products are
//!   copied back
//! - Every run step later executes against the same directory
//!
//! The directory is removed when the artifact is dropped.

use std::path::Path;
use std::time::Instant;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::utils::preview;
use crate::languages::LanguageConfig;
use crate::sandbox::{ExecutionLimits, ExecutionSpec, ExecutionStatus, Sandbox, SandboxError};

/// Diagnostics captured from the compile step
#[derive(Debug, Clone, Default)]
pub struct CompileDiagnostics {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u32,
}

/// Result of a compilation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileResult {
    Success,
    Failed { message: String },
    Cancelled,
}

/// The product of compiling one submission
pub struct CompileArtifact {
    dir: TempDir,
    diagnostics: CompileDiagnostics,
}

impl CompileArtifact {
    /// Create the artifact directory and write the source into it
    pub async fn prepare(
        scratch_root: Option<&Path>,
        language: &LanguageConfig,
        source: &str,
    ) -> Result<Self, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("judge-artifact-");
        let dir = match scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| SandboxError::workspace("failed to create artifact directory", e))?;

        let source_path = dir.path().join(&language.source_file);
        tokio::fs::write(&source_path, source)
            .await
            .map_err(|e| SandboxError::workspace("failed to write source file", e))?;

        Ok(Self {
            dir,
            diagnostics: CompileDiagnostics::default(),
        })
    }

    /// Directory holding the source and compiled products
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn diagnostics(&self) -> &CompileDiagnostics {
        &self.diagnostics
    }

    /// Run the language's compile step, if it has one.
    ///
    /// A compiler that cannot be spawned is reported as a failed compile.
    /// Other sandbox faults are returned as errors.
    pub async fn compile(
        &mut self,
        sandbox: &dyn Sandbox,
        language: &LanguageConfig,
        limits: ExecutionLimits,
        max_message_bytes: usize,
        cancel: &CancellationToken,
    ) -> Result<CompileResult, SandboxError> {
        let Some(command) = language.compile_step() else {
            // Interpreted language, no compilation needed
            return Ok(CompileResult::Success);
        };

        debug!("Compiling {} with {:?}", language.name, command.to_vec());

        let spec = ExecutionSpec::new(self.path())
            .with_command(command)
            .with_limits(limits)
            .with_copy_out_dir(self.path());

        let started = Instant::now();
        let result = match sandbox.execute(&spec, cancel).await {
            Ok(result) => result,
            Err(SandboxError::Spawn { program, source }) => {
                return Ok(CompileResult::Failed {
                    message: format!("Compiler {} could not be started: {}", program, source),
                });
            }
            Err(e) => return Err(e),
        };

        self.diagnostics = CompileDiagnostics {
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            duration_ms: started.elapsed().as_millis().min(u128::from(u32::MAX)) as u32,
        };

        if result.status == ExecutionStatus::Cancelled {
            return Ok(CompileResult::Cancelled);
        }
        if result.is_success() {
            return Ok(CompileResult::Success);
        }

        let message = if !result.stderr.is_empty() {
            result.stderr
        } else if !result.stdout.is_empty() {
            result.stdout
        } else {
            match result.status {
                ExecutionStatus::TimeLimitExceeded => "Compilation timed out".to_string(),
                ExecutionStatus::MemoryLimitExceeded => {
                    "Compilation exceeded the memory limit".to_string()
                }
                ExecutionStatus::OutputLimitExceeded => {
                    "Compilation exceeded the output limit".to_string()
                }
                ExecutionStatus::Signaled(_) => "Compiler crashed".to_string(),
                ExecutionStatus::Exited(code) => {
                    format!("Compilation failed with exit code {}", code)
                }
                ExecutionStatus::Cancelled => "Compilation cancelled".to_string(),
            }
        };

        Ok(CompileResult::Failed {
            message: preview(&message, max_message_bytes),
        })
    }
}
