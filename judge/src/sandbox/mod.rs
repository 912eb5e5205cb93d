//! Sandbox module - isolated command execution
//!
//! This module runs a single command (a compile or run step) under CPU time,
//! wall-clock, memory and output limits inside a private working directory,
//! and reports what happened as an `ExecutionOutcome`.
//!
//! The sandbox module does NOT:
//! - Interpret verdicts (that's the judge's job)
//! - Know about languages or compilation
//! - Compare outputs
//!
//! Expected outcomes of untrusted code (non-zero exit, timeouts, memory or
//! output overflow) are statuses, never errors. `SandboxError` is reserved
//! for engine faults.

pub mod cgroup;
pub mod proc_stats;
pub mod process;
pub mod rlimits;
pub mod workspace;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use cgroup::CgroupRoot;
pub use process::ProcessSandbox;
pub use workspace::Workspace;

/// Command specification for execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Extra environment variables (key=value)
    pub env: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(|e| e.into()).collect();
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self {
            program,
            args: iter.cloned().collect(),
            env: Vec::new(),
        }
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }
}

/// Resource limits for a single execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// CPU time limit in milliseconds
    pub cpu_time_ms: u32,
    /// Wall-clock limit in milliseconds
    pub wall_time_ms: u32,
    /// Memory limit in MB
    pub memory_mb: u32,
    /// Maximum captured bytes per output stream
    pub output_cap_bytes: u64,
    /// Also enforce memory as an address-space rlimit
    pub address_space_limit: bool,
}

impl ExecutionLimits {
    pub fn memory_kb(&self) -> u64 {
        u64::from(self.memory_mb) * 1024
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            cpu_time_ms: 1000,
            wall_time_ms: 3000,
            memory_mb: 256,
            output_cap_bytes: 8 * 1024 * 1024,
            address_space_limit: true,
        }
    }
}

/// Everything the sandbox needs for one invocation
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    /// Directory whose files are copied into the private workspace
    pub work_dir: PathBuf,
    pub command: CommandSpec,
    pub limits: ExecutionLimits,
    pub stdin: Option<String>,
    /// Directory to copy workspace files to after execution
    pub copy_out_dir: Option<PathBuf>,
}

impl ExecutionSpec {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            command: CommandSpec::default(),
            limits: ExecutionLimits::default(),
            stdin: None,
            copy_out_dir: None,
        }
    }

    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.command = command;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_copy_out_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.copy_out_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

/// Execution status (raw, no verdict interpretation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by a signal not attributable to a limit
    Signaled(i32),
    /// CPU time or wall-clock limit exceeded
    TimeLimitExceeded,
    /// Memory limit exceeded
    MemoryLimitExceeded,
    /// Output exceeded the byte cap
    OutputLimitExceeded,
    /// Terminated because the caller cancelled
    Cancelled,
}

/// Outcome of running one command
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// Raw exit code if the process exited
    pub exit_code: Option<i32>,
    /// Terminating signal if the process was killed
    pub signal: Option<i32>,
    /// Wall-clock time in milliseconds
    pub wall_time_ms: u32,
    /// CPU time (user + system) in milliseconds
    pub time_ms: u32,
    /// Peak resident memory in KB
    pub memory_kb: u32,
    pub stdout: String,
    pub stderr: String,
    /// Output exceeded the cap and was cut
    pub truncated: bool,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Exited(0))
    }

    /// Get exit code from status (-1 if not applicable)
    pub fn exit_code(&self) -> i32 {
        match self.status {
            ExecutionStatus::Exited(code) => code,
            _ => -1,
        }
    }
}

/// Engine faults raised by a sandbox
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no command specified for execution")]
    EmptyCommand,
    #[error("failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("workspace error: {context}")]
    Workspace {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cgroup error: {context}")]
    Cgroup {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for process")]
    Wait(#[source] std::io::Error),
    #[error("sandbox task failed: {0}")]
    Task(String),
}

impl SandboxError {
    pub(crate) fn workspace(context: impl Into<String>, source: std::io::Error) -> Self {
        SandboxError::Workspace {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn cgroup(context: impl Into<String>, source: std::io::Error) -> Self {
        SandboxError::Cgroup {
            context: context.into(),
            source,
        }
    }
}

/// Isolation backend. The judge pipeline depends only on this trait, so a
/// stronger backend (namespaces, jails, micro-VMs) can replace
/// `ProcessSandbox` without touching it.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run one command. `cancel` terminates the process promptly; the
    /// outcome then has status `Cancelled`.
    async fn execute(
        &self,
        spec: &ExecutionSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_round_trip() {
        let cmd = vec!["g++".to_string(), "-O2".to_string(), "main.cpp".to_string()];
        let spec = CommandSpec::from_vec(&cmd);
        assert_eq!(spec.program, "g++");
        assert_eq!(spec.args, vec!["-O2", "main.cpp"]);
        assert_eq!(spec.to_vec(), cmd);
    }

    #[test]
    fn test_outcome_exit_code() {
        let outcome = ExecutionOutcome {
            status: ExecutionStatus::TimeLimitExceeded,
            exit_code: None,
            signal: Some(9),
            wall_time_ms: 0,
            time_ms: 0,
            memory_kb: 0,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
        };
        assert_eq!(outcome.exit_code(), -1);
        assert!(!outcome.is_success());
    }
}
