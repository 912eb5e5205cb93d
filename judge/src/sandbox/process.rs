//! Process-based sandbox
//!
//! Runs each command as the leader of a fresh process group with kernel
//! rlimits installed, inside a private workspace. When a cgroup root is
//! configured the child also joins its own cgroup v2 leaf, which enforces
//! memory and process count and gives exact peak memory. A watchdog enforces
//! the wall-clock deadline and samples /proc for CPU time and resident
//! memory. The whole group is killed and the leader reaped on every exit
//! path.

use std::io::{self, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cgroup::{self, CgroupLeaf, CgroupRoot};
use super::rlimits::{self, RlimitPlan};
use super::{
    proc_stats, ExecutionLimits, ExecutionOutcome, ExecutionSpec, ExecutionStatus, Sandbox,
    SandboxError, Workspace,
};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long to wait for output pipes to drain after the group is dead
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Pages the child touches between fork and exec on top of the judge image
const FORK_SLACK_KB: u64 = 1024;

/// Sandbox backed by plain processes, rlimits and process groups
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    scratch_root: Option<PathBuf>,
    poll_interval: Duration,
    cgroup: Option<CgroupRoot>,
}

impl ProcessSandbox {
    pub fn new() -> Self {
        Self {
            scratch_root: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cgroup: None,
        }
    }

    /// Run every execution in its own leaf under `root`
    pub fn with_cgroup(mut self, root: CgroupRoot) -> Self {
        self.cgroup = Some(root);
        self
    }

    /// Create workspaces under `root` instead of the system temp directory
    pub fn with_scratch_root(mut self, root: impl AsRef<Path>) -> Self {
        self.scratch_root = Some(root.as_ref().to_path_buf());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn run(
        &self,
        workspace: &Workspace,
        spec: &ExecutionSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let limits = spec.limits;
        let program = resolve_program(&spec.command.program, workspace.path());

        let mut cmd = Command::new(&program);
        cmd.args(&spec.command.args)
            .current_dir(workspace.path())
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("HOME", workspace.path())
            .env("TMPDIR", workspace.path())
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        for pair in &spec.command.env {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }

        let leaf = match &self.cgroup {
            Some(root) => Some(root.create_leaf(limits.memory_kb() * 1024)?),
            None => None,
        };
        // With a leaf, memory.max enforces memory; an address-space cap
        // would only turn large allocations into crashes
        let plan = if leaf.is_some() {
            RlimitPlan::from_limits(&limits).without_address_space()
        } else {
            RlimitPlan::from_limits(&limits)
        };
        let procs_fd = leaf.as_ref().map(CgroupLeaf::procs_fd);
        // SAFETY: the hook only calls write and setrlimit, which are
        // async-signal-safe
        unsafe {
            cmd.pre_exec(move || {
                if let Some(fd) = procs_fd {
                    cgroup::join(fd)?;
                }
                rlimits::apply(&plan)
            });
        }

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: spec.command.program.clone(),
            source,
        })?;
        let pid = child.id() as i32;
        let mut guard = ProcessGroupGuard::new(pid);
        let started = Instant::now();
        debug!("Spawned {:?} as pid {} with limits {:?}", program, pid, limits);

        let overflow = Arc::new(AtomicBool::new(false));
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let input = spec.stdin.clone().unwrap_or_default();
            tokio::task::spawn_blocking(move || {
                // EPIPE just means the program stopped reading
                let _ = stdin.write_all(input.as_bytes());
            })
        });
        let stdout_task = spawn_reader(child.stdout.take(), limits.output_cap_bytes, &overflow);
        let stderr_task = spawn_reader(child.stderr.take(), limits.output_cap_bytes, &overflow);
        // The leader is reaped by wait_and_reap, never through Child
        drop(child);

        let mut waiter = tokio::task::spawn_blocking(move || wait_and_reap(pid));

        let wall_deadline = started + Duration::from_millis(u64::from(limits.wall_time_ms));
        let cpu_limit_ms = u64::from(limits.cpu_time_ms);
        let memory_limit_kb = limits.memory_kb();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut kill_reason: Option<KillReason> = None;
        let mut sampled_cpu_ms = 0u64;
        let mut sampled_peak_kb = 0u64;
        let mut sampled_peak_vm_kb = 0u64;

        let reaped = loop {
            tokio::select! {
                biased;
                result = &mut waiter => break result,
                _ = cancel.cancelled(), if kill_reason.is_none() => {
                    kill_reason = Some(KillReason::Cancelled);
                    guard.kill();
                }
                _ = tokio::time::sleep_until(wall_deadline), if kill_reason.is_none() => {
                    kill_reason = Some(KillReason::WallClock);
                    guard.kill();
                }
                _ = ticker.tick(), if kill_reason.is_none() => {
                    if overflow.load(Ordering::Relaxed) {
                        kill_reason = Some(KillReason::Output);
                        guard.kill();
                    } else if let Some(sample) = proc_stats::sample(pid) {
                        sampled_cpu_ms = sampled_cpu_ms.max(sample.cpu_time_ms);
                        // Before exec the memory figures are the judge's own
                        if sample.exec_done {
                            sampled_peak_kb = sampled_peak_kb.max(sample.peak_rss_kb);
                            sampled_peak_vm_kb = sampled_peak_vm_kb.max(sample.peak_vm_kb);
                        }
                        if sample.cpu_time_ms > cpu_limit_ms {
                            kill_reason = Some(KillReason::CpuTime);
                            guard.kill();
                        } else if sample.exec_done && sample.rss_kb > memory_limit_kb {
                            kill_reason = Some(KillReason::Memory);
                            guard.kill();
                        }
                    }
                }
            }
        };
        let wall_time_ms = millis_u32(started.elapsed());

        let reaped = match reaped {
            Ok(Ok(reaped)) => reaped,
            Ok(Err(e)) => return Err(SandboxError::Wait(e)),
            Err(e) => return Err(SandboxError::Task(e.to_string())),
        };
        // wait_and_reap already killed the rest of the group
        guard.disarm();
        if let Some(leaf) = &leaf {
            leaf.kill();
        }

        let (stdout, stdout_truncated) = drain(stdout_task).await;
        let (stderr, stderr_truncated) = drain(stderr_task).await;
        if let Some(task) = stdin_task {
            let _ = task.await;
        }

        let usage = Usage {
            cpu_time_ms: reaped.cpu_time_ms.max(sampled_cpu_ms),
            memory_kb: match &leaf {
                Some(leaf) => leaf.peak_kb().unwrap_or(sampled_peak_kb),
                None => fallback_peak_kb(
                    reaped.max_rss_kb,
                    sampled_peak_kb,
                    proc_stats::own_peak_rss_kb(),
                ),
            },
            peak_vm_kb: sampled_peak_vm_kb,
            address_space_capped: plan.address_space_bytes.is_some(),
            oom_killed: leaf.as_ref().is_some_and(CgroupLeaf::oom_killed),
            truncated: stdout_truncated || stderr_truncated,
        };
        drop(leaf);
        let status = classify(kill_reason, reaped.status, &usage, &limits);
        let Usage {
            cpu_time_ms,
            memory_kb,
            truncated,
            ..
        } = usage;

        debug!(
            "pid {} finished: status={:?}, cpu={}ms, wall={}ms, mem={}KB",
            pid, status, cpu_time_ms, wall_time_ms, memory_kb
        );

        Ok(ExecutionOutcome {
            status,
            exit_code: reaped.status.code(),
            signal: reaped.status.signal(),
            wall_time_ms,
            time_ms: cpu_time_ms.min(u64::from(u32::MAX)) as u32,
            memory_kb: memory_kb.min(u64::from(u32::MAX)) as u32,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            truncated,
        })
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(
        &self,
        spec: &ExecutionSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, SandboxError> {
        if spec.command.program.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }

        let workspace = Workspace::create(self.scratch_root.as_deref())?;
        workspace.copy_dir_in(&spec.work_dir).await?;

        let outcome = self.run(&workspace, spec, cancel).await?;

        if let Some(ref copy_out_dir) = spec.copy_out_dir {
            workspace.copy_out(copy_out_dir).await?;
        }

        workspace.close();
        Ok(outcome)
    }
}

/// Why the watchdog killed the process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    WallClock,
    CpuTime,
    Memory,
    Output,
    Cancelled,
}

/// Kills the process group on drop unless disarmed
struct ProcessGroupGuard {
    pgid: Pid,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(pid: i32) -> Self {
        Self {
            pgid: Pid::from_raw(pid),
            armed: true,
        }
    }

    fn kill(&self) {
        // ESRCH only means the group is already gone
        let _ = killpg(self.pgid, Signal::SIGKILL);
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.kill();
        }
    }
}

struct Reaped {
    status: ExitStatus,
    cpu_time_ms: u64,
    max_rss_kb: u64,
}

/// Wait for the group leader, kill the rest of its group, then reap it.
///
/// The leader is observed with WNOWAIT first so that its pid (and so the
/// group id) stays reserved while the group is killed.
fn wait_and_reap(pid: i32) -> io::Result<Reaped> {
    loop {
        match waitid(
            Id::Pid(Pid::from_raw(pid)),
            WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT,
        ) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);

    // nix has no wait4, and the rusage it fills is the CPU accounting
    let mut status: libc::c_int = 0;
    // SAFETY: zeroed rusage is a valid out-parameter for wait4
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: status and usage are valid, writable locations
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            break;
        }
        let err = io::Error::last_os_error();
        if rc == -1 && err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }

    Ok(Reaped {
        status: ExitStatus::from_raw(status),
        cpu_time_ms: timeval_ms(&usage.ru_utime) + timeval_ms(&usage.ru_stime),
        // ru_maxrss is in KB on Linux, and includes the pre-exec image
        max_rss_kb: usage.ru_maxrss.max(0) as u64,
    })
}

fn timeval_ms(tv: &libc::timeval) -> u64 {
    (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000
}

fn millis_u32(duration: Duration) -> u32 {
    duration.as_millis().min(u128::from(u32::MAX)) as u32
}

/// Peak memory without a cgroup. `ru_maxrss` also covers the forked copy of
/// the judge before exec, so it only counts once it exceeds the judge's own
/// peak; below that only samples taken after exec are trusted.
fn fallback_peak_kb(reaped_max_rss_kb: u64, sampled_peak_kb: u64, judge_peak_kb: u64) -> u64 {
    if reaped_max_rss_kb > judge_peak_kb.saturating_add(FORK_SLACK_KB) {
        reaped_max_rss_kb.max(sampled_peak_kb)
    } else {
        sampled_peak_kb
    }
}

/// Post-mortem accounting for one execution
#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    cpu_time_ms: u64,
    memory_kb: u64,
    /// Largest address space seen after exec
    peak_vm_kb: u64,
    /// RLIMIT_AS was installed
    address_space_capped: bool,
    /// The cgroup OOM killer fired
    oom_killed: bool,
    truncated: bool,
}

/// Map the raw termination to a status. Watchdog kills take precedence,
/// then post-mortem accounting, then the exit itself.
fn classify(
    kill_reason: Option<KillReason>,
    status: ExitStatus,
    usage: &Usage,
    limits: &ExecutionLimits,
) -> ExecutionStatus {
    match kill_reason {
        Some(KillReason::Cancelled) => return ExecutionStatus::Cancelled,
        Some(KillReason::WallClock) | Some(KillReason::CpuTime) => {
            return ExecutionStatus::TimeLimitExceeded
        }
        Some(KillReason::Memory) => return ExecutionStatus::MemoryLimitExceeded,
        Some(KillReason::Output) => return ExecutionStatus::OutputLimitExceeded,
        None => {}
    }

    let signal = status.signal();
    if usage.cpu_time_ms > u64::from(limits.cpu_time_ms) || signal == Some(libc::SIGXCPU) {
        return ExecutionStatus::TimeLimitExceeded;
    }
    if usage.oom_killed || usage.memory_kb > limits.memory_kb() {
        return ExecutionStatus::MemoryLimitExceeded;
    }
    if usage.truncated || signal == Some(libc::SIGXFSZ) {
        return ExecutionStatus::OutputLimitExceeded;
    }
    // Mapped past the limit and then died: an allocation refused by
    // RLIMIT_AS, not a bug of its own
    let abnormal = status.code() != Some(0);
    if abnormal && usage.address_space_capped && usage.peak_vm_kb >= limits.memory_kb() {
        return ExecutionStatus::MemoryLimitExceeded;
    }

    match (status.code(), signal) {
        (Some(code), _) => ExecutionStatus::Exited(code),
        (None, Some(sig)) => ExecutionStatus::Signaled(sig),
        (None, None) => ExecutionStatus::Signaled(0),
    }
}

/// `./name` refers to a file in the workspace; anything else is looked up on PATH
fn resolve_program(program: &str, workspace: &Path) -> PathBuf {
    match program.strip_prefix("./") {
        Some(relative) => workspace.join(relative),
        None => PathBuf::from(program),
    }
}

fn spawn_reader<R>(
    stream: Option<R>,
    cap: u64,
    overflow: &Arc<AtomicBool>,
) -> Option<JoinHandle<(Vec<u8>, bool)>>
where
    R: Read + Send + 'static,
{
    let overflow = Arc::clone(overflow);
    stream.map(|stream| tokio::task::spawn_blocking(move || read_capped(stream, cap, &overflow)))
}

/// Read until EOF or until `cap` bytes; returns (bytes, truncated)
fn read_capped<R: Read>(mut reader: R, cap: u64, overflow: &AtomicBool) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return (buf, false),
            Ok(n) => {
                let room = cap.saturating_sub(buf.len() as u64).min(n as u64) as usize;
                buf.extend_from_slice(&chunk[..room]);
                if room < n {
                    overflow.store(true, Ordering::Relaxed);
                    return (buf, true);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return (buf, false),
        }
    }
}

async fn drain(task: Option<JoinHandle<(Vec<u8>, bool)>>) -> (Vec<u8>, bool) {
    let Some(task) = task else {
        return (Vec::new(), false);
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!("Output reader task failed: {}", e);
            (Vec::new(), true)
        }
        Err(_) => {
            // A process outside the group still holds the pipe open
            warn!("Timed out draining output pipe");
            (Vec::new(), true)
        }
    }
}
