//! cgroup v2 leaves for per-execution accounting
//!
//! Each execution gets its own leaf under a delegated root. The child joins
//! the leaf between fork and exec, so the kernel charges only pages the
//! submission touches itself. `memory.max` and `pids.max` are enforced by the
//! kernel; `memory.peak` and `memory.events` are read back after the run.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use super::SandboxError;

/// Processes and threads allowed per execution, as in isolate's `--processes`
pub const DEFAULT_MAX_PROCESSES: u32 = 64;

const REMOVE_ATTEMPTS: u32 = 20;
const REMOVE_BACKOFF: Duration = Duration::from_millis(5);

/// Parent cgroup under which execution leaves are created
#[derive(Debug, Clone)]
pub struct CgroupRoot {
    path: PathBuf,
    max_processes: u32,
}

impl CgroupRoot {
    /// Prepare `path` (created if missing) as the parent of execution leaves
    /// and enable the memory and pids controllers for its children.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path).map_err(|e| {
            SandboxError::cgroup(format!("failed to create {}", path.display()), e)
        })?;

        let controllers = fs::read_to_string(path.join("cgroup.controllers")).map_err(|e| {
            SandboxError::cgroup(format!("{} is not a cgroup v2 directory", path.display()), e)
        })?;
        for controller in ["memory", "pids"] {
            if !controllers.split_whitespace().any(|c| c == controller) {
                return Err(SandboxError::cgroup(
                    format!("{} controller is not available in {}", controller, path.display()),
                    io::Error::from(io::ErrorKind::Unsupported),
                ));
            }
        }
        fs::write(path.join("cgroup.subtree_control"), "+memory +pids").map_err(|e| {
            SandboxError::cgroup(
                format!("failed to enable controllers in {}", path.display()),
                e,
            )
        })?;

        Ok(Self {
            path,
            max_processes: DEFAULT_MAX_PROCESSES,
        })
    }

    pub fn with_max_processes(mut self, max_processes: u32) -> Self {
        self.max_processes = max_processes.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a fresh leaf limited to `memory_bytes` with swap disabled
    pub fn create_leaf(&self, memory_bytes: u64) -> Result<CgroupLeaf, SandboxError> {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let name = format!(
            "box-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        let path = self.path.join(name);
        fs::create_dir(&path).map_err(|e| {
            SandboxError::cgroup(format!("failed to create {}", path.display()), e)
        })?;

        // From here on the directory is removed by LeafDir's drop on error
        let dir = LeafDir(path);
        dir.write("memory.max", &memory_bytes.to_string())?;
        dir.write("pids.max", &self.max_processes.to_string())?;
        // Absent when swap accounting or oom groups are not compiled in
        dir.write_optional("memory.swap.max", "0");
        dir.write_optional("memory.oom.group", "1");

        let procs = OpenOptions::new()
            .write(true)
            .open(dir.0.join("cgroup.procs"))
            .map_err(|e| SandboxError::cgroup("failed to open cgroup.procs", e))?;

        debug!("Created cgroup leaf {}", dir.0.display());
        Ok(CgroupLeaf { procs, dir })
    }
}

struct LeafDir(PathBuf);

impl LeafDir {
    fn write(&self, file: &str, value: &str) -> Result<(), SandboxError> {
        fs::write(self.0.join(file), value)
            .map_err(|e| SandboxError::cgroup(format!("failed to set {}", file), e))
    }

    fn write_optional(&self, file: &str, value: &str) {
        let path = self.0.join(file);
        if path.exists() {
            if let Err(e) = fs::write(&path, value) {
                warn!("Failed to set {}: {}", file, e);
            }
        }
    }

    fn read(&self, file: &str) -> Option<String> {
        fs::read_to_string(self.0.join(file)).ok()
    }
}

impl Drop for LeafDir {
    fn drop(&mut self) {
        // cgroup.kill exists since 5.14; the group is usually empty already
        let _ = fs::write(self.0.join("cgroup.kill"), "1");
        for _ in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.0) {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                // EBUSY while killed members are still exiting
                Err(_) => std::thread::sleep(REMOVE_BACKOFF),
            }
        }
        warn!("Failed to remove cgroup leaf {}", self.0.display());
    }
}

/// One execution's cgroup. Killed and removed on drop.
pub struct CgroupLeaf {
    procs: File,
    dir: LeafDir,
}

impl CgroupLeaf {
    pub fn path(&self) -> &Path {
        &self.dir.0
    }

    /// Descriptor of the leaf's `cgroup.procs`, for [`join`] in the child
    pub fn procs_fd(&self) -> RawFd {
        self.procs.as_raw_fd()
    }

    /// Peak memory charged to the leaf in KB. Kernels before 5.19 lack
    /// `memory.peak`; `memory.current` is the best remaining figure.
    pub fn peak_kb(&self) -> Option<u64> {
        self.dir
            .read("memory.peak")
            .or_else(|| self.dir.read("memory.current"))
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|bytes| bytes / 1024)
    }

    /// The kernel OOM killer fired inside the leaf
    pub fn oom_killed(&self) -> bool {
        self.dir
            .read("memory.events")
            .is_some_and(|events| parse_oom_kills(&events) > 0)
    }

    /// Kill every process in the leaf, including ones that left the
    /// process group
    pub fn kill(&self) {
        let _ = fs::write(self.dir.0.join("cgroup.kill"), "1");
    }
}

impl std::fmt::Debug for CgroupLeaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgroupLeaf").field("path", &self.dir.0).finish()
    }
}

/// Move the calling process into the leaf behind `procs_fd`.
///
/// Runs in the forked child before exec: a single write(2).
pub fn join(procs_fd: RawFd) -> io::Result<()> {
    // SAFETY: the descriptor belongs to a CgroupLeaf that outlives the spawn
    let fd = unsafe { BorrowedFd::borrow_raw(procs_fd) };
    nix::unistd::write(fd, b"0")?;
    Ok(())
}

/// `oom_kill` counter from the content of `memory.events`
fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_oom_kills() {
        let events = "low 0\nhigh 0\nmax 12\noom 1\noom_kill 1\noom_group_kill 0\n";
        assert_eq!(parse_oom_kills(events), 1);
        assert_eq!(parse_oom_kills("low 0\nmax 0\noom 0\noom_kill 0\n"), 0);
        assert_eq!(parse_oom_kills(""), 0);
    }

    #[test]
    fn test_open_rejects_non_cgroup_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = CgroupRoot::open(dir.path()).unwrap_err();
        assert!(matches!(err, SandboxError::Cgroup { .. }));
    }

    /// Needs a delegated cgroup v2 directory in JUDGE_TEST_CGROUP_ROOT
    #[test]
    fn test_leaf_lifecycle() {
        let Ok(root) = std::env::var("JUDGE_TEST_CGROUP_ROOT") else {
            return;
        };
        let root = CgroupRoot::open(root).unwrap().with_max_processes(8);
        let leaf = root.create_leaf(64 * 1024 * 1024).unwrap();
        let path = leaf.path().to_path_buf();
        assert_eq!(
            fs::read_to_string(path.join("memory.max")).unwrap().trim(),
            (64 * 1024 * 1024).to_string()
        );
        assert_eq!(fs::read_to_string(path.join("pids.max")).unwrap().trim(), "8");
        assert!(!leaf.oom_killed());
        drop(leaf);
        assert!(!path.exists());
    }
}
