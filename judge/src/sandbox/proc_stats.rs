//! /proc sampling for the resource watchdog

use std::path::PathBuf;
use std::sync::OnceLock;

use procfs::process::Process;

/// One watchdog sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcSample {
    /// user + system time, including reaped children, in milliseconds
    pub cpu_time_ms: u64,
    /// Current resident set size in KB
    pub rss_kb: u64,
    /// Peak resident set size in KB
    pub peak_rss_kb: u64,
    /// Peak virtual size in KB
    pub peak_vm_kb: u64,
    /// The process has exec'd away from the judge binary. Memory figures of
    /// a process that has not are the judge's own forked image.
    pub exec_done: bool,
}

fn judge_exe() -> Option<&'static PathBuf> {
    static EXE: OnceLock<Option<PathBuf>> = OnceLock::new();
    EXE.get_or_init(|| Process::myself().and_then(|me| me.exe()).ok())
        .as_ref()
}

/// Sample a live process. `None` once the process is gone.
pub fn sample(pid: i32) -> Option<ProcSample> {
    let process = Process::new(pid).ok()?;

    // exe before status: exec is one-way, so a status read after seeing the
    // new exe can only describe the new image
    let exec_done = match (process.exe(), judge_exe()) {
        (Ok(exe), Some(judge)) => &exe != judge,
        _ => false,
    };

    let stat = process.stat().ok()?;
    let ticks = (stat.utime + stat.stime)
        .saturating_add(stat.cutime.max(0) as u64)
        .saturating_add(stat.cstime.max(0) as u64);
    let cpu_time_ms = ticks * 1000 / procfs::ticks_per_second().max(1);

    let mut sample = ProcSample {
        cpu_time_ms,
        exec_done,
        ..ProcSample::default()
    };
    if let Ok(status) = process.status() {
        sample.rss_kb = status.vmrss.unwrap_or(0);
        sample.peak_rss_kb = status.vmhwm.unwrap_or(0).max(sample.rss_kb);
        sample.peak_vm_kb = status.vmpeak.unwrap_or(0);
    }
    Some(sample)
}

/// Peak resident set of the judge process itself, in KB
pub fn own_peak_rss_kb() -> u64 {
    Process::myself()
        .and_then(|me| me.status())
        .ok()
        .and_then(|status| status.vmhwm)
        .unwrap_or(0)
}
