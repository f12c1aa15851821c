//! Polling notification source
//!
//! Takes a snapshot of running processes (PID → image name) at a fixed
//! interval and reports the difference to the previous snapshot as creation
//! and deletion records. Used where WMI is unavailable or not wanted.
//!
//! Snapshots come from the Toolhelp32 API on Windows and from `sysinfo`
//! elsewhere. Processes that start and exit between two polls are never seen.

use crate::error::{ProcessMonitorError, Result};
use crate::monitor::source::{NotificationSource, RawProcessRecord, RecordHandler};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

#[cfg(windows)]
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW, TH32CS_SNAPPROCESS,
};

#[cfg(windows)]
use windows::Win32::Foundation::{CloseHandle, ERROR_NO_MORE_FILES};

/// Running processes keyed by PID
type Snapshot = HashMap<u32, String>;

/// Longest uninterrupted sleep of the poller, bounds how long unsubscribe waits
const STOP_CHECK_SLICE: Duration = Duration::from_millis(50);

/// Typical Windows system has 150-250 processes
const DEFAULT_PROCESS_COUNT: usize = 200;

/// Process source that diffs periodic snapshots
pub struct PollingSource {
    /// Polling interval
    interval: Duration,
    /// Stop flag of the current poller thread
    stop: Arc<AtomicBool>,
    /// Poller thread, present while subscribed
    worker: Option<JoinHandle<()>>,
}

impl PollingSource {
    /// Create a polling source with the given interval
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Polling interval
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl NotificationSource for PollingSource {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn subscribe(&mut self, handler: RecordHandler) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        // Baseline snapshot taken synchronously so an unusable facility fails the subscribe
        let baseline = take_snapshot()?;
        info!(
            "Polling source subscribed ({} processes, interval {:?})",
            baseline.len(),
            self.interval
        );

        let stop = Arc::new(AtomicBool::new(false));
        self.stop = Arc::clone(&stop);
        let interval = self.interval;

        let worker = thread::Builder::new()
            .name("process-poller".to_string())
            .spawn(move || run_poller(baseline, interval, &stop, &handler))
            .map_err(ProcessMonitorError::ThreadSpawn)?;
        self.worker = Some(worker);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Process poller thread panicked");
            }
            info!("Polling source unsubscribed");
        }
    }
}

fn run_poller(mut previous: Snapshot, interval: Duration, stop: &AtomicBool, handler: &RecordHandler) {
    let mut estimated_process_count = previous.len().max(DEFAULT_PROCESS_COUNT);

    while sleep_unless_stopped(interval, stop) {
        match take_snapshot_with_capacity(estimated_process_count) {
            Ok(current) => {
                let records = diff_snapshots(&previous, &current);
                if !records.is_empty() {
                    debug!("Poll detected {} process transitions", records.len());
                    handler(&records);
                }

                // Exponential moving average smooths out the capacity hint
                estimated_process_count = (estimated_process_count * 3 + current.len()) / 4;
                previous = current;
            }
            Err(e) => error!("Error polling processes: {}", e),
        }
    }
    debug!("Process poller exited");
}

/// Sleep for `interval` in short slices; returns false once `stop` is set
fn sleep_unless_stopped(interval: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_CHECK_SLICE));
    }
}

/// Records describing the change from `previous` to `current`
///
/// Deletions come before creations, each ordered by PID. A PID whose image
/// name changed was reused by a new process and yields both.
fn diff_snapshots(previous: &Snapshot, current: &Snapshot) -> Vec<RawProcessRecord> {
    let mut deleted: Vec<RawProcessRecord> = previous
        .iter()
        .filter(|(pid, name)| current.get(*pid) != Some(*name))
        .map(|(pid, name)| RawProcessRecord::deletion(name.clone(), *pid))
        .collect();
    let mut created: Vec<RawProcessRecord> = current
        .iter()
        .filter(|(pid, name)| previous.get(*pid) != Some(*name))
        .map(|(pid, name)| RawProcessRecord::creation(name.clone(), *pid))
        .collect();

    deleted.sort_by_key(|record| record.pid);
    created.sort_by_key(|record| record.pid);
    deleted.extend(created);
    deleted
}

fn take_snapshot() -> Result<Snapshot> {
    take_snapshot_with_capacity(DEFAULT_PROCESS_COUNT)
}

/// Enumerate running processes with the Windows Toolhelp32 API
///
/// # Safety
///
/// `CreateToolhelp32Snapshot` called with valid flags (`TH32CS_SNAPPROCESS`, PID 0).
/// Handle wrapped in `SnapshotGuard` (RAII) for cleanup. `PROCESSENTRY32W`
/// initialized with correct `dwSize`. `Process32FirstW`/`NextW` return codes
/// checked before data access; `ERROR_NO_MORE_FILES` ends iteration.
#[cfg(windows)]
#[expect(
    unsafe_code,
    reason = "Windows FFI for process enumeration via CreateToolhelp32Snapshot and Process32FirstW/NextW"
)]
fn take_snapshot_with_capacity(capacity: usize) -> Result<Snapshot> {
    use tracing::warn;

    let snapshot = unsafe {
        CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0).map_err(|e| {
            error!("Windows API error - CreateToolhelp32Snapshot failed: {e}");
            ProcessMonitorError::Subscription(Box::new(e))
        })?
    };
    let _guard = SnapshotGuard(snapshot);

    let mut processes = HashMap::with_capacity(capacity);

    #[expect(
        clippy::cast_possible_truncation,
        reason = "size_of::<PROCESSENTRY32W>() is a compile-time constant (592 bytes) that fits in u32"
    )]
    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };

    let mut has_process = unsafe { Process32FirstW(snapshot, &raw mut entry).is_ok() };
    while has_process {
        if let Some(name) = extract_process_name(&entry.szExeFile) {
            processes.insert(entry.th32ProcessID, name);
        }

        has_process = unsafe {
            match Process32NextW(snapshot, &raw mut entry) {
                Ok(()) => true,
                Err(e) => {
                    if e.code() != ERROR_NO_MORE_FILES.to_hresult() {
                        warn!("Error iterating processes: {e}");
                    }
                    false
                }
            }
        };
    }

    Ok(processes)
}

/// Enumerate running processes with `sysinfo`
#[cfg(not(windows))]
fn take_snapshot_with_capacity(capacity: usize) -> Result<Snapshot> {
    use sysinfo::{ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut processes = HashMap::with_capacity(capacity.max(system.processes().len()));
    for (pid, process) in system.processes() {
        processes.insert(pid.as_u32(), process.name().to_string_lossy().into_owned());
    }
    Ok(processes)
}

/// RAII guard for Windows snapshot handle
#[cfg(windows)]
struct SnapshotGuard(windows::Win32::Foundation::HANDLE);

#[cfg(windows)]
impl Drop for SnapshotGuard {
    #[expect(
        unsafe_code,
        reason = "Windows FFI for CloseHandle to release snapshot handle"
    )]
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Convert the NUL-terminated `szExeFile` field to a `String`
#[cfg(windows)]
fn extract_process_name(sz_exe_file: &[u16; 260]) -> Option<String> {
    let len = sz_exe_file
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(sz_exe_file.len());
    String::from_utf16(&sz_exe_file[..len]).ok()
}
