//! Shared test utilities for `process_monitor` unit tests.
//!
//! Only compiled during testing (`#[cfg(test)]`).

use crate::monitor::Clock;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use tempfile::TempDir;

/// Serializes tests that modify the APPDATA environment variable.
static APPDATA_LOCK: Mutex<()> = Mutex::new(());

/// Create a temporary directory removed on drop
pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Clock returning `start_ms`, then advancing by `step_ms` on every reading
pub fn stepping_clock(start_ms: i64, step_ms: i64) -> Clock {
    let now = Arc::new(AtomicI64::new(start_ms));
    Arc::new(move || now.fetch_add(step_ms, Ordering::SeqCst))
}

/// RAII guard pointing APPDATA at a temp directory for the test scope
///
/// Config and log paths derive from APPDATA. The guard holds `APPDATA_LOCK`
/// for its whole lifetime so no two tests change the variable at once, and
/// restores the previous value (or removes it) on drop, including on panic.
pub struct AppdataGuard {
    original: Option<String>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

#[expect(
    unsafe_code,
    reason = "Test-only environment mutation serialized by APPDATA_LOCK"
)]
impl AppdataGuard {
    /// Set APPDATA to `temp_dir` until the guard is dropped
    pub fn new(temp_dir: &TempDir) -> Self {
        // A test that panicked while holding the lock must not block the rest
        let lock = APPDATA_LOCK
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let original = std::env::var("APPDATA").ok();
        // SAFETY: APPDATA is only written while APPDATA_LOCK is held, and only
        // the tests holding the lock read paths derived from it
        unsafe {
            std::env::set_var("APPDATA", temp_dir.path());
        }
        Self {
            original,
            _lock: lock,
        }
    }
}

#[expect(
    unsafe_code,
    reason = "Test-only environment mutation serialized by APPDATA_LOCK"
)]
impl Drop for AppdataGuard {
    fn drop(&mut self) {
        // SAFETY: still holding APPDATA_LOCK (released after this body runs)
        unsafe {
            match &self.original {
                Some(original) => std::env::set_var("APPDATA", original),
                None => std::env::remove_var("APPDATA"),
            }
        }
    }
}

#[test]
fn stepping_clock_advances() {
    let clock = stepping_clock(1000, 50);
    assert_eq!(clock(), 1000);
    assert_eq!(clock(), 1050);
}
