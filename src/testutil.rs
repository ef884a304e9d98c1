//! Shared helpers for tests that touch the filesystem or fork.

use crate::env::Environment;
use std::fs::File;
use std::sync::{Mutex, MutexGuard};
use tempfile::TempDir;

static SERIAL: Mutex<()> = Mutex::new(());

/// Held by every test that opens descriptors or forks, so descriptor counts stay stable.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A directory of empty placeholder executables and an environment searching only it.
pub(crate) fn fake_search_path(names: &[&str]) -> (TempDir, Environment) {
    let dir = tempfile::tempdir().expect("tempdir");
    for name in names {
        File::create(dir.path().join(name)).expect("touch");
    }
    let env = Environment::with_search_path(dir.path().display().to_string());
    (dir, env)
}

/// Search path of the host, for tests that really execute programs.
pub(crate) fn system_env() -> Environment {
    Environment::with_search_path("/usr/local/bin:/usr/bin:/bin")
}

/// Number of descriptors currently open in this process.
pub(crate) fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .or_else(|_| std::fs::read_dir("/dev/fd"))
        .expect("descriptor table")
        .count()
}
