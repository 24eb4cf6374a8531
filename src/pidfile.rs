use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Advisory single-instance guard: writes the current pid on acquire and
/// unlinks the file on drop. A pidfile naming a live process blocks startup.
#[derive(Debug)]
pub struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    pub fn acquire(path: PathBuf) -> Result<PidGuard> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create pidfile dir {:?}", parent))?;
        }

        if path.exists() {
            if let Some(existing) = read_pid(&path)
                && pid_is_running(existing)
            {
                bail!(
                    "PID file exists and process appears running (pid={existing}): {:?}",
                    path
                );
            }
            // Stale or unreadable pidfile from a dead process.
            let _ = fs::remove_file(&path);
        }

        fs::write(&path, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write pidfile {:?}", path))?;
        Ok(PidGuard { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        // Best effort; a missing file on release is fine.
        let _ = fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Option<i64> {
    let text = fs::read_to_string(path).ok()?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.parse().ok()
}

#[cfg(unix)]
fn pid_is_running(pid: i64) -> bool {
    if pid <= 0 || pid > libc::pid_t::MAX as i64 {
        return false;
    }
    // Signal-zero probe; EPERM means the process exists but is not ours.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_is_running(_pid: i64) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pid_path() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("promptlens-test-{}", uuid::Uuid::new_v4()));
        dir.join("plens.pid")
    }

    #[test]
    fn acquire_writes_pid_and_release_removes_it() {
        let path = temp_pid_path();
        {
            let guard = PidGuard::acquire(path.clone()).expect("acquire");
            assert_eq!(guard.path(), path.as_path());
            let text = fs::read_to_string(&path).expect("pidfile readable");
            assert_eq!(text, format!("{}\n", std::process::id()));
        }
        assert!(!path.exists(), "pidfile should be removed on drop");
    }

    #[test]
    fn stale_pidfile_is_taken_over() {
        let path = temp_pid_path();
        fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        fs::write(&path, "not-a-pid\n").expect("write stale file");

        let _guard = PidGuard::acquire(path.clone()).expect("acquire over stale file");
        let text = fs::read_to_string(&path).expect("pidfile readable");
        assert_eq!(text.trim().parse::<u32>().ok(), Some(std::process::id()));
    }

    #[test]
    fn running_pid_blocks_acquire() {
        let path = temp_pid_path();
        fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        // Our own pid is definitely alive.
        fs::write(&path, format!("{}\n", std::process::id())).expect("write pidfile");

        let err = PidGuard::acquire(path.clone()).expect_err("should refuse to start");
        let msg = err.to_string();
        assert!(
            msg.contains(&std::process::id().to_string()) && msg.contains("plens.pid"),
            "error should name pid and path: {msg}"
        );
        assert!(path.exists(), "conflicting pidfile must be left in place");
    }

    #[test]
    fn missing_file_on_release_is_not_an_error() {
        let path = temp_pid_path();
        let guard = PidGuard::acquire(path.clone()).expect("acquire");
        fs::remove_file(&path).expect("remove behind the guard's back");
        drop(guard);
    }
}
