//! mpv executable discovery and process spawning.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProcessError {
  #[error("mpv executable not found")]
  NotFound,
  #[error("failed to spawn mpv: {0}")]
  SpawnFailed(#[from] std::io::Error),
}

/// Generate a fresh IPC endpoint path for one playback session.
///
/// mpv creates the endpoint itself when launched with
/// `--input-ipc-server=<path>`; a random name keeps concurrent sessions from
/// colliding.
pub(crate) fn create_ipc_path() -> PathBuf {
  let id = Uuid::new_v4();
  #[cfg(windows)]
  {
    PathBuf::from(format!(r"\\.\pipe\{}", id))
  }
  #[cfg(not(windows))]
  {
    std::env::temp_dir().join(id.to_string())
  }
}

#[cfg(windows)]
const FALLBACK_LOCATIONS: &[&str] = &[
  r"C:\Program Files\mpv\mpv.exe",
  r"C:\Program Files (x86)\mpv\mpv.exe",
  r"C:\mpv\mpv.exe",
];

#[cfg(target_os = "macos")]
const FALLBACK_LOCATIONS: &[&str] = &[
  "/usr/local/bin/mpv",
  "/opt/homebrew/bin/mpv",
  "/Applications/mpv.app/Contents/MacOS/mpv",
];

#[cfg(all(not(windows), not(target_os = "macos")))]
const FALLBACK_LOCATIONS: &[&str] = &["/usr/bin/mpv", "/usr/local/bin/mpv"];

/// Locate the mpv executable on PATH or in common install locations.
pub fn find_mpv() -> Option<PathBuf> {
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }
  FALLBACK_LOCATIONS
    .iter()
    .copied()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

/// Check that the executable starts at all.
///
/// Runs `mpv -h --no-config` and discards its output; only a failure to
/// launch counts as an error.
pub(crate) async fn verify_executable(executable: &Path) -> Result<(), ProcessError> {
  let status = Command::new(executable)
    .args(["-h", "--no-config"])
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .status()
    .await?;
  log::debug!("mpv executable check exited with {}", status);
  Ok(())
}

/// Spawn mpv detached from our stdio.
pub(crate) fn spawn_mpv(executable: &Path, args: &[String]) -> Result<Child, ProcessError> {
  log::info!("spawning mpv: {:?}", executable);
  log::debug!("mpv arguments: {:?}", args);
  let child = Command::new(executable)
    .args(args)
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .spawn()?;
  Ok(child)
}
