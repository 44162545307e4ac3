//! Lifecycle of one mpv process playing one media item.
//!
//! Spawning, IPC wiring, pause/position mirroring and the graceful-then-
//! forced shutdown sequence live here. Feedback flows to the embedding host
//! through an [`async_channel`] of [`PlaybackFeedback`] values.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::client::{ApiError, MpvApi};
use crate::options::MpvOptions;
use crate::pipe;
use crate::process::{create_ipc_path, spawn_mpv, ProcessError};
use crate::protocol::MpvProperty;

/// Time mpv needs to create its IPC endpoint after launch.
const LOAD_TIME: Duration = Duration::from_secs(2);
/// Interval between checks while waiting for the IPC connection.
const API_ONLINE_WAIT: Duration = Duration::from_millis(200);
/// How long a quit command may take before shutdown moves on.
const QUIT_TIMEOUT: Duration = Duration::from_secs(1);
/// How long the process may take to exit before it is killed.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PlaybackError {
  #[error(transparent)]
  Process(#[from] ProcessError),
  #[error(transparent)]
  Api(#[from] ApiError),
  #[error("invalid mpv options: {0}")]
  InvalidOptions(String),
  #[error("file not found: {}", .0.display())]
  FileNotFound(PathBuf),
  #[error("failed to resolve media file: {0}")]
  Io(#[from] std::io::Error),
  #[error("mpv IPC connection is not available")]
  NotConnected,
}

/// Remote playback state, mirrored from the player's pause property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
  Play,
  Pause,
}

/// Notification to the embedding host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackFeedback {
  /// The player switched between playing and paused.
  State(PlaybackState),
  /// The playback position changed.
  Progress(Duration),
  /// The process exited; the session is done.
  Finished,
}

enum ApiSlot {
  Connecting,
  Ready(Arc<MpvApi>),
  Failed,
}

/// One running mpv process and its IPC session.
///
/// The session owns the pipe and the API client exclusively; nothing else
/// may touch the transport.
pub struct MpvPlayback {
  api: Arc<RwLock<ApiSlot>>,
  pipe: Arc<RwLock<Option<Arc<dyn pipe::Pipe>>>>,
  kill: CancellationToken,
  exit_rx: async_channel::Receiver<()>,
  feedback_rx: async_channel::Receiver<PlaybackFeedback>,
}

impl MpvPlayback {
  /// Launch mpv for the given media reference (a file path, URL, or
  /// `ytdl://` pseudo-URL) and wire up its IPC session in the background.
  ///
  /// The player starts paused; call [`play`](Self::play) to begin.
  pub async fn start(
    executable: &Path,
    options: &MpvOptions,
    media: &str,
  ) -> Result<Self, PlaybackError> {
    let ipc_path = create_ipc_path();
    let args = build_args(&ipc_path, options, media);
    let child = spawn_mpv(executable, &args)?;

    let (exit_tx, exit_rx) = async_channel::bounded(1);
    let (feedback_tx, feedback_rx) = async_channel::unbounded();
    let kill = CancellationToken::new();
    tokio::spawn(watch_process(
      child,
      exit_tx,
      kill.clone(),
      feedback_tx.clone(),
    ));

    let api = Arc::new(RwLock::new(ApiSlot::Connecting));
    let pipe_slot = Arc::new(RwLock::new(None));
    tokio::spawn(connect_api(
      ipc_path,
      api.clone(),
      pipe_slot.clone(),
      feedback_tx,
    ));

    Ok(Self {
      api,
      pipe: pipe_slot,
      kill,
      exit_rx,
      feedback_rx,
    })
  }

  /// Receiver for state, progress and completion notifications.
  pub fn feedback(&self) -> async_channel::Receiver<PlaybackFeedback> {
    self.feedback_rx.clone()
  }

  /// Resume playback.
  pub async fn play(&self) -> Result<(), PlaybackError> {
    let api = self.api().await?;
    api
      .set_property(MpvProperty::Pause.external_name(), false)
      .await?;
    Ok(())
  }

  /// Pause playback.
  pub async fn pause(&self) -> Result<(), PlaybackError> {
    let api = self.api().await?;
    api
      .set_property(MpvProperty::Pause.external_name(), true)
      .await?;
    Ok(())
  }

  /// Shut the session down: ask the player to quit, release the IPC
  /// resources, then wait up to a bounded timeout for the process to exit
  /// before killing it.
  pub async fn close(&self) {
    let api = {
      match &*self.api.read() {
        ApiSlot::Ready(api) => Some(api.clone()),
        _ => None,
      }
    };
    if let Some(api) = api {
      match tokio::time::timeout(QUIT_TIMEOUT, api.quit()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("could not send quit command to mpv: {}", e),
        Err(_) => log::warn!("mpv did not acknowledge the quit command"),
      }
      api.close();
    }
    if let Some(pipe) = self.pipe.write().take() {
      pipe.close();
    }
    await_process_exit(&self.exit_rx, &self.kill, EXIT_TIMEOUT).await;
  }

  /// Wait until the background connector has produced the API client.
  async fn api(&self) -> Result<Arc<MpvApi>, PlaybackError> {
    loop {
      {
        match &*self.api.read() {
          ApiSlot::Ready(api) => return Ok(api.clone()),
          ApiSlot::Failed => return Err(PlaybackError::NotConnected),
          ApiSlot::Connecting => {}
        }
      }
      tokio::time::sleep(API_ONLINE_WAIT).await;
    }
  }
}

/// Assemble the mpv argument vector: fixed flags, then the option table's
/// output in table order, then extra arguments, then the media reference.
fn build_args(ipc_path: &Path, options: &MpvOptions, media: &str) -> Vec<String> {
  let mut args = vec![
    format!("--input-ipc-server={}", ipc_path.display()),
    "--no-input-terminal".to_string(),
    "--quiet".to_string(),
    "--pause".to_string(),
  ];
  args.extend(options.cli_args());
  args.extend(options.extra_args.iter().cloned());
  args.push(media.to_string());
  args
}

/// Wait for the process to exit, killing it when the token fires.
///
/// A non-zero exit status is logged but still counts as natural completion
/// of the playback session.
async fn watch_process(
  mut child: Child,
  exit_tx: async_channel::Sender<()>,
  kill: CancellationToken,
  feedback_tx: async_channel::Sender<PlaybackFeedback>,
) {
  let status = tokio::select! {
    status = child.wait() => status,
    _ = kill.cancelled() => {
      if let Err(e) = child.start_kill() {
        log::warn!("failed to kill mpv: {}", e);
      }
      child.wait().await
    }
  };
  match status {
    Ok(status) if status.success() => log::debug!("mpv process ended"),
    Ok(status) => log::warn!("mpv exited with non-zero status: {}", status),
    Err(e) => log::warn!("failed to wait for mpv: {}", e),
  }
  let _ = exit_tx.try_send(());
  let _ = feedback_tx.try_send(PlaybackFeedback::Finished);
}

/// Give mpv time to create its IPC endpoint, then connect and attach the
/// pause and position listeners. A connection failure leaves the session in
/// the failed state; it does not tear down the process.
async fn connect_api(
  ipc_path: PathBuf,
  api_slot: Arc<RwLock<ApiSlot>>,
  pipe_slot: Arc<RwLock<Option<Arc<dyn pipe::Pipe>>>>,
  feedback_tx: async_channel::Sender<PlaybackFeedback>,
) {
  tokio::time::sleep(LOAD_TIME).await;

  let pipe = match pipe::connect(&ipc_path).await {
    Ok(pipe) => pipe,
    Err(e) => {
      log::warn!("could not connect to mpv IPC endpoint: {}", e);
      *api_slot.write() = ApiSlot::Failed;
      return;
    }
  };
  *pipe_slot.write() = Some(pipe.clone());
  let api = Arc::new(MpvApi::new(pipe));

  let state_tx = feedback_tx.clone();
  let paused = api
    .add_property_listener(MpvProperty::Pause.external_name(), move |data| {
      if let Value::Bool(paused) = data {
        let state = if paused {
          PlaybackState::Pause
        } else {
          PlaybackState::Play
        };
        let _ = state_tx.try_send(PlaybackFeedback::State(state));
      }
    })
    .await;
  let position = api
    .add_property_listener(MpvProperty::PlaybackPosition.external_name(), move |data| {
      if let Some(seconds) = data.as_f64() {
        let _ = feedback_tx.try_send(PlaybackFeedback::Progress(clamp_position(seconds)));
      }
    })
    .await;

  if let Err(e) = paused.and(position) {
    log::warn!("could not attach mpv property listeners: {}", e);
    api.close();
    *api_slot.write() = ApiSlot::Failed;
    return;
  }
  *api_slot.write() = ApiSlot::Ready(api);
}

/// Convert a reported position to a duration. mpv may report small negative
/// values around start and seeks; those clamp to zero.
fn clamp_position(seconds: f64) -> Duration {
  if seconds.is_finite() && seconds > 0.0 {
    Duration::from_secs_f64(seconds)
  } else {
    Duration::ZERO
  }
}

/// The escalation tail of [`MpvPlayback::close`]: wait the full timeout for
/// a voluntary exit, only then force termination and wait for it to finish.
async fn await_process_exit(
  exit_rx: &async_channel::Receiver<()>,
  kill: &CancellationToken,
  timeout: Duration,
) {
  if tokio::time::timeout(timeout, exit_rx.recv()).await.is_err() {
    log::warn!("there is probably an unclosed mpv process");
    kill.cancel();
    let _ = exit_rx.recv().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_negative_position_clamps_to_zero() {
    assert_eq!(clamp_position(-0.5), Duration::ZERO);
    assert_eq!(clamp_position(0.0), Duration::ZERO);
    assert_eq!(clamp_position(f64::NAN), Duration::ZERO);
    assert_eq!(clamp_position(1.5), Duration::from_millis(1500));
  }

  #[test]
  fn test_build_args_shape() {
    let options = MpvOptions {
      extra_args: vec!["--volume=55".to_string()],
      ..MpvOptions::default()
    };
    let args = build_args(Path::new("/tmp/sock"), &options, "ytdl://abc123");

    assert_eq!(args[0], "--input-ipc-server=/tmp/sock");
    assert_eq!(&args[1..4], ["--no-input-terminal", "--quiet", "--pause"]);
    assert_eq!(args.last().map(String::as_str), Some("ytdl://abc123"));
    // Extra arguments come after the generated flags, before the media.
    assert_eq!(args[args.len() - 2], "--volume=55");
    assert!(args.iter().all(|a| !a.is_empty()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_forced_kill_only_after_full_timeout() {
    let (exit_tx, exit_rx) = async_channel::bounded(1);
    let kill = CancellationToken::new();

    // A process stand-in that never exits on its own and only dies when
    // killed.
    let watcher_kill = kill.clone();
    tokio::spawn(async move {
      watcher_kill.cancelled().await;
      let _ = exit_tx.try_send(());
    });

    let start = tokio::time::Instant::now();
    let timeout = Duration::from_secs(5);
    assert!(!kill.is_cancelled());
    await_process_exit(&exit_rx, &kill, timeout).await;
    assert!(kill.is_cancelled());
    // Paused-clock time must have advanced by the whole timeout before the
    // kill fired.
    assert!(start.elapsed() >= timeout);
  }

  #[tokio::test]
  async fn test_voluntary_exit_skips_the_kill() {
    let (exit_tx, exit_rx) = async_channel::bounded(1);
    let kill = CancellationToken::new();
    exit_tx.try_send(()).unwrap();

    await_process_exit(&exit_rx, &kill, Duration::from_secs(5)).await;
    assert!(!kill.is_cancelled());
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_watcher_reports_exit_and_kills_on_demand() {
    let child = tokio::process::Command::new("sleep")
      .arg("600")
      .spawn()
      .unwrap();
    let (exit_tx, exit_rx) = async_channel::bounded(1);
    let (feedback_tx, feedback_rx) = async_channel::unbounded();
    let kill = CancellationToken::new();
    tokio::spawn(watch_process(child, exit_tx, kill.clone(), feedback_tx));

    // Still running: no exit notification yet.
    assert!(
      tokio::time::timeout(Duration::from_millis(200), exit_rx.recv())
        .await
        .is_err()
    );

    kill.cancel();
    tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
      .await
      .expect("process was not killed")
      .unwrap();
    assert_eq!(feedback_rx.recv().await.unwrap(), PlaybackFeedback::Finished);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_abnormal_exit_is_reported_as_finished() {
    let child = tokio::process::Command::new("false").spawn().unwrap();
    let (exit_tx, exit_rx) = async_channel::bounded(1);
    let (feedback_tx, feedback_rx) = async_channel::unbounded();
    tokio::spawn(watch_process(
      child,
      exit_tx,
      CancellationToken::new(),
      feedback_tx,
    ));

    exit_rx.recv().await.unwrap();
    // A non-zero exit still ends the session as a normal completion.
    assert_eq!(feedback_rx.recv().await.unwrap(), PlaybackFeedback::Finished);
  }
}
