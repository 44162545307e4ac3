//! Creates playback sessions from validated configuration.

use std::path::{Path, PathBuf};

use crate::options::MpvOptions;
use crate::playback::{MpvPlayback, PlaybackError};
use crate::process::{find_mpv, verify_executable, ProcessError};

/// Factory for [`MpvPlayback`] sessions sharing one executable and option
/// set.
pub struct MpvPlaybackFactory {
  executable: PathBuf,
  options: MpvOptions,
}

impl MpvPlaybackFactory {
  /// Resolve and verify the mpv executable and validate the options.
  ///
  /// With no explicit path the executable is looked up on PATH and in
  /// common install locations. A failure to launch it is an initialization
  /// error; there is no retry.
  pub async fn new(
    executable: Option<PathBuf>,
    options: MpvOptions,
  ) -> Result<Self, PlaybackError> {
    let executable = executable.or_else(find_mpv).ok_or(ProcessError::NotFound)?;
    verify_executable(&executable).await?;
    options.validate().map_err(PlaybackError::InvalidOptions)?;
    log::debug!("using mpv executable {:?}", executable);
    Ok(Self {
      executable,
      options,
    })
  }

  /// Start playback of a local media file.
  pub async fn create_playback(&self, file: &Path) -> Result<MpvPlayback, PlaybackError> {
    if !file.is_file() {
      return Err(PlaybackError::FileNotFound(file.to_path_buf()));
    }
    let file = file.canonicalize()?;
    MpvPlayback::start(&self.executable, &self.options, &file.to_string_lossy()).await
  }

  /// Start playback of a video by id, letting mpv resolve the stream
  /// through its ytdl hook.
  pub async fn create_ytdl_playback(&self, video_id: &str) -> Result<MpvPlayback, PlaybackError> {
    log::debug!("creating playback for {}", video_id);
    MpvPlayback::start(
      &self.executable,
      &self.options,
      &format!("ytdl://{}", video_id),
    )
    .await
  }
}
