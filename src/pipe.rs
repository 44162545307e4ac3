//! Local IPC transports for the mpv JSON protocol.
//!
//! mpv serves its IPC protocol on a named pipe on Windows and on a Unix
//! domain socket elsewhere. Both are wrapped behind the [`Pipe`] trait with
//! one shared contract: `read_line` returns `Ok(None)` while no complete
//! line is available and `Err(PipeError::Eof)` once the peer has closed the
//! channel for good.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::framer::{DecodeError, LineFramer};

#[derive(Debug, Error)]
pub enum PipeError {
  #[error("failed to connect to IPC endpoint: {0}")]
  Connect(io::Error),
  #[error("pipe I/O failed: {0}")]
  Io(#[from] io::Error),
  #[error(transparent)]
  Decode(#[from] DecodeError),
  #[error("end of stream")]
  Eof,
  #[error("pipe is closed")]
  Closed,
}

/// Duplex line-oriented channel to the player process.
///
/// Reads are owned by a single reader (the client's read loop); writes may
/// come from any task and are serialized internally.
#[async_trait]
pub trait Pipe: Send + Sync {
  /// Try to read the next complete line, without its terminator.
  ///
  /// `Ok(None)` means no line is available right now; callers poll again
  /// later. `Err(PipeError::Eof)` means no further line will ever arrive.
  fn read_line(&self) -> Result<Option<String>, PipeError>;

  /// Write one line, appending the terminator if missing, and flush.
  async fn write_line(&self, line: &str) -> Result<(), PipeError>;

  /// Mark the pipe closed; idempotent. The OS handle is released when the
  /// pipe is dropped.
  fn close(&self);
}

/// Open the platform transport for the given endpoint path.
pub async fn connect(path: &Path) -> Result<Arc<dyn Pipe>, PipeError> {
  #[cfg(windows)]
  {
    Ok(Arc::new(NamedPipe::connect(path)?))
  }
  #[cfg(not(windows))]
  {
    Ok(Arc::new(UnixPipe::connect(path).await?))
  }
}

fn terminated(line: &str) -> Vec<u8> {
  let mut data = line.as_bytes().to_vec();
  if !line.ends_with('\n') {
    data.push(b'\n');
  }
  data
}

/// Unix domain socket transport.
#[cfg(not(windows))]
pub struct UnixPipe {
  stream: tokio::net::UnixStream,
  framer: Mutex<LineFramer>,
  write_lock: tokio::sync::Mutex<()>,
  closed: AtomicBool,
}

#[cfg(not(windows))]
impl UnixPipe {
  pub async fn connect(path: &Path) -> Result<Self, PipeError> {
    let stream = tokio::net::UnixStream::connect(path)
      .await
      .map_err(PipeError::Connect)?;
    Ok(Self {
      stream,
      framer: Mutex::new(LineFramer::new()),
      write_lock: tokio::sync::Mutex::new(()),
      closed: AtomicBool::new(false),
    })
  }
}

#[cfg(not(windows))]
#[async_trait]
impl Pipe for UnixPipe {
  fn read_line(&self) -> Result<Option<String>, PipeError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(PipeError::Eof);
    }
    let mut framer = self.framer.lock();
    loop {
      if let Some(line) = framer.next_line() {
        return Ok(Some(line));
      }
      let mut buf = [0u8; 2048];
      match self.stream.try_read(&mut buf) {
        Ok(0) => {
          framer.finish()?;
          return Err(PipeError::Eof);
        }
        Ok(n) => framer.push(&buf[..n])?,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) => return Err(PipeError::Io(e)),
      }
    }
  }

  async fn write_line(&self, line: &str) -> Result<(), PipeError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(PipeError::Closed);
    }
    let _guard = self.write_lock.lock().await;
    let data = terminated(line);
    let mut written = 0;
    while written < data.len() {
      self.stream.writable().await?;
      match self.stream.try_write(&data[written..]) {
        Ok(n) => written += n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
        Err(e) => return Err(PipeError::Io(e)),
      }
    }
    Ok(())
  }

  fn close(&self) {
    self.closed.store(true, Ordering::Release);
  }
}

/// Windows named pipe transport.
#[cfg(windows)]
pub struct NamedPipe {
  client: tokio::net::windows::named_pipe::NamedPipeClient,
  framer: Mutex<LineFramer>,
  write_lock: tokio::sync::Mutex<()>,
  closed: AtomicBool,
}

#[cfg(windows)]
impl NamedPipe {
  pub fn connect(path: &Path) -> Result<Self, PipeError> {
    let client = tokio::net::windows::named_pipe::ClientOptions::new()
      .open(path)
      .map_err(PipeError::Connect)?;
    Ok(Self {
      client,
      framer: Mutex::new(LineFramer::new()),
      write_lock: tokio::sync::Mutex::new(()),
      closed: AtomicBool::new(false),
    })
  }
}

#[cfg(windows)]
#[async_trait]
impl Pipe for NamedPipe {
  fn read_line(&self) -> Result<Option<String>, PipeError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(PipeError::Eof);
    }
    let mut framer = self.framer.lock();
    loop {
      if let Some(line) = framer.next_line() {
        return Ok(Some(line));
      }
      let mut buf = [0u8; 2048];
      match self.client.try_read(&mut buf) {
        Ok(0) => {
          framer.finish()?;
          return Err(PipeError::Eof);
        }
        Ok(n) => framer.push(&buf[..n])?,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) => return Err(PipeError::Io(e)),
      }
    }
  }

  async fn write_line(&self, line: &str) -> Result<(), PipeError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(PipeError::Closed);
    }
    let _guard = self.write_lock.lock().await;
    let data = terminated(line);
    let mut written = 0;
    while written < data.len() {
      self.client.writable().await?;
      match self.client.try_write(&data[written..]) {
        Ok(n) => written += n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
        Err(e) => return Err(PipeError::Io(e)),
      }
    }
    Ok(())
  }

  fn close(&self) {
    self.closed.store(true, Ordering::Release);
  }
}
