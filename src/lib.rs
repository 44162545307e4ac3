//! Drives an external mpv player over its JSON line IPC protocol.
//!
//! Architecture, bottom up:
//! - `framer` - incremental UTF-8 line decoding over chunked byte reads
//! - `pipe` - duplex line transports (named pipe on Windows, Unix socket
//!   elsewhere) behind one `Pipe` contract
//! - `protocol` - JSON command/response/event types and trial-parse decoding
//! - `client` - async API client: request/response correlation by id plus
//!   property and event listener dispatch
//! - `process` - executable discovery, IPC endpoint naming, spawning
//! - `options` - launch configuration and the flag table derived from it
//! - `playback` - per-media-item process supervision and shutdown escalation
//! - `factory` - session creation from a verified executable and options

mod client;
mod factory;
mod framer;
mod options;
mod pipe;
mod playback;
mod process;
mod protocol;

pub use client::{ApiError, MpvApi};
pub use factory::MpvPlaybackFactory;
pub use framer::{DecodeError, LineFramer};
pub use options::MpvOptions;
#[cfg(windows)]
pub use pipe::NamedPipe;
#[cfg(not(windows))]
pub use pipe::UnixPipe;
pub use pipe::{connect, Pipe, PipeError};
pub use playback::{MpvPlayback, PlaybackError, PlaybackFeedback, PlaybackState};
pub use process::{find_mpv, ProcessError};
pub use protocol::{
  MpvCommand, MpvEvent, MpvEventName, MpvMessage, MpvProperty, MpvResponse,
};
