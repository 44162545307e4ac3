//! mpv JSON IPC wire types.
//!
//! One JSON object per `\n`-terminated line, UTF-8. Incoming lines are either
//! a reply correlated to an earlier command or an unsolicited event; the wire
//! format does not tag which, so decoding tries the response shape first and
//! falls back to the event shape.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command sent to mpv.
///
/// The first element of `command` is the command name, the rest are its
/// arguments. The request id is assigned by the issuing client and echoed
/// back in the matching [`MpvResponse`].
#[derive(Debug, Clone, Serialize)]
pub struct MpvCommand {
  pub command: Vec<Value>,
  pub request_id: i64,
}

impl MpvCommand {
  pub fn new(args: Vec<Value>, request_id: i64) -> Self {
    Self {
      command: args,
      request_id,
    }
  }

  /// Serialize to a single wire line (JSON escaping keeps it newline-free).
  pub fn to_line(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }
}

/// Reply to a command.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvResponse {
  /// "success", or an error description.
  pub error: String,
  /// Command-specific payload.
  pub data: Option<Value>,
  /// Id of the command this replies to.
  pub request_id: i64,
}

impl MpvResponse {
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }
}

/// Unsolicited notification from mpv.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvEvent {
  /// Event type, e.g. "property-change", "file-loaded", "shutdown".
  pub event: String,
  /// Observed property name, for property-change events.
  pub name: Option<String>,
  /// New property value; may be null when the property has no value yet.
  pub data: Option<Value>,
  /// Any further event-specific fields.
  #[serde(flatten)]
  pub extra: serde_json::Map<String, Value>,
}

/// Decoded incoming line.
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  Event(MpvEvent),
}

impl MpvMessage {
  /// Parse one line from mpv.
  ///
  /// Tries the response shape first; if the line does not carry the response
  /// fields it is reparsed as an event.
  pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
    match serde_json::from_str::<MpvResponse>(line) {
      Ok(response) => Ok(MpvMessage::Response(response)),
      Err(_) => serde_json::from_str::<MpvEvent>(line).map(MpvMessage::Event),
    }
  }
}

/// Well-known observable properties.
///
/// Reference: https://mpv.io/manual/master/#properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpvProperty {
  /// Playback position in fractional seconds (double).
  PlaybackPosition,
  /// Whether playback is paused (bool).
  Pause,
}

impl MpvProperty {
  pub fn external_name(self) -> &'static str {
    match self {
      MpvProperty::PlaybackPosition => "time-pos",
      MpvProperty::Pause => "pause",
    }
  }
}

/// Well-known event names.
///
/// Reference: https://mpv.io/manual/master/#list-of-events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpvEventName {
  FileLoaded,
  Shutdown,
}

impl MpvEventName {
  pub fn external_name(self) -> &'static str {
    match self {
      MpvEventName::FileLoaded => "file-loaded",
      MpvEventName::Shutdown => "shutdown",
    }
  }
}
