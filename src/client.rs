//! Asynchronous mpv API client.
//!
//! Owns a background read loop over the pipe, correlates command responses
//! to pending requests by request id and dispatches property-change and
//! event notifications to registered listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipe::{Pipe, PipeError};
use crate::protocol::{MpvCommand, MpvEvent, MpvMessage, MpvProperty};

/// Interval between read attempts while the pipe has no line available.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ApiError {
  #[error(transparent)]
  Pipe(#[from] PipeError),
  #[error("failed to encode command: {0}")]
  Json(#[from] serde_json::Error),
  #[error("mpv returned an error: {0}")]
  Mpv(String),
  #[error("command timed out")]
  Timeout,
  #[error("client is closed")]
  Closed,
  #[error("a listener for {0:?} is already registered")]
  ListenerExists(String),
}

type CommandResult = Result<Option<Value>, ApiError>;
type PendingRequests = HashMap<i64, oneshot::Sender<CommandResult>>;
type PropertyListener = Arc<dyn Fn(Value) + Send + Sync>;
type EventListener = Arc<dyn Fn(MpvEvent) + Send + Sync>;

/// Client for one mpv IPC connection.
///
/// The read loop starts at construction and runs until [`close`](Self::close)
/// is called or the pipe reaches end of stream. Closing the client does not
/// close the pipe; the pipe's owner is responsible for that.
pub struct MpvApi {
  pipe: Arc<dyn Pipe>,
  requests: Arc<Mutex<PendingRequests>>,
  property_listeners: Arc<Mutex<HashMap<String, PropertyListener>>>,
  event_listeners: Arc<Mutex<HashMap<String, EventListener>>>,
  next_request_id: AtomicI64,
  cancel: CancellationToken,
  _read_task: JoinHandle<()>,
}

impl MpvApi {
  /// Create a client and start its read loop. Must be called on a tokio
  /// runtime.
  pub fn new(pipe: Arc<dyn Pipe>) -> Self {
    let requests: Arc<Mutex<PendingRequests>> = Arc::new(Mutex::new(HashMap::new()));
    let property_listeners = Arc::new(Mutex::new(HashMap::new()));
    let event_listeners = Arc::new(Mutex::new(HashMap::new()));
    let cancel = CancellationToken::new();

    let read_task = tokio::spawn(read_loop(
      pipe.clone(),
      requests.clone(),
      property_listeners.clone(),
      event_listeners.clone(),
      cancel.clone(),
    ));

    Self {
      pipe,
      requests,
      property_listeners,
      event_listeners,
      next_request_id: AtomicI64::new(1),
      cancel,
      _read_task: read_task,
    }
  }

  /// Run a raw command and wait for its correlated response.
  ///
  /// The first argument is the command name. Safe to call concurrently;
  /// responses are matched by request id, not arrival order.
  pub async fn run_command(&self, args: Vec<Value>) -> CommandResult {
    self.run_command_with_timeout(args, None).await
  }

  /// Like [`run_command`](Self::run_command), but fail with
  /// [`ApiError::Timeout`] and drop the pending entry if no response arrives
  /// within `limit`.
  pub async fn run_command_with_timeout(
    &self,
    args: Vec<Value>,
    limit: Option<Duration>,
  ) -> CommandResult {
    if self.cancel.is_cancelled() {
      return Err(ApiError::Closed);
    }

    let request_id = self.create_request_id();
    let (tx, rx) = oneshot::channel();
    self.requests.lock().insert(request_id, tx);

    let command = MpvCommand::new(args, request_id);
    let line = match command.to_line() {
      Ok(line) => line,
      Err(e) => {
        self.requests.lock().remove(&request_id);
        return Err(e.into());
      }
    };
    log::debug!("sending mpv command: {}", line);
    if let Err(e) = self.pipe.write_line(&line).await {
      self.requests.lock().remove(&request_id);
      return Err(e.into());
    }

    let received = match limit {
      None => rx.await,
      Some(limit) => match tokio::time::timeout(limit, rx).await {
        Ok(received) => received,
        Err(_) => {
          self.requests.lock().remove(&request_id);
          return Err(ApiError::Timeout);
        }
      },
    };
    match received {
      Ok(result) => result,
      // Sender dropped without a response: the client was closed.
      Err(_) => Err(ApiError::Closed),
    }
  }

  /// Set a property on the player.
  pub async fn set_property(
    &self,
    name: &str,
    value: impl Into<Value>,
  ) -> Result<(), ApiError> {
    self
      .run_command(vec!["set_property".into(), name.into(), value.into()])
      .await?;
    Ok(())
  }

  /// Read a property from the player.
  pub async fn get_property(&self, name: &str) -> CommandResult {
    self
      .run_command(vec!["get_property".into(), name.into()])
      .await
  }

  /// Current pause state.
  pub async fn get_pause(&self) -> Result<bool, ApiError> {
    match self.get_property(MpvProperty::Pause.external_name()).await? {
      Some(Value::Bool(paused)) => Ok(paused),
      _ => Ok(true),
    }
  }

  /// Current playback position in fractional seconds.
  pub async fn get_time_pos(&self) -> Result<f64, ApiError> {
    let data = self
      .get_property(MpvProperty::PlaybackPosition.external_name())
      .await?;
    Ok(data.as_ref().and_then(Value::as_f64).unwrap_or(0.0))
  }

  /// Register a property-change listener, then subscribe on the player.
  ///
  /// At most one listener per property; a second registration fails and
  /// leaves the existing listener in place.
  pub async fn add_property_listener(
    &self,
    name: &str,
    listener: impl Fn(Value) + Send + Sync + 'static,
  ) -> Result<(), ApiError> {
    {
      let mut listeners = self.property_listeners.lock();
      if listeners.contains_key(name) {
        return Err(ApiError::ListenerExists(name.to_string()));
      }
      listeners.insert(name.to_string(), Arc::new(listener));
    }
    let observe_id = self.create_request_id();
    self
      .run_command(vec![
        "observe_property".into(),
        observe_id.into(),
        name.into(),
      ])
      .await?;
    Ok(())
  }

  /// Register a listener for an unsolicited event.
  ///
  /// mpv emits these without a subscription, so no command is issued. At
  /// most one listener per event name.
  pub fn add_event_listener(
    &self,
    name: &str,
    listener: impl Fn(MpvEvent) + Send + Sync + 'static,
  ) -> Result<(), ApiError> {
    let mut listeners = self.event_listeners.lock();
    if listeners.contains_key(name) {
      return Err(ApiError::ListenerExists(name.to_string()));
    }
    listeners.insert(name.to_string(), Arc::new(listener));
    Ok(())
  }

  /// Ask the player to quit.
  pub async fn quit(&self) -> Result<(), ApiError> {
    self.run_command(vec!["quit".into()]).await?;
    Ok(())
  }

  /// Stop the read loop and fail all pending requests. Idempotent. The pipe
  /// stays open.
  pub fn close(&self) {
    self.cancel.cancel();
    self.requests.lock().clear();
  }

  fn create_request_id(&self) -> i64 {
    self.next_request_id.fetch_add(1, Ordering::SeqCst)
  }
}

impl Drop for MpvApi {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

async fn read_loop(
  pipe: Arc<dyn Pipe>,
  requests: Arc<Mutex<PendingRequests>>,
  property_listeners: Arc<Mutex<HashMap<String, PropertyListener>>>,
  event_listeners: Arc<Mutex<HashMap<String, EventListener>>>,
  cancel: CancellationToken,
) {
  log::debug!("mpv read loop started");
  loop {
    if cancel.is_cancelled() {
      break;
    }
    let line = match pipe.read_line() {
      Ok(Some(line)) => line,
      Ok(None) => {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = tokio::time::sleep(POLL_INTERVAL) => continue,
        }
      }
      Err(PipeError::Eof) => {
        log::debug!("mpv pipe reached end of stream");
        break;
      }
      Err(e @ PipeError::Decode(_)) => {
        // Corrupt byte stream, no way to resynchronize on line boundaries.
        log::error!("mpv pipe delivered undecodable data: {}", e);
        break;
      }
      Err(e) => {
        log::warn!("mpv pipe read failed: {}", e);
        continue;
      }
    };
    if line.is_empty() {
      continue;
    }
    dispatch_line(&line, &requests, &property_listeners, &event_listeners);
  }
  log::debug!("mpv read loop ended");
}

fn dispatch_line(
  line: &str,
  requests: &Mutex<PendingRequests>,
  property_listeners: &Mutex<HashMap<String, PropertyListener>>,
  event_listeners: &Mutex<HashMap<String, EventListener>>,
) {
  match MpvMessage::parse(line) {
    Ok(MpvMessage::Response(response)) => {
      let pending = requests.lock().remove(&response.request_id);
      match pending {
        Some(tx) => {
          let result = if response.is_success() {
            Ok(response.data)
          } else {
            Err(ApiError::Mpv(response.error))
          };
          let _ = tx.send(result);
        }
        // Unknown or stale request id.
        None => log::debug!("discarding response for request id {}", response.request_id),
      }
    }
    Ok(MpvMessage::Event(event)) => {
      if event.event == "property-change" {
        let Some(name) = event.name else {
          log::warn!("property-change event without a property name");
          return;
        };
        let listener = property_listeners.lock().get(&name).cloned();
        if let Some(listener) = listener {
          match event.data {
            Some(data) if !data.is_null() => listener(data),
            // The property has no value yet; a later change will carry one.
            _ => log::debug!("property {} changed without data", name),
          }
        }
      } else {
        let listener = event_listeners.lock().get(&event.event).cloned();
        if let Some(listener) = listener {
          listener(event);
        }
      }
    }
    Err(e) => log::warn!("failed to parse mpv message: {} - {}", e, line),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;
  use serde_json::json;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicBool, AtomicUsize};

  /// In-memory pipe: incoming lines are queued by the test, written lines
  /// are recorded. With auto-respond enabled every written command is
  /// immediately answered with a success response.
  struct MockPipe {
    incoming: Mutex<VecDeque<String>>,
    written: Mutex<Vec<String>>,
    eof: AtomicBool,
    auto_respond: bool,
  }

  impl MockPipe {
    fn new(auto_respond: bool) -> Arc<Self> {
      Arc::new(Self {
        incoming: Mutex::new(VecDeque::new()),
        written: Mutex::new(Vec::new()),
        eof: AtomicBool::new(false),
        auto_respond,
      })
    }

    fn push_line(&self, line: &str) {
      self.incoming.lock().push_back(line.to_string());
    }

    fn written(&self) -> Vec<String> {
      self.written.lock().clone()
    }
  }

  #[async_trait::async_trait]
  impl Pipe for MockPipe {
    fn read_line(&self) -> Result<Option<String>, PipeError> {
      if let Some(line) = self.incoming.lock().pop_front() {
        return Ok(Some(line));
      }
      if self.eof.load(Ordering::Acquire) {
        return Err(PipeError::Eof);
      }
      Ok(None)
    }

    async fn write_line(&self, line: &str) -> Result<(), PipeError> {
      self.written.lock().push(line.to_string());
      if self.auto_respond {
        let value: Value = serde_json::from_str(line).unwrap();
        let request_id = value["request_id"].clone();
        self.push_line(&format!(
          r#"{{"error":"success","data":null,"request_id":{}}}"#,
          request_id
        ));
      }
      Ok(())
    }

    fn close(&self) {
      self.eof.store(true, Ordering::Release);
    }
  }

  fn request_id_of(line: &str) -> i64 {
    let value: Value = serde_json::from_str(line).unwrap();
    value["request_id"].as_i64().unwrap()
  }

  async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
      if check() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within deadline");
  }

  #[tokio::test]
  async fn test_responses_resolve_by_request_id_not_arrival_order() {
    let pipe = MockPipe::new(false);
    let api = Arc::new(MpvApi::new(pipe.clone()));

    let mut tasks = Vec::new();
    for marker in ["prop-a", "prop-b", "prop-c"] {
      let api = api.clone();
      tasks.push(tokio::spawn(async move {
        api
          .run_command(vec!["get_property".into(), marker.into()])
          .await
      }));
    }
    wait_until(|| pipe.written().len() == 3).await;

    // Answer in reverse arrival order, each payload echoing the property
    // named in its command.
    for line in pipe.written().iter().rev() {
      let value: Value = serde_json::from_str(line).unwrap();
      let marker = value["command"][1].as_str().unwrap().to_string();
      pipe.push_line(&format!(
        r#"{{"error":"success","data":"{}","request_id":{}}}"#,
        marker,
        request_id_of(line)
      ));
    }

    for (task, marker) in tasks.into_iter().zip(["prop-a", "prop-b", "prop-c"]) {
      let result = task.await.unwrap().unwrap();
      assert_eq!(result, Some(json!(marker)));
    }
  }

  #[tokio::test]
  async fn test_error_response_fails_only_its_own_request() {
    let pipe = MockPipe::new(false);
    let api = Arc::new(MpvApi::new(pipe.clone()));

    let failing = {
      let api = api.clone();
      tokio::spawn(async move { api.run_command(vec!["get_property".into(), "bad".into()]).await })
    };
    let succeeding = {
      let api = api.clone();
      tokio::spawn(async move { api.run_command(vec!["get_property".into(), "good".into()]).await })
    };
    wait_until(|| pipe.written().len() == 2).await;

    for line in pipe.written() {
      let value: Value = serde_json::from_str(&line).unwrap();
      let id = request_id_of(&line);
      if value["command"][1] == json!("bad") {
        pipe.push_line(&format!(
          r#"{{"error":"property unavailable","data":null,"request_id":{}}}"#,
          id
        ));
      } else {
        pipe.push_line(&format!(
          r#"{{"error":"success","data":1,"request_id":{}}}"#,
          id
        ));
      }
    }

    let failed = failing.await.unwrap();
    assert!(matches!(failed, Err(ApiError::Mpv(ref msg)) if msg == "property unavailable"));
    assert_eq!(succeeding.await.unwrap().unwrap(), Some(json!(1)));
  }

  #[tokio::test]
  async fn test_unknown_request_id_is_ignored() {
    let pipe = MockPipe::new(false);
    let api = Arc::new(MpvApi::new(pipe.clone()));

    // Stale response before any request exists.
    pipe.push_line(r#"{"error":"success","data":"stale","request_id":99}"#);

    let pending = {
      let api = api.clone();
      tokio::spawn(async move { api.run_command(vec!["get_property".into(), "volume".into()]).await })
    };
    wait_until(|| !pipe.written().is_empty()).await;
    let id = request_id_of(&pipe.written()[0]);
    pipe.push_line(&format!(
      r#"{{"error":"success","data":50,"request_id":{}}}"#,
      id
    ));

    assert_eq!(pending.await.unwrap().unwrap(), Some(json!(50)));
  }

  #[tokio::test]
  async fn test_second_property_listener_is_rejected() {
    let pipe = MockPipe::new(true);
    let api = MpvApi::new(pipe.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let first_calls = calls.clone();
    api
      .add_property_listener("pause", move |_| {
        first_calls.fetch_add(1, Ordering::SeqCst);
      })
      .await
      .unwrap();

    let second = api.add_property_listener("pause", |_| {}).await;
    assert!(matches!(second, Err(ApiError::ListenerExists(_))));

    // The original listener still receives notifications.
    pipe.push_line(r#"{"event":"property-change","id":1,"name":"pause","data":true}"#);
    wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
  }

  #[tokio::test]
  async fn test_second_event_listener_is_rejected() {
    let pipe = MockPipe::new(true);
    let api = MpvApi::new(pipe.clone());

    api.add_event_listener("shutdown", |_| {}).unwrap();
    let second = api.add_event_listener("shutdown", |_| {});
    assert!(matches!(second, Err(ApiError::ListenerExists(_))));
  }

  #[tokio::test]
  async fn test_property_listener_subscribes_remotely() {
    let pipe = MockPipe::new(true);
    let api = MpvApi::new(pipe.clone());

    api.add_property_listener("time-pos", |_| {}).await.unwrap();

    let written = pipe.written();
    assert_eq!(written.len(), 1);
    let value: Value = serde_json::from_str(&written[0]).unwrap();
    assert_eq!(value["command"][0], json!("observe_property"));
    assert_eq!(value["command"][2], json!("time-pos"));
  }

  #[tokio::test]
  async fn test_null_property_data_is_skipped() {
    let pipe = MockPipe::new(true);
    let api = MpvApi::new(pipe.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    api
      .add_property_listener("time-pos", move |data| {
        sink.lock().push(data);
      })
      .await
      .unwrap();

    pipe.push_line(r#"{"event":"property-change","id":1,"name":"time-pos","data":null}"#);
    pipe.push_line(r#"{"event":"property-change","id":1,"name":"time-pos","data":1.5}"#);
    wait_until(|| !seen.lock().is_empty()).await;

    assert_eq!(seen.lock().clone(), vec![json!(1.5)]);
  }

  #[tokio::test]
  async fn test_event_listener_dispatch() {
    let pipe = MockPipe::new(true);
    let api = MpvApi::new(pipe.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    api
      .add_event_listener("file-loaded", move |event| {
        assert_eq!(event.event, "file-loaded");
        counter.fetch_add(1, Ordering::SeqCst);
      })
      .unwrap();

    // Unrelated event with no listener is dropped quietly.
    pipe.push_line(r#"{"event":"seek"}"#);
    pipe.push_line(r#"{"event":"file-loaded"}"#);
    wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
  }

  #[tokio::test]
  async fn test_malformed_line_does_not_kill_the_loop() {
    let pipe = MockPipe::new(false);
    let api = Arc::new(MpvApi::new(pipe.clone()));

    pipe.push_line("garbage {{{");

    let pending = {
      let api = api.clone();
      tokio::spawn(async move { api.run_command(vec!["get_version".into()]).await })
    };
    wait_until(|| !pipe.written().is_empty()).await;
    let id = request_id_of(&pipe.written()[0]);
    pipe.push_line(&format!(
      r#"{{"error":"success","data":null,"request_id":{}}}"#,
      id
    ));

    assert_eq!(pending.await.unwrap().unwrap(), None);
  }

  #[tokio::test]
  async fn test_command_timeout_fails_the_caller() {
    let pipe = MockPipe::new(false);
    let api = MpvApi::new(pipe.clone());

    let result = api
      .run_command_with_timeout(
        vec!["get_property".into(), "volume".into()],
        Some(Duration::from_millis(50)),
      )
      .await;
    assert!(matches!(result, Err(ApiError::Timeout)));

    // A late response for the expired id must be discarded quietly.
    let id = request_id_of(&pipe.written()[0]);
    pipe.push_line(&format!(
      r#"{{"error":"success","data":null,"request_id":{}}}"#,
      id
    ));
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!api.cancel.is_cancelled());
  }

  #[tokio::test]
  async fn test_close_fails_pending_requests() {
    let pipe = MockPipe::new(false);
    let api = Arc::new(MpvApi::new(pipe.clone()));

    let pending = {
      let api = api.clone();
      tokio::spawn(async move { api.run_command(vec!["get_property".into(), "volume".into()]).await })
    };
    wait_until(|| !pipe.written().is_empty()).await;

    api.close();
    assert!(matches!(pending.await.unwrap(), Err(ApiError::Closed)));

    let after = api.run_command(vec!["get_version".into()]).await;
    assert!(matches!(after, Err(ApiError::Closed)));
  }

  #[tokio::test]
  async fn test_set_property_encodes_command() {
    let pipe = MockPipe::new(true);
    let api = MpvApi::new(pipe.clone());

    api.set_property("pause", false).await.unwrap();

    let written = pipe.written();
    let value: Value = serde_json::from_str(&written[0]).unwrap();
    assert_eq!(value["command"], json!(["set_property", "pause", false]));
  }
}
