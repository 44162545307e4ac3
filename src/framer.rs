//! Incremental line framing over a raw byte stream.
//!
//! The IPC transports deliver bytes in arbitrarily-sized chunks, possibly
//! splitting a multi-byte UTF-8 sequence across two reads. The framer buffers
//! undecodable trailing bytes until the rest of the sequence arrives and
//! queues every `\n`-terminated line for the caller.

use std::collections::VecDeque;

use thiserror::Error;

/// The byte stream contained a sequence that is not valid UTF-8.
#[derive(Debug, Error)]
#[error("invalid UTF-8 in pipe data: {0}")]
pub struct DecodeError(#[from] std::str::Utf8Error);

/// Decodes a chunked byte stream into complete text lines.
#[derive(Debug, Default)]
pub struct LineFramer {
  /// Bytes carried over because they end mid-sequence.
  carry: Vec<u8>,
  /// Decoded characters of the line currently being assembled.
  partial: String,
  lines: VecDeque<String>,
}

impl LineFramer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Feed the next chunk of bytes from the transport.
  ///
  /// Complete lines become available through [`next_line`](Self::next_line).
  /// An incomplete trailing UTF-8 sequence is kept until the next chunk; an
  /// invalid sequence is a hard error.
  pub fn push(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
    self.carry.extend_from_slice(chunk);

    let valid_len = match std::str::from_utf8(&self.carry) {
      Ok(_) => self.carry.len(),
      Err(e) => {
        if e.error_len().is_some() {
          return Err(e.into());
        }
        // Incomplete trailing sequence, decode up to it and keep the rest.
        e.valid_up_to()
      }
    };
    if valid_len == 0 {
      return Ok(());
    }

    let rest = self.carry.split_off(valid_len);
    let head = std::mem::replace(&mut self.carry, rest);
    let text = String::from_utf8(head).map_err(|e| DecodeError::from(e.utf8_error()))?;
    for ch in text.chars() {
      if ch == '\n' {
        self.lines.push_back(std::mem::take(&mut self.partial));
      } else {
        self.partial.push(ch);
      }
    }
    Ok(())
  }

  /// Take the next complete line, without its terminator.
  pub fn next_line(&mut self) -> Option<String> {
    self.lines.pop_front()
  }

  /// Signal that no more bytes will arrive.
  ///
  /// Fails if the stream ended in the middle of a UTF-8 sequence. Trailing
  /// characters without a terminator never form a line.
  pub fn finish(&mut self) -> Result<(), DecodeError> {
    if let Err(e) = std::str::from_utf8(&self.carry) {
      return Err(e.into());
    }
    debug_assert!(self.carry.is_empty());
    Ok(())
  }
}
