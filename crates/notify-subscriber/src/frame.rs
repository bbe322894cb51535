//! Incremental `text/event-stream` decoder.
//!
//! Buffers raw byte chunks, splits them into lines (LF, CRLF or CR) and
//! assembles fields into frames:
//! - `event:` names the channel of the next event
//! - `data:` lines are joined with `\n`
//! - `id:` sets the last event id, which sticks across events
//! - `retry:` is parsed and attached to the next event
//! - lines starting with `:` are comments; they are surfaced so the
//!   controller can count them as liveness
//!
//! An event is dispatched on a blank line. A trailing event with no
//! terminating blank line is discarded when the stream ends.

use bytes::BytesMut;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

use crate::transport::ByteStream;
use crate::types::TransportError;

pub(crate) type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

const BOM: char = '\u{FEFF}';

/// One decoded unit of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Event(RawEvent),
    Comment(String),
}

/// An event as it appeared on the wire, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    /// Channel name from the `event:` field; `None` for the default channel.
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    /// Server-suggested reconnect delay in milliseconds.
    pub retry: Option<u64>,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    seen_first_line: bool,
    event: Option<String>,
    data: Option<String>,
    last_event_id: Option<String>,
    retry: Option<u64>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            ..Default::default()
        }
    }

    /// Append a chunk of bytes received from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Frame> {
        while let Some(line) = self.take_line() {
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        None
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n' || b == b'\r')?;
        let terminator_len = match self.buffer.get(pos..pos + 2) {
            Some(b"\r\n") => 2,
            // A lone CR at the end of the buffer may be the first half of CRLF.
            None if self.buffer.get(pos) == Some(&b'\r') => return None,
            _ => 1,
        };
        let line_bytes = self.buffer.split_to(pos + terminator_len);
        let content = line_bytes.get(..pos).unwrap_or_default();
        let mut line = String::from_utf8_lossy(content).into_owned();
        if !self.seen_first_line {
            self.seen_first_line = true;
            if line.starts_with(BOM) {
                line.remove(0);
            }
        }
        Some(line)
    }

    fn process_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(comment) = line.strip_prefix(':') {
            return Some(Frame::Comment(comment.trim_start().to_string()));
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = (!value.is_empty()).then(|| value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(ms);
                }
            }
            other => {
                tracing::trace!(field = other, "Ignoring unknown stream field");
            }
        }
        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let event = self.event.take();
        let retry = self.retry.take();
        let data = self.data.take()?;
        Some(Frame::Event(RawEvent {
            event: event.filter(|name| !name.is_empty()),
            data,
            id: self.last_event_id.clone(),
            retry,
        }))
    }
}

/// Decode a transport byte stream into frames.
///
/// A transport error is yielded once and ends the stream.
pub(crate) fn decode_frames(bytes: ByteStream) -> FrameStream {
    futures_util::stream::unfold(
        (bytes, FrameDecoder::new(), false),
        |(mut bytes, mut decoder, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(frame) = decoder.next_frame() {
                    return Some((Ok(frame), (bytes, decoder, false)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => return Some((Err(e), (bytes, decoder, true))),
                    None => return None,
                }
            }
        },
    )
    .boxed()
}
