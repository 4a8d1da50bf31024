//! Chunk model and server-sent event decoder for the chat stream.
//!
//! This crate owns the wire representation of `POST /chat` responses. Each
//! event is one `data: <json>` line; payload fields are all optional so the
//! decoder keeps them flexible (`serde_json::Value` for content) and leaves
//! interpretation to the session reducer.
//!
//! FRAMING
//! =======
//! Decoding is line-buffered at the byte level: a network read may end in the
//! middle of a line (or of a UTF-8 sequence), so only `\n`-terminated lines
//! are parsed. Lines that fail to parse are skipped, which tolerates
//! keep-alive comments and truncated noise without aborting the stream.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

/// Marker that prefixes every event payload line.
pub const DATA_FIELD: &str = "data:";

/// Error returned by [`decode_stream`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The underlying byte source failed mid-stream.
    #[error("stream transport failed: {0}")]
    Transport(String),
}

/// Phase tag carried in the `type` field of a chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    /// Discard everything accumulated so far in this turn.
    Reset,
    /// Structured chart payload in `content`.
    Chart,
    /// Answer text delta.
    Answer,
    /// Thinking text delta.
    Thinking,
    /// Reasoning text delta.
    Reasoning,
    /// A tag this client does not know about.
    Unknown(String),
}

impl ChunkKind {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "reset" => Self::Reset,
            "chart" => Self::Chart,
            "answer" => Self::Answer,
            "thinking" => Self::Thinking,
            "reasoning" => Self::Reasoning,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

/// One decoded event from the chat stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Chunk {
    /// Phase tag; `None` for legacy plain-text chunks.
    pub kind: Option<ChunkKind>,
    /// Text delta, or a chart object when `kind` is [`ChunkKind::Chart`].
    pub content: Option<Value>,
    /// Conversation id allocated by the backend, sent at most once per stream.
    pub conversation_id: Option<String>,
    /// Terminal success marker.
    pub done: bool,
    /// Terminal backend error.
    pub error: Option<String>,
    /// Sources used to ground the answer; only on the terminal chunk.
    pub context_sources: Option<Vec<Value>>,
}

impl Chunk {
    /// Whether this chunk ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }

    /// Text content, when the payload is a JSON string.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.content.as_ref().and_then(Value::as_str)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            Self::Text(value) => value,
            Self::Number(value) => value.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default, alias = "conversationId")]
    conversation_id: Option<WireId>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default, alias = "contextSources")]
    context_sources: Option<Vec<Value>>,
}

impl From<WireChunk> for Chunk {
    fn from(wire: WireChunk) -> Self {
        let error = wire.error.and_then(|value| match value {
            Value::Null => None,
            Value::String(message) => Some(message),
            other => Some(other.to_string()),
        });
        Self {
            kind: wire.kind.as_deref().map(ChunkKind::from_tag),
            content: wire.content,
            conversation_id: wire.conversation_id.map(WireId::into_string),
            done: wire.done.unwrap_or(false),
            error,
            context_sources: wire.context_sources,
        }
    }
}

/// Parse one complete line of the event stream.
///
/// Returns `None` for anything that is not a well-formed `data:` event:
/// blank lines, `:` comments, other SSE fields, the `[DONE]` sentinel and
/// malformed JSON.
#[must_use]
pub fn parse_line(line: &str) -> Option<Chunk> {
    let line = line.trim_end_matches(['\r', '\n']);
    let payload = line.strip_prefix(DATA_FIELD)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload).trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    serde_json::from_str::<WireChunk>(payload)
        .ok()
        .map(Chunk::from)
}

/// Incremental line-buffered decoder.
///
/// Feed raw network reads with [`ChunkDecoder::push`]; call
/// [`ChunkDecoder::finish`] once the source closes.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buf: Vec<u8>,
    /// Leading bytes of `buf` already searched for a line terminator.
    scanned: usize,
}

impl ChunkDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every chunk completed by them, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Chunk> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            if let Some(chunk) = decode_line_bytes(&self.buf[start..=end]) {
                out.push(chunk);
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        out
    }

    /// Parse whatever is left in the buffer as a final unterminated line.
    pub fn finish(&mut self) -> Option<Chunk> {
        if self.buf.is_empty() {
            return None;
        }
        self.scanned = 0;
        let line = std::mem::take(&mut self.buf);
        decode_line_bytes(&line)
    }

    /// Bytes held back waiting for a line terminator.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

fn decode_line_bytes(line: &[u8]) -> Option<Chunk> {
    std::str::from_utf8(line).ok().and_then(parse_line)
}

struct DecodeState<S> {
    source: Pin<Box<S>>,
    decoder: ChunkDecoder,
    pending: VecDeque<Chunk>,
    finished: bool,
}

/// Turn a byte stream into a lazy sequence of chunks.
///
/// The sequence ends after yielding a terminal chunk (`done` or `error`),
/// when the source closes, or after yielding a single
/// [`DecodeError::Transport`] for a failed read. Anything the server sends
/// after a terminal chunk is ignored.
pub fn decode_stream<S, B, E>(source: S) -> impl Stream<Item = Result<Chunk, DecodeError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let state = DecodeState {
        source: Box::pin(source),
        decoder: ChunkDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                if chunk.is_terminal() {
                    state.finished = true;
                    state.pending.clear();
                }
                return Some((Ok(chunk), state));
            }
            if state.finished {
                return None;
            }
            match state.source.next().await {
                Some(Ok(bytes)) => {
                    let decoded = state.decoder.push(bytes.as_ref());
                    state.pending.extend(decoded);
                }
                Some(Err(error)) => {
                    state.finished = true;
                    return Some((Err(DecodeError::Transport(error.to_string())), state));
                }
                None => {
                    state.finished = true;
                    let tail = state.decoder.finish();
                    state.pending.extend(tail);
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
