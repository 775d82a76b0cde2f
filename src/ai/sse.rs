//! Incremental decoder for the proxy's `text/event-stream` responses.
//!
//! The proxy relays an OpenAI-shaped stream: every event is a single
//! `data: {json}` line whose `choices[0].delta.content` carries the next
//! fragment of assistant text, and `data: [DONE]` ends the reply.

use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;

const DATA_PREFIX: &str = "data: ";
const DONE_TOKEN: &str = "[DONE]";
const CONTENT_POINTER: &str = "/choices/0/delta/content";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Content(String),
    Terminated,
}

enum Line {
    Skip,
    Content(String),
    Done,
    Malformed,
}

fn classify(line: &str) -> Line {
    if line.trim().is_empty() || line.starts_with(':') {
        return Line::Skip;
    }
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return Line::Skip;
    };
    let payload = rest.trim();
    if payload == DONE_TOKEN {
        return Line::Done;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => match value.pointer(CONTENT_POINTER).and_then(Value::as_str) {
            Some(piece) if !piece.is_empty() => Line::Content(piece.to_string()),
            _ => Line::Skip,
        },
        Err(_) => Line::Malformed,
    }
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: String,
    // Tail of a multi-byte character split across chunks.
    pending_bytes: Vec<u8>,
    terminated: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` has been seen; later input is ignored.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Feed one chunk and return the events it completes.
    ///
    /// A data line whose JSON does not parse is put back at the front of
    /// the buffer, since a later chunk may still complete it, and extraction
    /// stops until more input arrives.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.terminated || chunk.is_empty() {
            return events;
        }
        let text = self.decode_utf8(chunk);
        self.buffer.push_str(&text);

        while let Some(pos) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }

            match classify(&line) {
                Line::Skip => {}
                Line::Content(piece) => events.push(StreamEvent::Content(piece)),
                Line::Done => {
                    self.terminate(&mut events);
                    break;
                }
                Line::Malformed => {
                    line.push('\n');
                    self.buffer.insert_str(0, &line);
                    break;
                }
            }
        }
        events
    }

    /// Best-effort pass over whatever is still buffered once input has
    /// ended. Lines that still fail to parse are dropped.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.terminated {
            return events;
        }
        if !self.pending_bytes.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending_bytes).into_owned();
            self.buffer.push_str(&tail);
            self.pending_bytes.clear();
        }

        let remaining = std::mem::take(&mut self.buffer);
        for raw in remaining.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            match classify(line) {
                Line::Skip => {}
                Line::Content(piece) => events.push(StreamEvent::Content(piece)),
                Line::Done => {
                    self.terminate(&mut events);
                    break;
                }
                Line::Malformed => {
                    tracing::trace!(line, "dropping unparseable event-stream line");
                }
            }
        }
        events
    }

    fn terminate(&mut self, events: &mut Vec<StreamEvent>) {
        self.terminated = true;
        self.buffer.clear();
        self.pending_bytes.clear();
        events.push(StreamEvent::Terminated);
    }

    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        self.pending_bytes.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending_bytes.len());
        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending_bytes.clear();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.push_str(
                        std::str::from_utf8(&self.pending_bytes[..valid_up_to]).unwrap_or_default(),
                    );
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid_up_to + bad);
                        }
                        None => {
                            self.pending_bytes.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

struct DecodeState<S> {
    input: Pin<Box<S>>,
    decoder: StreamDecoder,
    ready: VecDeque<String>,
    finished: bool,
}

impl<S> DecodeState<S> {
    fn absorb(&mut self, events: Vec<StreamEvent>) {
        for event in events {
            match event {
                StreamEvent::Content(piece) => self.ready.push_back(piece),
                StreamEvent::Terminated => self.finished = true,
            }
        }
    }
}

/// Turn a stream of byte chunks into a lazy stream of content fragments.
///
/// Ends after `[DONE]` or once the input is exhausted and the buffer has
/// been flushed. An input error is yielded once and ends the stream.
pub fn decode_stream<S, B, E>(input: S) -> impl Stream<Item = Result<String, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    let state = DecodeState {
        input: Box::pin(input),
        decoder: StreamDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(piece) = state.ready.pop_front() {
                return Some((Ok(piece), state));
            }
            if state.finished {
                return None;
            }
            match state.input.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(chunk.as_ref());
                    state.absorb(events);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    let events = state.decoder.finish();
                    state.absorb(events);
                    state.finished = true;
                }
            }
        }
    })
}
