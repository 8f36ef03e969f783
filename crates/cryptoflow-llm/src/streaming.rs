use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use cryptoflow_core::error::{CryptoflowError, Result};

/// Incremental parser for `text/event-stream` bodies.
/// Events are `event: <type>\ndata: <json>\n\n` blocks.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

/// A parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// OpenAI-style end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        if self.buffer.contains('\r') {
            // A trailing '\r' may be half of a CRLF split across chunks.
            let held = self.buffer.ends_with('\r');
            if held {
                self.buffer.pop();
            }
            self.buffer = self.buffer.replace("\r\n", "\n");
            if held {
                self.buffer.push('\r');
            }
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing block that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_block(rest.trim_end_matches('\r'))
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event_type = None;
    let mut data_lines = Vec::new();

    for line in block.lines() {
        if let Some(val) = line.strip_prefix("event:") {
            event_type = Some(val.trim_start().to_string());
        } else if let Some(val) = line.strip_prefix("data:") {
            data_lines.push(val.strip_prefix(' ').unwrap_or(val).to_string());
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event_type,
        data: data_lines.join("\n"),
    })
}

/// Decode the complete UTF-8 prefix of `carry`, leaving an unfinished
/// multibyte sequence in place for the next chunk.
fn take_utf8(carry: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(carry.as_slice()) {
            Ok(text) => {
                out.push_str(text);
                carry.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&carry[..valid]));
                match e.error_len() {
                    None => {
                        carry.drain(..valid);
                        return out;
                    }
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        carry.drain(..valid + bad);
                    }
                }
            }
        }
    }
}

/// Adapts a byte stream into a stream of SSE events.
/// Transport failures surface as `LlmStream` errors and end the stream.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    /// Bytes of a multibyte character cut off at the end of the last chunk.
    carry: Vec<u8>,
    pending: std::collections::VecDeque<SseEvent>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            carry: Vec::new(),
            pending: Default::default(),
            done: false,
        }
    }
}

impl<S, B, E> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.carry.extend_from_slice(bytes.as_ref());
                    let text = take_utf8(&mut this.carry);
                    this.pending.extend(this.parser.feed(&text));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(CryptoflowError::LlmStream(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    if !this.carry.is_empty() {
                        let tail = String::from_utf8_lossy(&this.carry).into_owned();
                        this.carry.clear();
                        this.pending.extend(this.parser.feed(&tail));
                    }
                    this.pending.extend(this.parser.finish());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
