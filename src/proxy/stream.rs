use std::io;
use std::time::Duration;

use axum::body::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use tokio::time::timeout;
use serde_json::Value;
use tracing::{debug, warn};

use super::tool_args::coerce_tool_calls;

/// Reassembles `\n`-terminated lines from arbitrarily split chunks.
///
/// `start` marks the first unconsumed byte, `scan_pos` the first byte not yet
/// searched for a newline, so every byte is scanned once.
#[derive(Debug, Default)]
pub(super) struct LineFramer {
    buffer: Vec<u8>,
    start: usize,
    scan_pos: usize,
}

impl LineFramer {
    pub(super) fn push(&mut self, chunk: &[u8]) {
        if self.start > 0 {
            self.buffer.drain(..self.start);
            self.scan_pos -= self.start;
            self.start = 0;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete line, newline included.
    pub(super) fn next_line(&mut self) -> Option<Bytes> {
        let rel = self.buffer[self.scan_pos..]
            .iter()
            .position(|&b| b == b'\n');
        match rel {
            Some(rel) => {
                let end = self.scan_pos + rel + 1;
                let line = Bytes::copy_from_slice(&self.buffer[self.start..end]);
                self.start = end;
                self.scan_pos = end;
                Some(line)
            }
            None => {
                self.scan_pos = self.buffer.len();
                None
            }
        }
    }

    /// Whatever is left once the upstream ends without a final newline.
    pub(super) fn finish(&mut self) -> Option<Bytes> {
        let tail = &self.buffer[self.start..];
        let tail = (!tail.is_empty()).then(|| Bytes::copy_from_slice(tail));
        self.buffer.clear();
        self.start = 0;
        self.scan_pos = 0;
        tail
    }
}

/// Rewrite one SSE line if it carries coercible tool-call deltas.
///
/// `None` means relay the original bytes: comments, non-data fields,
/// `[DONE]`, undecodable lines and lines without any change all land here.
pub(super) fn rewrite_sse_line(line: &[u8]) -> Option<Bytes> {
    let body = line.strip_suffix(b"\n").unwrap_or(line);
    let (body, cr) = match body.strip_suffix(b"\r") {
        Some(b) => (b, true),
        None => (body, false),
    };
    let payload = body.strip_prefix(b"data:")?;
    let payload = std::str::from_utf8(payload).ok()?.trim_start();
    if payload.is_empty() || payload.trim_end() == "[DONE]" {
        return None;
    }

    let mut event: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "stream data line is not JSON, relaying verbatim");
            return None;
        }
    };
    let choices = event.get_mut("choices")?.as_array_mut()?;
    let mut changed = false;
    for choice in choices.iter_mut() {
        if let Some(delta) = choice.get_mut("delta") {
            changed |= coerce_tool_calls(delta.get_mut("tool_calls"));
        }
    }
    if !changed {
        return None;
    }

    let encoded = match serde_json::to_vec(&event) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to re-encode stream event, relaying verbatim");
            return None;
        }
    };
    let mut out = Vec::with_capacity(encoded.len() + 8);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(&encoded);
    if cr {
        out.push(b'\r');
    }
    out.push(b'\n');
    Some(Bytes::from(out))
}

struct RelayState<S> {
    upstream: Option<S>,
    idle: Duration,
    framer: LineFramer,
    lines: u64,
    rewritten: u64,
}

impl<S> RelayState<S> {
    fn emit(&mut self, line: Bytes) -> Bytes {
        self.lines += 1;
        match rewrite_sse_line(&line) {
            Some(out) => {
                self.rewritten += 1;
                out
            }
            None => line,
        }
    }
}

/// Relay an upstream event stream line by line, coercing tool-call deltas.
///
/// Each complete line goes out as its own chunk, in upstream order. An
/// upstream read error is forwarded and ends the stream, and so does an
/// upstream that sends nothing for `idle`. Dropping the returned stream
/// drops the upstream body with it.
pub fn relay_sse<S, E>(
    upstream: S,
    idle: Duration,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    let state = RelayState {
        upstream: Some(upstream),
        idle,
        framer: LineFramer::default(),
        lines: 0,
        rewritten: 0,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(line) = st.framer.next_line() {
                let out = st.emit(line);
                return Some((Ok(out), st));
            }
            let idle = st.idle;
            let upstream = st.upstream.as_mut()?;
            let next = match timeout(idle, upstream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(
                        idle_secs = idle.as_secs_f64(),
                        lines = st.lines,
                        "upstream stream stalled, closing"
                    );
                    st.upstream = None;
                    let err = io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no upstream data for {:.1}s", idle.as_secs_f64()),
                    );
                    return Some((Err(err), st));
                }
            };
            match next {
                Some(Ok(chunk)) => st.framer.push(&chunk),
                Some(Err(e)) => {
                    let err = io::Error::other(e);
                    warn!(error = %err, lines = st.lines, "upstream stream error");
                    st.upstream = None;
                    return Some((Err(err), st));
                }
                None => {
                    st.upstream = None;
                    debug!(lines = st.lines, rewritten = st.rewritten, "upstream stream finished");
                    let tail = st.framer.finish()?;
                    return Some((Ok(tail), st));
                }
            }
        }
    })
}
