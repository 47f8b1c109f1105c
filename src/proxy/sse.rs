use std::collections::VecDeque;

use bytes::Bytes;
use futures::{Stream, StreamExt};

/// Carry-over buffer turning arbitrarily fragmented upstream bytes into
/// newline-terminated SSE lines. Pure repartitioning: bytes out are exactly
/// the bytes in, re-cut at line boundaries.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one chunk, emitting every line completed by it. Each emitted
    /// line keeps its trailing `\n`; blank lines (record terminators) come
    /// through as a bare `\n`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let rest = self.buffer.split_off(pos + 1);
            let line = std::mem::replace(&mut self.buffer, rest);
            lines.push(Bytes::from(line));
        }
        lines
    }

    /// End-of-stream: whatever never saw its newline is flushed verbatim.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(Bytes::from(std::mem::take(&mut self.buffer)))
        }
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Wrap an upstream byte stream so every yielded item is a complete SSE line.
/// Single-pass, ordered, finite; dropping the returned stream drops the
/// upstream read and the carry-over buffer with it.
pub fn normalize_sse<S, E>(upstream: S) -> impl Stream<Item = Result<Bytes, String>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display,
{
    struct State<S> {
        upstream: S,
        buffer: SseLineBuffer,
        pending: VecDeque<Bytes>,
        done: bool,
    }

    let state = State {
        upstream,
        buffer: SseLineBuffer::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.pending.pop_front() {
                return Some((Ok(line), state));
            }
            if state.done {
                return None;
            }

            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    state.pending.extend(state.buffer.push(&chunk));
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e.to_string()), state));
                }
                None => {
                    state.done = true;
                    if let Some(tail) = state.buffer.finish() {
                        return Some((Ok(tail), state));
                    }
                    return None;
                }
            }
        }
    })
}
