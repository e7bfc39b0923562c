//! Incremental `text/event-stream` decoder.

use std::collections::VecDeque;

use futures::{Stream, StreamExt};

use super::{ApiError, BatchStream};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Splits arbitrary byte chunks into [`SseFrame`]s.
///
/// Lines may end in LF or CRLF and may be split across chunks. Comment lines
/// and `retry` fields are ignored; frames without data are not dispatched.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    current: SseFrame,
    has_data: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(nl) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=nl).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.feed_line(&line) {
                out.push(frame);
            }
        }
        out
    }

    /// Dispatches a trailing frame left without its blank-line terminator.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest).into_owned();
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            if let Some(frame) = self.feed_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };

        match field {
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.current.event = Some(value.to_string()),
            "id" => self.current.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let frame = std::mem::take(&mut self.current);
        let had_data = std::mem::take(&mut self.has_data);
        had_data.then_some(frame)
    }
}

/// Decodes a chunked byte stream into one `data` payload per frame.
///
/// A transport error is yielded once and ends the stream.
pub fn data_stream<S, B, E>(chunks: S) -> BatchStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    let state = (
        Box::pin(chunks),
        SseDecoder::new(),
        VecDeque::<SseFrame>::new(),
        false,
    );
    futures::stream::unfold(state, |(mut chunks, mut decoder, mut queue, mut done)| async move {
        loop {
            if let Some(frame) = queue.pop_front() {
                return Some((Ok(frame.data), (chunks, decoder, queue, done)));
            }
            if done {
                return None;
            }
            match chunks.next().await {
                Some(Ok(chunk)) => queue.extend(decoder.push(chunk.as_ref())),
                Some(Err(err)) => {
                    done = true;
                    return Some((Err(err.into()), (chunks, decoder, queue, done)));
                }
                None => {
                    done = true;
                    queue.extend(decoder.finish());
                }
            }
        }
    })
    .boxed()
}
