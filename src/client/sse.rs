//! Server-Sent Events parsing and delivery.
//!
//! The wire format is line-based: events are groups of `field: value` lines
//! terminated by a blank line. The core recognises `data:` payloads and
//! captures `id:` values as opaque reconnection tokens; every other field
//! (`event:`, `retry:`, comment lines starting with `:`) is accepted and
//! ignored. A payload of exactly `[DONE]` ends the stream.
//!
//! Tolerance policy: a `data:` frame that fails to decode as a
//! [`StreamChunk`] is skipped with a log line, never fatal — upstream
//! gateways emit occasional commented or partial frames. Transport errors
//! and oversized frames fail hard.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CoreError;

use super::StreamChunk;

/// Any single SSE event larger than this aborts the stream.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Capacity of the per-stream delivery channel. Enough to smooth producer
/// jitter without letting an unread stream grow unbounded.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// A parsed SSE event relevant to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload (JSON, still undecoded).
    Data(String),
    /// The `[DONE]` terminator.
    Done,
}

/// Incremental SSE parser. Feed raw bytes, drain parsed events.
#[derive(Debug, Default)]
pub struct SseParser {
    /// Undelimited tail of the byte stream, kept across feeds.
    pending: String,
    /// `data:` lines of the event currently being assembled.
    data_lines: Vec<String>,
    /// Most recent `id:` value seen, for reconnection.
    last_event_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opaque reconnection token from the last `id:` field, if any.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Feed a chunk of bytes; returns every event completed by it.
    ///
    /// Fails with [`CoreError::ChunkTooLarge`] when a single event exceeds
    /// [`MAX_FRAME_BYTES`].
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, CoreError> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line terminates the current event.
                if !self.data_lines.is_empty() {
                    let payload = self.data_lines.join("\n");
                    self.data_lines.clear();
                    if payload == "[DONE]" {
                        events.push(SseEvent::Done);
                    } else {
                        events.push(SseEvent::Data(payload));
                    }
                }
                continue;
            }

            if line.starts_with(':') {
                continue; // comment
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "data" => self.data_lines.push(value.to_string()),
                "id" => self.last_event_id = Some(value.to_string()),
                // event:, retry:, and anything else: accepted, ignored.
                _ => {}
            }
        }

        // Complete events have been drained; what remains is at most one
        // partial line plus the fields of one in-flight event. That is the
        // single-frame size the cap bounds.
        let assembled: usize = self.data_lines.iter().map(String::len).sum();
        if self.pending.len() + assembled > MAX_FRAME_BYTES {
            return Err(CoreError::ChunkTooLarge { limit: MAX_FRAME_BYTES });
        }
        Ok(events)
    }

    /// Flush a final unterminated event at end-of-stream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        // A trailing line without its newline still counts.
        let tail = std::mem::take(&mut self.pending);
        let tail = tail.trim();
        if let Some(data) = tail.strip_prefix("data:") {
            self.data_lines.push(data.trim_start().to_string());
        }
        if self.data_lines.is_empty() {
            return None;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        if payload == "[DONE]" {
            Some(SseEvent::Done)
        } else {
            Some(SseEvent::Data(payload))
        }
    }
}

/// What one pass over an SSE byte stream produced.
#[derive(Debug, Default, Clone)]
pub struct StreamOutcome {
    /// Chunks handed to the consumer.
    pub delivered: usize,
    /// Concatenated content deltas.
    pub content: String,
    /// Reconnection token, if the server sent one.
    pub last_event_id: Option<String>,
    /// Whether `[DONE]` (or a terminal finish reason) was observed.
    pub completed: bool,
}

/// Drive one SSE byte stream to completion, delivering decoded chunks into a
/// bounded channel.
///
/// Delivery selects on `(send, cancellation)` so a cancelled or departed
/// consumer releases the producer promptly. Within one stream, chunks are
/// delivered strictly in wire order.
///
/// Returns the outcome; `Err` carries the partial outcome alongside the
/// failure so callers can preserve accumulated content across retries.
pub async fn pump_stream<S>(
    mut byte_stream: S,
    tx: &mpsc::Sender<Result<StreamChunk, CoreError>>,
    cancel: &CancellationToken,
) -> Result<StreamOutcome, (StreamOutcome, CoreError)>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    let mut parser = SseParser::new();
    let mut outcome = StreamOutcome::default();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                return Err((outcome, CoreError::Cancelled));
            }
            next = byte_stream.next() => next,
        };

        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                outcome.last_event_id = parser.last_event_id().map(str::to_string);
                return Err((outcome, CoreError::Transport(e.to_string())));
            }
            None => break,
        };

        let events = match parser.feed(&bytes) {
            Ok(events) => events,
            Err(e) => {
                outcome.last_event_id = parser.last_event_id().map(str::to_string);
                return Err((outcome, e));
            }
        };
        for event in events {
            match deliver_event(event, tx, cancel, &mut outcome).await {
                Ok(true) => {
                    outcome.last_event_id = parser.last_event_id().map(str::to_string);
                    return Ok(outcome);
                }
                Ok(false) => {}
                Err(e) => {
                    outcome.last_event_id = parser.last_event_id().map(str::to_string);
                    return Err((outcome, e));
                }
            }
        }
    }

    // Stream ended without [DONE]; a final unterminated frame may remain.
    if let Some(event) = parser.finish() {
        match deliver_event(event, tx, cancel, &mut outcome).await {
            Ok(true) => {
                outcome.last_event_id = parser.last_event_id().map(str::to_string);
                return Ok(outcome);
            }
            Ok(false) => {}
            Err(e) => {
                outcome.last_event_id = parser.last_event_id().map(str::to_string);
                return Err((outcome, e));
            }
        }
    }

    outcome.last_event_id = parser.last_event_id().map(str::to_string);
    if outcome.completed {
        Ok(outcome)
    } else {
        // EOF mid-stream is a transport failure, not a clean end.
        let err = CoreError::Transport("stream closed before [DONE]".into());
        Err((outcome, err))
    }
}

/// Deliver one event. Returns `Ok(true)` when the stream is finished.
async fn deliver_event(
    event: SseEvent,
    tx: &mpsc::Sender<Result<StreamChunk, CoreError>>,
    cancel: &CancellationToken,
    outcome: &mut StreamOutcome,
) -> Result<bool, CoreError> {
    match event {
        SseEvent::Done => {
            outcome.completed = true;
            Ok(true)
        }
        SseEvent::Data(payload) => {
            let chunk: StreamChunk = match serde_json::from_str(&payload) {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Tolerate a malformed frame; upstream gateways emit
                    // occasional partial or commented chunks.
                    debug!(error = %e, "skipping undecodable SSE frame");
                    return Ok(false);
                }
            };
            let done = chunk.is_done();
            outcome.content.push_str(&chunk.content());
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                sent = tx.send(Ok(chunk)) => {
                    if sent.is_err() {
                        // Consumer went away; treat like cancellation.
                        warn!("stream consumer dropped; stopping producer");
                        return Err(CoreError::Cancelled);
                    }
                }
            }
            outcome.delivered += 1;
            if done {
                outcome.completed = true;
            }
            Ok(done)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({
                "choices": [{"delta": {"content": content}, "finish_reason": null}]
            })
        )
    }

    // -----------------------------------------------------------------------
    // Parser framing
    // -----------------------------------------------------------------------

    #[test]
    fn parses_simple_data_events() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n").unwrap();
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"a\":1}".into()),
                SseEvent::Data("{\"b\":2}".into())
            ]
        );
    }

    #[test]
    fn event_requires_the_blank_line_terminator() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"a\":1}\n").unwrap().is_empty());
        let events = parser.feed(b"\n").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn multiline_data_joins_with_newlines() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: line1\ndata: line2\n\n").unwrap();
        assert_eq!(events, vec![SseEvent::Data("line1\nline2".into())]);
    }

    #[test]
    fn done_sentinel_is_recognised() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: [DONE]\n\n").unwrap();
        assert_eq!(events, vec![SseEvent::Done]);
    }

    #[test]
    fn id_field_is_captured_other_fields_ignored() {
        let mut parser = SseParser::new();
        let events = parser
            .feed(b"id: evt-42\nevent: message\nretry: 3000\n: a comment\ndata: {\"x\":1}\n\n")
            .unwrap();
        assert_eq!(events, vec![SseEvent::Data("{\"x\":1}".into())]);
        assert_eq!(parser.last_event_id(), Some("evt-42"));
    }

    #[test]
    fn split_across_feeds_reassembles() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"da").unwrap().is_empty());
        assert!(parser.feed(b"ta: {\"a\"").unwrap().is_empty());
        let events = parser.feed(b":1}\n\n").unwrap();
        assert_eq!(events, vec![SseEvent::Data("{\"a\":1}".into())]);
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"a\":1}\r\n\r\n").unwrap();
        assert_eq!(events, vec![SseEvent::Data("{\"a\":1}".into())]);
    }

    #[test]
    fn oversized_frame_fails_with_chunk_too_large() {
        let mut parser = SseParser::new();
        let huge = format!("data: {}", "x".repeat(MAX_FRAME_BYTES + 1));
        let err = parser.feed(huge.as_bytes()).unwrap_err();
        assert_eq!(err.code(), "chunk_too_large");
    }

    #[test]
    fn finish_flushes_a_trailing_frame_without_newline() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"a\":1}").unwrap().is_empty());
        assert_eq!(parser.finish(), Some(SseEvent::Data("{\"a\":1}".into())));
    }

    // -----------------------------------------------------------------------
    // pump_stream — ordering, termination, partial preservation
    // -----------------------------------------------------------------------

    fn byte_stream(
        parts: Vec<Result<Bytes, reqwest::Error>>,
    ) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Unpin {
        futures_util::stream::iter(parts)
    }

    #[tokio::test]
    async fn n_chunks_then_done_delivers_exactly_n_in_order() {
        let frames = format!(
            "{}{}{}data: [DONE]\n\n",
            data_frame("alpha "),
            data_frame("beta "),
            data_frame("gamma")
        );
        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let outcome = pump_stream(
            byte_stream(vec![Ok(Bytes::from(frames))]),
            &tx,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(outcome.delivered, 3);
        assert!(outcome.completed);
        assert_eq!(outcome.content, "alpha beta gamma");

        drop(tx);
        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            received.push(chunk.unwrap().content());
        }
        assert_eq!(received, vec!["alpha ", "beta ", "gamma"]);
    }

    #[tokio::test]
    async fn undecodable_frames_are_skipped_not_fatal() {
        let frames = format!(
            "data: not json at all\n\n{}data: [DONE]\n\n",
            data_frame("ok")
        );
        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let outcome = pump_stream(byte_stream(vec![Ok(Bytes::from(frames))]), &tx, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.delivered, 1);

        drop(tx);
        assert_eq!(rx.recv().await.unwrap().unwrap().content(), "ok");
    }

    #[tokio::test]
    async fn eof_before_done_is_a_transport_error_with_partial_content() {
        let frames = format!("{}{}", data_frame("one "), data_frame("two"));
        let (tx, _rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let (partial, err) = pump_stream(byte_stream(vec![Ok(Bytes::from(frames))]), &tx, &cancel)
            .await
            .unwrap_err();
        assert_eq!(partial.delivered, 2);
        assert_eq!(partial.content, "one two");
        assert!(!partial.completed);
        assert_eq!(err.code(), "transport_error");
    }

    #[tokio::test]
    async fn cancellation_stops_the_pump_immediately() {
        let (tx, _rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let pending = futures_util::stream::pending::<Result<Bytes, reqwest::Error>>();
        let (outcome, err) = pump_stream(Box::pin(pending), &tx, &cancel).await.unwrap_err();
        assert_eq!(outcome.delivered, 0);
        assert_eq!(err.code(), "cancelled");
    }

    #[tokio::test]
    async fn finish_reason_in_a_chunk_terminates_without_done_sentinel() {
        let terminal = format!(
            "data: {}\n\n",
            serde_json::json!({
                "choices": [{"delta": {"content": "end"}, "finish_reason": "stop"}]
            })
        );
        let (tx, _rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let outcome = pump_stream(byte_stream(vec![Ok(Bytes::from(terminal))]), &tx, &cancel)
            .await
            .unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.delivered, 1);
    }

    #[tokio::test]
    async fn last_event_id_survives_into_the_outcome() {
        let frames = format!("id: evt-7\n{}", data_frame("x"));
        let (tx, _rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let (partial, _err) = pump_stream(byte_stream(vec![Ok(Bytes::from(frames))]), &tx, &cancel)
            .await
            .unwrap_err();
        assert_eq!(partial.last_event_id.as_deref(), Some("evt-7"));
    }
}
