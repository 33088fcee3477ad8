//! Normalization of the upstream's streamed body into [`Delta`]s.
//!
//! The upstream speaks newline-delimited `data: <json>` lines. Depending on the
//! model behind it, the JSON is either an OpenAI-style chunk
//! (`choices[0].delta.content`) or a bare `{"content": ...}` object. Both
//! collapse into text fragments here, followed by exactly one finish marker.

use std::fmt::Display;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::oneshot;

pub const FINISH_STOP: &str = "stop";

/// One unit of upstream output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// A non-empty text fragment.
    Text(String),
    /// End of output, with the finish reason.
    Finish(String),
}

impl Delta {
    pub fn stop() -> Self {
        Delta::Finish(FINISH_STOP.to_string())
    }
}

/// Lazy, forward-only sequence of deltas. Dropping it closes the upstream body.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Delta> + Send>>;

/// A streaming reply plus the reason it broke off early, sent at most once
/// and before the error fragment is yielded.
pub struct Reply {
    pub deltas: DeltaStream,
    pub interrupted: oneshot::Receiver<String>,
}

impl Reply {
    /// A reply that never reports an interruption.
    pub fn uninterrupted(deltas: DeltaStream) -> Self {
        let (_tx, interrupted) = oneshot::channel();
        Self {
            deltas,
            interrupted,
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply").finish_non_exhaustive()
    }
}

/// What a single upstream line means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Skip,
    Done,
    Text(String),
}

/// Interpret one line of the upstream body.
///
/// Comments, blank lines, non-`data` fields, unparseable JSON and payloads
/// without text all come back as [`LineEvent::Skip`].
pub fn parse_line(line: &str) -> LineEvent {
    let line = line.trim_end_matches('\r');
    if line.is_empty() || line.starts_with(':') {
        return LineEvent::Skip;
    }

    let data = if let Some(stripped) = line.strip_prefix("data: ") {
        stripped.trim()
    } else if let Some(stripped) = line.strip_prefix("data:") {
        // SSE makes the space after the colon optional
        stripped.trim()
    } else {
        return LineEvent::Skip;
    };

    if data == "[DONE]" {
        return LineEvent::Done;
    }

    let Ok(payload) = serde_json::from_str::<Value>(data) else {
        tracing::trace!(line = data, "Dropping unparseable upstream line");
        return LineEvent::Skip;
    };

    match extract_content(&payload) {
        Some(text) if !text.is_empty() => LineEvent::Text(text.to_string()),
        _ => LineEvent::Skip,
    }
}

/// Pull the text out of an upstream payload.
///
/// A non-empty `choices` array wins outright (its first delta's `content`);
/// only payloads without one fall back to a top-level `content` string.
pub fn extract_content(payload: &Value) -> Option<&str> {
    if let Some(choices) = payload.get("choices").and_then(Value::as_array) {
        if let Some(first) = choices.first() {
            return first
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str);
        }
    }
    payload.get("content").and_then(Value::as_str)
}

/// Turn an upstream byte stream into a [`Reply`].
///
/// Lines are split on raw bytes so multi-byte characters straddling chunk
/// boundaries survive. A transport failure mid-body is reported on
/// [`Reply::interrupted`] and becomes an error text fragment; the finish
/// marker is always emitted last.
pub fn normalize<S, E>(byte_stream: S) -> Reply
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, interrupted) = oneshot::channel();

    let deltas: DeltaStream = Box::pin(async_stream::stream! {
        let mut report = Some(tx);
        let mut buffer: Vec<u8> = Vec::new();
        let mut emitted_chars = 0usize;
        let mut done = false;

        tokio::pin!(byte_stream);

        'read: while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, "Upstream body failed mid-stream");
                    if let Some(tx) = report.take() {
                        let _ = tx.send(e.to_string());
                    }
                    yield Delta::Text(format!("Error: {e}"));
                    break;
                }
            };

            buffer.extend_from_slice(&chunk);

            while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(..=newline_pos).collect();
                let line = String::from_utf8_lossy(&line_bytes[..newline_pos]);

                match parse_line(&line) {
                    LineEvent::Skip => {}
                    LineEvent::Done => {
                        done = true;
                        break 'read;
                    }
                    LineEvent::Text(text) => {
                        emitted_chars += text.chars().count();
                        yield Delta::Text(text);
                    }
                }
            }
        }

        // connection closed on an unterminated final line
        if !done && !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).into_owned();
            if let LineEvent::Text(text) = parse_line(&line) {
                emitted_chars += text.chars().count();
                yield Delta::Text(text);
            }
        }

        tracing::info!(chars = emitted_chars, saw_done = done, "Upstream stream finished");
        yield Delta::stop();
    });

    Reply {
        deltas,
        interrupted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body(chunks: &[&str]) -> impl Stream<Item = std::result::Result<Bytes, String>> + Send {
        let owned: Vec<_> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        stream::iter(owned)
    }

    async fn collect(reply: Reply) -> Vec<Delta> {
        reply.deltas.collect().await
    }

    #[test]
    fn test_parse_line_variants() {
        assert_eq!(parse_line(""), LineEvent::Skip);
        assert_eq!(parse_line(": keep-alive"), LineEvent::Skip);
        assert_eq!(parse_line("event: message"), LineEvent::Skip);
        assert_eq!(parse_line("data: [DONE]"), LineEvent::Done);
        assert_eq!(parse_line("data: {not json"), LineEvent::Skip);
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            LineEvent::Text("Hi".to_string())
        );
        assert_eq!(
            parse_line("data:{\"content\":\"yo\"}\r"),
            LineEvent::Text("yo".to_string())
        );
    }

    #[test]
    fn test_choices_take_priority_over_top_level_content() {
        let payload = serde_json::json!({
            "choices": [{"delta": {}}],
            "content": "ignored"
        });
        assert_eq!(extract_content(&payload), None);

        let payload = serde_json::json!({"choices": [], "content": "fallback"});
        assert_eq!(extract_content(&payload), Some("fallback"));

        let payload = serde_json::json!({"usage": {"prompt_tokens": 3}});
        assert_eq!(extract_content(&payload), None);
    }

    #[tokio::test]
    async fn test_done_ends_stream_with_single_finish() {
        let deltas = collect(normalize(body(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n",
            "data: [DONE]\n",
            "data: {\"content\":\"after done\"}\n",
        ])))
        .await;

        assert_eq!(deltas, vec![Delta::Text("Hi".to_string()), Delta::stop()]);
    }

    #[tokio::test]
    async fn test_finish_synthesized_on_close() {
        let deltas = collect(normalize(body(&[
            "data: {\"content\":\"a\"}\n\ndata: {\"content\":\"b\"}",
        ])))
        .await;

        assert_eq!(
            deltas,
            vec![
                Delta::Text("a".to_string()),
                Delta::Text("b".to_string()),
                Delta::stop()
            ]
        );
    }

    #[tokio::test]
    async fn test_all_malformed_yields_only_finish() {
        let deltas = collect(normalize(body(&[
            "data: {oops\n",
            "data: not json at all\n",
            ": comment\n",
            "data: [DONE]\n",
        ])))
        .await;

        assert_eq!(deltas, vec![Delta::stop()]);
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        // "你好" split in the middle of its UTF-8 encoding
        let line = "data: {\"content\":\"你好\"}\n".as_bytes().to_vec();
        let (head, tail) = line.split_at(20);
        let chunks = vec![
            Ok::<_, String>(Bytes::copy_from_slice(head)),
            Ok(Bytes::copy_from_slice(tail)),
        ];

        let deltas = collect(normalize(stream::iter(chunks))).await;
        assert_eq!(deltas, vec![Delta::Text("你好".to_string()), Delta::stop()]);
    }

    #[tokio::test]
    async fn test_transport_error_becomes_error_fragment() {
        let chunks = vec![
            Ok(Bytes::from_static(b"data: {\"content\":\"partial\"}\n")),
            Err("connection reset".to_string()),
        ];

        let mut reply = normalize(stream::iter(chunks));
        let deltas: Vec<Delta> = (&mut reply.deltas).collect().await;
        assert_eq!(
            deltas,
            vec![
                Delta::Text("partial".to_string()),
                Delta::Text("Error: connection reset".to_string()),
                Delta::stop()
            ]
        );
        assert_eq!(reply.interrupted.try_recv().unwrap(), "connection reset");
    }

    #[tokio::test]
    async fn test_clean_end_reports_no_interruption() {
        let mut reply = normalize(body(&["data: {\"content\":\"a\"}\n", "data: [DONE]\n"]));
        let deltas: Vec<Delta> = (&mut reply.deltas).collect().await;

        assert_eq!(deltas.len(), 2);
        assert!(reply.interrupted.try_recv().is_err());
    }
}
