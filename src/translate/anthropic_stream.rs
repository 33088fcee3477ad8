//! State machine re-encoding upstream [`Delta`]s as Anthropic SSE events.
//!
//! The emitted sequence is always `message_start`, `content_block_start`,
//! one `content_block_delta` per text fragment, then `content_block_stop`,
//! `message_delta` and `message_stop`. Deltas arriving after the finish are
//! ignored.

use super::anthropic_types::{
    BlockDelta, DeltaUsage, MessageDeltaBody, MessagesResponse, ResponseContentBlock, StreamEvent,
    Usage,
};
use super::{estimate_tokens, SseFrame};
use crate::upstream::{Delta, FINISH_STOP};

/// Anthropic stop reason for an upstream finish reason.
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "stop" | "content_filter" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        "tool_calls" | "function_call" => "tool_use".to_string(),
        other => other.to_string(),
    }
}

/// `msg_` followed by 24 hex characters.
pub fn new_message_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &hex[..24])
}

/// Output-token estimate for `chars` characters of generated text; never zero.
pub fn output_tokens(chars: usize) -> u64 {
    estimate_tokens(chars).max(1)
}

/// Usage:
///   let mut encoder = AnthropicEncoder::new("claude-sonnet-4-5-20250929", input_tokens);
///   for delta in deltas {
///       for event in encoder.process(&delta) { /* send as SSE */ }
///   }
///   let trailing = encoder.finish();
#[derive(Debug)]
pub struct AnthropicEncoder {
    model: String,
    msg_id: String,
    input_tokens: u64,
    output_chars: usize,
    started: bool,
    finished: bool,
}

impl AnthropicEncoder {
    pub fn new(model: &str, input_tokens: u64) -> Self {
        Self {
            model: model.to_string(),
            msg_id: new_message_id(),
            input_tokens,
            output_chars: 0,
            started: false,
            finished: false,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.msg_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Process one delta, returning zero or more events.
    pub fn process(&mut self, delta: &Delta) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = self.start_events();
        match delta {
            Delta::Text(text) => {
                self.output_chars += text.chars().count();
                events.push(StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: BlockDelta::TextDelta { text: text.clone() },
                });
            }
            Delta::Finish(reason) => events.append(&mut self.finish_events(reason)),
        }
        events
    }

    /// Close the message if the delta sequence ended without a finish.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut events = self.start_events();
        events.append(&mut self.finish_events(FINISH_STOP));
        events
    }

    fn start_events(&mut self) -> Vec<StreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;

        vec![
            StreamEvent::MessageStart {
                message: MessagesResponse {
                    id: self.msg_id.clone(),
                    response_type: "message".to_string(),
                    role: "assistant".to_string(),
                    content: Vec::new(),
                    model: self.model.clone(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: Usage {
                        input_tokens: self.input_tokens,
                        output_tokens: 0,
                    },
                },
            },
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseContentBlock::Text {
                    text: String::new(),
                },
            },
        ]
    }

    fn finish_events(&mut self, reason: &str) -> Vec<StreamEvent> {
        self.finished = true;

        vec![
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(map_finish_reason(reason)),
                    stop_sequence: None,
                },
                usage: DeltaUsage {
                    output_tokens: output_tokens(self.output_chars),
                },
            },
            StreamEvent::MessageStop,
        ]
    }
}

pub fn to_frame(event: &StreamEvent) -> SseFrame {
    SseFrame::named(
        event.event_name(),
        serde_json::to_string(event).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_name).collect()
    }

    fn run(deltas: &[Delta]) -> Vec<StreamEvent> {
        let mut encoder = AnthropicEncoder::new("claude-sonnet-4-5-20250929", 3);
        let mut events: Vec<StreamEvent> = deltas.iter().flat_map(|d| encoder.process(d)).collect();
        events.extend(encoder.finish());
        events
    }

    #[test]
    fn test_single_fragment_event_order() {
        let events = run(&[Delta::Text("Hi".to_string()), Delta::stop()]);

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );

        let json = serde_json::to_value(&events[2]).unwrap();
        assert_eq!(json["delta"]["type"], "text_delta");
        assert_eq!(json["delta"]["text"], "Hi");

        let json = serde_json::to_value(&events[4]).unwrap();
        assert_eq!(json["delta"]["stop_reason"], "end_turn");
        assert_eq!(json["usage"]["output_tokens"], 1);
    }

    #[test]
    fn test_message_start_shape() {
        let events = run(&[Delta::stop()]);
        let json = serde_json::to_value(&events[0]).unwrap();

        assert_eq!(json["type"], "message_start");
        assert_eq!(json["message"]["model"], "claude-sonnet-4-5-20250929");
        assert_eq!(json["message"]["content"], serde_json::json!([]));
        assert_eq!(json["message"]["usage"]["input_tokens"], 3);
        let id = json["message"]["id"].as_str().unwrap();
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 28);
    }

    #[test]
    fn test_zero_fragments_still_complete() {
        let events = run(&[Delta::stop()]);
        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
    }

    #[test]
    fn test_nothing_after_finish() {
        let events = run(&[
            Delta::Text("a".to_string()),
            Delta::stop(),
            Delta::Text("late".to_string()),
            Delta::stop(),
        ]);

        assert_eq!(names(&events).iter().filter(|n| **n == "message_stop").count(), 1);
        assert_eq!(
            names(&events).iter().filter(|n| **n == "content_block_delta").count(),
            1
        );
        assert_eq!(names(&events).last(), Some(&"message_stop"));
    }

    #[test]
    fn test_finish_closes_unterminated_sequence() {
        let mut encoder = AnthropicEncoder::new("m", 0);
        let _ = encoder.process(&Delta::Text("x".repeat(40)));
        let events = encoder.finish();

        assert_eq!(
            names(&events),
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
        let json = serde_json::to_value(&events[1]).unwrap();
        assert_eq!(json["usage"]["output_tokens"], 10);
        assert!(encoder.is_finished());
    }

    #[test]
    fn test_frame_carries_event_name() {
        let frame = to_frame(&StreamEvent::MessageStop);
        assert_eq!(frame.event, Some("message_stop"));
        assert_eq!(frame.data, r#"{"type":"message_stop"}"#);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), "end_turn");
        assert_eq!(map_finish_reason("length"), "max_tokens");
        assert_eq!(map_finish_reason("tool_calls"), "tool_use");
        assert_eq!(map_finish_reason("custom"), "custom");
    }
}
