//! Translation between the two downstream dialects and the gateway's internal
//! types.
//!
//! Inbound requests from either dialect are normalized into a
//! [`request::ChatRequest`]; the upstream's normalized [`Delta`] sequence is
//! re-encoded into OpenAI-style chunks ([`openai_stream`]) or Anthropic-style
//! events ([`anthropic_stream`]), or collected into a single response
//! ([`aggregate`]). All translation functions are pure (no I/O).
//!
//! [`Delta`]: crate::upstream::Delta

pub mod aggregate;
pub mod anthropic_stream;
pub mod anthropic_types;
pub mod openai_stream;
pub mod openai_types;
pub mod request;

/// One server-sent event as it goes out on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<&'static str>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: &'static str, data: impl Into<String>) -> Self {
        Self {
            event: Some(event),
            data: data.into(),
        }
    }

    /// `event: <name>\ndata: <data>\n\n`, or just the data line when unnamed.
    pub fn render(&self) -> String {
        match self.event {
            Some(name) => format!("event: {name}\ndata: {}\n\n", self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }
}

/// Rough token count for `chars` characters of text: one token per four
/// characters. This is an approximation for usage reporting, not a tokenizer.
pub fn estimate_tokens(chars: usize) -> u64 {
    (chars / 4) as u64
}
