//! Re-encode upstream [`Delta`]s as OpenAI `chat.completion.chunk` frames.

use super::openai_types::{ChatCompletionChunk, ChunkChoice, ChunkDelta};
use super::SseFrame;
use crate::upstream::{Delta, FINISH_STOP};

pub const DONE: &str = "[DONE]";

/// `chatcmpl-` followed by a random UUID.
pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

#[derive(Debug)]
pub struct OpenAiEncoder {
    id: String,
    model: String,
    created: i64,
    finished: bool,
}

impl OpenAiEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: new_completion_id(),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            finished: false,
        }
    }

    pub fn completion_id(&self) -> &str {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Frames for one delta. After the finish has been encoded every call
    /// returns nothing.
    pub fn encode(&mut self, delta: &Delta) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }

        match delta {
            Delta::Text(text) => vec![self.chunk(
                ChunkDelta {
                    role: None,
                    content: Some(text.clone()),
                },
                None,
            )],
            Delta::Finish(reason) => self.finish_frames(reason),
        }
    }

    /// Close the stream if the delta sequence ended without a finish.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        self.finish_frames(FINISH_STOP)
    }

    fn finish_frames(&mut self, reason: &str) -> Vec<SseFrame> {
        self.finished = true;
        vec![
            self.chunk(ChunkDelta::default(), Some(reason.to_string())),
            SseFrame::data(DONE),
        ]
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> SseFrame {
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        };
        SseFrame::data(serde_json::to_string(&chunk).unwrap_or_default())
    }
}
