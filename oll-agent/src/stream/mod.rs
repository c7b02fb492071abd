use crate::clients::{ChatFragment, GenerationMetrics, ToolCall};

pub const REASONING_BEGIN: &str = "<think>\n";
pub const REASONING_END: &str = "</think>\n";

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ReasoningBegin,
    Reasoning(String),
    ReasoningEnd,
    Content(String),
    ToolCalls(Vec<ToolCall>),
    Images(Vec<String>),
    Done {
        reason: Option<String>,
        metrics: GenerationMetrics,
    },
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    hide_reasoning: bool,
    in_reasoning: bool,
    strip_next_content: bool,
}

impl StreamDecoder {
    pub fn new(hide_reasoning: bool) -> Self {
        Self {
            hide_reasoning,
            ..Default::default()
        }
    }

    pub fn in_reasoning(&self) -> bool {
        self.in_reasoning
    }

    pub fn decode(&mut self, fragment: ChatFragment) -> Vec<StreamEvent> {
        let ChatFragment {
            message,
            done,
            done_reason,
            metrics,
            ..
        } = fragment;
        let mut events = Vec::new();

        let has_reasoning = !message.thinking.is_empty();
        if has_reasoning && !self.in_reasoning {
            self.in_reasoning = true;
            if !self.hide_reasoning {
                events.push(StreamEvent::ReasoningBegin);
            }
        } else if !has_reasoning && self.in_reasoning {
            self.in_reasoning = false;
            if self.hide_reasoning {
                self.strip_next_content = true;
            } else {
                events.push(StreamEvent::ReasoningEnd);
            }
        }

        if has_reasoning && !self.hide_reasoning {
            events.push(StreamEvent::Reasoning(message.thinking));
        }

        if !message.content.is_empty() {
            // content inside a hidden reasoning block is never surfaced
            if !self.hide_reasoning || !self.in_reasoning {
                let content = if self.strip_next_content {
                    self.strip_next_content = false;
                    message.content.trim_start().to_string()
                } else {
                    message.content
                };
                if !content.is_empty() {
                    events.push(StreamEvent::Content(content));
                }
            }
        } else if !message.tool_calls.is_empty() {
            events.push(StreamEvent::ToolCalls(message.tool_calls));
        } else if !message.images.is_empty() {
            events.push(StreamEvent::Images(message.images));
        }

        if done {
            events.push(StreamEvent::Done {
                reason: done_reason,
                metrics,
            });
        }

        events
    }
}
