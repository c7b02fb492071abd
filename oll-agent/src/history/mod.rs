use crate::clients::{Message, MessageRole};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: MessageRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Turn {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

impl From<&Turn> for Message {
    fn from(turn: &Turn) -> Self {
        Message {
            role: turn.role,
            content: turn.text.clone(),
            images: turn.images.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    turns: Vec<Turn>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::user(text));
    }

    /// Consecutive assistant appends are merged into the last turn.
    pub fn append_assistant(&mut self, text: &str) {
        match self.turns.last_mut() {
            Some(last) if last.role == MessageRole::Assistant => last.text.push_str(text),
            _ => self.turns.push(Turn {
                role: MessageRole::Assistant,
                text: text.to_string(),
                images: Vec::new(),
            }),
        }
    }

    pub fn ends_with_user(&self) -> bool {
        self.turns
            .last()
            .is_some_and(|turn| turn.role == MessageRole::User)
    }

    pub fn contains_text(&self, needle: &str) -> bool {
        self.turns.iter().any(|turn| turn.text.contains(needle))
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn to_messages(&self) -> Vec<Message> {
        self.turns.iter().map(Message::from).collect()
    }
}
