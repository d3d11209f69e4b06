use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

/// Ordered conversation log.
///
/// Append-only except for the trailing model entry, whose text grows in
/// place while a streamed reply arrives. Consumers observing the log see
/// monotonically growing text on the last element, never one element per
/// fragment.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    /// A fresh log seeded with one model greeting.
    pub fn seeded(greeting: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage {
                role: Role::Model,
                text: greeting.into(),
            }],
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage {
            role: Role::User,
            text: text.into(),
        });
    }

    pub fn push_model(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage {
            role: Role::Model,
            text: text.into(),
        });
    }

    /// Opens the empty placeholder that streamed fragments accumulate into.
    pub fn open_model_entry(&mut self) {
        self.push_model(String::new());
    }

    /// Appends a fragment to the trailing model entry. Returns false when
    /// the trailing entry is not a model message (no placeholder is open).
    pub fn append_to_last(&mut self, fragment: &str) -> bool {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Model => {
                last.text.push_str(fragment);
                true
            }
            _ => false,
        }
    }

    /// Closes out a failed stream. If nothing arrived, the empty
    /// placeholder is replaced by the apology; if partial text arrived it
    /// stays in place and the apology lands as a separate model entry.
    pub fn close_with_apology(&mut self, apology: &str) {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Model && last.text.is_empty() => {
                last.text = apology.to_string();
            }
            _ => self.push_model(apology),
        }
    }
}
