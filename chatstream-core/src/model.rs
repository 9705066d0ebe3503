use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Caller-owned multi-turn history. The client never keeps one of these
/// itself; pass it to `ChatClient::ask_in` to send and extend it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a conversation with a leading system prompt.
    pub fn with_system(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(prompt)],
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

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Messages to send for a new question: the history followed by the question.
    pub(crate) fn with_question(&self, question: &str) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.extend(self.messages.iter().cloned());
        out.push(ChatMessage::user(question));
        out
    }

    /// Record a completed exchange.
    pub(crate) fn record_turn(&mut self, question: &str, answer: String) {
        self.messages.push(ChatMessage::user(question));
        self.messages.push(ChatMessage::assistant(answer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_json_lowercase() {
        let json = r#"{"role":"assistant","content":"ok"}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        let back = serde_json::to_string(&ChatMessage::system("be brief")).unwrap();
        assert_eq!(back, r#"{"role":"system","content":"be brief"}"#);
    }

    #[test]
    fn conversation_builds_question_without_mutating() {
        let conv = Conversation::with_system("Answer in Korean");
        let msgs = conv.with_question("hi");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1], ChatMessage::user("hi"));
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn conversation_records_turns_in_order() {
        let mut conv = Conversation::new();
        assert!(conv.is_empty());
        conv.record_turn("q1", "a1".into());
        conv.record_turn("q2", "a2".into());
        let roles: Vec<Role> = conv.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(conv.messages()[3].content, "a2");
    }
}
