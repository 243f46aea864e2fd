use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model, arguments still raw JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Assigned by [`DialogueHistory`] on append
    #[serde(default)]
    pub seq: u64,
}

impl DialogueTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            seq: 0,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, "")
        }
    }

    pub fn tool(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, text)
        }
    }

    /// Rough token estimate: one token per character.
    pub fn estimated_tokens(&self) -> usize {
        self.text.chars().count()
            + self
                .tool_calls
                .iter()
                .map(|c| c.name.chars().count() + c.arguments.chars().count())
                .sum::<usize>()
    }
}

/// Append-only conversation log with oldest-first truncation.
#[derive(Debug, Clone)]
pub struct DialogueHistory {
    turns: Vec<DialogueTurn>,
    next_seq: u64,
    token_budget: usize,
}

impl DialogueHistory {
    pub fn new(token_budget: usize) -> Self {
        Self {
            turns: Vec::new(),
            next_seq: 0,
            token_budget,
        }
    }

    pub fn with_system_prompt(token_budget: usize, prompt: &str) -> Self {
        let mut history = Self::new(token_budget);
        if !prompt.is_empty() {
            history.append(DialogueTurn::system(prompt));
        }
        history
    }

    /// Append a turn and return its sequence number.
    pub fn append(&mut self, mut turn: DialogueTurn) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        turn.seq = seq;
        self.turns.push(turn);
        self.truncate_to_budget();
        seq
    }

    pub fn extend(&mut self, turns: impl IntoIterator<Item = DialogueTurn>) {
        for turn in turns {
            self.append(turn);
        }
    }

    /// Read-only copy handed to a generation turn.
    pub fn snapshot(&self) -> Vec<DialogueTurn> {
        self.turns.clone()
    }

    pub fn turns(&self) -> &[DialogueTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.turns.iter().map(DialogueTurn::estimated_tokens).sum()
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text.as_str())
    }

    fn truncate_to_budget(&mut self) {
        if self.token_budget == 0 {
            return;
        }
        let mut removed = 0;
        while self.estimated_tokens() > self.token_budget {
            let non_system = self.turns.iter().filter(|t| t.role != Role::System).count();
            // Always keep the newest turn
            if non_system <= 1 {
                break;
            }
            let Some(index) = self.turns.iter().position(|t| t.role != Role::System) else {
                break;
            };
            self.turns.remove(index);
            removed += 1;

            // Tool results whose request was dropped are orphans
            while let Some(next) = self.turns.get(index)
                && next.role == Role::Tool
            {
                self.turns.remove(index);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Truncated {} oldest dialogue turns to fit token budget", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let mut history = DialogueHistory::with_system_prompt(0, "sys");
        history.append(DialogueTurn::user("hi"));
        history.append(DialogueTurn::assistant("hello"));
        let seqs: Vec<u64> = history.turns().iter().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_truncation_keeps_system_prompt() {
        let mut history = DialogueHistory::with_system_prompt(12, "sys");
        history.append(DialogueTurn::user("aaaa"));
        history.append(DialogueTurn::assistant("bbbb"));
        history.append(DialogueTurn::user("cccc"));
        let roles: Vec<Role> = history.turns().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::System, Role::Assistant, Role::User]);
        assert!(history.estimated_tokens() <= 12);
    }

    #[test]
    fn test_truncation_drops_orphan_tool_results() {
        let mut history = DialogueHistory::new(30);
        history.append(DialogueTurn::assistant_tool_calls(vec![ToolCallRequest::new(
            "c1", "get_x", "{}",
        )]));
        history.append(DialogueTurn::tool("c1", "result"));
        history.append(DialogueTurn::user("a".repeat(25)));
        assert_eq!(history.len(), 1);
        assert_eq!(history.turns()[0].role, Role::User);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut history = DialogueHistory::new(0);
        history.append(DialogueTurn::user("one"));
        let snapshot = history.snapshot();
        history.append(DialogueTurn::assistant("two"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(history.last_user_text(), Some("one"));
    }
}
