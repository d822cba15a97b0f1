//! Conversation size management.
//!
//! Messages are removed from the oldest end. An assistant message with tool
//! calls always leaves together with its tool results, so no tool message
//! is ever left without the call it answers.

use std::collections::HashSet;

use crate::llm::{Message, Role};

/// Trim `messages` in place until it fits `max_chars` or only `keep_last`
/// messages remain. Returns the number of removed messages.
pub fn trim_messages(messages: &mut Vec<Message>, max_chars: usize, keep_last: usize) -> usize {
    let mut total: usize = messages.iter().map(Message::char_len).sum();
    if total <= max_chars {
        return 0;
    }

    let protected = keep_last.min(messages.len());
    let mut start = 0;
    while messages.len() - start > protected && total > max_chars {
        let group = group_len(&messages[start..]);
        for msg in &messages[start..start + group] {
            total -= msg.char_len();
        }
        start += group;
    }
    // A group may have reached into the protected tail; what is left must
    // still not begin with a tool result.
    while messages.get(start).is_some_and(|m| m.role == Role::Tool) {
        total -= messages[start].char_len();
        start += 1;
    }

    messages.drain(..start);
    tracing::info!(removed = start, remaining = messages.len(), chars = total, "trimmed conversation");
    start
}

/// Length of the removable group at the head of `messages`.
fn group_len(messages: &[Message]) -> usize {
    let Some(head) = messages.first() else {
        return 0;
    };
    if head.role != Role::Assistant || head.tool_calls.is_empty() {
        return 1;
    }
    let ids: HashSet<&str> = head.tool_calls.iter().map(|c| c.id.as_str()).collect();
    1 + messages[1..]
        .iter()
        .take_while(|m| {
            m.role == Role::Tool
                && m.tool_call_id
                    .as_deref()
                    .is_some_and(|id| ids.contains(id))
        })
        .count()
}

/// The last `max_messages` messages (all when 0). A window that would
/// start with a tool result is widened back to the assistant message that
/// issued the call.
pub fn request_window(messages: &[Message], max_messages: usize) -> &[Message] {
    if max_messages == 0 || messages.len() <= max_messages {
        return messages;
    }
    let mut start = messages.len() - max_messages;
    while start > 0 && messages[start].role == Role::Tool {
        start -= 1;
    }
    &messages[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCall;
    use serde_json::json;

    fn call_group(id: &str, result: &str) -> Vec<Message> {
        vec![
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new(id, "read", json!({"path": "a"}))],
            ),
            Message::tool(id, "read", result),
        ]
    }

    #[test]
    fn test_under_budget_untouched() {
        let mut messages = vec![Message::user("hi"), Message::assistant("hello")];
        assert_eq!(trim_messages(&mut messages, 100, 1), 0);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_trim_removes_groups_atomically() {
        let big = "x".repeat(100);
        let mut messages = vec![Message::user(big.clone())];
        messages.extend(call_group("c1", &big));
        messages.extend(call_group("c2", &big));
        messages.push(Message::user("latest"));

        let removed = trim_messages(&mut messages, 150, 2);
        assert_eq!(removed, 3);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("c2"));
    }

    #[test]
    fn test_trim_never_leaves_orphan_tool_result() {
        let big = "y".repeat(200);
        let mut messages = vec![Message::user("task")];
        messages.extend(call_group("c1", &big));
        messages.push(Message::user("next"));

        trim_messages(&mut messages, 10, 2);
        assert!(messages.first().map_or(true, |m| m.role != Role::Tool));
        assert!(messages.iter().all(|m| m.role != Role::Tool));
    }

    #[test]
    fn test_keep_last_protects_tail() {
        let mut messages: Vec<Message> = (0..5).map(|i| Message::user("z".repeat(50 + i))).collect();
        trim_messages(&mut messages, 1, 3);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content.len(), 52);
    }

    #[test]
    fn test_request_window() {
        let mut messages = vec![Message::user("task")];
        messages.extend(call_group("c1", "r"));
        messages.push(Message::user("next"));
        assert_eq!(request_window(&messages, 0).len(), 4);
        assert_eq!(request_window(&messages, 1).len(), 1);
        let window = request_window(&messages, 2);
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].role, Role::Assistant);
        assert_eq!(request_window(&messages, 3).len(), 3);
    }
}
