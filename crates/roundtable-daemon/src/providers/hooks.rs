//! Tool-call hook capture.
//!
//! Backend-A detects agent tool invocations through post-tool-use hooks on
//! the client; backend-B extracts the same signals from its event stream.
//! Both paths feed [`HookSignal`]s into one channel the agent manager
//! drains each stream iteration, so there is a single merge point and no
//! shared mutable capture lists.

use tokio::sync::mpsc;

/// A tool invocation observed during a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookSignal {
    /// The agent called the skip tool: this turn produces no message.
    Skip,
    /// The agent called the policy-check tool with a situation string.
    PolicyCheck(String),
}

/// Sender side handed to clients through their options.
#[derive(Debug, Clone)]
pub struct HookCaptures {
    tx: Option<mpsc::UnboundedSender<HookSignal>>,
}

impl HookCaptures {
    /// Create a connected capture channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HookSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A capture sink that discards all signals (backends without hooks).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit a signal; silently dropped when the turn has ended.
    pub fn emit(&self, signal: HookSignal) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(signal);
        }
    }

    /// Hook matcher for post-tool-use events: namespaced MCP names match by
    /// suffix.
    pub fn observe_tool_use(&self, tool_name: &str, input: &serde_json::Value) {
        if tool_name == "skip" || tool_name.ends_with("__skip") {
            self.emit(HookSignal::Skip);
        } else if tool_name == "policy_check" || tool_name.ends_with("__policy_check") {
            if let Some(situation) = input.get("situation").and_then(|v| v.as_str()) {
                self.emit(HookSignal::PolicyCheck(situation.to_string()));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn skip_tool_matches_namespaced_name() {
        let (captures, mut rx) = HookCaptures::channel();
        captures.observe_tool_use("mcp__social__skip", &json!({}));
        assert_eq!(rx.try_recv().ok(), Some(HookSignal::Skip));
    }

    #[test]
    fn policy_check_carries_situation() {
        let (captures, mut rx) = HookCaptures::channel();
        captures.observe_tool_use("policy_check", &json!({"situation": "tricky"}));
        assert_eq!(
            rx.try_recv().ok(),
            Some(HookSignal::PolicyCheck("tricky".to_string()))
        );
    }

    #[test]
    fn unrelated_tools_emit_nothing() {
        let (captures, mut rx) = HookCaptures::channel();
        captures.observe_tool_use("memorize", &json!({"memory_entry": "x"}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_captures_do_not_panic() {
        HookCaptures::disabled().emit(HookSignal::Skip);
    }
}
