//! Standing allow/deny policies consulted before asking a human.

use serde::{Deserialize, Serialize};

/// What a matching rule does to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Deny,
    Approve,
}

/// A standing policy for one tool-name pattern.
///
/// Patterns are an exact tool name, the `*` wildcard, or an
/// `mcp__server__*` prefix wildcard scoped to one MCP server. Rules are
/// immutable once added; they disappear only via explicit delete or clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRule {
    pub id: String,
    pub tool_name: String,
    pub action: RuleAction,
    /// Provenance: which surface added the rule.
    pub added_by: String,
}

impl HookRule {
    pub fn new(
        tool_name: impl Into<String>,
        action: RuleAction,
        added_by: impl Into<String>,
    ) -> Self {
        HookRule {
            id: crate::new_id(),
            tool_name: tool_name.into(),
            action,
            added_by: added_by.into(),
        }
    }

    /// Whether this rule's pattern covers the given tool name.
    pub fn matches(&self, tool_name: &str) -> bool {
        if self.tool_name == "*" {
            return true;
        }
        if self.tool_name == tool_name {
            return true;
        }
        // mcp__server__* scopes to every tool of that literal server prefix.
        if let Some(prefix) = self.tool_name.strip_suffix('*') {
            return self.tool_name.starts_with("mcp__")
                && prefix.ends_with("__")
                && tool_name.starts_with(prefix);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str) -> HookRule {
        HookRule::new(pattern, RuleAction::Deny, "test")
    }

    #[test]
    fn exact_match() {
        assert!(rule("Bash").matches("Bash"));
        assert!(!rule("Bash").matches("BashOutput"));
    }

    #[test]
    fn star_matches_everything() {
        assert!(rule("*").matches("Bash"));
        assert!(rule("*").matches("mcp__github__create_issue"));
    }

    #[test]
    fn mcp_prefix_scopes_to_one_server() {
        let r = rule("mcp__serverA__*");
        assert!(r.matches("mcp__serverA__read"));
        assert!(r.matches("mcp__serverA__write_file"));
        assert!(!r.matches("mcp__serverB__read"));
        assert!(!r.matches("mcp__serverAB__read"));
        assert!(!r.matches("serverA__read"));
    }

    #[test]
    fn bare_suffix_star_is_not_a_wildcard() {
        // Only mcp-scoped prefix wildcards are recognized.
        assert!(!rule("Bash*").matches("BashOutput"));
        assert!(!rule("mcp__server*").matches("mcp__server__read"));
    }
}
