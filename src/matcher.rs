//! Prompt detection for installer output.
//!
//! Classifies a line of installer stdout as an interactive prompt and yields
//! the bytes to answer it with:
//! - yes/no and confirmation questions get the affirmative answer
//! - "press enter" pauses get a bare line terminator
//!
//! Rules are an ordered, deduplicated table; the first match wins.

use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

static ANSI_PATTERN: OnceLock<Regex> = OnceLock::new();

fn ansi_pattern() -> &'static Regex {
    ANSI_PATTERN.get_or_init(|| Regex::new(r"\x1B\[[0-9;?]*[A-Za-z]|\x1B\].*?\x07").unwrap())
}

/// Strip ANSI escape sequences from text
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").to_string()
}

/// Patterns answered affirmatively, in match order
pub const DEFAULT_AFFIRM_PATTERNS: &[&str] = &["?", "(y/n)", "[y/n]", "continue?", "proceed?"];

/// Patterns answered with a bare line terminator
pub const DEFAULT_ENTER_PATTERNS: &[&str] = &["press enter"];

/// What to send back when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAction {
    /// Affirmative answer followed by a newline
    Affirm,
    /// Just a newline
    Enter,
}

/// One recognized prompt pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRule {
    /// Lowercased substring to look for
    pattern: String,
    action: PromptAction,
}

impl PromptRule {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn action(&self) -> PromptAction {
        self.action
    }
}

/// Prompt matcher with a configurable rule table
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    rules: Vec<PromptRule>,
    affirm_response: Vec<u8>,
    enter_response: Vec<u8>,
}

impl PromptMatcher {
    /// Create a matcher with no rules
    pub fn new(affirm_word: &str) -> Self {
        Self {
            rules: Vec::new(),
            affirm_response: format!("{}\n", affirm_word).into_bytes(),
            enter_response: b"\n".to_vec(),
        }
    }

    /// Create a matcher with the default rule table plus extra patterns
    pub fn with_defaults(
        affirm_word: &str,
        extra_affirm: &[String],
        extra_enter: &[String],
    ) -> Self {
        let mut matcher = Self::new(affirm_word);
        for pattern in DEFAULT_AFFIRM_PATTERNS {
            matcher.add_rule(pattern, PromptAction::Affirm);
        }
        for pattern in DEFAULT_ENTER_PATTERNS {
            matcher.add_rule(pattern, PromptAction::Enter);
        }
        for pattern in extra_affirm {
            matcher.add_rule(pattern, PromptAction::Affirm);
        }
        for pattern in extra_enter {
            matcher.add_rule(pattern, PromptAction::Enter);
        }
        matcher
    }

    /// Append a rule
    ///
    /// Returns `false` if the pattern is empty or already present
    /// (case-insensitively); the earlier rule is kept.
    pub fn add_rule(&mut self, pattern: &str, action: PromptAction) -> bool {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return false;
        }
        if self.rules.iter().any(|rule| rule.pattern == pattern) {
            debug!("Ignoring duplicate prompt pattern {:?}", pattern);
            return false;
        }
        self.rules.push(PromptRule { pattern, action });
        true
    }

    /// Current rule table in match order
    pub fn rules(&self) -> &[PromptRule] {
        &self.rules
    }

    /// Classify a line of output
    ///
    /// Returns the bytes to write to the installer's stdin, or `None` if the
    /// line is not a prompt.
    pub fn match_line(&self, line: &str) -> Option<&[u8]> {
        let clean = strip_ansi(line).to_lowercase();
        let rule = self
            .rules
            .iter()
            .find(|rule| clean.contains(rule.pattern.as_str()))?;

        Some(match rule.action {
            PromptAction::Affirm => self.affirm_response.as_slice(),
            PromptAction::Enter => self.enter_response.as_slice(),
        })
    }
}

impl Default for PromptMatcher {
    fn default() -> Self {
        Self::with_defaults("yes", &[], &[])
    }
}
