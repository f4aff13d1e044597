//! Prompt matching - decides when the shell is ready for the next command
//!
//! A prompt template is the literal text installed as `PS1`. The only
//! escape understood is `\#` (bash's command number), which turns the
//! matcher into counter mode: a prompt only counts as fresh when its number
//! is strictly greater than the last one seen, so stale prompts replayed by
//! a reattached terminal are not taken for completion.

use crate::error::Result;
use regex::Regex;

const COUNTER_PLACEHOLDER: &str = r"\#";

/// Outcome of testing one line against the prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMatch {
    /// A fresh prompt standing alone on the line
    Complete,
    /// Prompt text found after leading garbage; the shell should be nudged
    Misaligned,
    None,
}

#[derive(Debug, Clone)]
pub struct PromptMatcher {
    template: String,
    anchored: Regex,
    unanchored: Regex,
    /// `None` when the template has no counter; inner `None` is "unset"
    last_count: Option<Option<u64>>,
    last_line: Option<String>,
}

impl PromptMatcher {
    /// Compile a prompt template
    pub fn configure(template: &str) -> Result<Self> {
        let counter_mode = template.contains(COUNTER_PLACEHOLDER);
        let body = template
            .split(COUNTER_PLACEHOLDER)
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(r"(\d+)");

        Ok(Self {
            template: template.to_string(),
            anchored: Regex::new(&format!(r"^{}\s*$", body))?,
            unanchored: Regex::new(&body)?,
            last_count: if counter_mode { Some(None) } else { None },
            last_line: None,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn is_counter_mode(&self) -> bool {
        self.last_count.is_some()
    }

    /// Highest command number accepted so far
    pub fn last_count(&self) -> Option<u64> {
        self.last_count.flatten()
    }

    /// Test a line; see [`PromptMatch`]
    pub fn test(&mut self, line: &str) -> PromptMatch {
        if line.is_empty() {
            return PromptMatch::None;
        }
        if self.last_line.as_deref() == Some(line) {
            return PromptMatch::None;
        }
        self.last_line = Some(line.to_string());

        if let Some(caps) = self.anchored.captures(line) {
            match self.last_count {
                None => return PromptMatch::Complete,
                Some(last) => {
                    let count = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
                    if let Some(count) = count {
                        if last.map_or(true, |last| count > last) {
                            self.last_count = Some(Some(count));
                            return PromptMatch::Complete;
                        }
                    }
                    return PromptMatch::None;
                }
            }
        }

        if self.unanchored.is_match(line) {
            return PromptMatch::Misaligned;
        }
        PromptMatch::None
    }

    /// True only for a fresh prompt on a line of its own
    pub fn is_completion_line(&mut self, line: &str) -> bool {
        self.test(line) == PromptMatch::Complete
    }
}
