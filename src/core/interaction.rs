//! Interactive prompt handling - pattern tables consulted while a command runs
//!
//! Four tables, all configurable:
//! - unresponsive: output meaning the running tool has hung (interrupt it)
//! - canned: operator-facing questions that always get the same answer
//! - sudo prompt: answered with the session's cached password
//! - expectations: multi-line `{pattern -> response}` pairs, defaults plus
//!   whatever the caller passes with a command

use crate::config::InteractionConfig;
use crate::error::Result;
use regex::Regex;

/// A prompt spanning one or more trailing lines and the text to answer with
#[derive(Debug, Clone)]
pub struct Expectation {
    lines: Vec<Regex>,
    response: String,
}

impl Expectation {
    /// Multi-line expectation; the last pattern is tested against the last line
    pub fn new<S: AsRef<str>>(lines: &[S], response: impl Into<String>) -> Result<Self> {
        let lines = lines
            .iter()
            .map(|l| Regex::new(l.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            lines,
            response: response.into(),
        })
    }

    pub fn single(pattern: &str, response: impl Into<String>) -> Result<Self> {
        Self::new(&[pattern], response)
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    /// Match each pattern against the corresponding line of the trailing window
    pub fn matches_tail(&self, tail: &[String]) -> bool {
        if self.lines.is_empty() || self.lines.len() > tail.len() {
            return false;
        }
        let window = &tail[tail.len() - self.lines.len()..];
        self.lines
            .iter()
            .zip(window)
            .all(|(re, line)| re.is_match(line))
    }
}

/// Compiled responder tables
#[derive(Debug, Clone)]
pub struct Interaction {
    unresponsive: Vec<Regex>,
    canned: Vec<(Regex, String)>,
    sudo_prompt: Regex,
    expectations: Vec<Expectation>,
}

impl Interaction {
    pub fn from_config(config: &InteractionConfig) -> Result<Self> {
        let unresponsive = config
            .unresponsive
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let canned = config
            .canned
            .iter()
            .map(|c| Ok((Regex::new(&c.pattern)?, c.response.clone())))
            .collect::<Result<Vec<_>>>()?;
        let expectations = config
            .expectations
            .iter()
            .map(|e| Expectation::new(&e.lines, e.response.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            unresponsive,
            canned,
            sudo_prompt: Regex::new(&config.sudo_prompt)?,
            expectations,
        })
    }

    /// Output showing that the running tool is stuck
    pub fn is_unresponsive(&self, line: &str) -> bool {
        self.unresponsive.iter().any(|re| re.is_match(line))
    }

    pub fn canned_answer(&self, line: &str) -> Option<&str> {
        self.canned
            .iter()
            .find(|(re, _)| re.is_match(line))
            .map(|(_, response)| response.as_str())
    }

    pub fn is_sudo_prompt(&self, line: &str) -> bool {
        self.sudo_prompt.is_match(line)
    }

    /// First default or caller expectation matching the tail of the output
    pub fn find_expectation<'a>(
        &'a self,
        extra: &'a [Expectation],
        tail: &[String],
    ) -> Option<&'a Expectation> {
        self.expectations
            .iter()
            .chain(extra.iter())
            .find(|e| e.matches_tail(tail))
    }
}

impl Default for Interaction {
    fn default() -> Self {
        // The default tables are constants known to compile
        Self::from_config(&InteractionConfig::default()).expect("default interaction patterns")
    }
}
