//! Human decision port
//!
//! Interactive dedupe asks its questions through this port rather than
//! reading standard input directly, so non-interactive runs fail fast
//! and tests substitute a deterministic responder. Only one question is
//! ever outstanding at a time.

use crate::error::{Result, SyncError};
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::ops::RangeInclusive;
use std::sync::Mutex;

/// Port for asking a human to decide
pub trait Prompt: Send + Sync {
    /// Ask a question with single-character choices; returns the chosen
    /// character. Implementations re-prompt on invalid input.
    fn ask(&self, question: &str, choices: &[char]) -> Result<char>;

    /// Ask for an integer within `range`
    fn ask_int(&self, question: &str, range: RangeInclusive<usize>) -> Result<usize>;
}

/// Prompt bound to the controlling terminal
pub struct TerminalPrompt {
    // one outstanding question at a time
    lock: Mutex<()>,
}

impl TerminalPrompt {
    /// Create a terminal prompt
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }

    fn read_line(&self) -> Result<String> {
        let stdin = std::io::stdin();
        let mut line = String::new();
        let n = stdin
            .lock()
            .read_line(&mut line)
            .map_err(|e| SyncError::fatal(format!("reading answer: {e}")))?;
        if n == 0 {
            return Err(SyncError::fatal("end of input while waiting for answer"));
        }
        Ok(line.trim().to_string())
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompt for TerminalPrompt {
    fn ask(&self, question: &str, choices: &[char]) -> Result<char> {
        let _guard = self.lock.lock().unwrap();
        let menu: String = choices
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join("/");
        loop {
            let mut err = std::io::stderr();
            let _ = write!(err, "{question}\n{menu}> ");
            let _ = err.flush();

            let line = self.read_line()?;
            let mut chars = line.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                let c = c.to_ascii_lowercase();
                if choices.contains(&c) {
                    return Ok(c);
                }
            }
        }
    }

    fn ask_int(&self, question: &str, range: RangeInclusive<usize>) -> Result<usize> {
        let _guard = self.lock.lock().unwrap();
        loop {
            let mut err = std::io::stderr();
            let _ = write!(err, "{question}> ");
            let _ = err.flush();

            let line = self.read_line()?;
            if let Ok(n) = line.parse::<usize>() {
                if range.contains(&n) {
                    return Ok(n);
                }
            }
        }
    }
}

/// Prompt binding for runs without a terminal. Every question is an
/// error, so interactive modes fail fast instead of hanging.
pub struct NonInteractivePrompt;

impl Prompt for NonInteractivePrompt {
    fn ask(&self, _question: &str, _choices: &[char]) -> Result<char> {
        Err(SyncError::fatal(
            "interactive mode requires a terminal; use a non-interactive mode",
        ))
    }

    fn ask_int(&self, _question: &str, _range: RangeInclusive<usize>) -> Result<usize> {
        Err(SyncError::fatal(
            "interactive mode requires a terminal; use a non-interactive mode",
        ))
    }
}

/// Deterministic prompt fed canned answers, for tests
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<String>>,
}

impl ScriptedPrompt {
    /// Create a prompt that will answer with `answers` in order
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn next_answer(&self) -> Result<String> {
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SyncError::fatal("scripted prompt ran out of answers"))
    }
}

impl Prompt for ScriptedPrompt {
    fn ask(&self, _question: &str, choices: &[char]) -> Result<char> {
        loop {
            let answer = self.next_answer()?;
            let mut chars = answer.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                let c = c.to_ascii_lowercase();
                if choices.contains(&c) {
                    return Ok(c);
                }
            }
            // invalid scripted input falls through to the next answer,
            // mirroring the terminal re-prompt
        }
    }

    fn ask_int(&self, _question: &str, range: RangeInclusive<usize>) -> Result<usize> {
        loop {
            let answer = self.next_answer()?;
            if let Ok(n) = answer.parse::<usize>() {
                if range.contains(&n) {
                    return Ok(n);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_prompt() {
        let prompt = ScriptedPrompt::new(&["x", "k", "9", "2"]);
        // invalid 'x' is skipped, 'k' accepted
        assert_eq!(prompt.ask("keep?", &['s', 'k', 'r']).unwrap(), 'k');
        // 9 is out of range, 2 accepted
        assert_eq!(prompt.ask_int("which?", 1..=3).unwrap(), 2);
        // exhausted script errors
        assert!(prompt.ask("again?", &['s']).is_err());
    }

    #[test]
    fn test_non_interactive_fails_fast() {
        let prompt = NonInteractivePrompt;
        assert!(prompt.ask("q", &['a']).is_err());
        assert!(prompt.ask_int("q", 1..=2).is_err());
    }
}
