//! Operator confirmation.
//!
//! Destructive or disruptive steps ask before they run. The answer source is
//! injected so non-interactive runs (`--yes`) and tests never block on a
//! terminal.

use std::collections::VecDeque;
use std::io::{self, BufRead, IsTerminal, Write};

use parking_lot::Mutex;

pub trait Prompter: Send + Sync {
    /// Ask a yes/no question. `Ok(false)` means the operator declined.
    fn confirm(&self, question: &str) -> io::Result<bool>;
}

/// Interpret a typed answer; empty input takes the default (no).
pub fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "" | "n" | "no" => Some(false),
        _ => None,
    }
}

/// Asks on stderr and reads the answer from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn confirm(&self, question: &str) -> io::Result<bool> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no terminal to confirm on; re-run with --yes to accept",
            ));
        }

        let mut stderr = io::stderr();
        loop {
            write!(stderr, "{} [y/N] ", question)?;
            stderr.flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                return Ok(false);
            }
            match parse_answer(&line) {
                Some(answer) => return Ok(answer),
                None => writeln!(stderr, "Please answer y or n.")?,
            }
        }
    }
}

/// Accepts every question (`--yes`).
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Prompter for AssumeYes {
    fn confirm(&self, _question: &str) -> io::Result<bool> {
        Ok(true)
    }
}

/// Answers from a fixed queue; an exhausted queue declines.
#[derive(Debug, Default)]
pub struct FixedAnswers {
    answers: Mutex<VecDeque<bool>>,
    asked: Mutex<Vec<String>>,
}

impl FixedAnswers {
    pub fn new(answers: &[bool]) -> Self {
        FixedAnswers {
            answers: Mutex::new(answers.iter().copied().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Questions asked so far, in order
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }
}

impl Prompter for FixedAnswers {
    fn confirm(&self, question: &str) -> io::Result<bool> {
        self.asked.lock().push(question.to_string());
        Ok(self.answers.lock().pop_front().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y\n"), Some(true));
        assert_eq!(parse_answer(" YES "), Some(true));
        assert_eq!(parse_answer("\n"), Some(false));
        assert_eq!(parse_answer("no"), Some(false));
        assert_eq!(parse_answer("maybe"), None);
    }

    #[test]
    fn test_fixed_answers_decline_when_exhausted() {
        let prompter = FixedAnswers::new(&[true]);
        assert!(prompter.confirm("first?").unwrap());
        assert!(!prompter.confirm("second?").unwrap());
        assert_eq!(prompter.asked(), vec!["first?", "second?"]);
        assert!(AssumeYes.confirm("anything?").unwrap());
    }
}
