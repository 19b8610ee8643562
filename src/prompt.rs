//! Interactive prompts.
//!
//! Command flows never read the terminal directly; they ask a [`Prompter`]
//! so the same code can run against canned answers in tests.

use anyhow::{bail, Context, Result};
use std::io::{self, BufRead, Write as _};

pub trait Prompter: Send + Sync {
    /// Ask a yes/no question. An empty answer yields `default`.
    fn confirm(&self, question: &str, default: bool) -> Result<bool>;

    /// Ask for a line of free text
    fn input(&self, label: &str) -> Result<String>;

    /// Ask for a secret without echoing it
    fn password(&self, label: &str) -> Result<String>;

    /// Pick one of `choices`. `None` means the user backed out.
    fn select(&self, label: &str, choices: &[String]) -> Result<Option<usize>>;
}

/// Prompts on stdin/stdout
pub struct TerminalPrompter;

impl TerminalPrompter {
    fn read_line(&self) -> Result<String> {
        let mut line = String::new();
        let read = io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read from stdin")?;
        if read == 0 {
            bail!("Input closed");
        }
        Ok(line.trim().to_string())
    }
}

impl Prompter for TerminalPrompter {
    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        let hint = if default { "(Y/n)" } else { "(y/N)" };
        print!("{} {} ", question, hint);
        io::stdout().flush()?;

        let answer = self.read_line()?;
        Ok(match answer.as_str() {
            "" => default,
            "y" | "Y" | "yes" | "Yes" => true,
            _ => false,
        })
    }

    fn input(&self, label: &str) -> Result<String> {
        print!("{}: ", label);
        io::stdout().flush()?;
        self.read_line()
    }

    fn password(&self, label: &str) -> Result<String> {
        rpassword::prompt_password(format!("{}: ", label)).context("Failed to read password")
    }

    fn select(&self, label: &str, choices: &[String]) -> Result<Option<usize>> {
        println!("{}", label);
        for (i, choice) in choices.iter().enumerate() {
            println!("  {:>2}) {}", i + 1, choice);
        }

        loop {
            print!("Select [1-{}] (q to cancel): ", choices.len());
            io::stdout().flush()?;

            let answer = self.read_line()?;
            if answer == "q" || answer == "Q" {
                return Ok(None);
            }
            match answer.parse::<usize>() {
                Ok(n) if (1..=choices.len()).contains(&n) => return Ok(Some(n - 1)),
                _ => println!("Please enter a number between 1 and {}", choices.len()),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Canned answer for [`ScriptedPrompter`]
    #[derive(Debug, Clone)]
    pub enum Answer {
        Confirm(bool),
        Text(String),
        Select(Option<usize>),
    }

    /// Replays answers in order and fails on any unexpected question
    #[derive(Default)]
    pub struct ScriptedPrompter {
        answers: Mutex<VecDeque<Answer>>,
        pub asked: Mutex<Vec<String>>,
    }

    impl ScriptedPrompter {
        pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
            Self {
                answers: Mutex::new(answers.into_iter().collect()),
                asked: Mutex::new(Vec::new()),
            }
        }

        fn next(&self, question: &str) -> Result<Answer> {
            self.asked.lock().unwrap().push(question.to_string());
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("Unexpected prompt: {}", question))
        }
    }

    impl Prompter for ScriptedPrompter {
        fn confirm(&self, question: &str, _default: bool) -> Result<bool> {
            match self.next(question)? {
                Answer::Confirm(value) => Ok(value),
                other => bail!("Expected a confirmation for '{}', got {:?}", question, other),
            }
        }

        fn input(&self, label: &str) -> Result<String> {
            match self.next(label)? {
                Answer::Text(value) => Ok(value),
                other => bail!("Expected text for '{}', got {:?}", label, other),
            }
        }

        fn password(&self, label: &str) -> Result<String> {
            self.input(label)
        }

        fn select(&self, label: &str, _choices: &[String]) -> Result<Option<usize>> {
            match self.next(label)? {
                Answer::Select(value) => Ok(value),
                other => bail!("Expected a selection for '{}', got {:?}", label, other),
            }
        }
    }
}
