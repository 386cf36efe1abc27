use std::io::{self, BufRead, IsTerminal, Write};

use derive_more::{Display, Error, From};

/// Interactive input errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum PromptError {
    /// IO-related error.
    Io(io::Error),

    /// Standard input is not attached to a terminal.
    #[display(fmt = "interactive input is required, but no TTY is available")]
    NoTty,
}

/// Source of values that were not provided with flags or configuration files.
pub(crate) trait Prompt {
    /// Ask a question and return the trimmed, non-empty answer.
    fn input(&self, question: &str) -> Result<String, PromptError>;
}

/// Prompt that reads answers from the terminal.
pub(crate) struct ConsolePrompt;

impl Prompt for ConsolePrompt {
    fn input(&self, question: &str) -> Result<String, PromptError> {
        let stdin = io::stdin();

        if !stdin.is_terminal() {
            return Err(PromptError::NoTty);
        }

        loop {
            eprint!("{question} ");
            io::stderr().flush()?;

            let mut answer = String::new();

            if stdin.lock().read_line(&mut answer)? == 0 {
                return Err(PromptError::NoTty);
            }

            let answer = answer.trim();

            if !answer.is_empty() {
                return Ok(answer.to_string());
            }
        }
    }
}
