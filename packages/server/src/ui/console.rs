//! Line-editing console on the controlling terminal.

use rustyline::{DefaultEditor, error::ReadlineError};

use crate::{
    error::ConsoleError,
    usecase::{ConsoleLine, LineSource},
};

/// Prompt shown before each console read.
pub const PROMPT: &str = ": ";

/// [`LineSource`] backed by `rustyline`.
///
/// Falls back to plain line reads when stdin is not a terminal.
pub struct Console {
    editor: DefaultEditor,
}

impl Console {
    pub fn new() -> Result<Self, ConsoleError> {
        let editor = DefaultEditor::new().map_err(ConsoleError::Init)?;
        Ok(Self { editor })
    }
}

impl LineSource for Console {
    fn read_line(&mut self) -> Result<ConsoleLine, ConsoleError> {
        match self.editor.readline(PROMPT) {
            Ok(line) => {
                if !line.is_empty()
                    && let Err(e) = self.editor.add_history_entry(line.as_str())
                {
                    tracing::debug!("History entry dropped: {}", e);
                }
                Ok(ConsoleLine::Line(line))
            }
            Err(ReadlineError::Interrupted) => Ok(ConsoleLine::Interrupted),
            Err(ReadlineError::Eof) => Ok(ConsoleLine::End),
            Err(e) => Err(ConsoleError::Read(e)),
        }
    }
}
