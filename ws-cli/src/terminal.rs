//! Raw-mode line editor for an interactive terminal.
//!
//! Keys are polled with a short timeout so the editor notices an interrupt
//! within one tick even when the operator is idle. All drawing goes through
//! the shared [`Console`], which is what keeps inbound messages from tearing
//! the prompt.

use std::{io, time::Duration};

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    console::{Console, LineBuffer},
    input::{InputError, LineSource, ReadLine},
};

pub const PROMPT: &str = "> ";

/// Upper bound on how long an interrupt can go unnoticed.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct TerminalEditor {
    console: Console,
    prompt: String,
    history: Vec<String>,
}

impl TerminalEditor {
    pub fn new(console: Console) -> Self {
        Self {
            console,
            prompt: PROMPT.to_string(),
            history: Vec::new(),
        }
    }

    fn edit_loop(&mut self, interrupt: &CancellationToken) -> Result<ReadLine, InputError> {
        // Index into `history` while browsing; `None` means the fresh line.
        let mut browsing: Option<usize> = None;
        let mut draft = String::new();

        loop {
            if interrupt.is_cancelled() {
                self.console.finish_prompt()?;
                return Ok(ReadLine::EndOfInput);
            }
            if !event::poll(POLL_INTERVAL)? {
                continue;
            }

            let key = match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => key,
                Event::Resize(..) => {
                    self.console.edit_prompt(|_| ())?;
                    continue;
                }
                _ => continue,
            };

            match EditAction::from_key(key) {
                EditAction::Submit => {
                    let line = self.console.finish_prompt()?;
                    if !line.is_empty() {
                        self.history.push(line.clone());
                    }
                    return Ok(ReadLine::Line(line));
                }
                EditAction::Interrupt => {
                    let partial = self.console.finish_prompt()?;
                    return Ok(ReadLine::Interrupted(partial));
                }
                EditAction::EndOfInput => {
                    let finished = self.console.edit_prompt(|line| {
                        if line.is_empty() {
                            true
                        } else {
                            line.delete();
                            false
                        }
                    })?;
                    if finished {
                        self.console.finish_prompt()?;
                        return Ok(ReadLine::EndOfInput);
                    }
                }
                EditAction::HistoryPrevious => {
                    let Some(index) = previous_entry(browsing, self.history.len()) else {
                        continue;
                    };
                    if browsing.is_none() {
                        draft = self.console.edit_prompt(|line| line.text())?;
                    }
                    browsing = Some(index);
                    let entry = &self.history[index];
                    self.console.edit_prompt(|line| line.replace(entry))?;
                }
                EditAction::HistoryNext => {
                    let Some(index) = browsing else {
                        continue;
                    };
                    browsing = (index + 1 < self.history.len()).then_some(index + 1);
                    let text = browsing.map_or(draft.as_str(), |next| self.history[next].as_str());
                    self.console.edit_prompt(|line| line.replace(text))?;
                }
                EditAction::Edit(edit) => {
                    self.console.edit_prompt(|line| edit.apply(line))?;
                }
                EditAction::Ignore => {}
            }
        }
    }
}

impl LineSource for TerminalEditor {
    fn read_line(&mut self, interrupt: &CancellationToken) -> Result<ReadLine, InputError> {
        if interrupt.is_cancelled() {
            return Ok(ReadLine::EndOfInput);
        }

        let _raw = RawMode::enable(&self.console)?;
        self.console.begin_prompt(&self.prompt)?;
        let result = self.edit_loop(interrupt);
        if result.is_err() {
            let _ = self.console.finish_prompt();
        }
        result
    }
}

fn previous_entry(browsing: Option<usize>, history_len: usize) -> Option<usize> {
    match browsing {
        None => history_len.checked_sub(1),
        Some(index) => Some(index.saturating_sub(1)),
    }
}

/// Restores cooked mode when dropped, whichever way the read ends. Both
/// switches go through the console so output always matches the mode.
struct RawMode {
    console: Console,
}

impl RawMode {
    fn enable(console: &Console) -> io::Result<Self> {
        console.set_raw_mode(true, enable_raw_mode)?;
        Ok(Self {
            console: console.clone(),
        })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(error) = self.console.set_raw_mode(false, disable_raw_mode) {
            warn!(?error, "failed to restore terminal mode");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditAction {
    Submit,
    Interrupt,
    /// Ctrl-D: ends input on an empty line, deletes forward otherwise.
    EndOfInput,
    HistoryPrevious,
    HistoryNext,
    Edit(LineEdit),
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineEdit {
    Insert(char),
    Backspace,
    Delete,
    Left,
    Right,
    Home,
    End,
    KillToStart,
}

impl EditAction {
    fn from_key(key: KeyEvent) -> Self {
        let control = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Enter => Self::Submit,
            KeyCode::Char('c') if control => Self::Interrupt,
            KeyCode::Char('d') if control => Self::EndOfInput,
            KeyCode::Char('a') if control => Self::Edit(LineEdit::Home),
            KeyCode::Char('e') if control => Self::Edit(LineEdit::End),
            KeyCode::Char('u') if control => Self::Edit(LineEdit::KillToStart),
            KeyCode::Char(_) if control => Self::Ignore,
            KeyCode::Char(c) => Self::Edit(LineEdit::Insert(c)),
            KeyCode::Backspace => Self::Edit(LineEdit::Backspace),
            KeyCode::Delete => Self::Edit(LineEdit::Delete),
            KeyCode::Left => Self::Edit(LineEdit::Left),
            KeyCode::Right => Self::Edit(LineEdit::Right),
            KeyCode::Home => Self::Edit(LineEdit::Home),
            KeyCode::End => Self::Edit(LineEdit::End),
            KeyCode::Up => Self::HistoryPrevious,
            KeyCode::Down => Self::HistoryNext,
            _ => Self::Ignore,
        }
    }
}

impl LineEdit {
    fn apply(self, line: &mut LineBuffer) {
        match self {
            Self::Insert(c) => line.insert(c),
            Self::Backspace => line.backspace(),
            Self::Delete => line.delete(),
            Self::Left => line.left(),
            Self::Right => line.right(),
            Self::Home => line.home(),
            Self::End => line.end(),
            Self::KillToStart => line.kill_to_start(),
        }
    }
}
