//! Serialized output sink shared by the receive loop and the line editor.
//!
//! Every write goes through one mutex. While the terminal editor is showing a
//! prompt, [`Console::print_line`] wipes every row the prompt occupies, prints
//! the message, and redraws the prompt with the operator's partial input, so
//! background output never lands in the middle of what is being typed.

use std::{
    io::{self, Write},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crossterm::{
    cursor::{MoveDown, MoveToColumn, MoveUp},
    queue,
    style::Print,
    terminal::{self, Clear, ClearType},
};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Used when the terminal cannot report its size.
const FALLBACK_COLUMNS: u16 = 80;

#[derive(Clone)]
pub struct Console {
    state: Arc<Mutex<ConsoleState>>,
}

struct ConsoleState {
    out: Box<dyn Write + Send>,
    prompt: Option<PromptLine>,
    raw_mode: bool,
    columns: Columns,
}

enum Columns {
    Terminal,
    Fixed(u16),
}

impl Columns {
    fn get(&self) -> u16 {
        let columns = match self {
            Self::Terminal => terminal::size().map_or(FALLBACK_COLUMNS, |(columns, _)| columns),
            Self::Fixed(columns) => *columns,
        };
        columns.max(1)
    }
}

struct PromptLine {
    prompt: String,
    buffer: LineBuffer,
    /// Row of the terminal cursor, counted from the prompt's first row.
    cursor_row: u16,
    /// Last row the prompt text reaches.
    end_row: u16,
}

impl Console {
    /// Output sized to the controlling terminal.
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self::build(out, Columns::Terminal)
    }

    /// Output wrapped at a fixed number of columns.
    pub fn with_columns(out: impl Write + Send + 'static, columns: u16) -> Self {
        Self::build(out, Columns::Fixed(columns))
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    fn build(out: impl Write + Send + 'static, columns: Columns) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConsoleState {
                out: Box::new(out),
                prompt: None,
                raw_mode: false,
                columns,
            })),
        }
    }

    /// Writes one line of output, keeping an active prompt intact.
    pub fn print_line(&self, text: &str) -> io::Result<()> {
        let mut state = self.lock();
        let columns = state.columns.get();
        let raw = state.raw_mode;
        let ConsoleState { out, prompt, .. } = &mut *state;
        match prompt {
            Some(prompt) => {
                prompt.clear(out)?;
                write_raw_line(out, text)?;
                prompt.draw(out, columns)?;
            }
            // No implicit carriage returns in raw mode.
            None if raw => write_raw_line(out, text)?,
            None => {
                out.write_all(text.as_bytes())?;
                out.write_all(b"\n")?;
            }
        }
        out.flush()
    }

    /// Switches the terminal mode while holding the output lock, so no line is
    /// written with the wrong line endings in between.
    pub(crate) fn set_raw_mode(
        &self,
        enabled: bool,
        switch: impl FnOnce() -> io::Result<()>,
    ) -> io::Result<()> {
        let mut state = self.lock();
        switch()?;
        state.raw_mode = enabled;
        Ok(())
    }

    pub(crate) fn begin_prompt(&self, prompt: &str) -> io::Result<()> {
        let mut state = self.lock();
        let columns = state.columns.get();
        let ConsoleState {
            out,
            prompt: active,
            ..
        } = &mut *state;
        let line = active.insert(PromptLine {
            prompt: prompt.to_string(),
            buffer: LineBuffer::default(),
            cursor_row: 0,
            end_row: 0,
        });
        line.clear(out)?;
        line.draw(out, columns)?;
        out.flush()
    }

    /// Applies an edit to the prompt's buffer and redraws it.
    pub(crate) fn edit_prompt<T>(&self, edit: impl FnOnce(&mut LineBuffer) -> T) -> io::Result<T> {
        let mut state = self.lock();
        let columns = state.columns.get();
        let ConsoleState { out, prompt, .. } = &mut *state;
        let Some(line) = prompt else {
            return Ok(edit(&mut LineBuffer::default()));
        };
        let result = edit(&mut line.buffer);
        line.clear(out)?;
        line.draw(out, columns)?;
        out.flush()?;
        Ok(result)
    }

    /// Leaves the prompt on screen as typed, moves below it and returns its
    /// contents.
    pub(crate) fn finish_prompt(&self) -> io::Result<String> {
        let mut state = self.lock();
        let ConsoleState { out, prompt, .. } = &mut *state;
        let Some(line) = prompt.take() else {
            out.write_all(b"\r\n")?;
            out.flush()?;
            return Ok(String::new());
        };
        let below = line.end_row - line.cursor_row;
        if below > 0 {
            queue!(out, MoveDown(below))?;
        }
        out.write_all(b"\r\n")?;
        out.flush()?;
        Ok(line.buffer.text())
    }

    fn lock(&self) -> MutexGuard<'_, ConsoleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_raw_line<W: Write + ?Sized>(out: &mut W, text: &str) -> io::Result<()> {
    out.write_all(text.replace('\n', "\r\n").as_bytes())?;
    out.write_all(b"\r\n")
}

impl PromptLine {
    /// Erases every row of the prompt and leaves the cursor at its start.
    fn clear<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        if self.cursor_row > 0 {
            queue!(out, MoveUp(self.cursor_row))?;
        }
        queue!(out, MoveToColumn(0), Clear(ClearType::FromCursorDown))?;
        self.cursor_row = 0;
        self.end_row = 0;
        Ok(())
    }

    /// Draws the prompt from the cursor's row and places the cursor, wrapping
    /// at `columns` display cells.
    fn draw<W: Write>(&mut self, out: &mut W, columns: u16) -> io::Result<()> {
        let columns = usize::from(columns);
        let prompt_width = self.prompt.width();
        let text = self.buffer.text();
        let total = prompt_width + text.width();
        queue!(out, Print(&self.prompt), Print(&text))?;
        if total > 0 && total % columns == 0 {
            // A full last row leaves the cursor pending a wrap; make it explicit.
            out.write_all(b"\r\n")?;
        }

        let cursor = prompt_width + self.buffer.width_before_cursor();
        let end_row = total / columns;
        let cursor_row = cursor / columns;
        let up = end_row - cursor_row;
        if up > 0 {
            queue!(out, MoveUp(to_u16(up)))?;
        }
        queue!(out, MoveToColumn(to_u16(cursor % columns)))?;

        self.end_row = to_u16(end_row);
        self.cursor_row = to_u16(cursor_row);
        Ok(())
    }
}

fn to_u16(value: usize) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// Text being typed at the prompt, with a cursor measured in characters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LineBuffer {
    chars: Vec<char>,
    cursor: usize,
}

impl LineBuffer {
    pub fn text(&self) -> String {
        self.chars.iter().collect()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn insert(&mut self, c: char) {
        self.chars.insert(self.cursor, c);
        self.cursor += 1;
    }

    pub fn backspace(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
            self.chars.remove(self.cursor);
        }
    }

    pub fn delete(&mut self) {
        if self.cursor < self.chars.len() {
            self.chars.remove(self.cursor);
        }
    }

    pub fn left(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    pub fn right(&mut self) {
        if self.cursor < self.chars.len() {
            self.cursor += 1;
        }
    }

    pub fn home(&mut self) {
        self.cursor = 0;
    }

    pub fn end(&mut self) {
        self.cursor = self.chars.len();
    }

    /// Drops everything left of the cursor (Ctrl-U).
    pub fn kill_to_start(&mut self) {
        self.chars.drain(..self.cursor);
        self.cursor = 0;
    }

    /// Display cells taken by the text left of the cursor.
    pub fn width_before_cursor(&self) -> usize {
        self.chars[..self.cursor]
            .iter()
            .map(|c| c.width().unwrap_or(0))
            .sum()
    }

    pub fn replace(&mut self, text: &str) {
        self.chars = text.chars().collect();
        self.cursor = self.chars.len();
    }
}
