//! Interruptible operator input.
//!
//! Line sources block, so they run on a dedicated `line-input` thread. The
//! send loop asks that thread for one line at a time through
//! [`InterruptibleInput::read_line`] and gets the answer back over a oneshot.
//! Any other task can hold an [`Interrupter`]; interrupting makes the pending
//! and every later `read_line` return [`ReadLine::EndOfInput`] right away.
//! Terminal sources also watch the same token at every poll tick, so they
//! give the terminal back within that granularity.

use std::{
    io::{self, BufRead},
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tokio::{select, sync::oneshot, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long [`InterruptibleInput::close`] waits for the reader thread.
const READER_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Outcome of one line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLine {
    Line(String),
    /// The operator pressed Ctrl-C; carries whatever had been typed so far.
    Interrupted(String),
    EndOfInput,
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("terminal input failed: {0}")]
    Terminal(#[from] io::Error),
    #[error("input reader stopped unexpectedly")]
    ReaderStopped,
}

/// A blocking source of operator lines.
///
/// Implementations should return [`ReadLine::EndOfInput`] once `interrupt` is
/// cancelled, if they are able to notice it while blocked.
pub trait LineSource: Send {
    fn read_line(&mut self, interrupt: &CancellationToken) -> Result<ReadLine, InputError>;
}

/// Cloneable handle that releases a blocked [`InterruptibleInput::read_line`].
#[derive(Debug, Clone)]
pub struct Interrupter {
    token: CancellationToken,
}

impl Interrupter {
    /// Idempotent; never blocks.
    pub fn interrupt(&self) {
        if !self.token.is_cancelled() {
            debug!("interrupting operator input");
        }
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }
}

type Reply = oneshot::Sender<Result<ReadLine, InputError>>;

pub struct InterruptibleInput {
    requests: Sender<Reply>,
    token: CancellationToken,
    reader_done: oneshot::Receiver<()>,
}

impl InterruptibleInput {
    /// Moves `source` onto its own reader thread.
    pub fn spawn<S>(source: S) -> io::Result<Self>
    where
        S: LineSource + 'static,
    {
        let (requests, pending) = unbounded::<Reply>();
        let (done_tx, reader_done) = oneshot::channel();
        let token = CancellationToken::new();
        let reader_token = token.clone();

        thread::Builder::new()
            .name("line-input".to_string())
            .spawn(move || {
                serve_reads(source, &pending, &reader_token);
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            requests,
            token,
            reader_done,
        })
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            token: self.token.clone(),
        }
    }

    pub async fn read_line(&self) -> Result<ReadLine, InputError> {
        if self.token.is_cancelled() {
            return Ok(ReadLine::EndOfInput);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.requests.send(reply_tx).is_err() {
            return Err(InputError::ReaderStopped);
        }

        select! {
            biased;
            _ = self.token.cancelled() => Ok(ReadLine::EndOfInput),
            reply = reply_rx => reply.unwrap_or(Err(InputError::ReaderStopped)),
        }
    }

    /// Stops the reader thread and gives it a moment to restore the terminal.
    ///
    /// A reader blocked on a pipe cannot observe the interrupt; it is left
    /// behind and ends with the process.
    pub async fn close(self) {
        let Self {
            requests,
            token,
            reader_done,
        } = self;
        token.cancel();
        drop(requests);

        if timeout(READER_SHUTDOWN_GRACE, reader_done).await.is_err() {
            debug!("input reader still blocked; leaving it behind");
        }
    }
}

fn serve_reads<S: LineSource>(mut source: S, pending: &Receiver<Reply>, token: &CancellationToken) {
    while let Ok(reply) = pending.recv() {
        let result = source.read_line(token);
        let fatal = result.is_err();
        if reply.send(result).is_err() {
            debug!("line read after the reader was interrupted was discarded");
        }
        if fatal {
            break;
        }
    }
}

/// Lines from a non-interactive stream such as a pipe.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending input. Once
/// end of input is reported, every later read reports it again.
pub struct PlainLines<R> {
    reader: R,
    finished: bool,
}

impl<R: BufRead> PlainLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            finished: false,
        }
    }
}

impl PlainLines<io::BufReader<io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(io::BufReader::new(io::stdin()))
    }
}

impl<R: BufRead + Send> LineSource for PlainLines<R> {
    fn read_line(&mut self, interrupt: &CancellationToken) -> Result<ReadLine, InputError> {
        if self.finished || interrupt.is_cancelled() {
            return Ok(ReadLine::EndOfInput);
        }

        let mut line = Vec::new();
        match self.reader.read_until(b'\n', &mut line) {
            Ok(0) => {}
            Ok(_) => {
                let bytes = line.strip_suffix(b"\n").unwrap_or(&line);
                let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
                if std::str::from_utf8(bytes).is_err() {
                    debug!("replaced invalid UTF-8 in input line");
                }
                return Ok(ReadLine::Line(String::from_utf8_lossy(bytes).into_owned()));
            }
            Err(error) => warn!(?error, "input stream failed; treating as end of input"),
        }
        self.finished = true;
        Ok(ReadLine::EndOfInput)
    }
}
