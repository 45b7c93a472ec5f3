//! Duplex session controller.
//!
//! Two loops run concurrently for the lifetime of a session:
//!
//! - the **receive loop** renders inbound messages until the transport closes,
//!   then interrupts operator input so a blocked prompt is released;
//! - the **send loop** forwards operator lines until input ends, then closes
//!   the transport so a blocked receive is released.
//!
//! Neither loop stops the other directly. Each one only fires its cross-signal
//! and reports to a [`CompletionLatch`]; the [`SessionController`] releases
//! resources after both reports are in.

use std::fmt;

use anyhow::{Context, Result, bail};
use futures_util::{Sink, Stream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{
    console::Console,
    input::{InputError, InterruptibleInput, Interrupter, ReadLine},
    latch::{Completion, CompletionLatch},
    transport::{self, Closure, ConnectError, ConnectOptions, Connection, Inbound, Outbound, Payload},
};

/// Marker printed in front of every inbound message.
pub const INBOUND_MARKER: &str = "< ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub received: usize,
    pub sent: usize,
}

pub struct SessionController {
    state: SessionState,
}

impl SessionController {
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Single connection attempt. On failure the controller stays in
    /// `Connecting`; the caller treats that as fatal.
    pub async fn connect(&mut self, options: &ConnectOptions) -> Result<Connection, ConnectError> {
        let connection = transport::connect(options).await?;
        self.transition(SessionState::Active);
        Ok(connection)
    }

    /// Runs both loops until each has reported completion. The controller must
    /// be `Active`, i.e. [`connect`](Self::connect) succeeded.
    ///
    /// Transport failures end the session normally. Besides a wrong starting
    /// state, the only error returned is a fatal input failure, after the
    /// transport has been closed.
    pub async fn run<K, S, E>(
        &mut self,
        outbound: Outbound<K>,
        inbound: Inbound<S>,
        input: InterruptibleInput,
        console: Console,
    ) -> Result<SessionReport>
    where
        K: Sink<Message> + Unpin + Send + 'static,
        K::Error: fmt::Display,
        S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if self.state != SessionState::Active {
            input.close().await;
            bail!("cannot run a session that is {}", self.state);
        }

        let latch = CompletionLatch::new();
        let receiver = tokio::spawn(receive_loop(
            inbound,
            console,
            input.interrupter(),
            latch.participant(),
        ));
        let sender = tokio::spawn(send_loop(outbound, input, latch.participant()));

        latch.first_completion().await;
        self.transition(SessionState::Draining);
        latch.wait().await;
        self.transition(SessionState::Closed);

        let received = receiver.await.context("receive loop panicked")?;
        let SendOutcome { input, sent, result } = sender.await.context("send loop panicked")?;
        input.close().await;

        let report = SessionReport { received, sent };
        info!(received, sent, "session closed");
        result.context("operator input failed")?;
        Ok(report)
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = %self.state, to = %next, "session state");
        self.state = next;
    }
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders inbound messages until the transport closes. Returns how many
/// messages were rendered.
pub async fn receive_loop<S, E>(
    mut inbound: Inbound<S>,
    console: Console,
    interrupter: Interrupter,
    completion: Completion,
) -> usize
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let mut received = 0;
    let closure = loop {
        match inbound.receive().await {
            Ok(payload) => {
                if let Err(error) = console.print_line(&render_inbound(payload)) {
                    warn!(?error, "failed to render inbound message");
                }
                received += 1;
            }
            Err(closure) => break closure,
        }
    };

    match closure {
        Closure::PeerClosed { code, reason } => debug!(?code, %reason, "peer closed the connection"),
        Closure::Ended => debug!("inbound stream ended"),
        Closure::CloseTimedOut => debug!("peer did not finish the close handshake"),
        Closure::Failed(error) => debug!(%error, "inbound stream failed"),
    }

    interrupter.interrupt();
    completion.done();
    received
}

pub fn render_inbound(payload: Payload) -> String {
    format!("{INBOUND_MARKER}{}", payload.into_text())
}

/// What the send loop hands back to the controller.
pub struct SendOutcome {
    pub input: InterruptibleInput,
    pub sent: usize,
    pub result: Result<(), InputError>,
}

/// Forwards operator lines until input ends, then closes the transport.
pub async fn send_loop<K>(
    mut outbound: Outbound<K>,
    input: InterruptibleInput,
    completion: Completion,
) -> SendOutcome
where
    K: Sink<Message> + Unpin,
    K::Error: fmt::Display,
{
    let mut sent = 0;
    let result = loop {
        match input.read_line().await {
            Ok(ReadLine::Line(line)) => {
                if let Err(error) = outbound.send(line).await {
                    debug!(%error, "outbound stream closed");
                    break Ok(());
                }
                sent += 1;
            }
            Ok(ReadLine::Interrupted(partial)) if !partial.is_empty() => {
                debug!("discarded partial line");
            }
            Ok(ReadLine::Interrupted(_) | ReadLine::EndOfInput) => break Ok(()),
            Err(error) => break Err(error),
        }
    };

    outbound.close().await;
    completion.done();
    SendOutcome {
        input,
        sent,
        result,
    }
}
