//! Interactive WebSocket client for the terminal.
//!
//! Lines typed by the operator go out as text messages; inbound messages are
//! printed with a `< ` marker as they arrive, without tearing the prompt.
//!
//! - [`cli`] parses the command line into connection options.
//! - [`client`] wires a connection, the console and operator input into a
//!   session and prints the lifecycle notices.
//! - [`session`] runs the receive and send loops and owns shutdown ordering.
//! - [`transport`] dials the WebSocket and splits it into send and receive
//!   halves with a bounded close handshake.
//! - [`input`] moves blocking line reads onto a reader thread and makes them
//!   interruptible; [`terminal`] is the raw-mode editor used on a TTY.
//! - [`console`] serializes output with the prompt redraw.
//! - [`latch`] counts loop completions.

pub mod cli;
pub mod client;
pub mod console;
pub mod input;
pub mod latch;
pub mod session;
pub mod terminal;
pub mod transport;
