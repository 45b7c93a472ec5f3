use std::io::{self, IsTerminal};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::{
    cli::Cli,
    console::Console,
    input::{InterruptibleInput, Interrupter, PlainLines},
    session::SessionController,
    terminal::TerminalEditor,
};

pub const CONNECTED_NOTICE: &str = "connected (press CTRL+C to quit)";
pub const DISCONNECTED_NOTICE: &str = "Disconnected";

pub async fn run(cli: Cli) -> Result<()> {
    let options = cli.connect_options();
    let mut controller = SessionController::new();
    let connection = controller
        .connect(&options)
        .await
        .with_context(|| format!("failed to connect to {}", options.url))?;

    let console = Console::stdout();
    console.print_line(CONNECTED_NOTICE)?;

    let input = operator_input(&console).context("failed to start input reader")?;
    let ctrl_c = tokio::spawn(interrupt_on_ctrl_c(input.interrupter()));

    let (outbound, inbound) = connection.split(cli.close_timeout());
    let outcome = controller.run(outbound, inbound, input, console.clone()).await;
    ctrl_c.abort();

    let report = outcome?;
    info!(received = report.received, sent = report.sent, "disconnected");
    console.print_line(DISCONNECTED_NOTICE)?;
    Ok(())
}

/// Line editor on an interactive terminal, plain line reads otherwise.
fn operator_input(console: &Console) -> io::Result<InterruptibleInput> {
    if io::stdin().is_terminal() && io::stdout().is_terminal() {
        debug!("using terminal line editor");
        InterruptibleInput::spawn(TerminalEditor::new(console.clone()))
    } else {
        debug!("reading plain lines from stdin");
        InterruptibleInput::spawn(PlainLines::stdin())
    }
}

/// SIGINT outside the editor's raw mode ends input the same way Ctrl-D does.
async fn interrupt_on_ctrl_c(interrupter: Interrupter) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => interrupter.interrupt(),
        Err(error) => warn!(?error, "ctrl-c handler failed"),
    }
}
