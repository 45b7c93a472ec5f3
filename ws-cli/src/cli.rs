use std::time::Duration;

use clap::Parser;
use url::Url;

use crate::transport::{ConnectOptions, DEFAULT_CLOSE_TIMEOUT, ExtraHeader};

/// Interactive WebSocket client: lines you type are sent as text messages,
/// messages from the server are printed as they arrive.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// WebSocket endpoint to connect to (ws:// or wss://).
    #[arg(long, value_parser = parse_websocket_url)]
    pub url: Url,

    /// Value for the Sec-WebSocket-Protocol request header.
    #[arg(long)]
    pub subprotocol: Option<String>,

    /// Value for the Origin request header.
    #[arg(long)]
    pub origin: Option<String>,

    /// One extra request header, given as NAME:VALUE.
    #[arg(long, value_name = "NAME:VALUE")]
    pub header: Option<ExtraHeader>,

    /// Seconds to wait for the server to finish the close handshake.
    #[arg(long, value_name = "SECONDS", default_value_t = DEFAULT_CLOSE_TIMEOUT.as_secs())]
    pub close_timeout: u64,
}

impl Cli {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            url: self.url.clone(),
            subprotocol: self.subprotocol.clone(),
            origin: self.origin.clone(),
            header: self.header.clone(),
        }
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout)
    }
}

fn parse_websocket_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|error| format!("invalid URL: {error}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(format!("unsupported scheme '{other}', expected ws or wss")),
    }
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;

    use super::*;

    #[test]
    fn url_is_required() {
        let error = Cli::try_parse_from(["ws-cli"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn only_websocket_schemes_are_accepted() {
        assert!(Cli::try_parse_from(["ws-cli", "--url", "ws://localhost:8080/"]).is_ok());
        assert!(Cli::try_parse_from(["ws-cli", "--url", "wss://example.com/feed"]).is_ok());

        let error = Cli::try_parse_from(["ws-cli", "--url", "http://example.com/"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ValueValidation);
        assert!(error.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn handshake_options_flow_into_connect_options() {
        let cli = Cli::try_parse_from([
            "ws-cli",
            "--url",
            "ws://127.0.0.1:9000/chat",
            "--subprotocol",
            "chat.v1",
            "--origin",
            "http://localhost",
            "--header",
            "X-Token: abc",
            "--close-timeout",
            "5",
        ])
        .unwrap();

        let options = cli.connect_options();
        assert_eq!(options.url.as_str(), "ws://127.0.0.1:9000/chat");
        assert_eq!(options.subprotocol.as_deref(), Some("chat.v1"));
        assert_eq!(options.origin.as_deref(), Some("http://localhost"));
        assert_eq!(options.header.unwrap().to_string(), "x-token: abc");
        assert_eq!(cli.close_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn close_timeout_defaults_to_two_seconds() {
        let cli = Cli::try_parse_from(["ws-cli", "--url", "ws://localhost/"]).unwrap();
        assert_eq!(cli.close_timeout(), Duration::from_secs(2));
        assert!(cli.header.is_none());
    }

    #[test]
    fn malformed_header_is_rejected_at_parse_time() {
        let error = Cli::try_parse_from(["ws-cli", "--url", "ws://localhost/", "--header", "nocolon"])
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ValueValidation);
    }
}
