//! WebSocket transport built on `tokio-tungstenite`.
//!
//! [`connect`] performs the single connection attempt and returns a
//! [`Connection`], which is split into an [`Outbound`] half (send, close) and
//! an [`Inbound`] half (receive). The halves share a "closing" token: once the
//! outbound side has sent its close frame, the inbound side keeps draining
//! until the peer acknowledges, but never longer than the close timeout.

use std::{fmt, str::FromStr, time::Duration};

use futures_util::{
    Sink, SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    select,
    time::{Instant, timeout, timeout_at},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{
            HeaderName, HeaderValue,
            header::{ORIGIN, SEC_WEBSOCKET_PROTOCOL},
        },
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use url::Url;

pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything needed to open the connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: Url,
    pub subprotocol: Option<String>,
    pub origin: Option<String>,
    pub header: Option<ExtraHeader>,
}

impl ConnectOptions {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            subprotocol: None,
            origin: None,
            header: None,
        }
    }
}

/// One arbitrary request header given as `Name:Value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraHeader {
    pub name: HeaderName,
    pub value: HeaderValue,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderParseError {
    #[error("expected NAME:VALUE, got '{0}'")]
    MissingSeparator(String),
    #[error("invalid header name '{0}'")]
    InvalidName(String),
    #[error("invalid value for header '{0}'")]
    InvalidValue(String),
}

impl FromStr for ExtraHeader {
    type Err = HeaderParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((name, value)) = raw.split_once(':') else {
            return Err(HeaderParseError::MissingSeparator(raw.to_string()));
        };
        let name = name.trim();
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| HeaderParseError::InvalidName(name.to_string()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| HeaderParseError::InvalidValue(name.to_string()))?;
        Ok(Self { name, value })
    }
}

impl fmt::Display for ExtraHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value.to_str().unwrap_or("<binary>"))
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("unsupported scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The server answered the upgrade request with an HTTP error.
    #[error("HTTP {status}: WebSocket upgrade rejected")]
    Rejected { status: u16 },
    #[error(transparent)]
    Handshake(#[from] tungstenite::Error),
}

impl ConnectError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status } => Some(*status),
            _ => None,
        }
    }
}

/// Opens the WebSocket. There is exactly one attempt; no retry.
pub async fn connect(options: &ConnectOptions) -> Result<Connection, ConnectError> {
    let request = build_request(options)?;
    debug!(url = %options.url, "opening websocket");

    let (stream, response) = connect_async(request).await.map_err(|error| match error {
        tungstenite::Error::Http(response) => ConnectError::Rejected {
            status: response.status().as_u16(),
        },
        other => ConnectError::Handshake(other),
    })?;

    let subprotocol = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    info!(url = %options.url, status = %response.status(), ?subprotocol, "websocket connected");

    Ok(Connection {
        stream,
        subprotocol,
    })
}

pub(crate) fn build_request(options: &ConnectOptions) -> Result<Request, ConnectError> {
    match options.url.scheme() {
        "ws" | "wss" => {}
        other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
    }

    let mut request = options
        .url
        .as_str()
        .into_client_request()
        .map_err(|error| ConnectError::InvalidRequest(error.to_string()))?;
    let headers = request.headers_mut();

    if let Some(subprotocol) = &options.subprotocol {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, header_value("subprotocol", subprotocol)?);
    }
    if let Some(origin) = &options.origin {
        headers.insert(ORIGIN, header_value("origin", origin)?);
    }
    if let Some(extra) = &options.header {
        headers.insert(extra.name.clone(), extra.value.clone());
    }

    Ok(request)
}

fn header_value(what: &str, value: &str) -> Result<HeaderValue, ConnectError> {
    HeaderValue::from_str(value)
        .map_err(|_| ConnectError::InvalidRequest(format!("invalid {what} '{value}'")))
}

/// An established WebSocket, not yet split.
pub struct Connection {
    stream: WsStream,
    subprotocol: Option<String>,
}

impl Connection {
    /// Subprotocol the server agreed to, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub fn split(
        self,
        close_timeout: Duration,
    ) -> (
        Outbound<SplitSink<WsStream, Message>>,
        Inbound<SplitStream<WsStream>>,
    ) {
        let (sink, stream) = self.stream.split();
        halves(sink, stream, close_timeout)
    }
}

/// Pairs a message sink and stream so that closing the sink bounds how long
/// the stream keeps being read.
pub fn halves<K, S>(sink: K, stream: S, close_timeout: Duration) -> (Outbound<K>, Inbound<S>) {
    let closing = CancellationToken::new();
    let outbound = Outbound {
        sink,
        closing: closing.clone(),
        close_timeout,
        closed: false,
    };
    let inbound = Inbound {
        stream,
        closing,
        close_timeout,
        deadline: None,
    };
    (outbound, inbound)
}

#[derive(Debug, Error)]
#[error("websocket send failed: {0}")]
pub struct TransportError(String);

pub struct Outbound<K> {
    sink: K,
    closing: CancellationToken,
    close_timeout: Duration,
    closed: bool,
}

impl<K> Outbound<K>
where
    K: Sink<Message> + Unpin,
    K::Error: fmt::Display,
{
    /// Sends `text` as one text message, exactly as given.
    pub async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError("connection already closed".to_string()));
        }
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|error| TransportError(error.to_string()))
    }

    /// Sends the close frame. Only the first call does anything; it returns
    /// `true`, later calls return `false`.
    pub async fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        match timeout(self.close_timeout, self.sink.close()).await {
            Ok(Ok(())) => debug!("close frame sent"),
            Ok(Err(error)) => debug!(%error, "close frame not delivered"),
            Err(_) => debug!("timed out sending close frame"),
        }
        self.closing.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// One inbound data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Binary payloads are decoded lossily.
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
        }
    }
}

/// Why the inbound side stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closure {
    /// The peer sent a close frame.
    PeerClosed { code: Option<u16>, reason: String },
    /// The stream ended, or failed after we had already closed our side.
    Ended,
    /// We closed our side and the peer never finished the close handshake.
    CloseTimedOut,
    Failed(String),
}

pub struct Inbound<S> {
    stream: S,
    closing: CancellationToken,
    close_timeout: Duration,
    deadline: Option<Instant>,
}

impl<S, E> Inbound<S>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    /// Waits for the next data message. Control frames are skipped.
    pub async fn receive(&mut self) -> Result<Payload, Closure> {
        loop {
            let next = match self.deadline {
                Some(deadline) => match timeout_at(deadline, self.stream.next()).await {
                    Ok(next) => next,
                    Err(_) => return Err(Closure::CloseTimedOut),
                },
                None => select! {
                    next = self.stream.next() => next,
                    _ = self.closing.cancelled() => {
                        self.deadline = Some(Instant::now() + self.close_timeout);
                        continue;
                    }
                },
            };

            match next {
                None => return Err(Closure::Ended),
                Some(Err(error)) if self.closing.is_cancelled() => {
                    debug!(%error, "read failed after local close");
                    return Err(Closure::Ended);
                }
                Some(Err(error)) => return Err(Closure::Failed(error.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(Payload::Text(text)),
                Some(Ok(Message::Binary(data))) => return Ok(Payload::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (Some(u16::from(frame.code)), frame.reason.into_owned()))
                        .unwrap_or((None, String::new()));
                    return Err(Closure::PeerClosed { code, reason });
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    trace!("control frame skipped");
                }
            }
        }
    }
}
