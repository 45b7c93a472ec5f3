use std::{
    future::Future,
    io::{self, Cursor, Write},
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    WebSocketStream, accept_async, accept_hdr_async,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
        http::{HeaderValue, StatusCode},
    },
};
use tokio_util::sync::CancellationToken;
use url::Url;
use ws_cli::{
    console::Console,
    input::{InputError, InterruptibleInput, LineSource, PlainLines, ReadLine},
    session::{SessionController, SessionReport, SessionState},
    transport::{ConnectError, ConnectOptions},
};

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An operator who never types anything.
struct Idle;

impl LineSource for Idle {
    fn read_line(&mut self, interrupt: &CancellationToken) -> Result<ReadLine, InputError> {
        while !interrupt.is_cancelled() {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(ReadLine::EndOfInput)
    }
}

async fn bind() -> Result<(TcpListener, Url)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr: SocketAddr = listener.local_addr()?;
    let url = Url::parse(&format!("ws://{addr}/socket"))?;
    Ok((listener, url))
}

/// Accepts one connection and hands the websocket to `handler`.
fn serve_once<F, Fut, T>(listener: TcpListener, handler: F) -> JoinHandle<Result<T>>
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send,
    T: Send + 'static,
{
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let ws = accept_async(stream).await?;
        handler(ws).await
    })
}

/// Reads until the client's close frame, returning the text messages seen.
async fn collect_until_close(ws: &mut WebSocketStream<TcpStream>) -> Result<Vec<String>> {
    let mut texts = Vec::new();
    while let Some(message) = ws.next().await {
        match message? {
            Message::Text(text) => texts.push(text),
            Message::Close(_) => return Ok(texts),
            _ => {}
        }
    }
    Err(anyhow!("connection ended without a close frame"))
}

async fn run_session(
    url: Url,
    input: InterruptibleInput,
    console: Console,
) -> Result<(SessionReport, SessionState)> {
    let mut controller = SessionController::new();
    let connection = controller.connect(&ConnectOptions::new(url)).await?;
    assert_eq!(controller.state(), SessionState::Active);

    let (outbound, inbound) = connection.split(CLOSE_TIMEOUT);
    let report = timeout(
        SESSION_TIMEOUT,
        controller.run(outbound, inbound, input, console),
    )
    .await
    .map_err(|_| anyhow!("session did not settle"))??;
    Ok((report, controller.state()))
}

#[tokio::test]
async fn inbound_messages_render_in_order_until_peer_close() -> Result<()> {
    let (listener, url) = bind().await?;
    let server = serve_once(listener, |mut ws| async move {
        for n in 1..=20 {
            ws.send(Message::Text(format!("message {n}"))).await?;
        }
        ws.send(Message::Binary(b"raw bytes".to_vec())).await?;
        ws.close(None).await?;
        while ws.next().await.is_some() {}
        Ok::<_, anyhow::Error>(())
    });

    let buffer = SharedBuffer::default();
    let input = InterruptibleInput::spawn(Idle)?;
    let (report, state) = run_session(url, input, Console::new(buffer.clone())).await?;

    let mut expected: Vec<String> = (1..=20).map(|n| format!("< message {n}")).collect();
    expected.push("< raw bytes".to_string());
    assert_eq!(buffer.lines(), expected);
    assert_eq!(report, SessionReport { received: 21, sent: 0 });
    assert_eq!(state, SessionState::Closed);
    server.await??;
    Ok(())
}

#[tokio::test]
async fn operator_lines_are_sent_verbatim_then_closed() -> Result<()> {
    let (listener, url) = bind().await?;
    let server = serve_once(listener, |mut ws| async move {
        let texts = collect_until_close(&mut ws).await?;
        while ws.next().await.is_some() {}
        Ok::<_, anyhow::Error>(texts)
    });

    let input = InterruptibleInput::spawn(PlainLines::new(Cursor::new("one\n\n  three  \n")))?;
    let (report, state) = run_session(url, input, Console::new(SharedBuffer::default())).await?;

    assert_eq!(report, SessionReport { received: 0, sent: 3 });
    assert_eq!(state, SessionState::Closed);
    assert_eq!(server.await??, vec!["one", "", "  three  "]);
    Ok(())
}

#[tokio::test]
async fn silent_peer_does_not_hold_the_session_open() -> Result<()> {
    let (listener, url) = bind().await?;
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let server = serve_once(listener, |ws| async move {
        // Keep the socket open without ever reading, so no close reply is sent.
        let _ = release_rx.await;
        drop(ws);
        Ok::<_, anyhow::Error>(())
    });

    let input = InterruptibleInput::spawn(PlainLines::new(Cursor::new("bye\n")))?;
    let started = tokio::time::Instant::now();
    let (report, state) = run_session(url, input, Console::new(SharedBuffer::default())).await?;

    assert_eq!(report.sent, 1);
    assert_eq!(state, SessionState::Closed);
    assert!(started.elapsed() < SESSION_TIMEOUT);
    let _ = release_tx.send(());
    server.await??;
    Ok(())
}

#[tokio::test]
async fn handshake_options_reach_the_server() -> Result<()> {
    let (listener, url) = bind().await?;
    let (seen_tx, seen_rx) = oneshot::channel();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let header = |name: &str| {
                request
                    .headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            };
            let seen = (
                header("sec-websocket-protocol"),
                header("origin"),
                header("x-trace-id"),
            );
            if let Some(protocol) = &seen.0 {
                if let Ok(value) = HeaderValue::from_str(protocol) {
                    response.headers_mut().insert("sec-websocket-protocol", value);
                }
            }
            let _ = seen_tx.send(seen);
            Ok(response)
        };
        let mut ws = accept_hdr_async(stream, callback).await?;
        let _ = ws.close(None).await;
        while ws.next().await.is_some() {}
        Ok::<_, anyhow::Error>(())
    });

    let mut options = ConnectOptions::new(url);
    options.subprotocol = Some("chat.v1".into());
    options.origin = Some("http://localhost".into());
    options.header = Some("X-Trace-Id: 10:30".parse()?);

    let mut controller = SessionController::new();
    let connection = controller.connect(&options).await?;
    assert_eq!(connection.subprotocol(), Some("chat.v1"));

    let (protocol, origin, trace) = seen_rx.await?;
    assert_eq!(protocol.as_deref(), Some("chat.v1"));
    assert_eq!(origin.as_deref(), Some("http://localhost"));
    assert_eq!(trace.as_deref(), Some("10:30"));

    drop(connection);
    server.await??;
    Ok(())
}

#[tokio::test]
async fn rejected_upgrade_reports_http_status() -> Result<()> {
    let (listener, url) = bind().await?;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let callback = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
            let mut rejection = ErrorResponse::new(Some("forbidden".into()));
            *rejection.status_mut() = StatusCode::FORBIDDEN;
            Err(rejection)
        };
        let outcome = accept_hdr_async(stream, callback).await;
        assert!(outcome.is_err());
        Ok::<_, anyhow::Error>(())
    });

    let mut controller = SessionController::new();
    let error = match controller.connect(&ConnectOptions::new(url)).await {
        Ok(_) => return Err(anyhow!("upgrade should have been rejected")),
        Err(error) => error,
    };

    assert!(matches!(error, ConnectError::Rejected { status: 403 }));
    assert_eq!(error.http_status(), Some(403));
    assert_eq!(controller.state(), SessionState::Connecting);
    server.await??;
    Ok(())
}

#[tokio::test]
async fn unreachable_endpoint_fails_without_a_session() -> Result<()> {
    let (listener, url) = bind().await?;
    drop(listener);

    let mut controller = SessionController::new();
    let error = match controller.connect(&ConnectOptions::new(url)).await {
        Ok(_) => return Err(anyhow!("connection should have failed")),
        Err(error) => error,
    };

    assert!(matches!(error, ConnectError::Handshake(_)));
    assert_eq!(error.http_status(), None);
    assert_eq!(controller.state(), SessionState::Connecting);
    Ok(())
}
