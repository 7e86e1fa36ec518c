//! A single Shiny WebSocket connection: the handshake, a background reader
//! task that filters out frames `core::message::can_ignore` says don't
//! matter, and a small bounded queue the session loop drains from.
//!
//! One task owns the raw stream and only ever talks to the rest of the
//! program through a channel, so a slow or wedged consumer can never
//! corrupt the read side.

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use core::error::ShinyError;
use core::message::can_ignore;

/// Frames the reader task failed to keep up with push this into the
/// session's failure path instead of silently dropping them.
pub const QUEUE_CAPACITY: usize = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsConnection {
    sink: SplitSink<WsStream, WsMessage>,
    pub receiver: mpsc::Receiver<Result<String, ShinyError>>,
    reader_task: JoinHandle<()>,
}

impl WsConnection {
    /// Opens the socket with a `Cookie` header taken from the session's
    /// HTTP cookie jar, so the server recognizes it as the same browser.
    pub async fn open(url: &str, cookie_header: &str) -> Result<Self, ShinyError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ShinyError::WsProtocol(format!("invalid websocket url {url}: {e}")))?;
        if !cookie_header.is_empty() {
            request.headers_mut().insert(
                "Cookie",
                cookie_header
                    .parse()
                    .map_err(|_| ShinyError::WsProtocol("cookie header not ASCII".into()))?,
            );
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ShinyError::WsProtocol(format!("websocket connect to {url} failed: {e}")))?;

        let (sink, mut stream) = stream.split();
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        let reader_task = tokio::spawn(async move {
            loop {
                let frame = match stream.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(ShinyError::WsProtocol(format!("websocket read error: {e}"))))
                            .await;
                        return;
                    }
                    None => return,
                };

                let text = match frame {
                    WsMessage::Text(text) => text.to_string(),
                    WsMessage::Close(_) => return,
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) | WsMessage::Frame(_) => {
                        continue;
                    }
                };

                let ignorable = match can_ignore(&text) {
                    Ok(ignorable) => ignorable,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                if ignorable {
                    continue;
                }

                match tx.try_send(Ok(text)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let _ = tx
                            .send(Err(ShinyError::WsProtocol(
                                "receive queue overflowed: session is not keeping up".into(),
                            )))
                            .await;
                        return;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        });

        Ok(Self {
            sink,
            receiver: rx,
            reader_task,
        })
    }

    pub async fn send(&mut self, payload: &str) -> Result<(), ShinyError> {
        self.sink
            .send(WsMessage::Text(payload.to_string().into()))
            .await
            .map_err(|e| ShinyError::WsProtocol(format!("websocket send failed: {e}")))
    }

    pub async fn close(mut self) -> Result<(), ShinyError> {
        let _ = self.sink.close().await;
        self.reader_task.abort();
        Ok(())
    }
}
