//! Transport abstraction under the connection manager.
//!
//! A [`Channel`] opens a bidirectional frame stream. Inbound traffic arrives
//! as [`ChannelSignal`]s on the receiver returned by `open`; the stream ends
//! with `Closed` or `Error` (or by the sender being dropped).
//!
//! [`WebSocketChannel`] is the production implementation:
//! ```text
//! send(frame) ──► mpsc ──► writer task ──► ws sink
//! ws stream  ──► reader task ──► mpsc<ChannelSignal> ──► ConnectionManager
//! ```

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::Frame;

/// Channel send/subscribe failure. Feeds the reconnect path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("channel is not open")]
    NotConnected,
    #[error("channel closed")]
    Closed,
    #[error("subscribe to `{page}` timed out")]
    SubscribeTimeout { page: String },
    #[error("subscribe to `{page}` failed: {reason}")]
    Subscribe { page: String, reason: String },
    #[error("frame encode failed: {0}")]
    Encode(String),
}

/// Inbound traffic from an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Text(String),
    Closed,
    Error(String),
}

pub trait Channel: Send + Sync + 'static {
    /// Open (or re-open) the transport.
    fn open(&self) -> BoxFuture<'_, Result<mpsc::Receiver<ChannelSignal>, TransportError>>;

    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Tear the transport down. Never fails.
    fn close(&self);
}

const SIGNAL_BUFFER: usize = 256;
const OUTGOING_BUFFER: usize = 256;

struct Session {
    outgoing: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
}

/// WebSocket transport over tokio-tungstenite.
pub struct WebSocketChannel {
    url: String,
    session: Mutex<Option<Session>>,
}

impl WebSocketChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<mpsc::Receiver<ChannelSignal>, TransportError> {
        self.close();

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTGOING_BUFFER);
        let (signal_tx, signal_rx) = mpsc::channel::<ChannelSignal>(SIGNAL_BUFFER);

        // Writer task: ends when the session's sender is dropped
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let signal = match msg {
                    Ok(Message::Text(text)) => ChannelSignal::Text(text.as_str().to_owned()),
                    Ok(Message::Close(_)) => ChannelSignal::Closed,
                    Ok(_) => continue,
                    Err(e) => ChannelSignal::Error(e.to_string()),
                };
                let terminal = !matches!(signal, ChannelSignal::Text(_));
                if signal_tx.send(signal).await.is_err() || terminal {
                    return;
                }
            }
            let _ = signal_tx.send(ChannelSignal::Closed).await;
        });

        *self.session.lock() = Some(Session {
            outgoing: out_tx,
            reader,
        });
        log::debug!("websocket channel open to {}", self.url);
        Ok(signal_rx)
    }

    async fn transmit(&self, frame: Frame) -> Result<(), TransportError> {
        let text = frame
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        let outgoing = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.outgoing.clone())
            .ok_or(TransportError::NotConnected)?;
        outgoing
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

impl Channel for WebSocketChannel {
    fn open(&self) -> BoxFuture<'_, Result<mpsc::Receiver<ChannelSignal>, TransportError>> {
        Box::pin(self.connect())
    }

    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.transmit(frame))
    }

    fn close(&self) {
        if let Some(session) = self.session.lock().take() {
            let _ = session.outgoing.try_send(Message::Close(None));
            session.reader.abort();
            log::debug!("websocket channel to {} closed", self.url);
        }
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}
