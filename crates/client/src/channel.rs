//! Live update channel: one WebSocket per watched subject.
//!
//! [`ChannelClient::open`] connects to `/ws/blocks/{id}` or `/ws/jobs/{id}`
//! and spawns a reader task that parses each text frame and forwards it as
//! a [`ChannelEvent`]. The returned [`LiveChannel`] owns both the task and
//! the event receiver, so once it is closed or dropped nothing more can be
//! observed from that connection.
//!
//! Teardown always sends a close frame with code 1000. Malformed frames are
//! logged and dropped; they never end the connection. There is no automatic
//! reconnection: a lost connection is reported once and the reader exits.

use std::borrow::Cow;
use std::time::Duration;

use futures::StreamExt;
use llwatch_core::live::{parse_frame, ChannelKind, Frame, LiveUpdateEvent};
use llwatch_core::types::{BlockId, JobId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Buffered frames between the reader task and the owning surface.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound on waiting for the close handshake or the reader task.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// What a channel follows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelSubject {
    Block(BlockId),
    Job(JobId),
}

impl ChannelSubject {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Block(_) => ChannelKind::Block,
            Self::Job(_) => ChannelKind::Job,
        }
    }

    /// Path of the push endpoint for this subject.
    pub fn path(&self) -> String {
        match self {
            Self::Block(id) => format!("/ws/blocks/{id}"),
            Self::Job(id) => format!("/ws/jobs/{id}"),
        }
    }
}

impl std::fmt::Display for ChannelSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block(id) => write!(f, "block/{id}"),
            Self::Job(id) => write!(f, "job/{id}"),
        }
    }
}

/// Something that happened on an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A parsed progress frame.
    Update(LiveUpdateEvent),
    /// The connection ended cleanly, from either side.
    Closed { code: Option<u16>, reason: String },
    /// The connection dropped or closed with an error code.
    Lost(String),
}

/// Errors opening a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Invalid service URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Channel open cancelled")]
    Cancelled,
}

/// Derive the WebSocket base from an HTTP base URL.
///
/// `http` becomes `ws` and `https` becomes `wss`; `ws`/`wss` pass through.
pub fn ws_base_url(api_base: &str) -> Result<String, ChannelError> {
    let base = api_base.trim_end_matches('/');
    let converted = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(ChannelError::InvalidUrl(api_base.to_string()));
    };
    Ok(converted)
}

/// Opens push channels against one compute service.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    ws_base: String,
}

impl ChannelClient {
    pub fn new(api_base: &str) -> Result<Self, ChannelError> {
        Ok(Self {
            ws_base: ws_base_url(api_base)?,
        })
    }

    pub fn url_for(&self, subject: &ChannelSubject) -> String {
        format!("{}{}", self.ws_base, subject.path())
    }

    /// Connect to the subject's push endpoint and start reading.
    ///
    /// The reader stops when `parent` is cancelled, when the returned
    /// [`LiveChannel`] is closed or dropped, after a `done` frame, or when
    /// the server goes away.
    pub async fn open(
        &self,
        subject: ChannelSubject,
        parent: &CancellationToken,
    ) -> Result<LiveChannel, ChannelError> {
        let url = self.url_for(&subject);

        let connected = tokio::select! {
            _ = parent.cancelled() => return Err(ChannelError::Cancelled),
            result = connect_async(url.as_str()) => result,
        };
        let (ws, _response) = connected.map_err(|e| ChannelError::Connect {
            url: url.clone(),
            message: e.to_string(),
        })?;

        tracing::info!(subject = %subject, url = %url, "Live channel open");

        let cancel = parent.child_token();
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(read_frames(ws, subject.clone(), tx, cancel.clone()));

        Ok(LiveChannel {
            subject,
            cancel,
            task: Some(task),
            events,
        })
    }
}

/// An open push connection owned by exactly one surface.
#[derive(Debug)]
pub struct LiveChannel {
    subject: ChannelSubject,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    events: mpsc::Receiver<ChannelEvent>,
}

impl LiveChannel {
    /// Next event, or `None` once the reader has exited and the buffer is empty.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Close with a normal-closure frame and wait for the reader to exit.
    ///
    /// Events still buffered are discarded together with the channel.
    pub async fn close(mut self) {
        self.cancel.cancel();
        // A reader blocked on a full buffer must not wait for us to drain it.
        self.events.close();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                tracing::warn!(subject = %self.subject, "Live channel reader did not exit in time");
            }
        }
        tracing::debug!(subject = %self.subject, "Live channel closed by owner");
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        // The reader sends the close frame itself once cancelled.
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

/// Read frames until cancelled, done, or disconnected.
async fn read_frames(
    mut ws: WsStream,
    subject: ChannelSubject,
    tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
) {
    let kind = subject.kind();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                close_normally(&mut ws, &subject, "client closed").await;
                return;
            }

            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse_frame(kind, &text) {
                    Ok(Frame::Update(event)) => {
                        let done = event.is_done();
                        let forwarded = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => false,
                            sent = tx.send(ChannelEvent::Update(event)) => sent.is_ok(),
                        };
                        if !forwarded {
                            close_normally(&mut ws, &subject, "client closed").await;
                            return;
                        }
                        if done {
                            tracing::info!(subject = %subject, "Subject reported done, closing channel");
                            close_normally(&mut ws, &subject, "subject done").await;
                            let _ = tx
                                .send(ChannelEvent::Closed {
                                    code: Some(u16::from(CloseCode::Normal)),
                                    reason: "subject done".to_string(),
                                })
                                .await;
                            return;
                        }
                    }
                    Ok(Frame::KeepAlive) => {
                        tracing::trace!(subject = %subject, "Keep-alive frame");
                    }
                    Err(e) => {
                        tracing::warn!(
                            subject = %subject,
                            error = %e,
                            raw_message = %text,
                            "Dropping malformed progress frame",
                        );
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let event = classify_close(frame.as_ref());
                    tracing::info!(subject = %subject, ?frame, "Live channel closed by server");
                    // Let tungstenite flush its close reply.
                    drain(&mut ws).await;
                    let _ = tx.send(event).await;
                    return;
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::trace!(subject = %subject, "Ignoring binary frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // Handled automatically by tungstenite.
                }
                Some(Err(e)) => {
                    tracing::error!(subject = %subject, error = %e, "Live channel receive error");
                    let _ = tx.send(ChannelEvent::Lost(e.to_string())).await;
                    return;
                }
                None => {
                    tracing::warn!(subject = %subject, "Live channel ended without close frame");
                    let _ = tx
                        .send(ChannelEvent::Lost("connection ended without close frame".to_string()))
                        .await;
                    return;
                }
            }
        }
    }
}

/// Normal and going-away closes are clean; any other code means the
/// connection was lost.
fn classify_close(frame: Option<&CloseFrame<'_>>) -> ChannelEvent {
    match frame {
        None => ChannelEvent::Closed {
            code: None,
            reason: String::new(),
        },
        Some(frame) => {
            let code = u16::from(frame.code);
            let reason = frame.reason.to_string();
            match frame.code {
                CloseCode::Normal | CloseCode::Away => ChannelEvent::Closed {
                    code: Some(code),
                    reason,
                },
                _ => ChannelEvent::Lost(format!("closed with code {code}: {reason}")),
            }
        }
    }
}

/// Send a normal-closure frame and wait briefly for the handshake.
async fn close_normally(ws: &mut WsStream, subject: &ChannelSubject, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed(reason),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        tracing::debug!(subject = %subject, error = %e, "Close frame not delivered");
        return;
    }
    drain(ws).await;
}

/// Read until the peer finishes the close handshake or the timeout hits.
async fn drain(ws: &mut WsStream) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}
