//! BLIP-like framed message protocol over a WebSocket stream (§4.7).

mod frame;

pub use frame::{Frame, FrameFlags};

use crate::error::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// An inbound or outbound BLIP message, reassembled from one or more
/// frames. `properties` is the length-prefixed name/value list; `body` is
/// the payload, already inflated if the `Compressed` flag was set.
#[derive(Clone, Debug, Default)]
pub struct Message {
    pub number: u64,
    pub flags: FrameFlags,
    pub properties: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn profile(&self) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == "Profile")
            .map(|(_, v)| v.as_str())
    }

    pub fn is_request(&self) -> bool {
        !self.flags.contains(FrameFlags::RESPONSE) && !self.flags.contains(FrameFlags::ERROR)
    }
}

/// Accumulates frames for one in-flight message, keyed by `(messageNo,
/// senderIsRequester)` at the connection layer.
#[derive(Default)]
struct MessageIn {
    flags: FrameFlags,
    properties_buf: Vec<u8>,
    body_buf: Vec<u8>,
}

impl MessageIn {
    fn push(&mut self, frame: &Frame) -> Result<bool> {
        self.flags = frame.flags;
        self.properties_buf.extend_from_slice(&frame.properties_chunk);
        self.body_buf.extend_from_slice(&frame.body_chunk);
        Ok(!frame.flags.contains(FrameFlags::MORE_COMING))
    }

    fn finish(self, number: u64) -> Result<Message> {
        let (raw_props, raw_body) = if self.flags.contains(FrameFlags::COMPRESSED) {
            (
                frame::inflate(&self.properties_buf)?,
                frame::inflate(&self.body_buf)?,
            )
        } else {
            (self.properties_buf, self.body_buf)
        };
        let properties = frame::decode_properties(&raw_props)?;
        Ok(Message {
            number,
            flags: self.flags,
            properties,
            body: raw_body,
        })
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Outgoing {
    /// Fire-and-forget, e.g. a response or a `NoReply` request.
    Send(Message),
    /// A request awaiting its response.
    Call(Message, oneshot::Sender<Result<Message>>),
}

/// A connected BLIP socket: owns the WebSocket stream, dispatches inbound
/// requests to registered profile handlers, and completes outbound calls.
/// Cheap to clone — every clone shares the same driver task and message
/// numbering.
#[derive(Clone)]
pub struct Connection {
    out_tx: mpsc::UnboundedSender<Outgoing>,
    next_number: Arc<AtomicU64>,
}

/// The future returned by a [`Handler`] — boxed since each profile's
/// handler closes over different state and borrows nothing from the
/// driver.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Message>> + Send>>;

/// A registered profile handler. `Arc`-wrapped (rather than `Box`) so the
/// driver can clone it out of the handler map and drop the map's lock
/// before awaiting it, instead of holding the lock for the handler's
/// entire execution.
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Wraps an `async fn(Message) -> Result<Message>`-shaped closure as a
/// [`Handler`], so callers registering profile handlers don't have to spell
/// out the `Box::pin` themselves.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Message>> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)) as HandlerFuture)
}

struct Driver {
    ws: WsStream,
    out_rx: mpsc::UnboundedReceiver<Outgoing>,
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
    pending: HashMap<u64, oneshot::Sender<Result<Message>>>,
    incoming: HashMap<(u64, bool), MessageIn>,
}

impl Connection {
    /// Connects to `url` (e.g. `wss://host/<db>/_blipsync`) and spawns the
    /// driver task that owns the socket exclusively.
    pub async fn connect(url: &str, handlers: HashMap<String, Handler>) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(Error::WebSocket)?;
        Ok(Self::from_stream(ws, handlers))
    }

    pub fn from_stream(ws: WsStream, handlers: HashMap<String, Handler>) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            ws,
            out_rx,
            handlers: Arc::new(Mutex::new(handlers)),
            pending: HashMap::new(),
            incoming: HashMap::new(),
        };
        tokio::spawn(driver.run());
        Self {
            out_tx,
            next_number: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_number(&self) -> u64 {
        self.next_number.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a request and awaits its response, matching §4.7's
    /// `sendRequest(msg) -> future<response>` contract.
    pub async fn send_request(&self, mut msg: Message) -> Result<Message> {
        msg.number = self.next_number();
        let (tx, rx) = oneshot::channel();
        self.out_tx
            .send(Outgoing::Call(msg, tx))
            .map_err(|_| Error::Network("blip connection closed".into()))?;
        rx.await
            .map_err(|_| Error::Network("blip connection closed before reply".into()))?
    }

    /// Sends a message with no expected reply (a `NoReply` request, or a
    /// response to one).
    pub fn send(&self, mut msg: Message) -> Result<()> {
        if msg.number == 0 {
            msg.number = self.next_number();
        }
        self.out_tx
            .send(Outgoing::Send(msg))
            .map_err(|_| Error::Network("blip connection closed".into()))
    }
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                outgoing = self.out_rx.recv() => {
                    match outgoing {
                        Some(Outgoing::Send(msg)) => {
                            if let Err(e) = self.write_message(&msg).await {
                                tracing::warn!(error = %e, "blip.driver.write_failed");
                                break;
                            }
                        }
                        Some(Outgoing::Call(msg, tx)) => {
                            self.pending.insert(msg.number, tx);
                            if let Err(e) = self.write_message(&msg).await {
                                tracing::warn!(error = %e, "blip.driver.write_failed");
                                if let Some(tx) = self.pending.remove(&msg.number) {
                                    let _ = tx.send(Err(e));
                                }
                                break;
                            }
                        }
                        None => break,
                    }
                }
                frame = self.read_frame() => {
                    match frame {
                        Ok(Some(frame)) => self.handle_frame(frame).await,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "blip.driver.read_failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let timeout = tokio::time::Duration::from_secs(30);
        match tokio::time::timeout(timeout, self.ws.next()).await {
            Ok(Some(Ok(WsMessage::Binary(bytes)))) => Ok(Some(frame::decode(&bytes)?)),
            Ok(Some(Ok(_))) => Ok(None),
            Ok(Some(Err(e))) => Err(Error::WebSocket(e)),
            Ok(None) => Ok(None),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn write_message(&mut self, msg: &Message) -> Result<()> {
        let bytes = frame::encode_single_frame(msg)?;
        self.ws.send(WsMessage::Binary(bytes)).await.map_err(Error::WebSocket)
    }

    async fn handle_frame(&mut self, frame: Frame) {
        let is_response = frame.flags.contains(FrameFlags::RESPONSE) || frame.flags.contains(FrameFlags::ERROR);
        let key = (frame.number, is_response);
        let entry = self.incoming.entry(key).or_default();
        let complete = match entry.push(&frame) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "blip.driver.bad_frame");
                self.incoming.remove(&key);
                return;
            }
        };
        if !complete {
            return;
        }
        let entry = self.incoming.remove(&key).expect("just inserted above");
        let number = frame.number;
        let msg = match entry.finish(number) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "blip.driver.reassembly_failed");
                return;
            }
        };

        if is_response {
            if let Some(tx) = self.pending.remove(&number) {
                let _ = tx.send(Ok(msg));
            }
            return;
        }

        let no_reply = msg.flags.contains(FrameFlags::NO_REPLY);
        let profile = msg.profile().map(str::to_string);
        tracing::debug!(profile = ?profile, number, "blip.driver.dispatch");
        let Some(profile) = profile else { return };

        // Clone the handler out and drop the map lock before awaiting it,
        // so a slow handler never blocks registration/lookup for others.
        let handler = {
            let handlers = self.handlers.lock().await;
            handlers.get(&profile).cloned()
        };
        let Some(handler) = handler else {
            tracing::warn!(%profile, "blip.driver.no_handler");
            return;
        };
        let outcome = handler(msg).await;
        if no_reply {
            if let Err(e) = outcome {
                tracing::warn!(error = %e, profile = %profile, "blip.handler_failed");
            }
            return;
        }

        let response = match outcome {
            Ok(mut reply) => {
                reply.number = number;
                reply.flags.insert(FrameFlags::RESPONSE);
                reply
            }
            Err(e) => {
                tracing::warn!(error = %e, profile = %profile, "blip.handler_failed");
                Message {
                    number,
                    flags: FrameFlags::RESPONSE | FrameFlags::ERROR,
                    properties: vec![("Error-Message".into(), e.to_string())],
                    body: Vec::new(),
                }
            }
        };
        if let Err(e) = self.write_message(&response).await {
            tracing::warn!(error = %e, "blip.driver.write_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_profile_reads_property() {
        let msg = Message {
            properties: vec![("Profile".into(), "subChanges".into())],
            ..Default::default()
        };
        assert_eq!(msg.profile(), Some("subChanges"));
    }

    #[test]
    fn request_flag_excludes_response_and_error() {
        let mut msg = Message::default();
        assert!(msg.is_request());
        msg.flags.insert(FrameFlags::RESPONSE);
        assert!(!msg.is_request());
    }
}
