//! One actor per accepted socket connection.
//!
//! The reader enforces the pong deadline and rejects application data; the
//! writer drains the hub queue, sends keepalive pings and enforces the
//! connection TTL. A client the hub evicts closes at once, without flushing
//! the frames still in its queue. Every frame goes through one locked sink, and every exit
//! path funnels into [`Client::close`], whose body runs exactly once.

use std::{
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    axum::extract::ws::{CloseFrame, Message, close_code},
    bytes::Bytes,
    futures::{Sink, SinkExt, Stream, StreamExt},
    tokio::{
        sync::{Mutex, mpsc},
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, trace},
};

use potat_config::SocketConfig;
use potat_protocol::{Envelope, Opcode, ProtocolError, close_reasons, topics};

use crate::hub::{ClientId, ClientRegistration, HubHandle};

/// Timers and limits applied to every client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub ping_period: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub ttl: Duration,
    pub reconnect_grace: Duration,
    pub queue_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from(&SocketConfig::default())
    }
}

impl From<&SocketConfig> for ClientSettings {
    fn from(cfg: &SocketConfig) -> Self {
        Self {
            ping_period: cfg.ping_period(),
            pong_wait: cfg.pong_wait(),
            write_wait: cfg.write_wait(),
            ttl: cfg.ttl(),
            reconnect_grace: cfg.reconnect_grace(),
            queue_capacity: cfg.queue_capacity.max(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("write failed: {0}")]
    Sink(String),

    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

pub struct Client<S> {
    id: ClientId,
    remote: String,
    hub: HubHandle,
    sink: Mutex<S>,
    close_signal: CancellationToken,
    /// Cancelled by the hub when it drops this client.
    evicted: CancellationToken,
    closed: AtomicBool,
    settings: ClientSettings,
}

impl<S> Client<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    pub(crate) fn new(
        sink: S,
        hub: HubHandle,
        remote: String,
        settings: ClientSettings,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: hub.next_client_id(),
            remote,
            hub,
            sink: Mutex::new(sink),
            close_signal: shutdown.child_token(),
            evicted: CancellationToken::new(),
            closed: AtomicBool::new(false),
            settings,
        })
    }

    /// Drive one connection to completion: register with the hub, greet,
    /// then run the reader and writer until the connection is closed.
    pub async fn serve<R, E>(
        sink: S,
        stream: R,
        hub: HubHandle,
        remote: String,
        settings: ClientSettings,
        shutdown: &CancellationToken,
    ) where
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send,
    {
        let client = Self::new(sink, hub, remote, settings, shutdown);
        let (queue, queue_rx) = mpsc::channel(client.settings.queue_capacity);
        client.hub.register(client.registration(queue));
        info!(client_id = client.id, remote = %client.remote, "client connected");

        let hello = Envelope::new(Opcode::Hello, topics::HELLO);
        if let Err(e) = client.send_envelope(&hello).await {
            debug!(client_id = client.id, error = %e, "failed to send hello");
            client.close(close_reasons::WRITE_ERROR).await;
            return;
        }

        let writer = tokio::spawn(Arc::clone(&client).write_loop(queue_rx));
        Arc::clone(&client).read_loop(stream).await;
        let _ = writer.await;
    }

    fn registration(&self, queue: mpsc::Sender<Bytes>) -> ClientRegistration {
        ClientRegistration {
            id: self.id,
            queue,
            evict: self.evicted.clone(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the connection. Only the first call does anything: it fires
    /// the close signal, unregisters from the hub, sends a close frame and
    /// releases the sink.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_signal.cancel();
        self.hub.unregister(self.id);

        let mut sink = self.sink.lock().await;
        let frame = Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: reason.to_owned().into(),
        }));
        let _ = tokio::time::timeout(self.settings.write_wait, sink.send(frame)).await;
        let _ = tokio::time::timeout(self.settings.write_wait, sink.close()).await;
        info!(client_id = self.id, remote = %self.remote, reason, "client disconnected");
    }

    async fn send(&self, message: Message) -> Result<(), WriteError> {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.settings.write_wait, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WriteError::Sink(e.to_string())),
            Err(_) => Err(WriteError::Timeout(self.settings.write_wait)),
        }
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<(), WriteError> {
        self.send(Message::Text(envelope.to_json()?.into())).await
    }

    async fn write_loop(self: Arc<Self>, mut queue: mpsc::Receiver<Bytes>) {
        let period = self.settings.ping_period;
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        let ttl = tokio::time::sleep(self.settings.ttl);
        tokio::pin!(ttl);

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.close_signal.cancelled() => break close_reasons::SHUTDOWN,
                _ = self.evicted.cancelled() => break close_reasons::EVICTED,
                _ = &mut ttl => {
                    self.announce_reconnect().await;
                    break close_reasons::TTL_REACHED;
                },
                _ = ping.tick() => {
                    trace!(client_id = self.id, "ping");
                    if let Err(e) = self.send(Message::Ping(Bytes::new())).await {
                        debug!(client_id = self.id, error = %e, "ping failed");
                        break close_reasons::WRITE_ERROR;
                    }
                },
                payload = queue.recv() => match payload {
                    Some(payload) => {
                        if let Err(e) = self.send(frame_for(payload)).await {
                            debug!(client_id = self.id, error = %e, "relay write failed");
                            break close_reasons::WRITE_ERROR;
                        }
                    },
                    None => break close_reasons::QUEUE_CLOSED,
                },
            }
        };
        self.close(reason).await;
    }

    async fn announce_reconnect(&self) {
        info!(client_id = self.id, "connection TTL reached");
        let notice = Envelope::new(Opcode::Reconnect, topics::RECONNECT);
        if self.send_envelope(&notice).await.is_err() {
            return;
        }
        tokio::select! {
            _ = self.close_signal.cancelled() => {},
            _ = tokio::time::sleep(self.settings.reconnect_grace) => {},
        }
    }

    async fn read_loop<R, E>(self: Arc<Self>, mut stream: R)
    where
        R: Stream<Item = Result<Message, E>> + Unpin + Send,
        E: Display + Send,
    {
        let mut deadline = Instant::now() + self.settings.pong_wait;

        let reason = loop {
            let next = tokio::select! {
                _ = self.close_signal.cancelled() => break close_reasons::SHUTDOWN,
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };
            let message = match next {
                Err(_) => break close_reasons::PONG_TIMEOUT,
                Ok(None) => break close_reasons::PEER_CLOSED,
                Ok(Some(Err(e))) => {
                    debug!(client_id = self.id, error = %e, "read failed");
                    break close_reasons::READ_ERROR;
                },
                Ok(Some(Ok(message))) => message,
            };
            match message {
                Message::Pong(_) => deadline = Instant::now() + self.settings.pong_wait,
                Message::Ping(_) => {},
                Message::Close(_) => break close_reasons::PEER_CLOSED,
                Message::Text(_) | Message::Binary(_) => {
                    let notice = Envelope::new(Opcode::ReceivedData, topics::RECEIVED_DATA);
                    let _ = self.send_envelope(&notice).await;
                    break close_reasons::INCOMING_NOT_ALLOWED;
                },
            }
        };
        self.close(reason).await;
    }
}

/// Relay payloads go out as text when they are UTF-8, binary otherwise.
fn frame_for(payload: Bytes) -> Message {
    match std::str::from_utf8(&payload) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(payload),
    }
}
