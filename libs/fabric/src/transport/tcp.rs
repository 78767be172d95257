use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame, Frame};
use crate::qos::QoS;
use crate::topic;
use crate::transport::{ConnectOptions, Inbound, InboundMessage, Transport};

const URL_SCHEME: &str = "tcp://";

/// Pub/sub transport speaking the length-prefixed [`Frame`] protocol to a
/// [`TcpBroker`](crate::broker::TcpBroker)
///
/// The socket is owned by a background session task; this handle only sends
/// it commands.
pub struct TcpTransport {
    connect_timeout: Option<Duration>,
    session: Mutex<Option<SessionHandle>>,
}

struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

enum Command {
    Publish(Frame),
    Subscribe {
        filter: String,
        qos: QoS,
        ack: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
}

impl TcpTransport {
    /// Transport with no connect timeout
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }

    fn commands(&self) -> Result<mpsc::UnboundedSender<Command>> {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        match session.as_ref() {
            Some(handle) if handle.connected.load(Ordering::SeqCst) => Ok(handle.commands.clone()),
            _ => Err(Error::NotConnected),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<Inbound> {
        {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            match session.as_ref() {
                Some(handle) if !handle.task.is_finished() => {
                    return Err(Error::custom("session already open"))
                }
                _ => *session = None,
            }
        }

        let connection = establish(options, self.connect_timeout).await?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let driver = SessionDriver {
            options: options.clone(),
            connect_timeout: self.connect_timeout,
            commands: command_rx,
            inbound: inbound_tx,
            connected: Arc::clone(&connected),
            subscriptions: Vec::new(),
            pending: HashMap::new(),
            next_packet_id: 0,
        };
        let task = tokio::spawn(driver.run(connection));

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        *session = Some(SessionHandle {
            commands,
            connected,
            task,
        });
        Ok(inbound)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        topic::validate_filter(filter)?;
        let (ack, result) = oneshot::channel();
        self.commands()?
            .send(Command::Subscribe {
                filter: filter.to_string(),
                qos,
                ack,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        result.await.map_err(|_| Error::ConnectionClosed)?
    }

    fn publish(&self, topic_name: &str, payload: Vec<u8>, qos: QoS) -> Result<()> {
        topic::validate_topic(topic_name)?;
        let frame = Frame::Publish {
            topic: topic_name.to_string(),
            payload,
            qos,
        };
        self.commands()?
            .send(Command::Publish(frame))
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn disconnect(&self) -> Result<()> {
        let handle = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        handle.connected.store(false, Ordering::SeqCst);
        let (ack, done) = oneshot::channel();
        if handle.commands.send(Command::Disconnect { ack }).is_ok() {
            let _ = done.await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.commands().is_ok()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(handle) = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.task.abort();
        }
    }
}

/// Builder for configuring TCP transport
#[derive(Default)]
pub struct TcpTransportBuilder {
    connect_timeout: Option<Duration>,
}

impl TcpTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout for establishing the connection and handshake
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> TcpTransport {
        TcpTransport {
            connect_timeout: self.connect_timeout,
            session: Mutex::new(None),
        }
    }
}

/// Strip the `tcp://` scheme from a broker URL, leaving `host:port`
fn broker_address(url: &str) -> Result<&str> {
    let address = url.strip_prefix(URL_SCHEME).unwrap_or(url);
    if address.is_empty() || address.contains("://") {
        return Err(Error::custom(format!("unsupported broker URL: {url}")));
    }
    Ok(address)
}

/// One live socket: the write half plus frames decoded by a reader task
struct Connection {
    writer: OwnedWriteHalf,
    frames: mpsc::UnboundedReceiver<Result<Frame>>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn establish(options: &ConnectOptions, timeout: Option<Duration>) -> Result<Connection> {
    let handshake = async {
        let stream = TcpStream::connect(broker_address(&options.broker_url)?).await?;
        let (mut reader, mut writer) = stream.into_split();

        let (username, password) = match &options.credentials {
            Some(c) => (Some(c.username.clone()), Some(c.password.clone())),
            None => (None, None),
        };
        let connect = Frame::Connect {
            session_id: options.session_id.clone(),
            username,
            password,
        };
        write_frame(&mut writer, &connect).await?;

        match read_frame(&mut reader).await? {
            Frame::ConnAck { accepted: true, .. } => {}
            Frame::ConnAck { reason, .. } => {
                return Err(Error::Rejected(
                    reason.unwrap_or_else(|| "connection refused".to_string()),
                ))
            }
            other => {
                return Err(Error::InvalidFrame(format!(
                    "expected ConnAck, got {other:?}"
                )))
            }
        }

        let (frames_tx, frames) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut reader).await;
                let failed = frame.is_err();
                if frames_tx.send(frame).is_err() || failed {
                    break;
                }
            }
        });

        Ok::<Connection, Error>(Connection {
            writer,
            frames,
            reader,
        })
    };

    if let Some(timeout) = timeout {
        tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| Error::Custom("Connect timeout exceeded".to_string()))?
    } else {
        handshake.await
    }
}

struct PendingSubscribe {
    filter: String,
    qos: QoS,
    ack: Option<oneshot::Sender<Result<()>>>,
}

enum Exit {
    Closed,
    Lost(Error),
}

/// Owns the socket for one logical session, across reconnects
struct SessionDriver {
    options: ConnectOptions,
    connect_timeout: Option<Duration>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    connected: Arc<AtomicBool>,
    subscriptions: Vec<(String, QoS)>,
    pending: HashMap<u32, PendingSubscribe>,
    next_packet_id: u32,
}

impl SessionDriver {
    async fn run(mut self, mut connection: Connection) {
        let session_id = self.options.session_id.clone();
        loop {
            match self.drive(&mut connection).await {
                Exit::Closed => break,
                Exit::Lost(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    self.fail_pending();
                    tracing::warn!(%session_id, error = %e, "broker connection lost");

                    if !self.options.reconnect.enabled {
                        break;
                    }
                    match self.reconnect().await {
                        Some(fresh) => connection = fresh,
                        None => break,
                    }
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        self.fail_pending();
        tracing::debug!(%session_id, "session task finished");
    }

    async fn drive(&mut self, connection: &mut Connection) -> Exit {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        let _ = write_frame(&mut connection.writer, &Frame::Disconnect).await;
                        return Exit::Closed;
                    }
                    Some(Command::Disconnect { ack }) => {
                        let _ = write_frame(&mut connection.writer, &Frame::Disconnect).await;
                        let _ = ack.send(());
                        return Exit::Closed;
                    }
                    Some(Command::Publish(frame)) => {
                        if let Err(e) = write_frame(&mut connection.writer, &frame).await {
                            return Exit::Lost(e);
                        }
                    }
                    Some(Command::Subscribe { filter, qos, ack }) => {
                        if let Err(e) = self.send_subscribe(connection, filter, qos, Some(ack)).await {
                            return Exit::Lost(e);
                        }
                    }
                },
                frame = connection.frames.recv() => match frame {
                    Some(Ok(frame)) => self.on_frame(frame),
                    Some(Err(e)) => return Exit::Lost(e),
                    None => return Exit::Lost(Error::ConnectionClosed),
                },
            }
        }
    }

    async fn send_subscribe(
        &mut self,
        connection: &mut Connection,
        filter: String,
        qos: QoS,
        ack: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        let packet_id = self.next_packet_id;
        let frame = Frame::Subscribe {
            packet_id,
            filter: filter.clone(),
            qos,
        };
        self.pending
            .insert(packet_id, PendingSubscribe { filter, qos, ack });
        write_frame(&mut connection.writer, &frame).await
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Publish { topic, payload, .. } => {
                // The owner may have stopped reading; the session still runs
                let _ = self.inbound.send(InboundMessage { topic, payload });
            }
            Frame::SubAck { packet_id, result } => {
                let Some(pending) = self.pending.remove(&packet_id) else {
                    tracing::debug!(packet_id, "unexpected SubAck");
                    return;
                };
                match &result {
                    Ok(()) => self.remember(pending.filter.clone(), pending.qos),
                    Err(reason) => {
                        tracing::warn!(filter = %pending.filter, %reason, "subscription rejected");
                    }
                }
                if let Some(ack) = pending.ack {
                    let _ = ack.send(result.map_err(Error::Rejected));
                }
            }
            other => tracing::debug!(frame = ?other, "ignoring frame"),
        }
    }

    fn remember(&mut self, filter: String, qos: QoS) {
        match self.subscriptions.iter_mut().find(|(f, _)| *f == filter) {
            Some(existing) => existing.1 = qos,
            None => self.subscriptions.push((filter, qos)),
        }
    }

    fn fail_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            if let Some(ack) = pending.ack {
                let _ = ack.send(Err(Error::ConnectionClosed));
            }
        }
    }

    /// Retry until connected again, or until the owner gives up on the session
    async fn reconnect(&mut self) -> Option<Connection> {
        let session_id = self.options.session_id.clone();
        loop {
            let wait = tokio::time::sleep(self.options.reconnect.period());
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    command = self.commands.recv() => match command {
                        None => return None,
                        Some(Command::Disconnect { ack }) => {
                            let _ = ack.send(());
                            return None;
                        }
                        Some(Command::Subscribe { ack, .. }) => {
                            let _ = ack.send(Err(Error::NotConnected));
                        }
                        Some(Command::Publish(_)) => {
                            tracing::debug!(%session_id, "dropping publish while reconnecting");
                        }
                    },
                }
            }

            let mut connection = match establish(&self.options, self.connect_timeout).await {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::debug!(%session_id, error = %e, "reconnect attempt failed");
                    continue;
                }
            };

            let mut restored = true;
            for (filter, qos) in self.subscriptions.clone() {
                if self
                    .send_subscribe(&mut connection, filter, qos, None)
                    .await
                    .is_err()
                {
                    restored = false;
                    break;
                }
            }
            if !restored {
                self.pending.clear();
                continue;
            }

            self.connected.store(true, Ordering::SeqCst);
            tracing::info!(%session_id, "reconnected to broker");
            return Some(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_address_strips_scheme() {
        assert_eq!(
            broker_address("tcp://127.0.0.1:1883").unwrap(),
            "127.0.0.1:1883"
        );
        assert_eq!(broker_address("localhost:1883").unwrap(), "localhost:1883");
        assert!(broker_address("wss://example.com/mqtt").is_err());
        assert!(broker_address("tcp://").is_err());
    }
}
