//! Subscription routing shared by the bundled brokers, and a TCP broker
//! speaking the [`frame`](crate::frame) protocol

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame, Frame};
use crate::qos::QoS;
use crate::topic;
use crate::transport::{Credentials, InboundMessage};

pub(crate) type SessionKey = u64;

struct Session {
    session_id: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
    filters: Vec<(String, QoS)>,
}

/// Live sessions and their filters
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    next_key: SessionKey,
    sessions: HashMap<SessionKey, Session>,
}

impl SubscriptionTable {
    pub(crate) fn open(
        &mut self,
        session_id: &str,
        sender: mpsc::UnboundedSender<InboundMessage>,
    ) -> SessionKey {
        self.next_key += 1;
        self.sessions.insert(
            self.next_key,
            Session {
                session_id: session_id.to_string(),
                sender,
                filters: Vec::new(),
            },
        );
        self.next_key
    }

    pub(crate) fn subscribe(&mut self, key: SessionKey, filter: &str, qos: QoS) -> Result<()> {
        topic::validate_filter(filter)?;
        let session = self.sessions.get_mut(&key).ok_or(Error::NotConnected)?;

        match session.filters.iter_mut().find(|(f, _)| f == filter) {
            Some(existing) => existing.1 = qos,
            None => session.filters.push((filter.to_string(), qos)),
        }
        tracing::debug!(session_id = %session.session_id, %filter, %qos, "subscribed");
        Ok(())
    }

    pub(crate) fn close(&mut self, key: SessionKey) {
        if let Some(session) = self.sessions.remove(&key) {
            tracing::debug!(session_id = %session.session_id, "session closed");
        }
    }

    pub(crate) fn contains(&self, key: SessionKey) -> bool {
        self.sessions.contains_key(&key)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Deliver to every session with a matching filter, once per session
    ///
    /// Returns the number of sessions the message was handed to.
    pub(crate) fn route(&mut self, topic_name: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();

        for (key, session) in &self.sessions {
            if !session
                .filters
                .iter()
                .any(|(filter, _)| topic::matches(filter, topic_name))
            {
                continue;
            }

            let message = InboundMessage {
                topic: topic_name.to_string(),
                payload: payload.to_vec(),
            };
            if session.sender.send(message).is_ok() {
                delivered += 1;
            } else {
                gone.push(*key);
            }
        }

        for key in gone {
            self.close(key);
        }
        delivered
    }
}

pub(crate) fn authenticate(
    expected: Option<&Credentials>,
    given: Option<&Credentials>,
) -> Result<()> {
    match expected {
        None => Ok(()),
        Some(expected) if given == Some(expected) => Ok(()),
        Some(_) => Err(Error::Rejected("bad username or password".to_string())),
    }
}

pub(crate) fn lock(table: &Mutex<SubscriptionTable>) -> MutexGuard<'_, SubscriptionTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BrokerState {
    credentials: Option<Credentials>,
    table: Mutex<SubscriptionTable>,
}

/// Minimal broker for [`TcpTransport`](crate::transport::TcpTransport) clients
pub struct TcpBroker {
    listener: TcpListener,
    credentials: Option<Credentials>,
}

impl TcpBroker {
    /// Bind to a local address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            credentials: None,
        })
    }

    /// Require every client to present these credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Get the local address this broker is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Broker URL clients should connect to
    pub fn url(&self) -> Result<String> {
        Ok(format!("tcp://{}", self.local_addr()?))
    }

    /// Accept clients until the listener fails
    pub async fn run(self) -> Result<()> {
        let shared = Arc::new(BrokerState {
            credentials: self.credentials,
            table: Mutex::new(SubscriptionTable::default()),
        });
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let state = Arc::clone(&shared);
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, state).await {
                    tracing::debug!(%peer, error = %e, "broker client ended");
                }
            });
        }
    }
}

async fn serve_client(stream: TcpStream, state: Arc<BrokerState>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let (session_id, credentials) = match read_frame(&mut reader).await? {
        Frame::Connect {
            session_id,
            username,
            password,
        } => {
            let credentials = match (username, password) {
                (Some(username), Some(password)) => Some(Credentials { username, password }),
                _ => None,
            };
            (session_id, credentials)
        }
        other => {
            return Err(Error::InvalidFrame(format!(
                "expected Connect, got {other:?}"
            )))
        }
    };

    if let Err(e) = authenticate(state.credentials.as_ref(), credentials.as_ref()) {
        let ack = Frame::ConnAck {
            accepted: false,
            reason: Some(e.to_string()),
        };
        write_frame(&mut writer, &ack).await?;
        return Err(e);
    }
    write_frame(
        &mut writer,
        &Frame::ConnAck {
            accepted: true,
            reason: None,
        },
    )
    .await?;

    let (deliveries_tx, mut deliveries) = mpsc::unbounded_channel();
    let (control_tx, mut control) = mpsc::unbounded_channel::<Frame>();
    let key = lock(&state.table).open(&session_id, deliveries_tx);
    tracing::info!(%session_id, "broker accepted session");

    let writer_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = control.recv() => frame,
                Some(message) = deliveries.recv() => Frame::Publish {
                    topic: message.topic,
                    payload: message.payload,
                    qos: QoS::AtMostOnce,
                },
                else => break,
            };
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => break Err(e),
        };
        match frame {
            Frame::Subscribe {
                packet_id,
                filter,
                qos,
            } => {
                let result = lock(&state.table)
                    .subscribe(key, &filter, qos)
                    .map_err(|e| e.to_string());
                let _ = control_tx.send(Frame::SubAck { packet_id, result });
            }
            Frame::Publish { topic, payload, .. } => {
                if let Err(e) = topic::validate_topic(&topic) {
                    tracing::warn!(%session_id, error = %e, "dropping publish");
                    continue;
                }
                lock(&state.table).route(&topic, &payload);
            }
            Frame::Disconnect => break Ok(()),
            other => tracing::warn!(%session_id, frame = ?other, "unexpected frame"),
        }
    };

    lock(&state.table).close(key);
    drop(control_tx);
    let _ = writer_task.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_once_per_matching_session() {
        let mut table = SubscriptionTable::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = table.open("a", tx_a);
        let b = table.open("b", tx_b);

        table.subscribe(a, "bob/+", QoS::AtMostOnce).unwrap();
        table.subscribe(a, "bob/#", QoS::AtMostOnce).unwrap();
        table.subscribe(b, "alice/+", QoS::AtMostOnce).unwrap();

        assert_eq!(table.route("bob/ping", b"x"), 1);
        assert_eq!(rx_a.try_recv().unwrap().topic, "bob/ping");
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn resubscribing_replaces_qos() {
        let mut table = SubscriptionTable::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let key = table.open("a", tx);

        table.subscribe(key, "bob/+", QoS::AtMostOnce).unwrap();
        table.subscribe(key, "bob/+", QoS::ExactlyOnce).unwrap();
        assert_eq!(
            table.sessions[&key].filters,
            vec![("bob/+".to_string(), QoS::ExactlyOnce)]
        );
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let mut table = SubscriptionTable::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let key = table.open("a", tx);
        table.subscribe(key, "#", QoS::AtMostOnce).unwrap();
        drop(rx);

        assert_eq!(table.route("any/topic", b""), 0);
        assert!(!table.contains(key));
    }

    #[test]
    fn invalid_filters_are_rejected() {
        let mut table = SubscriptionTable::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let key = table.open("a", tx);

        assert!(matches!(
            table.subscribe(key, "bob/#/x", QoS::AtMostOnce),
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn authentication() {
        let creds = Credentials {
            username: "u".to_string(),
            password: "p".to_string(),
        };
        let wrong = Credentials {
            username: "u".to_string(),
            password: "x".to_string(),
        };
        assert!(authenticate(None, None).is_ok());
        assert!(authenticate(None, Some(&wrong)).is_ok());
        assert!(authenticate(Some(&creds), Some(&creds)).is_ok());
        assert!(authenticate(Some(&creds), Some(&wrong)).is_err());
        assert!(authenticate(Some(&creds), None).is_err());
    }
}
