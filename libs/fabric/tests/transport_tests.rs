use courier_fabric::{
    error::Error,
    frame::{read_frame, write_frame, Frame},
    ConnectOptions, Credentials, QoS, ReconnectPolicy, TcpBroker, TcpTransport, Transport,
};
use std::time::Duration;
use tokio::net::TcpListener;

#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options(url: &str, session_id: &str) -> ConnectOptions {
    ConnectOptions {
        broker_url: url.to_string(),
        session_id: session_id.to_string(),
        credentials: None,
        reconnect: ReconnectPolicy::disabled(),
    }
}

/// Helper to start a broker on a free port
async fn start_broker() -> String {
    let broker = TcpBroker::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let url = broker.url().unwrap();
    tokio::spawn(broker.run());
    url
}

#[tokio::test]
async fn tcp_publish_reaches_subscriber() {
    let url = start_broker().await;

    let alice = TcpTransport::new();
    let bob = TcpTransport::new();
    let _alice_inbound = alice.connect(&options(&url, "alice-1")).await.unwrap();
    let mut bob_inbound = bob.connect(&options(&url, "bob-1")).await.unwrap();

    // The ack arrives only after the broker recorded the filter
    bob.subscribe("bob/+", QoS::AtLeastOnce).await.unwrap();

    alice
        .publish("bob/ping", br#"{"n":1}"#.to_vec(), QoS::AtMostOnce)
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), bob_inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic, "bob/ping");
    assert_eq!(message.payload, br#"{"n":1}"#);
}

#[tokio::test]
async fn tcp_messages_preserve_order() {
    let url = start_broker().await;

    let sender = TcpTransport::new();
    let receiver = TcpTransport::new();
    let _sender_inbound = sender.connect(&options(&url, "s")).await.unwrap();
    let mut inbound = receiver.connect(&options(&url, "r")).await.unwrap();
    receiver.subscribe("r/#", QoS::AtMostOnce).await.unwrap();

    let topics = ["r/first", "r/second", "r/third/deep"];
    for topic in topics {
        sender
            .publish(topic, Vec::new(), QoS::AtMostOnce)
            .unwrap();
    }

    for topic in topics {
        let message = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.topic, topic);
    }
}

#[tokio::test]
async fn tcp_rejects_invalid_filter_and_topic() {
    let url = start_broker().await;
    let client = TcpTransport::new();
    let _inbound = client.connect(&options(&url, "c")).await.unwrap();

    assert!(matches!(
        client.subscribe("a/#/b", QoS::AtMostOnce).await,
        Err(Error::InvalidFilter(_))
    ));
    assert!(matches!(
        client.publish("a/+", Vec::new(), QoS::AtMostOnce),
        Err(Error::InvalidFilter(_))
    ));
}

#[tokio::test]
async fn tcp_bad_credentials_rejected() {
    let broker = TcpBroker::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
        .with_credentials(Credentials {
            username: "user".to_string(),
            password: "secret".to_string(),
        });
    let url = broker.url().unwrap();
    tokio::spawn(broker.run());

    let client = TcpTransport::new();
    match client.connect(&options(&url, "anon")).await {
        Err(Error::Rejected(reason)) => assert!(reason.contains("password")),
        other => panic!("Expected Rejected error, got {:?}", other.map(|_| ())),
    }
    assert!(!client.is_connected());

    let mut opts = options(&url, "authed");
    opts.credentials = Some(Credentials {
        username: "user".to_string(),
        password: "secret".to_string(),
    });
    assert!(client.connect(&opts).await.is_ok());
    assert!(client.is_connected());
}

#[tokio::test]
async fn tcp_connect_refused() {
    // Bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = TcpTransport::builder()
        .connect_timeout(Duration::from_secs(2))
        .build();
    let result = client.connect(&options(&format!("tcp://{addr}"), "c")).await;
    assert!(result.is_err());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn tcp_disconnect_closes_inbound_and_is_idempotent() {
    let url = start_broker().await;
    let client = TcpTransport::new();
    let mut inbound = client.connect(&options(&url, "c")).await.unwrap();
    assert!(client.is_connected());

    client.disconnect().await.unwrap();
    assert!(!client.is_connected());
    assert!(inbound.recv().await.is_none());

    client.disconnect().await.unwrap();
    assert!(matches!(
        client.publish("c/x", Vec::new(), QoS::AtMostOnce),
        Err(Error::NotConnected)
    ));
}

/// Accept one client, complete the handshake, and return its socket halves
async fn accept_session(
    listener: &TcpListener,
) -> (
    tokio::net::tcp::OwnedReadHalf,
    tokio::net::tcp::OwnedWriteHalf,
) {
    let (stream, _) = listener.accept().await.unwrap();
    let (mut reader, mut writer) = stream.into_split();
    match read_frame(&mut reader).await.unwrap() {
        Frame::Connect { .. } => {}
        other => panic!("Expected Connect, got {:?}", other),
    }
    write_frame(
        &mut writer,
        &Frame::ConnAck {
            accepted: true,
            reason: None,
        },
    )
    .await
    .unwrap();
    (reader, writer)
}

#[tokio::test]
async fn tcp_connection_loss_without_reconnect_ends_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("tcp://{}", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let (reader, writer) = accept_session(&listener).await;
        drop(reader);
        drop(writer);
    });

    let client = TcpTransport::new();
    let mut inbound = client.connect(&options(&url, "c")).await.unwrap();
    server.await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .unwrap();
    assert!(closed.is_none());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn tcp_reconnect_restores_subscriptions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("tcp://{}", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        // First session: acknowledge one subscription, then drop the socket
        let (mut reader, mut writer) = accept_session(&listener).await;
        let packet_id = match read_frame(&mut reader).await.unwrap() {
            Frame::Subscribe { packet_id, filter, .. } => {
                assert_eq!(filter, "dev/+");
                packet_id
            }
            other => panic!("Expected Subscribe, got {:?}", other),
        };
        write_frame(
            &mut writer,
            &Frame::SubAck {
                packet_id,
                result: Ok(()),
            },
        )
        .await
        .unwrap();
        drop(reader);
        drop(writer);

        // Second session: the client must re-subscribe on its own
        let (mut reader, mut writer) = accept_session(&listener).await;
        let packet_id = match read_frame(&mut reader).await.unwrap() {
            Frame::Subscribe { packet_id, filter, .. } => {
                assert_eq!(filter, "dev/+");
                packet_id
            }
            other => panic!("Expected Subscribe, got {:?}", other),
        };
        write_frame(
            &mut writer,
            &Frame::SubAck {
                packet_id,
                result: Ok(()),
            },
        )
        .await
        .unwrap();
        write_frame(
            &mut writer,
            &Frame::Publish {
                topic: "dev/after".to_string(),
                payload: b"again".to_vec(),
                qos: QoS::AtMostOnce,
            },
        )
        .await
        .unwrap();
        // Hold the connection open until the client is done
        let _ = read_frame(&mut reader).await;
    });

    let client = TcpTransport::new();
    let mut opts = options(&url, "c");
    opts.reconnect = ReconnectPolicy {
        enabled: true,
        period_ms: 20,
    };
    let mut inbound = client.connect(&opts).await.unwrap();
    client.subscribe("dev/+", QoS::AtMostOnce).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic, "dev/after");
    assert_eq!(message.payload, b"again");
    assert!(client.is_connected());

    client.disconnect().await.unwrap();
    server.await.unwrap();
}
