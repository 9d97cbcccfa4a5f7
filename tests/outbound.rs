//! Outbound-listener integration tests: lifecycle, channel-data shapes and
//! the channels projection.

mod common;

use common::*;
use eventsocket::{EslError, OutboundListener};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn new_listener() -> OutboundListener {
    init_tracing();
    OutboundListener::new(0)
}

/// Play FreeSWITCH: dial the listener, answer `connect` with channel data
/// in the command-reply shape.
async fn dial_and_serve_channel_data(port: u16, channel_uuid: &str) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    expect_command(&mut stream, "connect\n\n").await;
    send(
        &mut stream,
        &format!(
            "Content-Type: command/reply\nReply-Text: +OK\nEvent-Name: CHANNEL_DATA\nChannel-Call-UUID: {}\nUnique-ID: {}\nChannel-Name: sofia/internal/1000@example.com\n\n",
            channel_uuid, channel_uuid
        ),
    )
    .await;
    stream
}

#[tokio::test]
async fn start_is_idempotent_and_stop_restart_works() {
    let listener = new_listener();
    assert!(!listener.is_started());
    assert_eq!(listener.port(), None);

    listener.start().await.unwrap();
    assert!(listener.is_started());
    let first_port = listener.port().expect("port bound after start");

    // Start again: indistinguishable from the first start.
    listener.start().await.unwrap();
    assert!(listener.is_started());
    assert_eq!(listener.port(), Some(first_port));

    listener.stop().await;
    assert!(!listener.is_started());

    // Restart gives a working listener (the ephemeral port may change).
    listener.start().await.unwrap();
    assert!(listener.is_started());
    let second_port = listener.port().expect("port bound after restart");

    let mut connections = listener.connections();
    let _fs = dial_and_serve_channel_data(second_port, "restart-uuid").await;
    let session = tokio::time::timeout(Duration::from_secs(2), connections.next())
        .await
        .unwrap()
        .expect("restarted listener should accept");
    let data = session.connect().await.unwrap();
    assert_eq!(data.channel_uuid(), Some("restart-uuid"));

    listener.dispose().await;
    assert!(!listener.is_started());
    assert!(matches!(listener.start().await, Err(EslError::Disposed)));
}

#[tokio::test]
async fn connect_returns_channel_data_from_reply() {
    let listener = new_listener();
    listener.start().await.unwrap();
    let port = listener.port().unwrap();

    let mut connections = listener.connections();
    let _fs = dial_and_serve_channel_data(port, "call-1").await;

    let session = tokio::time::timeout(Duration::from_secs(2), connections.next())
        .await
        .unwrap()
        .unwrap();
    let data = session.connect().await.unwrap();
    assert_eq!(data.channel_uuid(), Some("call-1"));
    assert_eq!(
        data.channel_name(),
        Some("sofia/internal/1000@example.com")
    );
    // Repeated calls share the same exchange.
    let again = session.connect().await.unwrap();
    assert_eq!(again, data);
    assert!(session.channel_data().is_some());

    listener.dispose().await;
}

#[tokio::test]
async fn connect_accepts_event_shaped_channel_data() {
    let listener = new_listener();
    listener.start().await.unwrap();
    let port = listener.port().unwrap();

    let mut connections = listener.connections();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    expect_command(&mut stream, "connect\n\n").await;
    // Bare reply without channel data, then a CHANNEL_DATA event.
    send(&mut stream, &command_reply("+OK")).await;
    send(
        &mut stream,
        &plain_event(&[
            ("Event-Name", "CHANNEL_DATA"),
            ("Channel-Call-UUID", "call-2"),
            ("Unique-ID", "call-2"),
            ("Channel-Name", "sofia/internal/1001@example.com"),
        ]),
    )
    .await;

    let session = tokio::time::timeout(Duration::from_secs(2), connections.next())
        .await
        .unwrap()
        .unwrap();
    let data = tokio::time::timeout(Duration::from_secs(2), session.connect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.channel_uuid(), Some("call-2"));

    listener.dispose().await;
}

#[tokio::test]
async fn channels_projects_only_ready_sessions() {
    let listener = new_listener();
    listener.start().await.unwrap();
    let port = listener.port().unwrap();

    let mut channels = listener.channels();

    // First peer disconnects before sending channel data.
    {
        let mut dead = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        expect_command(&mut dead, "connect\n\n").await;
        dead.shutdown().await.unwrap();
    }

    // Second peer completes the exchange.
    let _fs = dial_and_serve_channel_data(port, "call-3").await;

    let session = tokio::time::timeout(Duration::from_secs(2), channels.next())
        .await
        .expect("a ready session should reach the channels stream")
        .unwrap();
    assert_eq!(
        session.channel_data().and_then(|d| d.channel_uuid().map(String::from)),
        Some("call-3".to_string())
    );

    listener.dispose().await;
}

#[tokio::test]
async fn stop_does_not_dispose_accepted_sessions() {
    let listener = new_listener();
    listener.start().await.unwrap();
    let port = listener.port().unwrap();

    let mut connections = listener.connections();
    let mut fs = dial_and_serve_channel_data(port, "call-4").await;
    let session = tokio::time::timeout(Duration::from_secs(2), connections.next())
        .await
        .unwrap()
        .unwrap();
    session.connect().await.unwrap();

    listener.stop().await;
    assert!(!listener.is_started());

    // The session still speaks ESL after stop.
    let exchange = tokio::spawn(async move {
        expect_command(&mut fs, "test\n\n").await;
        send(&mut fs, &command_reply("+OK still here")).await;
        fs
    });
    let reply = session.connection().send_command("test").await.unwrap();
    assert!(reply.success());
    exchange.await.unwrap();

    // Dispose tears the session down.
    listener.dispose().await;
    assert!(!session.connection().is_connected());
    assert!(matches!(
        session.connection().send_command("test").await,
        Err(EslError::Disposed)
    ));
}

#[tokio::test]
async fn listener_survives_a_peer_that_disconnects_immediately() {
    let listener = new_listener();
    listener.start().await.unwrap();
    let port = listener.port().unwrap();

    let mut connections = listener.connections();

    // A peer that vanishes right after the TCP handshake.
    {
        let flaky = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        drop(flaky);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(listener.is_started());

    // The accept loop keeps serving.
    let _fs = dial_and_serve_channel_data(port, "call-5").await;
    let mut found = None;
    for _ in 0..2 {
        let session = tokio::time::timeout(Duration::from_secs(2), connections.next())
            .await
            .unwrap()
            .unwrap();
        if session.connect().await.is_ok() {
            found = Some(session);
            break;
        }
    }
    let session = found.expect("healthy session should connect");
    assert_eq!(
        session.channel_data().unwrap().channel_uuid(),
        Some("call-5")
    );

    listener.dispose().await;
}
