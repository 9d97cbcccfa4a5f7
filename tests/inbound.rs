//! Inbound-mode integration tests against a scripted in-process peer.

mod common;

use common::*;
use eventsocket::{
    ConnectionConfig, EslError, EventName, InboundFailureReason, InboundSocket,
};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

async fn connect(addr: std::net::SocketAddr) -> eventsocket::Connection {
    InboundSocket::connect(&addr.ip().to_string(), addr.port(), "ClueCon")
        .await
        .expect("handshake should succeed")
}

#[tokio::test]
async fn auth_ok_returns_live_connection() {
    let addr = spawn_server(|mut stream| async move {
        serve_auth(&mut stream, "ClueCon").await;
        expect_command(&mut stream, "api status\n\n").await;
        send(&mut stream, &api_response("UP 0 years, 0 days\n")).await;
    })
    .await;

    let connection = connect(addr).await;
    assert!(connection.is_connected());

    let response = connection.send_api("status").await.unwrap();
    assert!(response.success());
    assert_eq!(response.body(), "UP 0 years, 0 days");

    connection.dispose().await;
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn auth_bad_password_fails_with_invalid_password() {
    let addr = spawn_server(|mut stream| async move {
        send(&mut stream, AUTH_REQUEST).await;
        expect_command(&mut stream, "auth wrong\n\n").await;
        send(&mut stream, &command_reply("-ERR Invalid Password")).await;
    })
    .await;

    let err = InboundSocket::connect(&addr.ip().to_string(), addr.port(), "wrong")
        .await
        .unwrap_err();
    match err {
        EslError::InboundConnectionFailed {
            reason,
            endpoint,
            message,
        } => {
            assert_eq!(reason, InboundFailureReason::InvalidPassword);
            assert_eq!(endpoint, addr.to_string());
            assert_eq!(message.as_deref(), Some("Invalid Password"));
        }
        other => panic!("expected InboundConnectionFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_auth_request_times_out() {
    // Server accepts the TCP connection but never speaks.
    let addr = spawn_server(|_stream| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
    })
    .await;

    let err = InboundSocket::connect_with_config(
        &addr.ip().to_string(),
        addr.port(),
        "ClueCon",
        Duration::from_millis(100),
        ConnectionConfig::default(),
    )
    .await
    .unwrap_err();
    match err {
        EslError::InboundConnectionFailed { reason, .. } => {
            assert_eq!(reason, InboundFailureReason::Timeout);
        }
        other => panic!("expected InboundConnectionFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn concurrent_sends_are_serialized_in_issue_order() {
    let addr = spawn_server(|mut stream| async move {
        serve_auth(&mut stream, "ClueCon").await;
        // The second command must not hit the wire until the first reply
        // has been sent.
        expect_command(&mut stream, "test\n\n").await;
        send(&mut stream, &command_reply("+OK")).await;
        expect_command(&mut stream, "event CHANNEL_ANSWER\n\n").await;
        send(&mut stream, &command_reply("-ERR FAILED")).await;
    })
    .await;

    let connection = connect(addr).await;
    let (first, second) = tokio::join!(
        connection.send_command("test"),
        connection.send_command("event CHANNEL_ANSWER"),
    );

    let first = first.unwrap();
    assert!(first.success());
    let second = second.unwrap();
    assert!(!second.success());
    assert_eq!(second.error_message(), Some("FAILED"));
}

#[tokio::test]
async fn reply_timeout_keeps_the_connection_alive() {
    let addr = spawn_server(|mut stream| async move {
        serve_auth(&mut stream, "ClueCon").await;
        // Swallow the first command without replying, then serve the next
        // one normally.
        expect_command(&mut stream, "slow\n\n").await;
        expect_command(&mut stream, "quick\n\n").await;
        send(&mut stream, &command_reply("+OK")).await;
    })
    .await;

    let connection = InboundSocket::connect_with_config(
        &addr.ip().to_string(),
        addr.port(),
        "ClueCon",
        Duration::from_secs(5),
        ConnectionConfig {
            response_timeout: Duration::from_millis(100),
        },
    )
    .await
    .unwrap();

    let err = connection.send_command("slow").await.unwrap_err();
    assert!(matches!(err, EslError::Timeout { timeout_ms: 100 }));
    assert!(connection.is_connected());

    let reply = connection.send_command("quick").await.unwrap();
    assert!(reply.success());
}

#[tokio::test]
async fn disconnect_cancels_pending_and_disposes() {
    let addr = spawn_server(|mut stream| async move {
        serve_auth(&mut stream, "ClueCon").await;
        expect_command(&mut stream, "api status\n\n").await;
        // Close the socket with the command still in flight.
        stream.shutdown().await.unwrap();
    })
    .await;

    let connection = connect(addr).await;
    let mut messages = connection.messages();

    let err = connection.send_api("status").await.unwrap_err();
    assert!(matches!(err, EslError::Cancelled));

    // The message stream completes normally.
    assert!(messages.next().await.is_none());
    assert!(!connection.is_connected());

    // Further sends report the connection as dead.
    let err = connection.send_api("status").await.unwrap_err();
    assert!(matches!(err, EslError::Disposed));
    let err = connection.send_command("test").await.unwrap_err();
    assert!(matches!(err, EslError::Disposed));
}

#[tokio::test]
async fn exit_completes_on_disconnect_notice() {
    let addr = spawn_server(|mut stream| async move {
        serve_auth(&mut stream, "ClueCon").await;
        expect_command(&mut stream, "exit\n\n").await;
        send(&mut stream, &command_reply("+OK bye")).await;
        let notice = "Disconnected, goodbye.\n";
        send(
            &mut stream,
            &format!(
                "Content-Type: text/disconnect-notice\nContent-Length: {}\n\n{}",
                notice.len(),
                notice
            ),
        )
        .await;
        stream.shutdown().await.unwrap();
    })
    .await;

    let connection = connect(addr).await;
    let reply = connection.exit().await.unwrap();
    assert!(reply.success());

    // The notice terminates the connection.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn exit_tolerates_missing_disconnect_notice() {
    let addr = spawn_server(|mut stream| async move {
        serve_auth(&mut stream, "ClueCon").await;
        expect_command(&mut stream, "exit\n\n").await;
        send(&mut stream, &command_reply("+OK bye")).await;
        // Keep the socket open and silent; exit must still complete.
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let connection = connect(addr).await;
    let started = std::time::Instant::now();
    let reply = connection.exit().await.unwrap();
    assert!(reply.success());
    // Completed via the 2s notice timeout, not the 5s response timeout.
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn subscriptions_grow_monotonically_and_skip_noops() {
    let addr = spawn_server(|mut stream| async move {
        serve_auth(&mut stream, "ClueCon").await;
        expect_command(&mut stream, "event plain HEARTBEAT\n\n").await;
        send(&mut stream, &command_reply("+OK event listener enabled plain")).await;
        // A repeat subscription issues nothing; the next wire command is
        // the grown set.
        expect_command(&mut stream, "event plain CHANNEL_ANSWER HEARTBEAT\n\n").await;
        send(&mut stream, &command_reply("+OK event listener enabled plain")).await;
        expect_command(
            &mut stream,
            "event plain CHANNEL_ANSWER HEARTBEAT CUSTOM sofia::register\n\n",
        )
        .await;
        send(&mut stream, &command_reply("+OK event listener enabled plain")).await;
    })
    .await;

    let connection = connect(addr).await;
    connection
        .subscribe_events([EventName::Heartbeat])
        .await
        .unwrap();
    // Same set again: no command on the wire.
    connection
        .subscribe_events([EventName::Heartbeat])
        .await
        .unwrap();
    connection
        .subscribe_events([EventName::ChannelAnswer])
        .await
        .unwrap();
    connection
        .subscribe_custom_events(["sofia::register"])
        .await
        .unwrap();
    // And the custom set is idempotent too.
    connection
        .subscribe_custom_events(["sofia::register"])
        .await
        .unwrap();
}

#[tokio::test]
async fn events_stream_delivers_in_wire_order() {
    let addr = spawn_server(|mut stream| async move {
        serve_auth(&mut stream, "ClueCon").await;
        expect_command(&mut stream, "event plain CHANNEL_ANSWER CHANNEL_HANGUP\n\n").await;
        send(&mut stream, &command_reply("+OK")).await;
        send(
            &mut stream,
            &plain_event(&[("Event-Name", "CHANNEL_ANSWER"), ("Unique-ID", "u1")]),
        )
        .await;
        send(
            &mut stream,
            &plain_event(&[("Event-Name", "CHANNEL_HANGUP"), ("Unique-ID", "u1")]),
        )
        .await;
    })
    .await;

    let connection = connect(addr).await;
    let mut events = connection.events();
    connection
        .subscribe_events([EventName::ChannelAnswer, EventName::ChannelHangup])
        .await
        .unwrap();

    let first = events.next().await.unwrap();
    assert_eq!(first.event_name(), EventName::ChannelAnswer);
    let second = events.next().await.unwrap();
    assert_eq!(second.event_name(), EventName::ChannelHangup);
}

#[tokio::test]
async fn channel_events_filter_out_systemwide_events() {
    let addr = spawn_server(|mut stream| async move {
        serve_auth(&mut stream, "ClueCon").await;
        // The subscribe exchange guarantees the client armed its stream
        // before any event hits the wire (hot streams have no replay).
        expect_command(&mut stream, "event plain CHANNEL_ANSWER HEARTBEAT\n\n").await;
        send(&mut stream, &command_reply("+OK")).await;
        send(&mut stream, &plain_event(&[("Event-Name", "HEARTBEAT")])).await;
        send(
            &mut stream,
            &plain_event(&[("Event-Name", "CHANNEL_ANSWER"), ("Unique-ID", "u9")]),
        )
        .await;
    })
    .await;

    let connection = connect(addr).await;
    let mut channel_events = connection.channel_events();
    connection
        .subscribe_events([EventName::ChannelAnswer, EventName::Heartbeat])
        .await
        .unwrap();

    let event = channel_events.next().await.unwrap();
    assert_eq!(event.event_name(), EventName::ChannelAnswer);
    assert_eq!(event.unique_id(), Some("u9"));
}
