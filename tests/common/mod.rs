//! Scripted in-process TCP peer playing the FreeSWITCH side of the wire.
#![allow(dead_code)] // each test binary uses its own slice of the helpers

use std::future::Future;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const AUTH_REQUEST: &str = "Content-Type: auth/request\n\n";

/// Opt-in test logging: `RUST_LOG=eventsocket=trace cargo test -- --nocapture`.
///
/// Safe to call from every test; only the first registration wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bind an ephemeral port, run `script` against the first accepted
/// connection and return the address to dial.
pub async fn spawn_server<F, Fut>(script: F) -> SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(stream).await;
    });
    addr
}

/// Read bytes until the buffer ends with `marker`.
pub async fn read_until(stream: &mut TcpStream, marker: &str) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n != 0, "peer closed while reading; got {:?}", String::from_utf8_lossy(&buf));
        buf.push(byte[0]);
        if buf.ends_with(marker.as_bytes()) {
            return String::from_utf8(buf).unwrap();
        }
    }
}

/// Read one complete client command, including any length-framed payload
/// (`sendmsg` carries its arguments that way).
pub async fn read_command(stream: &mut TcpStream) -> String {
    let head = read_until(stream, "\n\n").await;
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length: "))
        .and_then(|value| value.trim().parse::<usize>().ok());
    match content_length {
        Some(len) => {
            // Payload plus the trailing blank line.
            let mut rest = vec![0u8; len + 2];
            stream.read_exact(&mut rest).await.unwrap();
            format!("{}{}", head, String::from_utf8(rest).unwrap())
        }
        None => head,
    }
}

/// Expect exactly this command next on the wire.
pub async fn expect_command(stream: &mut TcpStream, expected: &str) {
    let actual = read_command(stream).await;
    assert_eq!(actual, expected);
}

pub async fn send(stream: &mut TcpStream, wire: &str) {
    stream.write_all(wire.as_bytes()).await.unwrap();
}

pub fn command_reply(reply_text: &str) -> String {
    format!("Content-Type: command/reply\nReply-Text: {}\n\n", reply_text)
}

pub fn api_response(body: &str) -> String {
    format!(
        "Content-Type: api/response\nContent-Length: {}\n\n{}",
        body.len(),
        body
    )
}

/// A `text/event-plain` message whose body is the given header block.
pub fn plain_event(headers: &[(&str, &str)]) -> String {
    let mut body = String::new();
    for (name, value) in headers {
        body.push_str(&format!("{}: {}\n", name, value));
    }
    format!(
        "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
        body.len(),
        body
    )
}

/// A `text/event-plain` message with an inner length-framed body
/// (`BACKGROUND_JOB` results use this shape).
pub fn plain_event_with_body(headers: &[(&str, &str)], inner_body: &str) -> String {
    let mut event_headers = String::new();
    for (name, value) in headers {
        event_headers.push_str(&format!("{}: {}\n", name, value));
    }
    event_headers.push_str(&format!("Content-Length: {}\n", inner_body.len()));
    let body = format!("{}\n{}", event_headers, inner_body);
    format!(
        "Content-Length: {}\nContent-Type: text/event-plain\n\n{}",
        body.len(),
        body
    )
}

/// Complete inbound auth handshake from the server side.
pub async fn serve_auth(stream: &mut TcpStream, password: &str) {
    send(stream, AUTH_REQUEST).await;
    expect_command(stream, &format!("auth {}\n\n", password)).await;
    send(stream, &command_reply("+OK accepted")).await;
}
