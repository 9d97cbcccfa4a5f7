//! Inbound mode: dial FreeSWITCH and authenticate
//!
//! The handshake is strict: FreeSWITCH speaks first with `auth/request`,
//! the client answers `auth <password>`, and the `command/reply` decides the
//! outcome. Every failure mode is folded into
//! [`EslError::InboundConnectionFailed`] with the endpoint and underlying
//! cause preserved.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig};
use crate::constants::HANDSHAKE_TIMEOUT;
use crate::error::{EslError, EslResult, InboundFailureReason};
use crate::message::{ContentType, EslMessage};

/// Entry point for inbound connections.
pub struct InboundSocket;

impl InboundSocket {
    /// Connect to FreeSWITCH and authenticate with the default handshake
    /// timeout (5 s) and configuration.
    ///
    /// ```rust,no_run
    /// use eventsocket::{InboundSocket, DEFAULT_ESL_PORT};
    ///
    /// # async fn example() -> Result<(), eventsocket::EslError> {
    /// let connection = InboundSocket::connect("localhost", DEFAULT_ESL_PORT, "ClueCon").await?;
    /// let response = connection.send_api("status").await?;
    /// println!("{}", response.body());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(host: &str, port: u16, password: &str) -> EslResult<Connection> {
        Self::connect_with_config(
            host,
            port,
            password,
            HANDSHAKE_TIMEOUT,
            ConnectionConfig::default(),
        )
        .await
    }

    /// Connect with an explicit handshake timeout and connection
    /// configuration.
    pub async fn connect_with_config(
        host: &str,
        port: u16,
        password: &str,
        handshake_timeout: Duration,
        config: ConnectionConfig,
    ) -> EslResult<Connection> {
        let endpoint = format!("{}:{}", host, port);
        info!(%endpoint, "connecting to FreeSWITCH");

        let stream = match timeout(handshake_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%endpoint, "TCP connect failed: {e}");
                return Err(inbound_failed(
                    InboundFailureReason::Transport,
                    &endpoint,
                    Some(e.to_string()),
                ));
            }
            Err(_) => {
                warn!(%endpoint, "TCP connect timed out");
                return Err(inbound_failed(
                    InboundFailureReason::Timeout,
                    &endpoint,
                    None,
                ));
            }
        };

        let (connection, handshake_rx) = Connection::start(stream, config);

        match timeout(handshake_timeout, await_auth_request(handshake_rx)).await {
            Ok(Ok(_)) => debug!("received auth request"),
            Ok(Err(e)) => {
                connection.dispose().await;
                return Err(inbound_failed(
                    InboundFailureReason::Transport,
                    &endpoint,
                    Some(e.to_string()),
                ));
            }
            Err(_) => {
                warn!(%endpoint, "no auth request within {:?}", handshake_timeout);
                connection.dispose().await;
                return Err(inbound_failed(
                    InboundFailureReason::Timeout,
                    &endpoint,
                    None,
                ));
            }
        }

        let reply = match connection.send_command(&format!("auth {}", password)).await {
            Ok(reply) => reply,
            Err(e) => {
                connection.dispose().await;
                return Err(inbound_failed(
                    InboundFailureReason::Transport,
                    &endpoint,
                    Some(e.to_string()),
                ));
            }
        };
        if !reply.success() {
            let message = reply.error_message().map(|s| s.to_string());
            warn!(%endpoint, "authentication rejected: {:?}", message);
            connection.dispose().await;
            return Err(EslError::InboundConnectionFailed {
                reason: InboundFailureReason::InvalidPassword,
                endpoint,
                message,
            });
        }

        info!(%endpoint, "authenticated");
        Ok(connection)
    }
}

/// Wait for the server's `auth/request`, skipping anything else.
async fn await_auth_request(
    mut rx: broadcast::Receiver<EslMessage>,
) -> EslResult<EslMessage> {
    loop {
        match rx.recv().await {
            Ok(message) if message.content_type() == Some(ContentType::AuthRequest) => {
                return Ok(message)
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                return Err(EslError::protocol_error(
                    "connection closed before auth request",
                ))
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }
}

fn inbound_failed(
    reason: InboundFailureReason,
    endpoint: &str,
    message: Option<String>,
) -> EslError {
    EslError::InboundConnectionFailed {
        reason,
        endpoint: endpoint.to_string(),
        message,
    }
}
