//! FreeSWITCH Event Socket Layer (ESL) client for Rust
//!
//! This crate provides an async client for FreeSWITCH's Event Socket Layer,
//! allowing applications to run API commands, execute dialplan applications
//! on calls and receive the real-time event stream about channels,
//! conferences and background jobs.
//!
//! # Architecture
//!
//! Every connection owns one background reader task that frames the TCP
//! byte stream into messages and publishes them on a hot broadcast stream.
//! Commands are serialized through a single-in-flight gate and correlated
//! with their replies by arrival order; event observers are independent
//! cursors over the same stream.
//!
//! # Inbound mode
//!
//! The client dials FreeSWITCH and authenticates:
//!
//! ```rust,no_run
//! use eventsocket::{EventName, InboundSocket};
//! use futures_util::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), eventsocket::EslError> {
//!     let connection = InboundSocket::connect("localhost", 8021, "ClueCon").await?;
//!
//!     let response = connection.send_api("status").await?;
//!     println!("status: {}", response.body());
//!
//!     connection
//!         .subscribe_events([EventName::ChannelAnswer, EventName::ChannelHangup])
//!         .await?;
//!     let mut events = connection.events();
//!     while let Some(event) = events.next().await {
//!         println!("{}: {:?}", event.event_name(), event.unique_id());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Outbound mode
//!
//! FreeSWITCH dials the listener (dialplan
//! `<action application="socket" data="127.0.0.1:8040 async full"/>`), one
//! connection per call, already bound to a channel:
//!
//! ```rust,no_run
//! use eventsocket::OutboundListener;
//! use futures_util::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), eventsocket::EslError> {
//!     let listener = OutboundListener::new(8040);
//!     listener.start().await?;
//!
//!     let mut channels = listener.channels();
//!     while let Some(session) = channels.next().await {
//!         let data = session.connect().await?;
//!         println!("call from {:?}", data.channel_name());
//!         let uuid = data.channel_uuid().unwrap_or_default().to_string();
//!         session
//!             .connection()
//!             .execute_application(&uuid, "answer", None)
//!             .await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Executing applications
//!
//! [`Connection::execute_application`] issues `sendmsg … execute` and
//! resolves when the correlated `CHANNEL_EXECUTE_COMPLETE` arrives:
//!
//! ```rust,no_run
//! # async fn example(connection: &eventsocket::Connection) -> Result<(), eventsocket::EslError> {
//! if let Some(complete) = connection
//!     .execute_application("the-channel-uuid", "playback", Some("ivr/ivr-welcome.wav"))
//!     .await?
//! {
//!     println!("result: {:?}", complete.application_response());
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod execute;
pub mod headers;
pub mod inbound;
pub mod message;
pub mod outbound;
pub mod parser;

pub(crate) mod transport;

pub use connection::{
    Connection, ConnectionConfig, ConnectionStatus, DisconnectReason, EventStream, MessageStream,
};
pub use constants::DEFAULT_ESL_PORT;
pub use error::{EslError, EslResult, InboundFailureReason};
pub use event::{BackgroundJobResult, EventMessage, EventName};
pub use execute::ExecuteOptions;
pub use headers::EventHeader;
pub use inbound::InboundSocket;
pub use message::{ApiResponse, CommandReply, ContentType, EslMessage, Headers};
pub use outbound::{ChannelData, OutboundListener, OutboundSession, SessionStream};
pub use parser::{Framer, MessageParser};
