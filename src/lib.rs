//! FreeSWITCH Event Socket Library (ESL) inbound client for Rust
//!
//! This crate connects to FreeSWITCH's event socket, authenticates, runs
//! commands, and delivers server-pushed events to registered listeners.
//!
//! # Architecture
//!
//! - [`EslClient`] (Clone + Send + Sync) owns at most one socket at a time and
//!   redials it according to [`EslClientOptions`].
//! - A background reader task decodes frames ([`decode`]) and routes them:
//!   command replies to the caller waiting on the socket, events to
//!   [`EventListener`]s, lifecycle changes to [`ConnectionListener`]s.
//! - The protocol carries no request IDs, so commands are strictly serialized:
//!   the write lock is held from the write until the reply arrives.
//! - Listener callbacks run on tokio's blocking pool with bounded concurrency,
//!   never on the reader task.
//!
//! # Example
//!
//! ```rust,no_run
//! use freeswitch_esl_client::{
//!     EslClient, EslClientOptions, EslEvent, EventFormat, EventListener, ListenerError,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Printer;
//!
//! impl EventListener for Printer {
//!     fn event_received(&self, event: &EslEvent) -> Result<(), ListenerError> {
//!         println!("{}", event);
//!         Ok(())
//!     }
//!
//!     fn background_job_result_received(&self, event: &EslEvent) -> Result<(), ListenerError> {
//!         println!("job {:?} done: {:?}", event.job_uuid(), event.body_lines());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = EslClient::new(
//!         "localhost",
//!         8021,
//!         "ClueCon",
//!         Duration::from_secs(2),
//!         EslClientOptions::default(),
//!     );
//!     client.add_event_listener(Arc::new(Printer));
//!     client.connect().await?;
//!
//!     client.set_event_subscriptions(EventFormat::Plain, "HEARTBEAT BACKGROUND_JOB").await?;
//!     let job_uuid = client.send_async_api_command("status", None).await?;
//!     println!("queued job {}", job_uuid);
//!
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

#[macro_use]
mod macros;

pub mod client;
pub mod command;
pub mod commands;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod headers;
pub mod listener;
pub mod protocol;

pub(crate) mod connection;
pub(crate) mod dispatch;

pub use client::{ConnectionState, EslClient};
pub use command::{CommandResponse, ReplyStatus};
pub use commands::{SendEvent, SendMsg};
pub use config::EslClientOptions;
pub use constants::DEFAULT_ESL_PORT;
pub use error::{EslError, EslResult};
pub use event::{decode_header_value, EslEvent, EventFormat, ParseEventFormatError};
pub use headers::{EventHeader, MessageHeader, ParseEventHeaderError, ParseMessageHeaderError};
pub use listener::{ConnectionListener, EventListener, ListenerError};
pub use protocol::{decode, EslMessage, MessageHeaders, MessageType};
