//! PostgreSQL streaming replication client.
//!
//! Three layers, each usable on its own:
//! - [`Connection`]: framing, direction checks and the coarse protocol state
//!   machine over any `AsyncRead + AsyncWrite` stream
//! - [`ReplicationSession`]: the IDENTIFY_SYSTEM / START_REPLICATION handshake
//!   and the CopyData wrap/unwrap of the replication sub-protocol
//! - [`ReplicationClient`]: a background worker driving a session and
//!   delivering events over a channel
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     channel      ┌─────────────────┐
//! │                 │◄─────────────────│                 │
//! │  Your App       │ ReplicationEvent │  Worker Task    │
//! │                 │─────────────────►│                 │
//! │                 │  send / stop     │                 │
//! └─────────────────┘                  └────────┬────────┘
//!                                               │
//!                                               │ TCP
//!                                               ▼
//!                                      ┌─────────────────┐
//!                                      │   PostgreSQL    │
//!                                      │  (walsender)    │
//!                                      └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pg_replicant::{ReplicationClient, ReplicationConfig, ReplicationEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = ReplicationClient::connect(ReplicationConfig::default()).await?;
//!
//!     loop {
//!         match client.recv().await? {
//!             ReplicationEvent::Started { cursor, .. } => println!("streaming from {cursor}"),
//!             ReplicationEvent::XLogData(x) => {
//!                 println!("{} bytes of WAL at {}", x.records.len(), x.start);
//!             }
//!             ReplicationEvent::StoppedAt { reached } => {
//!                 println!("reached stop position {reached}");
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

mod connection;
mod session;
mod tokio_client;
mod worker;

pub use connection::{Connection, ConnectionState, SessionState};
pub use session::{ReplicationSession, SessionEvent};
pub use tokio_client::ReplicationClient;
pub use worker::{ReplicationEvent, ReplicationEventReceiver};
