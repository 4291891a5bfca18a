//! PostgreSQL wire protocol implementation.
//!
//! This module provides the low-level building blocks:
//! - The pack/unpack format language ([`codec`])
//! - Outer frontend/backend messages ([`messages`])
//! - Streaming replication sub-protocol messages ([`replication`])
//! - Tag lookup tables for both ([`registry`])
//! - Frame reading and writing ([`framing`])
//!
//! # Wire Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message consists of:
//! - 1 byte: message type tag
//! - 4 bytes: message length (including these 4 bytes)
//! - N bytes: message payload
//!
//! Exception: Startup and CancelRequest messages omit the type tag.
//!
//! # Replication Protocol
//!
//! During streaming replication, the server sends CopyData messages whose
//! payload is itself a tagged message: `XLogData` (WAL records) or `Keepalive`
//! (heartbeats). These inner messages carry no length word. The client answers
//! pinging keepalives with `HotStandbyFeedback`.

pub mod codec;
pub mod commands;
mod direction;
pub mod framing;
pub mod messages;
pub mod registry;
pub mod replication;

pub use codec::{FormatSpec, Value, pack, unpack_exact, unpack_from};
pub use commands::{identify_system, start_replication, start_replication_at};
pub use direction::{Direction, Role};
pub use framing::Frame;
pub use messages::{
    AuthKind, AuthRequest, BackendKeyData, CommandComplete, CommandTag, CopyBothResponse,
    CopyData, CopyDone, DataRow, ErrorFields, ErrorResponse, FieldDescription, FormatCode,
    Message, MessageBody, NoticeResponse, ParameterStatus, Query, ReadyForQuery, RowDescription,
    Startup, TransactionStatus,
};
pub use registry::{decode_message, decode_replication};
pub use replication::{
    HotStandbyFeedback, Keepalive, PG_EPOCH_MICROS, ReplicationMessage, StandbyStatusUpdate,
    XLogData, pg_now, pg_to_unix_timestamp, unix_to_pg_timestamp,
};
