//! Tag → decoder lookup tables.
//!
//! The outer protocol and the replication sub-protocol reuse tag bytes (`k`,
//! `w`, `h` vs. `c`, `d`, `W`...), so each has its own table. Both are built
//! from explicit variant lists the first time they are used and never change
//! afterwards. Unregistered tags decode to an `Unknown` variant carrying the
//! payload untouched.

use std::collections::HashMap;
use std::sync::LazyLock;

use bytes::Bytes;

use super::messages::{
    AuthRequest, BackendKeyData, CommandComplete, CopyBothResponse, CopyData, CopyDone, DataRow,
    EmptyQueryResponse, ErrorResponse, Message, MessageBody, NoticeResponse, ParameterStatus,
    Query, ReadyForQuery, RowDescription, Terminate, UnknownMessage,
};
use super::replication::{
    HotStandbyFeedback, Keepalive, ReplicationMessage, StandbyStatusUpdate,
    UnknownReplicationMessage, XLogData,
};
use crate::error::Result;

type Decoder<M> = fn(Bytes) -> Result<M>;

fn entry<T, M>() -> (u8, Decoder<M>)
where
    T: MessageBody + Into<M>,
{
    fn decode<T: MessageBody + Into<M>, M>(payload: Bytes) -> Result<M> {
        T::decode(payload).map(Into::into)
    }
    let decoder: Decoder<M> = decode::<T, M>;
    // tag-less variants are never registered
    (T::TAG.unwrap_or_default(), decoder)
}

static MESSAGES: LazyLock<HashMap<u8, Decoder<Message>>> = LazyLock::new(|| {
    HashMap::from([
        entry::<AuthRequest, Message>(),
        entry::<BackendKeyData, Message>(),
        entry::<ParameterStatus, Message>(),
        entry::<ReadyForQuery, Message>(),
        entry::<ErrorResponse, Message>(),
        entry::<NoticeResponse, Message>(),
        entry::<CommandComplete, Message>(),
        entry::<EmptyQueryResponse, Message>(),
        entry::<Query, Message>(),
        entry::<RowDescription, Message>(),
        entry::<DataRow, Message>(),
        entry::<CopyData, Message>(),
        entry::<CopyDone, Message>(),
        entry::<CopyBothResponse, Message>(),
        entry::<Terminate, Message>(),
    ])
});

static REPLICATION: LazyLock<HashMap<u8, Decoder<ReplicationMessage>>> = LazyLock::new(|| {
    HashMap::from([
        entry::<XLogData, ReplicationMessage>(),
        entry::<Keepalive, ReplicationMessage>(),
        entry::<HotStandbyFeedback, ReplicationMessage>(),
        entry::<StandbyStatusUpdate, ReplicationMessage>(),
    ])
});

/// Decode one outer-protocol payload by tag.
pub fn decode_message(tag: u8, payload: Bytes) -> Result<Message> {
    match MESSAGES.get(&tag) {
        Some(decode) => decode(payload),
        None => Ok(Message::Unknown(UnknownMessage { tag, payload })),
    }
}

/// Decode one replication sub-protocol payload (tag already split off).
pub fn decode_replication(tag: u8, payload: Bytes) -> Result<ReplicationMessage> {
    match REPLICATION.get(&tag) {
        Some(decode) => decode(payload),
        None => Ok(ReplicationMessage::Unknown(UnknownReplicationMessage {
            tag,
            payload,
        })),
    }
}
