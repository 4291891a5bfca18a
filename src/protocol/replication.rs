//! Streaming replication sub-protocol.
//!
//! Once the server answers `START_REPLICATION` with CopyBothResponse, every
//! CopyData payload is one of these messages: `tag(1) | payload`, with no
//! length word of its own. [`ReplicationMessage::wrap`] and
//! [`ReplicationMessage::from_copy_data`] are the only bridge between the two
//! protocols.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{Fields, pack_into, unpack_from};
use super::direction::{Direction, Role};
use super::messages::{CopyData, MessageBody};
use crate::error::{PgWireError, Result};
use crate::lsn::Lsn;

/// WAL records starting at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    /// WAL position where `records` starts.
    pub start: Lsn,
    /// Current end of WAL on the server.
    pub end: Lsn,
    /// Server clock, microseconds since 2000-01-01.
    pub clock: u64,
    pub records: Bytes,
}

impl XLogData {
    /// First WAL position after `records`.
    #[inline]
    pub fn next_position(&self) -> Lsn {
        self.start.advance(self.records.len() as u64)
    }
}

impl MessageBody for XLogData {
    const NAME: &'static str = "XLogData";
    const TAG: Option<u8> = Some(b'w');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        pack_into(
            "Q Q Q",
            &[self.start.0.into(), self.end.0.into(), self.clock.into()],
            buf,
        )?;
        buf.put_slice(&self.records);
        Ok(())
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let (head, off) = unpack_from("Q Q Q", &payload, 0)?;
        let mut head = Fields::new(head);
        Ok(XLogData {
            start: Lsn(head.u64()?),
            end: Lsn(head.u64()?),
            clock: head.u64()?,
            records: payload.slice(off..),
        })
    }
}

/// Server heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub end: Lsn,
    pub clock: u64,
    /// The server wants an immediate reply.
    pub ping: bool,
}

impl MessageBody for Keepalive {
    const NAME: &'static str = "Keepalive";
    const TAG: Option<u8> = Some(b'k');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        pack_into(
            "Q Q ?",
            &[self.end.0.into(), self.clock.into(), self.ping.into()],
            buf,
        )
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut f = Fields::unpack_exact("Q Q ?", &payload)?;
        Ok(Keepalive {
            end: Lsn(f.u64()?),
            clock: f.u64()?,
            ping: f.bool()?,
        })
    }
}

/// Standby feedback; also the reply to a pinging [`Keepalive`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HotStandbyFeedback {
    pub clock: u64,
    /// Oldest transaction id still needed by the standby; 0 disables.
    pub xmin: u32,
    pub epoch: u32,
    pub catalog_xmin: u32,
    pub catalog_epoch: u32,
}

impl HotStandbyFeedback {
    /// Feedback stamped with the current clock.
    pub fn now(xmin: u32) -> HotStandbyFeedback {
        HotStandbyFeedback {
            clock: pg_now(),
            xmin,
            ..HotStandbyFeedback::default()
        }
    }
}

impl MessageBody for HotStandbyFeedback {
    const NAME: &'static str = "HotStandbyFeedback";
    const TAG: Option<u8> = Some(b'h');
    const DIRECTION: Direction = Direction::Frontend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        pack_into(
            "Q I I I I",
            &[
                self.clock.into(),
                self.xmin.into(),
                self.epoch.into(),
                self.catalog_xmin.into(),
                self.catalog_epoch.into(),
            ],
            buf,
        )
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut f = Fields::unpack_exact("Q I I I I", &payload)?;
        Ok(HotStandbyFeedback {
            clock: f.u64()?,
            xmin: f.u32()?,
            epoch: f.u32()?,
            catalog_xmin: f.u32()?,
            catalog_epoch: f.u32()?,
        })
    }
}

/// Write/flush/apply progress report. Declared for completeness; neither
/// direction of its codec is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub write: Lsn,
    pub flush: Lsn,
    pub apply: Lsn,
    pub clock: u64,
    pub reply: bool,
}

impl MessageBody for StandbyStatusUpdate {
    const NAME: &'static str = "StandbyStatusUpdate";
    const TAG: Option<u8> = Some(b'r');
    const DIRECTION: Direction = Direction::Frontend;

    fn encode(&self, _buf: &mut BytesMut) -> Result<()> {
        Err(PgWireError::Unsupported(
            "StandbyStatusUpdate encoding is not implemented".into(),
        ))
    }

    fn decode(_payload: Bytes) -> Result<Self> {
        Err(PgWireError::Unsupported(
            "StandbyStatusUpdate decoding is not implemented".into(),
        ))
    }
}

/// A sub-protocol message whose tag is not registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownReplicationMessage {
    pub tag: u8,
    pub payload: Bytes,
}

/// Every replication sub-protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    XLogData(XLogData),
    Keepalive(Keepalive),
    HotStandbyFeedback(HotStandbyFeedback),
    StandbyStatusUpdate(StandbyStatusUpdate),
    Unknown(UnknownReplicationMessage),
}

impl From<XLogData> for ReplicationMessage {
    fn from(m: XLogData) -> Self {
        ReplicationMessage::XLogData(m)
    }
}

impl From<Keepalive> for ReplicationMessage {
    fn from(m: Keepalive) -> Self {
        ReplicationMessage::Keepalive(m)
    }
}

impl From<HotStandbyFeedback> for ReplicationMessage {
    fn from(m: HotStandbyFeedback) -> Self {
        ReplicationMessage::HotStandbyFeedback(m)
    }
}

impl From<StandbyStatusUpdate> for ReplicationMessage {
    fn from(m: StandbyStatusUpdate) -> Self {
        ReplicationMessage::StandbyStatusUpdate(m)
    }
}

fn meta<T: MessageBody>(_: &T) -> (&'static str, u8, Direction) {
    // every replication variant is tagged
    (T::NAME, T::TAG.unwrap_or_default(), T::DIRECTION)
}

impl ReplicationMessage {
    fn meta(&self) -> (&'static str, u8, Direction) {
        match self {
            ReplicationMessage::XLogData(m) => meta(m),
            ReplicationMessage::Keepalive(m) => meta(m),
            ReplicationMessage::HotStandbyFeedback(m) => meta(m),
            ReplicationMessage::StandbyStatusUpdate(m) => meta(m),
            ReplicationMessage::Unknown(m) => ("UnknownReplicationMessage", m.tag, Direction::Both),
        }
    }

    pub fn name(&self) -> &'static str {
        self.meta().0
    }

    pub fn tag(&self) -> u8 {
        self.meta().1
    }

    pub fn direction(&self) -> Direction {
        self.meta().2
    }

    /// Returns true if this is a Keepalive asking for an immediate reply.
    #[inline]
    pub fn requires_reply(&self) -> bool {
        matches!(self, ReplicationMessage::Keepalive(Keepalive { ping: true, .. }))
    }

    /// Serialize to `tag | payload` as sent by `role`.
    pub fn render(&self, role: Role) -> Result<Bytes> {
        if !self.direction().permits(role) {
            return Err(PgWireError::DirectionViolation {
                message: self.name(),
                role,
            });
        }

        let mut out = BytesMut::with_capacity(64);
        out.put_u8(self.tag());
        match self {
            ReplicationMessage::XLogData(m) => m.encode(&mut out)?,
            ReplicationMessage::Keepalive(m) => m.encode(&mut out)?,
            ReplicationMessage::HotStandbyFeedback(m) => m.encode(&mut out)?,
            ReplicationMessage::StandbyStatusUpdate(m) => m.encode(&mut out)?,
            ReplicationMessage::Unknown(m) => out.put_slice(&m.payload),
        }
        Ok(out.freeze())
    }

    /// Render and wrap into the outer CopyData that carries it.
    pub fn wrap(&self, role: Role) -> Result<CopyData> {
        Ok(CopyData {
            data: self.render(role)?,
        })
    }

    /// Split a CopyData payload into inner tag and payload and decode it.
    pub fn from_copy_data(copy: &CopyData) -> Result<ReplicationMessage> {
        let Some(&tag) = copy.data.first() else {
            return Err(PgWireError::Protocol("empty CopyData payload".into()));
        };
        super::registry::decode_replication(tag, copy.data.slice(1..))
    }
}

/// PostgreSQL epoch (2000-01-01) in microseconds since Unix epoch.
pub const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// Convert Unix timestamp (micros) to PostgreSQL timestamp (micros since 2000-01-01).
#[inline]
pub fn unix_to_pg_timestamp(unix_micros: i64) -> i64 {
    unix_micros - PG_EPOCH_MICROS
}

/// Convert PostgreSQL timestamp to Unix timestamp (micros).
#[inline]
pub fn pg_to_unix_timestamp(pg_micros: i64) -> i64 {
    pg_micros + PG_EPOCH_MICROS
}

/// Current time as a replication clock value. A system clock set before
/// 2000 reads as 0.
pub fn pg_now() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let unix_micros = i64::try_from(now.as_micros()).unwrap_or(i64::MAX);
    u64::try_from(unix_to_pg_timestamp(unix_micros)).unwrap_or(0)
}
