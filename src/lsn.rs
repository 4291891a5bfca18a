use std::fmt;
use std::str::FromStr;

use crate::error::{PgWireError, Result};

/// Write-ahead log position, printed as `HI/LO` in hex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    /// Parse `"16/B374D848"`. Exactly one `/` is required.
    pub fn parse(s: &str) -> Result<Lsn> {
        let invalid = || PgWireError::InvalidFormat(format!("invalid log position: {s:?}"));

        let (hi, lo) = s.split_once('/').ok_or_else(invalid)?;
        if lo.contains('/') || hi.is_empty() || lo.is_empty() {
            return Err(invalid());
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }

    pub fn to_pg_string(self) -> String {
        format!("{:X}/{:X}", (self.0 >> 32) as u32, self.0 as u32)
    }

    /// `self + n`, saturating at the top of the address space.
    #[inline]
    pub fn advance(self, n: u64) -> Lsn {
        Lsn(self.0.saturating_add(n))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_pg_string())
    }
}

impl FromStr for Lsn {
    type Err = PgWireError;

    fn from_str(s: &str) -> Result<Lsn> {
        Lsn::parse(s)
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

/// Where streaming stands: the timeline and the first byte not yet received.
///
/// Learned from IDENTIFY_SYSTEM, then advanced by every XLogData. This is the
/// resume point after a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplicationCursor {
    pub timeline: u32,
    pub position: Lsn,
}

impl ReplicationCursor {
    pub fn new(timeline: u32, position: Lsn) -> ReplicationCursor {
        ReplicationCursor { timeline, position }
    }

    /// Move to `position` if it lies ahead; the cursor never moves backwards.
    /// Returns whether it moved.
    pub fn advance_to(&mut self, position: Lsn) -> bool {
        if position > self.position {
            self.position = position;
            return true;
        }
        false
    }
}

impl fmt::Display for ReplicationCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on timeline {}", self.position, self.timeline)
    }
}

/// The IDENTIFY_SYSTEM result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifySystem {
    pub system_id: Option<String>,
    pub timeline: u32,
    pub position: Lsn,
    /// Set only on database-specific (logical) replication connections.
    pub database: Option<String>,
}

impl IdentifySystem {
    pub fn cursor(&self) -> ReplicationCursor {
        ReplicationCursor::new(self.timeline, self.position)
    }
}
