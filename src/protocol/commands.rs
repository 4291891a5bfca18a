//! Replication commands, sent as plain simple-protocol queries.

use super::messages::Query;
use crate::error::Result;
use crate::lsn::Lsn;

pub fn identify_system() -> Query {
    Query::new("IDENTIFY_SYSTEM")
}

/// `START_REPLICATION <position> TIMELINE <timeline>` (physical replication).
pub fn start_replication(position: Lsn, timeline: u32) -> Query {
    Query::new(format!("START_REPLICATION {position} TIMELINE {timeline}"))
}

/// Like [`start_replication`], for a position in its textual `HI/LO` form.
pub fn start_replication_at(position: &str, timeline: u32) -> Result<Query> {
    Ok(start_replication(Lsn::parse(position)?, timeline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PgWireError;

    #[test]
    fn command_text() {
        assert_eq!(identify_system().sql, "IDENTIFY_SYSTEM");
        assert_eq!(
            start_replication(Lsn(0x1_0000_00A0), 3).sql,
            "START_REPLICATION 1/A0 TIMELINE 3"
        );
        assert_eq!(
            start_replication_at("0/16B3748", 1).unwrap().sql,
            "START_REPLICATION 0/16B3748 TIMELINE 1"
        );
    }

    #[test]
    fn position_needs_one_slash() {
        assert!(matches!(
            start_replication_at("0/1/2", 1),
            Err(PgWireError::InvalidFormat(_))
        ));
        assert!(matches!(
            start_replication_at("16B3748", 1),
            Err(PgWireError::InvalidFormat(_))
        ));
    }
}
