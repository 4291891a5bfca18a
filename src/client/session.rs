use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::connection::Connection;
use crate::config::ReplicationConfig;
use crate::error::{PgWireError, Result};
use crate::lsn::{IdentifySystem, Lsn, ReplicationCursor};
use crate::protocol::messages::{DataRow, Message, RowDescription};
use crate::protocol::replication::{HotStandbyFeedback, ReplicationMessage};
use crate::protocol::{Role, identify_system, start_replication};

/// What [`ReplicationSession::recv`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Decoded from a CopyData payload.
    Replication(ReplicationMessage),
    /// Any other outer message, passed through unchanged (ErrorResponse,
    /// NoticeResponse, the server's CopyDone...).
    Message(Message),
}

/// A connection in streaming replication mode.
pub struct ReplicationSession<S> {
    conn: Connection<S>,
    system: IdentifySystem,
    cursor: ReplicationCursor,
    feedback_xmin: u32,
}

impl ReplicationSession<TcpStream> {
    pub async fn connect(cfg: &ReplicationConfig) -> Result<Self> {
        let tcp = TcpStream::connect((cfg.connection.host.as_str(), cfg.connection.port)).await?;
        tcp.set_nodelay(true)?;
        Self::handshake(tcp, cfg).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ReplicationSession<S> {
    /// Run startup, IDENTIFY_SYSTEM and START_REPLICATION on `stream`.
    ///
    /// Returns once the server has answered with CopyBothResponse.
    pub async fn handshake(stream: S, cfg: &ReplicationConfig) -> Result<Self> {
        let mut conn = Connection::new(stream);
        conn.startup(cfg.connection.startup_message()).await?;

        let system = identify(&mut conn).await?;
        info!(
            timeline = system.timeline,
            position = %system.position,
            system_id = system.system_id.as_deref().unwrap_or("?"),
            "identified system"
        );

        let cursor = ReplicationCursor::new(
            system.timeline,
            cfg.resume_from.unwrap_or(system.position),
        );
        conn.send(start_replication(cursor.position, cursor.timeline))
            .await?;

        loop {
            match conn.recv().await? {
                Message::CopyBothResponse(_) => break,
                Message::ErrorResponse(err) => {
                    conn.close().await;
                    return Err(err.into_error());
                }
                Message::NoticeResponse(notice) => debug!("notice: {}", notice.0),
                other => {
                    return Err(conn.abort(PgWireError::ProtocolDesync(format!(
                        "expected CopyBothResponse, got {}",
                        other.name()
                    ))));
                }
            }
        }
        info!(cursor = %cursor, "streaming started");

        Ok(Self {
            conn,
            system,
            cursor,
            feedback_xmin: cfg.feedback_xmin,
        })
    }

    pub fn system(&self) -> &IdentifySystem {
        &self.system
    }

    /// Position after the last XLogData received.
    pub fn cursor(&self) -> ReplicationCursor {
        self.cursor
    }

    pub fn connection(&self) -> &Connection<S> {
        &self.conn
    }

    /// Receive the next event, replying to keepalive pings before returning.
    pub async fn recv(&mut self) -> Result<SessionEvent> {
        let event = self.read_event().await?;
        self.handle(&event).await?;
        Ok(event)
    }

    /// Read and decode the next event without acting on it.
    ///
    /// Cancel-safe. Callers that use this instead of [`recv`](Self::recv)
    /// must pass every event to [`handle`](Self::handle).
    pub(crate) async fn read_event(&mut self) -> Result<SessionEvent> {
        match self.conn.recv().await? {
            Message::CopyData(copy) => ReplicationMessage::from_copy_data(&copy)
                .map(SessionEvent::Replication)
                .map_err(|e| self.conn.abort(e)),
            other => Ok(SessionEvent::Message(other)),
        }
    }

    /// Advance the cursor and answer keepalive pings.
    pub(crate) async fn handle(&mut self, event: &SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Replication(ReplicationMessage::XLogData(x)) => {
                self.cursor.advance_to(x.next_position());
            }
            SessionEvent::Replication(msg) if msg.requires_reply() => {
                self.send(HotStandbyFeedback::now(self.feedback_xmin))
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Send a sub-protocol message inside CopyData.
    pub async fn send(&mut self, msg: impl Into<ReplicationMessage>) -> Result<()> {
        let copy = match msg.into().wrap(Role::Frontend) {
            Ok(copy) => copy,
            Err(e) => return Err(self.conn.abort(e)),
        };
        self.conn.send(copy).await
    }

    /// End the stream: CopyDone then Terminate, both best-effort.
    pub async fn shutdown(&mut self) {
        if self.conn.is_closed() {
            return;
        }
        if let Err(e) = self.conn.send(crate::protocol::CopyDone).await {
            debug!("copy done failed: {e}");
        }
        self.conn.close().await;
    }
}

/// IDENTIFY_SYSTEM: exactly RowDescription, DataRow, CommandComplete,
/// ReadyForQuery. Anything else is `ProtocolDesync`.
async fn identify<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut Connection<S>,
) -> Result<IdentifySystem> {
    conn.send(identify_system()).await?;

    let desc = match expect(conn, "RowDescription").await? {
        Message::RowDescription(desc) => desc,
        other => return Err(desync(conn, "RowDescription", &other)),
    };
    let row = match expect(conn, "DataRow").await? {
        Message::DataRow(row) => row,
        other => return Err(desync(conn, "DataRow", &other)),
    };
    match expect(conn, "CommandComplete").await? {
        Message::CommandComplete(_) => {}
        other => return Err(desync(conn, "CommandComplete", &other)),
    }
    match expect(conn, "ReadyForQuery").await? {
        Message::ReadyForQuery(_) => {}
        other => return Err(desync(conn, "ReadyForQuery", &other)),
    }

    parse_identify_row(&desc, &row).map_err(|e| conn.abort(e))
}

async fn expect<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut Connection<S>,
    want: &str,
) -> Result<Message> {
    conn.recv().await.map_err(|e| match e {
        // a decode failure here still breaks the sequence
        e if e.is_decode() => conn.abort(PgWireError::ProtocolDesync(format!(
            "expected {want}: {e}"
        ))),
        e => e,
    })
}

fn desync<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut Connection<S>,
    want: &str,
    got: &Message,
) -> PgWireError {
    let detail = match got {
        Message::ErrorResponse(err) => format!("expected {want}, got error: {}", err.0),
        other => format!("expected {want}, got {}", other.name()),
    };
    conn.abort(PgWireError::ProtocolDesync(detail))
}

fn parse_identify_row(desc: &RowDescription, row: &DataRow) -> Result<IdentifySystem> {
    let column = |name: &str| -> Result<Option<String>> {
        let Some(idx) = desc.column_index(name) else {
            return Ok(None);
        };
        row.text(idx)
            .map(|v| v.map(str::to_owned))
            .map_err(|e| PgWireError::ProtocolDesync(format!("IDENTIFY_SYSTEM {name}: {e}")))
    };
    let required = |name: &str| -> Result<String> {
        column(name)?.ok_or_else(|| {
            PgWireError::ProtocolDesync(format!("IDENTIFY_SYSTEM row has no {name} column"))
        })
    };

    let timeline = required("timeline")?;
    let timeline = timeline.parse::<u32>().map_err(|_| {
        PgWireError::ProtocolDesync(format!("IDENTIFY_SYSTEM timeline {timeline:?}"))
    })?;
    let position = Lsn::parse(&required("xlogpos")?)
        .map_err(|e| PgWireError::ProtocolDesync(format!("IDENTIFY_SYSTEM xlogpos: {e}")))?;

    Ok(IdentifySystem {
        system_id: column("systemid")?,
        timeline,
        position,
        database: column("dbname")?,
    })
}
