use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::session::{ReplicationSession, SessionEvent};
use crate::config::ReplicationConfig;
use crate::error::{PgWireError, Result};
use crate::lsn::{IdentifySystem, Lsn, ReplicationCursor};
use crate::protocol::messages::Message;
use crate::protocol::replication::{Keepalive, ReplicationMessage, XLogData};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// Handshake done; streaming begins at `cursor`.
    Started {
        system: IdentifySystem,
        cursor: ReplicationCursor,
    },
    XLogData(XLogData),
    /// Pings have already been answered when this is delivered.
    Keepalive(Keepalive),
    /// Any other replication message (unknown tags included).
    Replication(ReplicationMessage),
    /// An outer message received while streaming (notice, the server's
    /// CopyDone, the CommandComplete that follows it...).
    Message(Message),

    /// Emitted when an XLogData ending at or past `stop_at` has been delivered.
    StoppedAt { reached: Lsn },
}

pub type ReplicationEventReceiver =
    mpsc::Receiver<std::result::Result<ReplicationEvent, PgWireError>>;

pub struct WorkerState {
    cfg: ReplicationConfig,
    stop_rx: watch::Receiver<bool>,
    cmd_rx: mpsc::Receiver<ReplicationMessage>,
    cursor_tx: watch::Sender<Option<ReplicationCursor>>,
    out: mpsc::Sender<std::result::Result<ReplicationEvent, PgWireError>>,
}

impl WorkerState {
    pub fn new(
        cfg: ReplicationConfig,
        stop_rx: watch::Receiver<bool>,
        cmd_rx: mpsc::Receiver<ReplicationMessage>,
        cursor_tx: watch::Sender<Option<ReplicationCursor>>,
        out: mpsc::Sender<std::result::Result<ReplicationEvent, PgWireError>>,
    ) -> Self {
        Self {
            cfg,
            stop_rx,
            cmd_rx,
            cursor_tx,
            out,
        }
    }

    pub async fn run_on_stream<S: AsyncRead + AsyncWrite + Unpin>(&mut self, stream: S) -> Result<()> {
        let mut session = ReplicationSession::handshake(stream, &self.cfg).await?;

        let cursor = session.cursor();
        self.cursor_tx.send_replace(Some(cursor));
        let started = ReplicationEvent::Started {
            system: session.system().clone(),
            cursor,
        };

        let res = if self.emit(Ok(started)).await {
            self.stream(&mut session).await
        } else {
            Ok(())
        };
        session.shutdown().await;
        res
    }

    async fn stream<S: AsyncRead + AsyncWrite + Unpin>(
        &mut self,
        session: &mut ReplicationSession<S>,
    ) -> Result<()> {
        loop {
            // Only cancel-safe futures race here; everything after the
            // select runs to completion.
            let read = tokio::select! {
                biased;

                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        info!(cursor = %session.cursor(), "stop requested");
                        return Ok(());
                    }
                    continue;
                }

                Some(msg) = self.cmd_rx.recv() => {
                    if let Err(e) = session.send(msg).await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        if !self.emit(Err(e)).await {
                            return Ok(());
                        }
                    }
                    continue;
                }

                read = tokio::time::timeout(self.cfg.idle_timeout, session.read_event()) => {
                    read.map_err(|_| PgWireError::Protocol("replication idle timeout".into()))
                        .and_then(|r| r)
                }
            };

            let event = match read {
                Ok(event) => event,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable message");
                    if !self.emit(Err(e)).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            session.handle(&event).await?;
            self.cursor_tx.send_if_modified(|current| {
                let next = Some(session.cursor());
                if *current == next {
                    return false;
                }
                *current = next;
                true
            });

            let event = match event {
                SessionEvent::Replication(ReplicationMessage::XLogData(x)) => {
                    // Optional stop condition: best-effort based on WAL end
                    if let Some(stop) = self.cfg.stop_at
                        && x.end >= stop
                    {
                        let reached = x.end;
                        if self.emit(Ok(ReplicationEvent::XLogData(x))).await {
                            self.emit(Ok(ReplicationEvent::StoppedAt { reached })).await;
                        }
                        info!(%reached, "reached stop position");
                        return Ok(());
                    }
                    ReplicationEvent::XLogData(x)
                }
                SessionEvent::Replication(ReplicationMessage::Keepalive(k)) => {
                    ReplicationEvent::Keepalive(k)
                }
                SessionEvent::Replication(other) => ReplicationEvent::Replication(other),
                SessionEvent::Message(Message::ErrorResponse(err)) => {
                    return Err(err.into_error());
                }
                SessionEvent::Message(other) => ReplicationEvent::Message(other),
            };

            if !self.emit(Ok(event)).await {
                return Ok(());
            }
        }
    }

    /// Deliver to the consumer. Returns false once the receiver is gone.
    async fn emit(&self, ev: std::result::Result<ReplicationEvent, PgWireError>) -> bool {
        if self.out.send(ev).await.is_err() {
            debug!("event receiver dropped; stopping");
            return false;
        }
        true
    }
}
