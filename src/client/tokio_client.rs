use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ReplicationConfig;
use crate::error::{PgWireError, Result};
use crate::lsn::ReplicationCursor;
use crate::protocol::replication::ReplicationMessage;

use super::worker::{ReplicationEvent, ReplicationEventReceiver, WorkerState};

/// Outbound messages queued for the worker.
const COMMAND_BUFFER: usize = 16;

/// Handle to a background replication worker.
///
/// The worker owns the connection and is its only writer; this handle talks
/// to it through channels. Dropping the handle without calling
/// [`stop`](Self::stop) ends the worker at its next event, when the event
/// channel turns out to be closed.
pub struct ReplicationClient {
    rx: ReplicationEventReceiver,
    cmd_tx: mpsc::Sender<ReplicationMessage>,
    cursor_rx: watch::Receiver<Option<ReplicationCursor>>,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReplicationClient {
    /// Spawn a worker that connects over TCP and starts streaming.
    ///
    /// Connection and handshake errors are delivered through [`recv`](Self::recv).
    pub async fn connect(cfg: ReplicationConfig) -> Result<Self> {
        Ok(Self::spawn(cfg, |mut worker, cfg| async move {
            let tcp =
                TcpStream::connect((cfg.connection.host.as_str(), cfg.connection.port)).await?;
            tcp.set_nodelay(true)?;
            worker.run_on_stream(tcp).await
        }))
    }

    /// Like [`connect`](Self::connect), over an already established stream.
    pub fn spawn_on_stream<S>(stream: S, cfg: ReplicationConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(cfg, |mut worker, _cfg| async move {
            worker.run_on_stream(stream).await
        })
    }

    fn spawn<F, Fut>(cfg: ReplicationConfig, run: F) -> Self
    where
        F: FnOnce(WorkerState, ReplicationConfig) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(cfg.buffer_events.max(1));
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (cursor_tx, cursor_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let worker = WorkerState::new(cfg.clone(), stop_rx, cmd_rx, cursor_tx, tx.clone());
            if let Err(e) = run(worker, cfg).await {
                tracing::error!(error = %e, "replication worker failed");
                let _ = tx.send(Err(e)).await;
            }
        });

        Self {
            rx,
            cmd_tx,
            cursor_rx,
            stop_tx,
            join,
        }
    }

    /// Next event, or the error the worker hit.
    ///
    /// Once the worker has exited and the buffer is drained this returns
    /// `Task`.
    pub async fn recv(&mut self) -> Result<ReplicationEvent> {
        self.rx
            .recv()
            .await
            .unwrap_or_else(|| Err(PgWireError::Task("replication worker has exited".into())))
    }

    /// Queue a frontend replication message; the worker sends it inside CopyData.
    pub async fn send(&self, msg: impl Into<ReplicationMessage>) -> Result<()> {
        self.cmd_tx
            .send(msg.into())
            .await
            .map_err(|_| PgWireError::Task("replication worker is gone".into()))
    }

    /// Latest replication cursor; `None` until the handshake has finished.
    pub fn cursor(&self) -> Option<ReplicationCursor> {
        *self.cursor_rx.borrow()
    }

    /// Ask the worker to end the stream. It sends CopyDone and Terminate,
    /// then exits; events already buffered can still be received.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Wait for the worker task to finish.
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| PgWireError::Task(format!("replication worker panicked: {e}")))
    }
}
