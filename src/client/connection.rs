use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{PgWireError, Result};
use crate::protocol::framing::{FrameReader, write_frame};
use crate::protocol::messages::{
    AuthKind, BackendKeyData, CancelRequest, Message, Startup, Terminate, TransactionStatus,
};
use crate::protocol::{Role, decode_message};

/// Coarse protocol state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open, StartupMessage not sent yet.
    Connecting,
    /// StartupMessage sent; waiting for authentication to finish.
    AwaitingAuth,
    /// Idle; a query may be sent.
    Ready,
    /// A query is in flight (this includes a running replication stream).
    InQuery,
    Closed,
}

/// Backend-reported state cached while messages pass through.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    cancel_key: Option<BackendKeyData>,
    parameters: HashMap<String, String>,
    transaction: Option<TransactionStatus>,
    running: bool,
}

impl SessionState {
    pub fn cancel_key(&self) -> Option<&BackendKeyData> {
        self.cancel_key.as_ref()
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Status from the most recent ReadyForQuery.
    pub fn transaction(&self) -> Option<TransactionStatus> {
        self.transaction
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// A frontend connection: owns the stream, frames messages, enforces
/// direction and tracks [`ConnectionState`].
///
/// Callers only ever see whole [`Message`]s. Any fatal error (see
/// [`PgWireError::is_fatal`]) closes the connection; later calls fail with
/// `ConnectionClosed`.
pub struct Connection<S> {
    stream: S,
    reader: FrameReader,
    state: ConnectionState,
    session: SessionState,
}

impl Connection<TcpStream> {
    /// Open a TCP connection and complete startup.
    pub async fn connect(cfg: &ConnectionConfig) -> Result<Self> {
        let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port)).await?;
        tcp.set_nodelay(true)?;

        let mut conn = Connection::new(tcp);
        conn.startup(cfg.startup_message()).await?;
        Ok(conn)
    }

    /// Ask the server to cancel whatever this connection is running.
    ///
    /// Uses a fresh socket to `host:port`, as the protocol requires.
    pub async fn cancel(&self, host: &str, port: u16) -> Result<()> {
        let mut tcp = TcpStream::connect((host, port)).await?;
        self.send_cancel_request(&mut tcp).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            reader: FrameReader::new(),
            state: ConnectionState::Connecting,
            session: SessionState {
                running: true,
                ..SessionState::default()
            },
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Send `startup` and drain authentication until the first ReadyForQuery.
    ///
    /// Only AuthenticationOk is accepted; any other request fails with
    /// `Unsupported` naming the method.
    pub async fn startup(&mut self, startup: Startup) -> Result<()> {
        if self.state != ConnectionState::Connecting {
            return Err(self.abort(PgWireError::ProtocolDesync(format!(
                "startup in state {:?}",
                self.state
            ))));
        }
        self.send(startup).await?;

        loop {
            match self.recv().await? {
                Message::AuthRequest(req) if req.kind == AuthKind::Ok => {
                    debug!("authentication ok");
                }
                Message::AuthRequest(req) => {
                    self.mark_closed();
                    return Err(PgWireError::Unsupported(format!(
                        "authentication method {:?}",
                        req.kind
                    )));
                }
                Message::ErrorResponse(err) => {
                    self.mark_closed();
                    return Err(err.into_error());
                }
                Message::ReadyForQuery(_) => break,
                // ParameterStatus / BackendKeyData are cached by recv()
                _ => {}
            }
        }

        info!(
            server_version = self.session.parameter("server_version").unwrap_or("?"),
            "connection ready"
        );
        Ok(())
    }

    /// Send one frontend message; the whole frame is flushed before returning.
    pub async fn send(&mut self, msg: impl Into<Message>) -> Result<()> {
        self.ensure_open()?;
        let msg = msg.into();

        let frame = match msg.render(Role::Frontend) {
            Ok(frame) => frame,
            Err(e) => return Err(self.abort(e)),
        };
        debug!("--> {msg}");
        if let Err(e) = write_frame(&mut self.stream, &frame).await {
            return Err(self.abort(e));
        }

        match msg {
            Message::Startup(_) => self.state = ConnectionState::AwaitingAuth,
            Message::Query(_) if self.state == ConnectionState::Ready => {
                self.state = ConnectionState::InQuery;
            }
            Message::Terminate(_) => self.mark_closed(),
            _ => {}
        }
        Ok(())
    }

    /// Receive the next backend message.
    ///
    /// Cancel-safe: dropping the future mid-frame loses nothing. A decode
    /// failure for a single message is returned as-is (the frame has been
    /// consumed, the connection stays usable); fatal errors close it.
    pub async fn recv(&mut self) -> Result<Message> {
        self.ensure_open()?;

        let frame = match self.reader.read_frame(&mut self.stream).await {
            Ok(frame) => frame,
            Err(e) => return Err(self.abort(e)),
        };

        let msg = match decode_message(frame.tag, frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(tag = ?(frame.tag as char), error = %e, "failed to decode message");
                return Err(self.abort(e));
            }
        };

        if !msg.direction().permits(Role::Backend) {
            return Err(self.abort(PgWireError::DirectionViolation {
                message: msg.name(),
                role: Role::Backend,
            }));
        }

        debug!("<-- {msg}");
        self.observe(&msg);
        Ok(msg)
    }

    fn observe(&mut self, msg: &Message) {
        match msg {
            Message::ParameterStatus(p) => {
                self.session
                    .parameters
                    .insert(p.name.clone(), p.value.clone());
            }
            Message::BackendKeyData(key) => self.session.cancel_key = Some(key.clone()),
            Message::ReadyForQuery(r) => {
                self.session.transaction = Some(r.status);
                self.state = ConnectionState::Ready;
            }
            _ => {}
        }
    }

    /// Write a CancelRequest for this connection to `stream`, which must be a
    /// fresh connection to the same server.
    pub async fn send_cancel_request<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<()> {
        let key = self
            .session
            .cancel_key
            .clone()
            .ok_or_else(|| PgWireError::Protocol("no cancellation key received".into()))?;
        let frame = Message::from(CancelRequest { key }).render(Role::Frontend)?;
        write_frame(stream, &frame).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    /// Send Terminate (best-effort) and shut the stream down.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.send(Terminate).await {
            debug!("terminate failed: {e}");
        }
        self.mark_closed();
        let _ = self.stream.shutdown().await;
    }

    /// Record `err`, closing the connection if it is fatal, and hand it back.
    pub(crate) fn abort(&mut self, err: PgWireError) -> PgWireError {
        if err.is_fatal() {
            warn!(error = %err, "closing connection");
            self.mark_closed();
        }
        err
    }

    fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.session.running = false;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PgWireError::ConnectionClosed);
        }
        Ok(())
    }
}
