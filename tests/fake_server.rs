//! Scripted backend over an in-memory pipe.
//!
//! Run with: `RUST_LOG=pg_replicant=debug cargo test --test fake_server`

use std::time::Duration;

use bytes::Bytes;
use pg_replicant::protocol::framing::read_frame;
use pg_replicant::protocol::messages::{
    AuthRequest, BackendKeyData, CommandComplete, CommandTag, CopyBothResponse, CopyData, DataRow,
    ErrorFields, ErrorResponse, FieldDescription, FormatCode, MessageBody, NoticeResponse,
    ParameterStatus, ReadyForQuery, RowDescription, Startup, TransactionStatus, UtilityCommand,
};
use pg_replicant::protocol::{
    HotStandbyFeedback, Keepalive, ReplicationMessage, XLogData, decode_message,
};
use pg_replicant::{
    ConnectionState, Lsn, Message, PgWireError, ReplicationClient, ReplicationConfig,
    ReplicationCursor, ReplicationEvent, ReplicationSession, Role, SessionEvent,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

fn config() -> ReplicationConfig {
    ReplicationConfig {
        idle_timeout: Duration::from_secs(5),
        buffer_events: 16,
        ..ReplicationConfig::default()
    }
}

const IDENTIFY_ROW: [(&str, Option<&str>); 4] = [
    ("systemid", Some("7350118822046584523")),
    ("timeline", Some("3")),
    ("xlogpos", Some("0/16B3748")),
    ("dbname", None),
];

struct FakeBackend {
    io: DuplexStream,
}

impl FakeBackend {
    async fn read_startup(&mut self) -> Startup {
        let len = self.io.read_i32().await.unwrap();
        let mut buf = vec![0u8; len as usize - 4];
        self.io.read_exact(&mut buf).await.unwrap();
        Startup::decode(Bytes::from(buf)).unwrap()
    }

    async fn send(&mut self, msg: impl Into<Message>) {
        let frame = msg.into().render(Role::Backend).unwrap();
        self.io.write_all(&frame).await.unwrap();
    }

    async fn send_raw(&mut self, frame: &[u8]) {
        self.io.write_all(frame).await.unwrap();
    }

    async fn send_repl(&mut self, msg: impl Into<ReplicationMessage>) {
        let copy = msg.into().wrap(Role::Backend).unwrap();
        self.send(copy).await;
    }

    async fn recv(&mut self) -> Message {
        let frame = read_frame(&mut self.io).await.unwrap();
        decode_message(frame.tag, frame.payload).unwrap()
    }

    async fn expect_query(&mut self) -> String {
        match self.recv().await {
            Message::Query(q) => q.sql,
            other => panic!("expected Query, got {other}"),
        }
    }

    async fn expect_repl(&mut self) -> ReplicationMessage {
        match self.recv().await {
            Message::CopyData(copy) => ReplicationMessage::from_copy_data(&copy).unwrap(),
            other => panic!("expected CopyData, got {other}"),
        }
    }

    async fn ready(&mut self) {
        self.send(ReadyForQuery {
            status: TransactionStatus::Idle,
        })
        .await;
    }

    async fn authenticate(&mut self) -> Startup {
        let startup = self.read_startup().await;
        self.send(AuthRequest::ok()).await;
        self.send(ParameterStatus {
            name: "server_version".into(),
            value: "16.2".into(),
        })
        .await;
        self.send(BackendKeyData {
            key: Bytes::from_static(&[0, 0, 0, 42, 1, 2, 3, 4]),
        })
        .await;
        self.ready().await;
        startup
    }

    async fn identify(&mut self, columns: &[(&str, Option<&str>)]) {
        assert_eq!(self.expect_query().await, "IDENTIFY_SYSTEM");
        self.send(RowDescription {
            fields: columns
                .iter()
                .map(|(name, _)| FieldDescription::text(*name, 25))
                .collect(),
        })
        .await;
        self.send(DataRow {
            values: columns
                .iter()
                .map(|(_, v)| v.map(|s| Bytes::copy_from_slice(s.as_bytes())))
                .collect(),
        })
        .await;
        self.send(CommandComplete {
            tag: CommandTag::Utility(UtilityCommand::IdentifySystem),
        })
        .await;
        self.ready().await;
    }

    async fn copy_both(&mut self) {
        self.send(CopyBothResponse::new(FormatCode::Binary, vec![]).unwrap())
            .await;
    }

    /// Full handshake; returns the START_REPLICATION command text.
    async fn serve_handshake(&mut self) -> String {
        self.authenticate().await;
        self.identify(&IDENTIFY_ROW).await;
        let start = self.expect_query().await;
        self.copy_both().await;
        start
    }
}

fn pipe() -> (DuplexStream, FakeBackend) {
    let (client, server) = duplex(64 * 1024);
    (client, FakeBackend { io: server })
}

fn xlog(start: u64, end: u64, records: &'static [u8]) -> XLogData {
    XLogData {
        start: Lsn(start),
        end: Lsn(end),
        clock: 0,
        records: Bytes::from_static(records),
    }
}

fn keepalive(end: u64, ping: bool) -> Keepalive {
    Keepalive {
        end: Lsn(end),
        clock: 0,
        ping,
    }
}

// ==================== Session: handshake ====================

#[tokio::test]
async fn handshake_reads_identify_row_by_column_name() {
    init_tracing();
    let (client, mut backend) = pipe();

    let server = tokio::spawn(async move {
        let startup = backend.authenticate().await;
        assert_eq!(startup.param("user"), Some("postgres"));
        assert_eq!(startup.param("replication"), Some("true"));

        // deliberately not the server's usual column order
        backend
            .identify(&[
                ("dbname", None),
                ("xlogpos", Some("0/16B3748")),
                ("timeline", Some("3")),
                ("systemid", Some("7350118822046584523")),
            ])
            .await;
        let start = backend.expect_query().await;
        backend.copy_both().await;
        (start, backend)
    });

    let session = ReplicationSession::handshake(client, &config())
        .await
        .unwrap();
    let (start, _backend) = server.await.unwrap();

    assert_eq!(start, "START_REPLICATION 0/16B3748 TIMELINE 3");
    assert_eq!(
        session.cursor(),
        ReplicationCursor::new(3, Lsn(0x16B_3748))
    );
    assert_eq!(
        session.system().system_id.as_deref(),
        Some("7350118822046584523")
    );
    assert_eq!(session.system().database, None);
    assert_eq!(
        session.connection().session().parameter("server_version"),
        Some("16.2")
    );
    assert_eq!(session.connection().state(), ConnectionState::InQuery);
}

#[tokio::test]
async fn handshake_resumes_from_configured_position() {
    let (client, mut backend) = pipe();
    let server = tokio::spawn(async move { backend.serve_handshake().await });

    let cfg = ReplicationConfig {
        resume_from: Some(Lsn::parse("1/A0").unwrap()),
        ..config()
    };
    let session = ReplicationSession::handshake(client, &cfg).await.unwrap();

    assert_eq!(
        server.await.unwrap(),
        "START_REPLICATION 1/A0 TIMELINE 3"
    );
    assert_eq!(session.cursor().position, Lsn(0x1_0000_00A0));
}

#[tokio::test]
async fn handshake_out_of_order_is_desync() {
    let (client, mut backend) = pipe();

    let server = tokio::spawn(async move {
        backend.authenticate().await;
        assert_eq!(backend.expect_query().await, "IDENTIFY_SYSTEM");
        // DataRow before RowDescription
        backend
            .send(DataRow {
                values: vec![Some(Bytes::from_static(b"1"))],
            })
            .await;
        backend
    });

    let err = ReplicationSession::handshake(client, &config())
        .await
        .err()
        .unwrap();
    assert!(
        matches!(err, PgWireError::ProtocolDesync(ref m) if m.contains("RowDescription")),
        "{err}"
    );
    assert!(err.is_fatal());
    server.await.unwrap();
}

#[tokio::test]
async fn handshake_error_response_is_desync_with_server_text() {
    let (client, mut backend) = pipe();

    let server = tokio::spawn(async move {
        backend.authenticate().await;
        backend.expect_query().await;
        backend
            .send(ErrorResponse(
                ErrorFields::default()
                    .with(b'S', "ERROR")
                    .with(b'C', "42501")
                    .with(b'M', "must be superuser or replication role"),
            ))
            .await;
        backend
    });

    let err = ReplicationSession::handshake(client, &config())
        .await
        .err()
        .unwrap();
    let PgWireError::ProtocolDesync(text) = err else {
        panic!("expected ProtocolDesync, got {err:?}");
    };
    assert!(text.contains("must be superuser or replication role (SQLSTATE 42501)"));
    server.await.unwrap();
}

#[tokio::test]
async fn start_replication_error_surfaces_as_server_error() {
    let (client, mut backend) = pipe();

    let server = tokio::spawn(async move {
        backend.authenticate().await;
        backend.identify(&IDENTIFY_ROW).await;
        backend.expect_query().await;
        backend
            .send(ErrorResponse(ErrorFields::default().with(
                b'M',
                "requested WAL segment has already been removed",
            )))
            .await;
        backend
    });

    let err = ReplicationSession::handshake(client, &config())
        .await
        .err()
        .unwrap();
    assert!(err.is_server(), "{err}");
    server.await.unwrap();
}

// ==================== Session: streaming ====================

#[tokio::test]
async fn xlogdata_is_unwrapped_and_advances_cursor() {
    let (client, mut backend) = pipe();
    let server = tokio::spawn(async move {
        backend.serve_handshake().await;
        backend.send_repl(xlog(0x16B_3748, 0x16B_4000, b"abc")).await;
        // a stale chunk must not move the cursor back
        backend.send_repl(xlog(0x16B_0000, 0x16B_4000, b"")).await;
        backend
    });

    let mut session = ReplicationSession::handshake(client, &config())
        .await
        .unwrap();

    let ev = session.recv().await.unwrap();
    let SessionEvent::Replication(ReplicationMessage::XLogData(x)) = ev else {
        panic!("expected XLogData, got {ev:?}");
    };
    assert_eq!(&x.records[..], b"abc");
    assert_eq!(session.cursor().position, Lsn(0x16B_374B));

    session.recv().await.unwrap();
    assert_eq!(session.cursor().position, Lsn(0x16B_374B));
    server.await.unwrap();
}

#[tokio::test]
async fn keepalive_ping_gets_exactly_one_feedback() {
    let (client, mut backend) = pipe();

    let server = tokio::spawn(async move {
        backend.serve_handshake().await;

        backend.send_repl(keepalive(10, true)).await;
        let reply = backend.expect_repl().await;
        let ReplicationMessage::HotStandbyFeedback(fb) = reply else {
            panic!("expected HotStandbyFeedback, got {reply:?}");
        };
        assert_eq!(fb.xmin, 0);
        assert!(fb.clock > 0);

        backend.send_repl(keepalive(11, false)).await;
        backend.send_repl(xlog(0, 12, b"x")).await;

        // the next thing on the wire is the client's CopyDone, not a second reply
        assert!(matches!(backend.recv().await, Message::CopyDone(_)));
        assert!(matches!(backend.recv().await, Message::Terminate(_)));
    });

    let mut session = ReplicationSession::handshake(client, &config())
        .await
        .unwrap();

    for _ in 0..3 {
        session.recv().await.unwrap();
    }
    session.shutdown().await;
    assert!(session.connection().is_closed());
    server.await.unwrap();
}

#[tokio::test]
async fn outer_messages_pass_through_while_streaming() {
    let (client, mut backend) = pipe();
    let server = tokio::spawn(async move {
        backend.serve_handshake().await;
        backend
            .send(NoticeResponse(ErrorFields::default().with(b'M', "hello")))
            .await;
        backend
            .send(ErrorResponse(
                ErrorFields::default().with(b'M', "terminating connection"),
            ))
            .await;
        backend
    });

    let mut session = ReplicationSession::handshake(client, &config())
        .await
        .unwrap();
    assert!(matches!(
        session.recv().await.unwrap(),
        SessionEvent::Message(Message::NoticeResponse(_))
    ));
    let SessionEvent::Message(Message::ErrorResponse(err)) = session.recv().await.unwrap() else {
        panic!("expected ErrorResponse");
    };
    assert_eq!(err.0.message(), Some("terminating connection"));
    server.await.unwrap();
}

#[tokio::test]
async fn unknown_inner_tag_is_not_fatal() {
    let (client, mut backend) = pipe();
    let server = tokio::spawn(async move {
        backend.serve_handshake().await;
        backend
            .send(CopyData {
                data: Bytes::from_static(b"?raw"),
            })
            .await;
        backend.send_repl(keepalive(1, false)).await;
        backend
    });

    let mut session = ReplicationSession::handshake(client, &config())
        .await
        .unwrap();
    let ev = session.recv().await.unwrap();
    assert!(matches!(
        ev,
        SessionEvent::Replication(ReplicationMessage::Unknown(ref u)) if u.tag == b'?' && &u.payload[..] == b"raw"
    ));
    assert!(matches!(
        session.recv().await.unwrap(),
        SessionEvent::Replication(ReplicationMessage::Keepalive(_))
    ));
    server.await.unwrap();
}

// ==================== Driver ====================

#[tokio::test]
async fn client_streams_and_stops_cleanly() {
    init_tracing();
    let (client, mut backend) = pipe();

    let server = tokio::spawn(async move {
        backend.serve_handshake().await;
        backend.send_repl(xlog(0x16B_3748, 0x16B_4000, b"abcd")).await;
        // wait for the client to hang up
        assert!(matches!(backend.recv().await, Message::CopyDone(_)));
        assert!(matches!(backend.recv().await, Message::Terminate(_)));
    });

    let mut repl = ReplicationClient::spawn_on_stream(client, config());

    let ReplicationEvent::Started { system, cursor } = repl.recv().await.unwrap() else {
        panic!("expected Started");
    };
    assert_eq!(system.timeline, 3);
    assert_eq!(cursor, ReplicationCursor::new(3, Lsn(0x16B_3748)));

    let ReplicationEvent::XLogData(x) = repl.recv().await.unwrap() else {
        panic!("expected XLogData");
    };
    assert_eq!(&x.records[..], b"abcd");
    assert_eq!(repl.cursor().map(|c| c.position), Some(Lsn(0x16B_374C)));

    repl.stop();
    server.await.unwrap();
    repl.join().await.unwrap();
}

#[tokio::test]
async fn client_answers_pings_and_forwards_sends() {
    let (client, mut backend) = pipe();

    let server = tokio::spawn(async move {
        backend.serve_handshake().await;
        backend.send_repl(keepalive(5, true)).await;
        assert!(matches!(
            backend.expect_repl().await,
            ReplicationMessage::HotStandbyFeedback(_)
        ));

        let sent = backend.expect_repl().await;
        assert_eq!(
            sent,
            ReplicationMessage::HotStandbyFeedback(HotStandbyFeedback {
                clock: 1,
                xmin: 77,
                ..HotStandbyFeedback::default()
            })
        );
        backend.send_repl(keepalive(6, false)).await;
        backend
    });

    let mut repl = ReplicationClient::spawn_on_stream(client, config());
    assert!(matches!(
        repl.recv().await.unwrap(),
        ReplicationEvent::Started { .. }
    ));
    assert!(matches!(
        repl.recv().await.unwrap(),
        ReplicationEvent::Keepalive(Keepalive { ping: true, .. })
    ));

    repl.send(HotStandbyFeedback {
        clock: 1,
        xmin: 77,
        ..HotStandbyFeedback::default()
    })
    .await
    .unwrap();
    assert!(matches!(
        repl.recv().await.unwrap(),
        ReplicationEvent::Keepalive(Keepalive { ping: false, .. })
    ));

    let _backend = server.await.unwrap();
    repl.stop();
    repl.join().await.unwrap();
}

#[tokio::test]
async fn client_stops_at_configured_position() {
    let (client, mut backend) = pipe();

    let server = tokio::spawn(async move {
        backend.serve_handshake().await;
        backend.send_repl(xlog(0x100, 0x180, b"a")).await;
        backend.send_repl(xlog(0x180, 0x200, b"b")).await;
        backend.send_repl(xlog(0x200, 0x280, b"c")).await;
        backend
    });

    let cfg = ReplicationConfig {
        stop_at: Some(Lsn(0x200)),
        ..config()
    };
    let mut repl = ReplicationClient::spawn_on_stream(client, cfg);

    let mut records = Vec::new();
    let reached = loop {
        match repl.recv().await.unwrap() {
            ReplicationEvent::XLogData(x) => records.push(x.records),
            ReplicationEvent::StoppedAt { reached } => break reached,
            _ => {}
        }
    };
    assert_eq!(reached, Lsn(0x200));
    assert_eq!(records, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

    // the worker is gone; the channel drains to a task error
    assert!(matches!(repl.recv().await, Err(PgWireError::Task(_))));
    let _backend = server.await.unwrap();
}

#[tokio::test]
async fn client_forwards_decode_errors_and_keeps_going() {
    let (client, mut backend) = pipe();

    let server = tokio::spawn(async move {
        backend.serve_handshake().await;
        // keepalive one byte short
        let mut bad = vec![b'd', 0, 0, 0, 4 + 17, b'k'];
        bad.extend_from_slice(&[0u8; 16]);
        backend.send_raw(&bad).await;
        backend.send_repl(xlog(0, 1, b"ok")).await;
        backend
    });

    let mut repl = ReplicationClient::spawn_on_stream(client, config());
    assert!(matches!(
        repl.recv().await.unwrap(),
        ReplicationEvent::Started { .. }
    ));

    let err = repl.recv().await.unwrap_err();
    assert!(err.is_decode(), "{err}");
    assert!(matches!(
        repl.recv().await.unwrap(),
        ReplicationEvent::XLogData(_)
    ));

    let _backend = server.await.unwrap();
    repl.stop();
    repl.join().await.unwrap();
}

#[tokio::test]
async fn client_reports_server_disconnect() {
    let (client, mut backend) = pipe();

    let server = tokio::spawn(async move {
        backend.serve_handshake().await;
        drop(backend);
    });

    let mut repl = ReplicationClient::spawn_on_stream(client, config());
    assert!(matches!(
        repl.recv().await.unwrap(),
        ReplicationEvent::Started { .. }
    ));
    assert_eq!(repl.recv().await.unwrap_err(), PgWireError::ConnectionClosed);
    server.await.unwrap();
}

#[tokio::test]
async fn client_rejects_password_authentication() {
    let (client, mut backend) = pipe();

    let server = tokio::spawn(async move {
        backend.read_startup().await;
        backend
            .send(AuthRequest {
                kind: pg_replicant::protocol::AuthKind::CleartextPassword,
                data: Bytes::new(),
            })
            .await;
        backend
    });

    let mut repl = ReplicationClient::spawn_on_stream(client, config());
    let err = repl.recv().await.unwrap_err();
    assert!(
        matches!(err, PgWireError::Unsupported(ref m) if m.contains("CleartextPassword")),
        "{err}"
    );
    let _backend = server.await.unwrap();
}
