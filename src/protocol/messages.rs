//! Outer (frontend/backend) protocol messages.
//!
//! Every variant is a plain struct implementing [`MessageBody`], which ties it
//! to its wire tag, its allowed [`Direction`] and its payload codec. The closed
//! set of variants is collected in [`Message`]; incoming frames are turned into
//! a `Message` by [`registry::decode_message`](super::registry::decode_message).
//!
//! Outer envelope: `tag(1) | length(4, self-inclusive) | payload`, except the
//! startup and cancel requests which have no tag byte.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{Fields, FormatSpec, Value, pack_into, unpack_from};
use super::direction::{Direction, Role};
use crate::error::{PgWireError, Result};

/// Protocol 3.0: major version in the high 16 bits, minor in the low 16.
pub const PROTOCOL_VERSION: u32 = 3 << 16;

/// Magic "version" word identifying a CancelRequest.
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// Per-variant metadata and payload codec.
///
/// `encode` writes the payload only; framing (tag and length word) is added by
/// the enclosing protocol's `render`.
pub trait MessageBody: Sized {
    const NAME: &'static str;
    /// `None` for the tag-less startup-phase messages.
    const TAG: Option<u8>;
    const DIRECTION: Direction;

    fn encode(&self, buf: &mut BytesMut) -> Result<()>;
    fn decode(payload: Bytes) -> Result<Self>;
}

fn expect_consumed(consumed: usize, payload: &[u8]) -> Result<()> {
    if consumed != payload.len() {
        return Err(PgWireError::LengthMismatch {
            expected: consumed,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Column/copy format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatCode {
    Text,
    Binary,
}

impl FormatCode {
    pub fn from_code(code: i16) -> Result<FormatCode> {
        match code {
            0 => Ok(FormatCode::Text),
            1 => Ok(FormatCode::Binary),
            other => Err(PgWireError::UnknownEnumValue {
                kind: "format code",
                value: i64::from(other),
            }),
        }
    }

    pub fn code(self) -> i16 {
        match self {
            FormatCode::Text => 0,
            FormatCode::Binary => 1,
        }
    }
}

// ==================== Startup phase ====================

/// The very first frontend message; carries no tag byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
    pub version: u32,
    /// Ordered `key, value` pairs; must contain `user`.
    pub params: Vec<(String, String)>,
}

impl Startup {
    pub fn new(user: impl Into<String>) -> Startup {
        Startup {
            version: PROTOCOL_VERSION,
            params: vec![("user".to_owned(), user.into())],
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Startup {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn require_user(&self) -> Result<()> {
        if self.param("user").is_none() {
            return Err(PgWireError::InvalidFormat(
                "startup message requires a user parameter".into(),
            ));
        }
        Ok(())
    }
}

impl MessageBody for Startup {
    const NAME: &'static str = "StartupMessage";
    const TAG: Option<u8> = None;
    const DIRECTION: Direction = Direction::Frontend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        self.require_user()?;
        pack_into("I", &[self.version.into()], buf)?;
        for (k, v) in &self.params {
            pack_into("s s", &[k.as_str().into(), v.as_str().into()], buf)?;
        }
        buf.put_u8(0);
        Ok(())
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let (head, mut off) = unpack_from("I", &payload, 0)?;
        let version = Fields::new(head).u32()?;

        let mut params = Vec::new();
        loop {
            match payload.get(off) {
                None => {
                    return Err(PgWireError::LengthMismatch {
                        expected: off + 1,
                        actual: payload.len(),
                    });
                }
                Some(0) => {
                    off += 1;
                    break;
                }
                Some(_) => {
                    let (pair, next) = unpack_from("s s", &payload, off)?;
                    let mut pair = Fields::new(pair);
                    params.push((pair.string()?, pair.string()?));
                    off = next;
                }
            }
        }
        expect_consumed(off, &payload)?;

        let msg = Startup { version, params };
        msg.require_user()?;
        Ok(msg)
    }
}

/// Sent on a fresh connection to abort the query running on another one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub key: BackendKeyData,
}

impl MessageBody for CancelRequest {
    const NAME: &'static str = "CancelRequest";
    const TAG: Option<u8> = None;
    const DIRECTION: Direction = Direction::Frontend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        pack_into("I", &[CANCEL_REQUEST_CODE.into()], buf)?;
        buf.put_slice(&self.key.key);
        Ok(())
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let (head, off) = unpack_from("I", &payload, 0)?;
        let code = Fields::new(head).u32()?;
        if code != CANCEL_REQUEST_CODE {
            return Err(PgWireError::UnknownEnumValue {
                kind: "cancel request code",
                value: i64::from(code),
            });
        }
        Ok(CancelRequest {
            key: BackendKeyData {
                key: payload.slice(off..),
            },
        })
    }
}

/// Authentication request sub-kinds (`R` messages share one tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthKind {
    Ok,
    KerberosV5,
    CleartextPassword,
    Md5Password,
    ScmCredential,
    Gss,
    GssContinue,
    Sspi,
    Sasl,
    SaslContinue,
    SaslFinal,
}

impl AuthKind {
    pub fn from_code(code: i32) -> Result<AuthKind> {
        let kind = match code {
            0 => AuthKind::Ok,
            2 => AuthKind::KerberosV5,
            3 => AuthKind::CleartextPassword,
            5 => AuthKind::Md5Password,
            6 => AuthKind::ScmCredential,
            7 => AuthKind::Gss,
            8 => AuthKind::GssContinue,
            9 => AuthKind::Sspi,
            10 => AuthKind::Sasl,
            11 => AuthKind::SaslContinue,
            12 => AuthKind::SaslFinal,
            other => {
                return Err(PgWireError::UnknownEnumValue {
                    kind: "authentication request",
                    value: i64::from(other),
                });
            }
        };
        Ok(kind)
    }

    pub fn code(self) -> i32 {
        match self {
            AuthKind::Ok => 0,
            AuthKind::KerberosV5 => 2,
            AuthKind::CleartextPassword => 3,
            AuthKind::Md5Password => 5,
            AuthKind::ScmCredential => 6,
            AuthKind::Gss => 7,
            AuthKind::GssContinue => 8,
            AuthKind::Sspi => 9,
            AuthKind::Sasl => 10,
            AuthKind::SaslContinue => 11,
            AuthKind::SaslFinal => 12,
        }
    }

    /// Whether this kind is followed by mechanism-specific bytes.
    fn carries_data(self) -> bool {
        matches!(
            self,
            AuthKind::Md5Password
                | AuthKind::GssContinue
                | AuthKind::Sasl
                | AuthKind::SaslContinue
                | AuthKind::SaslFinal
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub kind: AuthKind,
    /// Salt, SASL mechanism list, GSS token... empty for data-less kinds.
    pub data: Bytes,
}

impl AuthRequest {
    pub fn ok() -> AuthRequest {
        AuthRequest {
            kind: AuthKind::Ok,
            data: Bytes::new(),
        }
    }
}

impl MessageBody for AuthRequest {
    const NAME: &'static str = "AuthRequest";
    const TAG: Option<u8> = Some(b'R');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        pack_into("i", &[self.kind.code().into()], buf)?;
        buf.put_slice(&self.data);
        Ok(())
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let (head, off) = unpack_from("i", &payload, 0)?;
        let kind = AuthKind::from_code(Fields::new(head).i32()?)?;
        if !kind.carries_data() {
            expect_consumed(off, &payload)?;
        }
        Ok(AuthRequest {
            kind,
            data: payload.slice(off..),
        })
    }
}

/// Cancellation key, kept opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendKeyData {
    pub key: Bytes,
}

impl BackendKeyData {
    /// Backend process id, when the key has the classic `pid | secret` layout.
    pub fn process_id(&self) -> Option<i32> {
        let head: [u8; 4] = self.key.get(..4)?.try_into().ok()?;
        Some(i32::from_be_bytes(head))
    }
}

impl MessageBody for BackendKeyData {
    const NAME: &'static str = "BackendKeyData";
    const TAG: Option<u8> = Some(b'K');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(&self.key);
        Ok(())
    }

    fn decode(payload: Bytes) -> Result<Self> {
        Ok(BackendKeyData { key: payload })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

impl MessageBody for ParameterStatus {
    const NAME: &'static str = "ParameterStatus";
    const TAG: Option<u8> = Some(b'S');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        pack_into(
            "s s",
            &[self.name.as_str().into(), self.value.as_str().into()],
            buf,
        )
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let mut f = Fields::unpack_exact("s s", &payload)?;
        Ok(ParameterStatus {
            name: f.string()?,
            value: f.string()?,
        })
    }
}

/// Backend transaction state reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Error,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Result<TransactionStatus> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Error),
            other => Err(PgWireError::UnknownEnumValue {
                kind: "transaction status",
                value: i64::from(other),
            }),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Error => b'E',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl MessageBody for ReadyForQuery {
    const NAME: &'static str = "ReadyForQuery";
    const TAG: Option<u8> = Some(b'Z');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        pack_into("c", &[Value::Byte(self.status.as_byte())], buf)
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let status = Fields::unpack_exact("c", &payload)?.byte()?;
        Ok(ReadyForQuery {
            status: TransactionStatus::from_byte(status)?,
        })
    }
}

// ==================== Error / notice ====================

/// Identified fields of an ErrorResponse or NoticeResponse, keyed by the
/// one-byte field code (`S` severity, `C` SQLSTATE, `M` message, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub fields: BTreeMap<u8, String>,
}

impl ErrorFields {
    pub fn parse(payload: &[u8]) -> Result<ErrorFields> {
        let code_spec = FormatSpec::parse("c")?;
        let text_spec = FormatSpec::parse("s")?;

        let mut fields = BTreeMap::new();
        let mut off = 0;
        loop {
            let (code, next) = code_spec.unpack_from(payload, off)?;
            off = next;
            let code = Fields::new(code).byte()?;
            if code == 0 {
                break;
            }
            let (text, next) = text_spec.unpack_from(payload, off)?;
            off = next;
            fields.insert(code, Fields::new(text).string()?);
        }
        expect_consumed(off, payload)?;
        Ok(ErrorFields { fields })
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let spec = FormatSpec::parse("c s")?;
        for (code, text) in &self.fields {
            spec.pack_into(&[Value::Byte(*code), text.as_str().into()], buf)?;
        }
        buf.put_u8(0);
        Ok(())
    }

    pub fn with(mut self, code: u8, text: impl Into<String>) -> ErrorFields {
        self.fields.insert(code, text.into());
        self
    }

    pub fn field(&self, code: u8) -> Option<&str> {
        self.fields.get(&code).map(String::as_str)
    }

    pub fn severity(&self) -> Option<&str> {
        self.field(b'S')
    }

    pub fn code(&self) -> Option<&str> {
        self.field(b'C')
    }

    pub fn message(&self) -> Option<&str> {
        self.field(b'M')
    }
}

impl fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.message(), self.code()) {
            (Some(m), Some(c)) => write!(f, "{m} (SQLSTATE {c})"),
            (Some(m), None) => f.write_str(m),
            _ => f.write_str("unknown server error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse(pub ErrorFields);

impl ErrorResponse {
    pub fn into_error(self) -> PgWireError {
        PgWireError::Server(self.0.to_string())
    }
}

impl MessageBody for ErrorResponse {
    const NAME: &'static str = "ErrorResponse";
    const TAG: Option<u8> = Some(b'E');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        self.0.encode(buf)
    }

    fn decode(payload: Bytes) -> Result<Self> {
        ErrorFields::parse(&payload).map(ErrorResponse)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeResponse(pub ErrorFields);

impl MessageBody for NoticeResponse {
    const NAME: &'static str = "NoticeResponse";
    const TAG: Option<u8> = Some(b'N');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        self.0.encode(buf)
    }

    fn decode(payload: Bytes) -> Result<Self> {
        ErrorFields::parse(&payload).map(NoticeResponse)
    }
}

// ==================== Simple query cycle ====================

/// Walsender commands that complete with their own name as the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UtilityCommand {
    IdentifySystem,
    StartReplication,
    TimelineHistory,
    CreateReplicationSlot,
    DropReplicationSlot,
    BaseBackup,
}

impl UtilityCommand {
    fn from_word(word: &str) -> Option<UtilityCommand> {
        let cmd = match word {
            "IDENTIFY_SYSTEM" => UtilityCommand::IdentifySystem,
            "START_REPLICATION" => UtilityCommand::StartReplication,
            "TIMELINE_HISTORY" => UtilityCommand::TimelineHistory,
            "CREATE_REPLICATION_SLOT" => UtilityCommand::CreateReplicationSlot,
            "DROP_REPLICATION_SLOT" => UtilityCommand::DropReplicationSlot,
            "BASE_BACKUP" => UtilityCommand::BaseBackup,
            _ => return None,
        };
        Some(cmd)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UtilityCommand::IdentifySystem => "IDENTIFY_SYSTEM",
            UtilityCommand::StartReplication => "START_REPLICATION",
            UtilityCommand::TimelineHistory => "TIMELINE_HISTORY",
            UtilityCommand::CreateReplicationSlot => "CREATE_REPLICATION_SLOT",
            UtilityCommand::DropReplicationSlot => "DROP_REPLICATION_SLOT",
            UtilityCommand::BaseBackup => "BASE_BACKUP",
        }
    }
}

/// Parsed CommandComplete tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTag {
    Insert { oid: u32, rows: u64 },
    Delete { rows: u64 },
    Update { rows: u64 },
    Select { rows: u64 },
    Move { rows: u64 },
    Fetch { rows: u64 },
    Copy { rows: u64 },
    Utility(UtilityCommand),
}

impl CommandTag {
    pub fn parse(text: &str) -> Result<CommandTag> {
        let unknown = || PgWireError::UnknownCommandTag(text.to_owned());

        let mut words = text.split_ascii_whitespace();
        let head = words.next().ok_or_else(unknown)?;
        let counts = words
            .map(|w| w.parse::<u64>().map_err(|_| unknown()))
            .collect::<Result<Vec<u64>>>()?;

        let tag = match (head, counts.as_slice()) {
            ("INSERT", &[oid, rows]) => CommandTag::Insert {
                oid: u32::try_from(oid).map_err(|_| unknown())?,
                rows,
            },
            ("DELETE", &[rows]) => CommandTag::Delete { rows },
            ("UPDATE", &[rows]) => CommandTag::Update { rows },
            ("SELECT", &[rows]) => CommandTag::Select { rows },
            ("MOVE", &[rows]) => CommandTag::Move { rows },
            ("FETCH", &[rows]) => CommandTag::Fetch { rows },
            ("COPY", &[rows]) => CommandTag::Copy { rows },
            (word, &[]) => CommandTag::Utility(UtilityCommand::from_word(word).ok_or_else(unknown)?),
            _ => return Err(unknown()),
        };
        Ok(tag)
    }

    /// Affected row count, if the command reports one.
    pub fn rows(&self) -> Option<u64> {
        match *self {
            CommandTag::Insert { rows, .. }
            | CommandTag::Delete { rows }
            | CommandTag::Update { rows }
            | CommandTag::Select { rows }
            | CommandTag::Move { rows }
            | CommandTag::Fetch { rows }
            | CommandTag::Copy { rows } => Some(rows),
            CommandTag::Utility(_) => None,
        }
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandTag::Insert { oid, rows } => write!(f, "INSERT {oid} {rows}"),
            CommandTag::Delete { rows } => write!(f, "DELETE {rows}"),
            CommandTag::Update { rows } => write!(f, "UPDATE {rows}"),
            CommandTag::Select { rows } => write!(f, "SELECT {rows}"),
            CommandTag::Move { rows } => write!(f, "MOVE {rows}"),
            CommandTag::Fetch { rows } => write!(f, "FETCH {rows}"),
            CommandTag::Copy { rows } => write!(f, "COPY {rows}"),
            CommandTag::Utility(cmd) => f.write_str(cmd.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandComplete {
    pub tag: CommandTag,
}

impl MessageBody for CommandComplete {
    const NAME: &'static str = "CommandComplete";
    const TAG: Option<u8> = Some(b'C');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        pack_into("s", &[self.tag.to_string().into()], buf)
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let text = Fields::unpack_exact("s", &payload)?.string()?;
        Ok(CommandComplete {
            tag: CommandTag::parse(&text)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyQueryResponse;

impl MessageBody for EmptyQueryResponse {
    const NAME: &'static str = "EmptyQueryResponse";
    const TAG: Option<u8> = Some(b'I');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn decode(payload: Bytes) -> Result<Self> {
        super::codec::unpack_exact("", &payload)?;
        Ok(EmptyQueryResponse)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub sql: String,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Query {
        Query { sql: sql.into() }
    }
}

impl MessageBody for Query {
    const NAME: &'static str = "Query";
    const TAG: Option<u8> = Some(b'Q');
    const DIRECTION: Direction = Direction::Frontend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        pack_into("s", &[self.sql.as_str().into()], buf)
    }

    fn decode(payload: Bytes) -> Result<Self> {
        Ok(Query {
            sql: Fields::unpack_exact("s", &payload)?.string()?,
        })
    }
}

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: FormatCode,
}

impl FieldDescription {
    /// A text-format column with no table or type information.
    pub fn text(name: impl Into<String>, type_oid: u32) -> FieldDescription {
        FieldDescription {
            name: name.into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: FormatCode::Text,
        }
    }
}

const FIELD_DESCRIPTION: &str = "s I h I h i h";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl RowDescription {
    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

fn column_count(n: usize) -> Result<u16> {
    u16::try_from(n)
        .map_err(|_| PgWireError::InvalidFormat(format!("{n} columns exceed the 16-bit count")))
}

impl MessageBody for RowDescription {
    const NAME: &'static str = "RowDescription";
    const TAG: Option<u8> = Some(b'T');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        pack_into("H", &[column_count(self.fields.len())?.into()], buf)?;
        let spec = FormatSpec::parse(FIELD_DESCRIPTION)?;
        for f in &self.fields {
            spec.pack_into(
                &[
                    f.name.as_str().into(),
                    f.table_oid.into(),
                    f.column_id.into(),
                    f.type_oid.into(),
                    f.type_size.into(),
                    f.type_modifier.into(),
                    f.format.code().into(),
                ],
                buf,
            )?;
        }
        Ok(())
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let (head, mut off) = unpack_from("H", &payload, 0)?;
        let n = Fields::new(head).u16()?;

        let spec = FormatSpec::parse(FIELD_DESCRIPTION)?;
        let mut fields = Vec::with_capacity(usize::from(n));
        for _ in 0..n {
            let (values, next) = spec.unpack_from(&payload, off)?;
            off = next;
            let mut f = Fields::new(values);
            fields.push(FieldDescription {
                name: f.string()?,
                table_oid: f.u32()?,
                column_id: f.i16()?,
                type_oid: f.u32()?,
                type_size: f.i16()?,
                type_modifier: f.i32()?,
                format: FormatCode::from_code(f.i16()?)?,
            });
        }
        expect_consumed(off, &payload)?;
        Ok(RowDescription { fields })
    }
}

/// One result row; `None` is SQL NULL (length word `-1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub values: Vec<Option<Bytes>>,
}

impl DataRow {
    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        self.values.get(idx)?.as_deref()
    }

    /// Column `idx` as text. `Ok(None)` for NULL or a missing column.
    pub fn text(&self, idx: usize) -> Result<Option<&str>> {
        self.get(idx)
            .map(|b| {
                std::str::from_utf8(b).map_err(|e| {
                    PgWireError::InvalidFormat(format!("column {idx}: invalid utf-8: {e}"))
                })
            })
            .transpose()
    }
}

impl MessageBody for DataRow {
    const NAME: &'static str = "DataRow";
    const TAG: Option<u8> = Some(b'D');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        pack_into("H", &[column_count(self.values.len())?.into()], buf)?;
        for v in &self.values {
            match v {
                None => buf.put_i32(-1),
                Some(b) => {
                    let len = i32::try_from(b.len()).map_err(|_| {
                        PgWireError::InvalidFormat(format!("column of {} bytes", b.len()))
                    })?;
                    buf.put_i32(len);
                    buf.put_slice(b);
                }
            }
        }
        Ok(())
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let (head, mut off) = unpack_from("H", &payload, 0)?;
        let n = Fields::new(head).u16()?;

        let len_spec = FormatSpec::parse("i")?;
        let mut values = Vec::with_capacity(usize::from(n));
        for _ in 0..n {
            let (len, next) = len_spec.unpack_from(&payload, off)?;
            off = next;
            match Fields::new(len).i32()? {
                -1 => values.push(None),
                len if len < 0 => {
                    return Err(PgWireError::InvalidFormat(format!(
                        "negative column length {len}"
                    )));
                }
                len => {
                    let end = off + len as usize;
                    if end > payload.len() {
                        return Err(PgWireError::LengthMismatch {
                            expected: end,
                            actual: payload.len(),
                        });
                    }
                    values.push(Some(payload.slice(off..end)));
                    off = end;
                }
            }
        }
        expect_consumed(off, &payload)?;
        Ok(DataRow { values })
    }
}

// ==================== COPY ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyData {
    pub data: Bytes,
}

impl MessageBody for CopyData {
    const NAME: &'static str = "CopyData";
    const TAG: Option<u8> = Some(b'd');
    const DIRECTION: Direction = Direction::Both;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(&self.data);
        Ok(())
    }

    fn decode(payload: Bytes) -> Result<Self> {
        Ok(CopyData { data: payload })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyDone;

impl MessageBody for CopyDone {
    const NAME: &'static str = "CopyDone";
    const TAG: Option<u8> = Some(b'c');
    const DIRECTION: Direction = Direction::Both;

    fn encode(&self, _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn decode(payload: Bytes) -> Result<Self> {
        super::codec::unpack_exact("", &payload)?;
        Ok(CopyDone)
    }
}

/// Start of a bidirectional copy (streaming replication).
///
/// Invariant: a textual overall format implies textual columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyBothResponse {
    format: FormatCode,
    columns: Vec<FormatCode>,
}

impl CopyBothResponse {
    pub fn new(format: FormatCode, columns: Vec<FormatCode>) -> Result<CopyBothResponse> {
        if format == FormatCode::Text && columns.iter().any(|c| *c != FormatCode::Text) {
            return Err(PgWireError::InconsistentFormat(
                "textual copy format requires every column to be textual".into(),
            ));
        }
        Ok(CopyBothResponse { format, columns })
    }

    pub fn format(&self) -> FormatCode {
        self.format
    }

    pub fn columns(&self) -> &[FormatCode] {
        &self.columns
    }
}

impl MessageBody for CopyBothResponse {
    const NAME: &'static str = "CopyBothResponse";
    const TAG: Option<u8> = Some(b'W');
    const DIRECTION: Direction = Direction::Backend;

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let n = column_count(self.columns.len())?;
        // overall format is an Int8 on the wire
        pack_into(
            "b H",
            &[(self.format.code() as i8).into(), n.into()],
            buf,
        )?;
        let columns: Vec<Value> = self.columns.iter().map(|c| c.code().into()).collect();
        pack_into(&format!("{n}h"), &columns, buf)
    }

    fn decode(payload: Bytes) -> Result<Self> {
        let (head, off) = unpack_from("b H", &payload, 0)?;
        let mut head = Fields::new(head);
        let format = FormatCode::from_code(i16::from(head.i8()?))?;
        let n = head.u16()?;

        let (cols, off) = unpack_from(&format!("{n}h"), &payload, off)?;
        expect_consumed(off, &payload)?;
        let mut cols = Fields::new(cols);
        let columns = (0..n)
            .map(|_| cols.i16().and_then(FormatCode::from_code))
            .collect::<Result<Vec<_>>>()?;

        CopyBothResponse::new(format, columns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminate;

impl MessageBody for Terminate {
    const NAME: &'static str = "Terminate";
    const TAG: Option<u8> = Some(b'X');
    const DIRECTION: Direction = Direction::Frontend;

    fn encode(&self, _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn decode(payload: Bytes) -> Result<Self> {
        super::codec::unpack_exact("", &payload)?;
        Ok(Terminate)
    }
}

/// A frame whose tag is not in the registry, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessage {
    pub tag: u8,
    pub payload: Bytes,
}

// ==================== The closed set ====================

/// Every outer-protocol message this crate understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Startup(Startup),
    CancelRequest(CancelRequest),
    AuthRequest(AuthRequest),
    BackendKeyData(BackendKeyData),
    ParameterStatus(ParameterStatus),
    ReadyForQuery(ReadyForQuery),
    ErrorResponse(ErrorResponse),
    NoticeResponse(NoticeResponse),
    CommandComplete(CommandComplete),
    EmptyQueryResponse(EmptyQueryResponse),
    Query(Query),
    RowDescription(RowDescription),
    DataRow(DataRow),
    CopyData(CopyData),
    CopyDone(CopyDone),
    CopyBothResponse(CopyBothResponse),
    Terminate(Terminate),
    Unknown(UnknownMessage),
}

macro_rules! message_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }
        )*
    };
}

message_from!(
    Startup,
    CancelRequest,
    AuthRequest,
    BackendKeyData,
    ParameterStatus,
    ReadyForQuery,
    ErrorResponse,
    NoticeResponse,
    CommandComplete,
    EmptyQueryResponse,
    Query,
    RowDescription,
    DataRow,
    CopyData,
    CopyDone,
    CopyBothResponse,
    Terminate,
);

impl From<UnknownMessage> for Message {
    fn from(m: UnknownMessage) -> Self {
        Message::Unknown(m)
    }
}

fn meta<T: MessageBody>(_: &T) -> (&'static str, Option<u8>, Direction) {
    (T::NAME, T::TAG, T::DIRECTION)
}

impl Message {
    fn meta(&self) -> (&'static str, Option<u8>, Direction) {
        match self {
            Message::Startup(m) => meta(m),
            Message::CancelRequest(m) => meta(m),
            Message::AuthRequest(m) => meta(m),
            Message::BackendKeyData(m) => meta(m),
            Message::ParameterStatus(m) => meta(m),
            Message::ReadyForQuery(m) => meta(m),
            Message::ErrorResponse(m) => meta(m),
            Message::NoticeResponse(m) => meta(m),
            Message::CommandComplete(m) => meta(m),
            Message::EmptyQueryResponse(m) => meta(m),
            Message::Query(m) => meta(m),
            Message::RowDescription(m) => meta(m),
            Message::DataRow(m) => meta(m),
            Message::CopyData(m) => meta(m),
            Message::CopyDone(m) => meta(m),
            Message::CopyBothResponse(m) => meta(m),
            Message::Terminate(m) => meta(m),
            Message::Unknown(m) => ("UnknownMessage", Some(m.tag), Direction::Both),
        }
    }

    pub fn name(&self) -> &'static str {
        self.meta().0
    }

    pub fn tag(&self) -> Option<u8> {
        self.meta().1
    }

    pub fn direction(&self) -> Direction {
        self.meta().2
    }

    pub fn encode_payload(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Message::Startup(m) => m.encode(buf),
            Message::CancelRequest(m) => m.encode(buf),
            Message::AuthRequest(m) => m.encode(buf),
            Message::BackendKeyData(m) => m.encode(buf),
            Message::ParameterStatus(m) => m.encode(buf),
            Message::ReadyForQuery(m) => m.encode(buf),
            Message::ErrorResponse(m) => m.encode(buf),
            Message::NoticeResponse(m) => m.encode(buf),
            Message::CommandComplete(m) => m.encode(buf),
            Message::EmptyQueryResponse(m) => m.encode(buf),
            Message::Query(m) => m.encode(buf),
            Message::RowDescription(m) => m.encode(buf),
            Message::DataRow(m) => m.encode(buf),
            Message::CopyData(m) => m.encode(buf),
            Message::CopyDone(m) => m.encode(buf),
            Message::CopyBothResponse(m) => m.encode(buf),
            Message::Terminate(m) => m.encode(buf),
            Message::Unknown(m) => {
                buf.put_slice(&m.payload);
                Ok(())
            }
        }
    }

    /// Serialize to `tag | length | payload` as sent by `role`.
    ///
    /// Fails with `DirectionViolation` if `role` may not send this variant.
    pub fn render(&self, role: Role) -> Result<Bytes> {
        if !self.direction().permits(role) {
            return Err(PgWireError::DirectionViolation {
                message: self.name(),
                role,
            });
        }

        let mut body = BytesMut::with_capacity(64);
        self.encode_payload(&mut body)?;
        let len = i32::try_from(body.len() + 4).map_err(|_| {
            PgWireError::Protocol(format!("{} payload of {} bytes", self.name(), body.len()))
        })?;

        let mut out = BytesMut::with_capacity(body.len() + 5);
        if let Some(tag) = self.tag() {
            out.put_u8(tag);
        }
        out.put_i32(len);
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Query(q) => write!(f, "<Query: {:?}>", q.sql),
            Message::ParameterStatus(p) => write!(f, "<ParameterStatus {}={:?}>", p.name, p.value),
            Message::ReadyForQuery(r) => write!(f, "<ReadyForQuery::{:?}>", r.status),
            Message::CommandComplete(c) => write!(f, "<CommandComplete {}>", c.tag),
            Message::ErrorResponse(e) => write!(f, "<ErrorResponse {}>", e.0),
            Message::AuthRequest(a) => write!(f, "<AuthRequest::{:?}>", a.kind),
            Message::Unknown(u) => write!(f, "<UnknownMessage({:?}): {} bytes>", u.tag as char, u.payload.len()),
            other => write!(f, "<{}>", other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: MessageBody + PartialEq + fmt::Debug>(m: T) {
        let mut buf = BytesMut::new();
        m.encode(&mut buf).unwrap();
        assert_eq!(T::decode(buf.freeze()).unwrap(), m);
    }

    #[test]
    fn every_variant_roundtrips() {
        roundtrip(
            Startup::new("replicator")
                .with_param("database", "postgres")
                .with_param("replication", "true"),
        );
        roundtrip(CancelRequest {
            key: BackendKeyData {
                key: Bytes::from_static(&[0, 0, 0, 7, 1, 2, 3, 4]),
            },
        });
        roundtrip(AuthRequest::ok());
        roundtrip(AuthRequest {
            kind: AuthKind::Md5Password,
            data: Bytes::from_static(b"salt"),
        });
        roundtrip(BackendKeyData {
            key: Bytes::from_static(&[0, 0, 0, 42, 9, 9, 9, 9]),
        });
        roundtrip(ParameterStatus {
            name: "server_version".into(),
            value: "16.2".into(),
        });
        for status in [
            TransactionStatus::Idle,
            TransactionStatus::InTransaction,
            TransactionStatus::Error,
        ] {
            roundtrip(ReadyForQuery { status });
        }
        roundtrip(ErrorResponse(
            ErrorFields::default()
                .with(b'S', "ERROR")
                .with(b'C', "42P01")
                .with(b'M', "relation does not exist"),
        ));
        roundtrip(NoticeResponse(ErrorFields::default().with(b'M', "hi")));
        roundtrip(CommandComplete {
            tag: CommandTag::Insert { oid: 0, rows: 5 },
        });
        roundtrip(EmptyQueryResponse);
        roundtrip(Query::new("IDENTIFY_SYSTEM"));
        roundtrip(RowDescription {
            fields: vec![
                FieldDescription::text("systemid", 25),
                FieldDescription {
                    format: FormatCode::Binary,
                    ..FieldDescription::text("timeline", 23)
                },
            ],
        });
        roundtrip(DataRow {
            values: vec![Some(Bytes::from_static(b"1")), None, Some(Bytes::new())],
        });
        roundtrip(CopyData {
            data: Bytes::from_static(b"w\x00\x01"),
        });
        roundtrip(CopyDone);
        roundtrip(CopyBothResponse::new(FormatCode::Binary, vec![FormatCode::Binary, FormatCode::Text]).unwrap());
        roundtrip(Terminate);
    }

    #[test]
    fn startup_layout() {
        let mut buf = BytesMut::new();
        Startup::new("u").encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 3, 0, 0, b'u', b's', b'e', b'r', 0, b'u', 0, 0]);

        let rendered = Message::from(Startup::new("u"))
            .render(Role::Frontend)
            .unwrap();
        // no tag byte; length counts itself
        assert_eq!(&rendered[..4], &16i32.to_be_bytes());
        assert_eq!(rendered.len(), 16);
    }

    #[test]
    fn startup_requires_user() {
        let msg = Startup {
            version: PROTOCOL_VERSION,
            params: vec![("database".into(), "x".into())],
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            msg.encode(&mut buf),
            Err(PgWireError::InvalidFormat(_))
        ));
    }

    #[test]
    fn render_adds_tag_and_self_inclusive_length() {
        let out = Message::from(Query::new("SELECT 1"))
            .render(Role::Frontend)
            .unwrap();
        assert_eq!(out[0], b'Q');
        assert_eq!(&out[1..5], &13i32.to_be_bytes());
        assert_eq!(&out[5..], b"SELECT 1\0");
    }

    #[test]
    fn render_enforces_direction() {
        let rfq = Message::from(ReadyForQuery {
            status: TransactionStatus::Idle,
        });
        assert_eq!(
            rfq.render(Role::Frontend).unwrap_err(),
            PgWireError::DirectionViolation {
                message: "ReadyForQuery",
                role: Role::Frontend
            }
        );
        assert!(rfq.render(Role::Backend).is_ok());

        let query = Message::from(Query::new("x"));
        assert!(matches!(
            query.render(Role::Backend),
            Err(PgWireError::DirectionViolation { .. })
        ));

        let copy = Message::from(CopyData { data: Bytes::new() });
        assert!(copy.render(Role::Frontend).is_ok());
        assert!(copy.render(Role::Backend).is_ok());
    }

    #[test]
    fn ready_for_query_rejects_unknown_status() {
        let err = ReadyForQuery::decode(Bytes::from_static(b"X")).unwrap_err();
        assert_eq!(
            err,
            PgWireError::UnknownEnumValue {
                kind: "transaction status",
                value: i64::from(b'X')
            }
        );
        assert!(matches!(
            ReadyForQuery::decode(Bytes::from_static(b"II")),
            Err(PgWireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn command_tags() {
        let cases = [
            ("INSERT 0 5", CommandTag::Insert { oid: 0, rows: 5 }),
            ("DELETE 3", CommandTag::Delete { rows: 3 }),
            ("UPDATE 0", CommandTag::Update { rows: 0 }),
            ("SELECT 1", CommandTag::Select { rows: 1 }),
            ("MOVE 2", CommandTag::Move { rows: 2 }),
            ("FETCH 9", CommandTag::Fetch { rows: 9 }),
            ("COPY 12", CommandTag::Copy { rows: 12 }),
            (
                "IDENTIFY_SYSTEM",
                CommandTag::Utility(UtilityCommand::IdentifySystem),
            ),
        ];
        for (text, want) in cases {
            assert_eq!(CommandTag::parse(text).unwrap(), want, "{text}");
            assert_eq!(want.to_string(), text);
        }
        assert_eq!(CommandTag::Select { rows: 4 }.rows(), Some(4));
    }

    #[test]
    fn unknown_command_tag() {
        for text in ["CREATE TABLE", "VACUUM", "", "SELECT", "INSERT 1", "DELETE x"] {
            assert!(
                matches!(
                    CommandTag::parse(text),
                    Err(PgWireError::UnknownCommandTag(_))
                ),
                "{text:?}"
            );
        }
        let err = CommandComplete::decode(Bytes::from_static(b"CREATE TABLE\0")).unwrap_err();
        assert_eq!(err, PgWireError::UnknownCommandTag("CREATE TABLE".into()));
    }

    #[test]
    fn error_fields_last_value_wins() {
        let payload = b"MFirst\0CXX000\0MSecond\0\0";
        let fields = ErrorFields::parse(payload).unwrap();
        assert_eq!(fields.message(), Some("Second"));
        assert_eq!(fields.to_string(), "Second (SQLSTATE XX000)");
    }

    #[test]
    fn error_fields_need_terminator() {
        assert!(matches!(
            ErrorFields::parse(b"Mhello\0"),
            Err(PgWireError::LengthMismatch { .. })
        ));
        assert!(matches!(
            ErrorFields::parse(b"Mhello\0\0junk"),
            Err(PgWireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn error_response_becomes_server_error() {
        let err = ErrorResponse(
            ErrorFields::default()
                .with(b'M', "hello")
                .with(b'C', "12345"),
        )
        .into_error();
        assert!(err.is_server());
        assert!(err.to_string().contains("hello (SQLSTATE 12345)"));
    }

    #[test]
    fn data_row_nulls_and_bounds() {
        let mut payload = BytesMut::new();
        payload.put_u16(2);
        payload.put_i32(-1);
        payload.put_i32(3);
        payload.put_slice(b"abc");
        let row = DataRow::decode(payload.freeze()).unwrap();
        assert_eq!(row.get(0), None);
        assert_eq!(row.text(1).unwrap(), Some("abc"));

        let mut short = BytesMut::new();
        short.put_u16(1);
        short.put_i32(10);
        short.put_slice(b"abc");
        assert!(matches!(
            DataRow::decode(short.freeze()),
            Err(PgWireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn row_description_lookup_by_name() {
        let rd = RowDescription {
            fields: vec![
                FieldDescription::text("xlogpos", 25),
                FieldDescription::text("timeline", 23),
            ],
        };
        assert_eq!(rd.column_index("timeline"), Some(1));
        assert_eq!(rd.column_index("dbname"), None);
    }

    #[test]
    fn copy_both_response_format_invariant() {
        assert!(matches!(
            CopyBothResponse::new(FormatCode::Text, vec![FormatCode::Binary]),
            Err(PgWireError::InconsistentFormat(_))
        ));
        assert!(CopyBothResponse::new(FormatCode::Text, vec![FormatCode::Text]).is_ok());

        // text overall, binary column: 0 | 1 column | 1
        let payload = Bytes::from_static(&[0, 0, 1, 0, 1]);
        assert!(matches!(
            CopyBothResponse::decode(payload),
            Err(PgWireError::InconsistentFormat(_))
        ));

        let payload = Bytes::from_static(&[0, 0, 0]);
        let resp = CopyBothResponse::decode(payload).unwrap();
        assert_eq!(resp.format(), FormatCode::Text);
        assert!(resp.columns().is_empty());
    }

    #[test]
    fn auth_request_kinds() {
        let mut payload = BytesMut::new();
        payload.put_i32(10);
        payload.put_slice(b"SCRAM-SHA-256\0\0");
        let req = AuthRequest::decode(payload.freeze()).unwrap();
        assert_eq!(req.kind, AuthKind::Sasl);
        assert_eq!(&req.data[..], b"SCRAM-SHA-256\0\0");

        let err = AuthRequest::decode(Bytes::from_static(&[0, 0, 0, 99])).unwrap_err();
        assert!(matches!(err, PgWireError::UnknownEnumValue { value: 99, .. }));

        // AuthenticationOk carries nothing
        assert!(matches!(
            AuthRequest::decode(Bytes::from_static(&[0, 0, 0, 0, 1])),
            Err(PgWireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn backend_key_data_process_id() {
        let key = BackendKeyData {
            key: Bytes::from_static(&[0, 0, 1, 0, 0xde, 0xad, 0xbe, 0xef]),
        };
        assert_eq!(key.process_id(), Some(256));
        assert_eq!(BackendKeyData { key: Bytes::new() }.process_id(), None);
    }

    #[test]
    fn empty_query_response_has_no_payload() {
        assert!(EmptyQueryResponse::decode(Bytes::new()).is_ok());
        assert!(matches!(
            EmptyQueryResponse::decode(Bytes::from_static(b"x")),
            Err(PgWireError::LengthMismatch { .. })
        ));
    }
}
