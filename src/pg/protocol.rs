//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::{Format, Oid};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Request code of the out-of-band CancelRequest packet
pub const CANCEL_REQUEST_CODE: i32 = 80877102; // (1234 << 16) | 5678

/// Upper bound on a single backend message, guarding against garbage lengths
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    #[default]
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages.
///
/// Messages append themselves to an output buffer so several of them can be
/// pipelined into one write.
pub trait FrontendMessage {
    fn encode(&self, buf: &mut BytesMut);
}

/// Write a tagged message, back-filling the length once the body is known.
fn write_tagged(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();

        // Placeholder for length (will be filled in at the end)
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        put_cstring(buf, "user");
        put_cstring(buf, &self.user);
        if let Some(ref db) = self.database {
            put_cstring(buf, "database");
            put_cstring(buf, db);
        }
        for (key, value) in &self.options {
            put_cstring(buf, key);
            put_cstring(buf, value);
        }

        // Terminator
        buf.put_u8(0);

        // Fill in length (includes length field itself)
        let len = (buf.len() - start) as i32;
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }
}

/// CancelRequest, sent on a fresh connection instead of a startup message
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self, buf: &mut BytesMut) {
        write_tagged(buf, b'p', |body| put_cstring(body, &self.password));
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_tagged(buf, b'Q', |body| put_cstring(body, self.query));
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_tagged(buf, b'P', |body| {
            put_cstring(body, self.name);
            put_cstring(body, self.query);
            body.put_i16(self.param_types.len() as i16);
            for oid in self.param_types {
                body.put_u32(oid.as_u32());
            }
        });
    }
}

/// Format codes of a Bind message; most statements have few parameters.
pub type FormatCodes = SmallVec<[Format; 8]>;

/// Parameter values already encoded by the type map; `None` is NULL.
pub type EncodedParams = SmallVec<[Option<Bytes>; 8]>;

/// Bind message ('B') - Binds parameters to a prepared statement
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub param_formats: &'a [Format],
    pub params: &'a [Option<Bytes>],
    pub result_formats: &'a [Format],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_tagged(buf, b'B', |body| {
            put_cstring(body, self.portal);
            put_cstring(body, self.statement);

            body.put_i16(self.param_formats.len() as i16);
            for fmt in self.param_formats {
                body.put_i16(fmt.code());
            }

            body.put_i16(self.params.len() as i16);
            for param in self.params {
                match param {
                    Some(bytes) => {
                        body.put_i32(bytes.len() as i32);
                        body.put_slice(bytes);
                    }
                    None => body.put_i32(-1),
                }
            }

            body.put_i16(self.result_formats.len() as i16);
            for fmt in self.result_formats {
                body.put_i16(fmt.code());
            }
        });
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// Row limit, 0 for no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_tagged(buf, b'E', |body| {
            put_cstring(body, self.portal);
            body.put_i32(self.max_rows);
        });
    }
}

/// Target of a Describe or Close message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    pub target: Target,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_tagged(buf, b'D', |body| {
            body.put_u8(self.target.code());
            put_cstring(body, self.name);
        });
    }
}

/// Close message ('C') - Release a prepared statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    pub target: Target,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_tagged(buf, b'C', |body| {
            body.put_u8(self.target.code());
            put_cstring(body, self.name);
        });
    }
}

/// CopyData message ('d') - A chunk of COPY payload
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_tagged(buf, b'd', |body| body.put_slice(self.data));
    }
}

/// CopyFail message ('f') - Abort COPY FROM STDIN
#[derive(Debug, Clone)]
pub struct CopyFailMessage<'a> {
    pub message: &'a str,
}

impl FrontendMessage for CopyFailMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        write_tagged(buf, b'f', |body| put_cstring(body, self.message));
    }
}

macro_rules! empty_message {
    ($($(#[$meta:meta])* $name:ident => $tag:expr),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy)]
            pub struct $name;

            impl FrontendMessage for $name {
                fn encode(&self, buf: &mut BytesMut) {
                    buf.put_u8($tag);
                    buf.put_i32(4);
                }
            }
        )*
    };
}

empty_message! {
    /// Sync message ('S') - Marks end of an extended query
    SyncMessage => b'S',
    /// Flush message ('H') - Request server to flush output buffer
    FlushMessage => b'H',
    /// Terminate message ('X') - Close the connection
    TerminateMessage => b'X',
    /// CopyDone message ('c') - End of COPY payload
    CopyDoneMessage => b'c',
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: Oid,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    /// Any other authentication request (SASL, GSS, ...)
    AuthenticationOther {
        code: i32,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription {
        type_oids: Vec<Oid>,
    },

    // COPY
    CopyInResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyOutResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyData {
        data: Bytes,
    },
    CopyDone,

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Split one complete message off the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything when `buf` does not yet
    /// hold a full message, so a read interrupted between calls loses no data.
    pub fn parse(buf: &mut BytesMut) -> PgResult<Option<Self>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 || len as usize > MAX_MESSAGE_LEN {
            return Err(PgError::Protocol(format!(
                "Invalid message length {} for message type {}",
                len, buf[0] as char
            )));
        }
        let total = 1 + len as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        let mut msg = buf.split_to(total).freeze();
        Self::decode(&mut msg).map(Some)
    }

    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();

        if len < 4 || buf.remaining() < len as usize - 4 {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let mut body = Body(buf.split_to(len as usize - 4));

        let msg = match msg_type {
            b'R' => Self::decode_auth(&mut body)?,
            b'T' => Self::decode_row_description(&mut body)?,
            b'D' => Self::decode_data_row(&mut body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: body.cstring()?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::from(body.u8()?),
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: body.error_fields()?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: body.error_fields()?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: body.cstring()?,
                value: body.cstring()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.i32()?,
                secret_key: body.i32()?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => Self::decode_parameter_description(&mut body)?,
            b'A' => BackendMessage::NotificationResponse {
                process_id: body.i32()?,
                channel: body.cstring()?,
                payload: body.cstring()?,
            },
            b'G' => {
                let (format, column_formats) = Self::decode_copy_response(&mut body)?;
                BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                }
            }
            b'H' => {
                let (format, column_formats) = Self::decode_copy_response(&mut body)?;
                BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                }
            }
            b'd' => BackendMessage::CopyData {
                data: std::mem::take(&mut body.0),
            },
            b'c' => BackendMessage::CopyDone,
            _ => {
                return Err(PgError::Protocol(format!(
                    "Unknown message type: {}",
                    msg_type as char
                )))
            }
        };
        Ok(msg)
    }

    fn decode_auth(body: &mut Body) -> PgResult<Self> {
        let auth_type = body.i32()?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body.take(4)?);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            code => Ok(BackendMessage::AuthenticationOther { code }),
        }
    }

    fn decode_row_description(body: &mut Body) -> PgResult<Self> {
        let num_fields = body.i16()?.max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            fields.push(FieldDescription {
                name: body.cstring()?,
                table_oid: Oid(body.u32()?),
                column_attr: body.i16()?,
                type_oid: Oid(body.u32()?),
                type_size: body.i16()?,
                type_modifier: body.i32()?,
                format: Format::from_code(body.i16()?),
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut Body) -> PgResult<Self> {
        let num_cols = body.i16()?.max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = body.i32()?;
            if len < 0 {
                values.push(None);
            } else {
                // Slices share the message allocation
                values.push(Some(body.take(len as usize)?));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(body: &mut Body) -> PgResult<Self> {
        let num_params = body.i16()?.max(0) as usize;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid(body.u32()?));
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_copy_response(body: &mut Body) -> PgResult<(Format, Vec<Format>)> {
        let format = Format::from_code(body.u8()? as i16);
        let count = body.i16()?.max(0) as usize;
        let mut column_formats = Vec::with_capacity(count);
        for _ in 0..count {
            column_formats.push(Format::from_code(body.i16()?));
        }
        Ok((format, column_formats))
    }

    /// Short name used in logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "AuthenticationOk",
            BackendMessage::AuthenticationCleartextPassword => "AuthenticationCleartextPassword",
            BackendMessage::AuthenticationMD5Password { .. } => "AuthenticationMD5Password",
            BackendMessage::AuthenticationOther { .. } => "Authentication",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::CopyInResponse { .. } => "CopyInResponse",
            BackendMessage::CopyOutResponse { .. } => "CopyOutResponse",
            BackendMessage::CopyData { .. } => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::ErrorResponse { .. } => "ErrorResponse",
            BackendMessage::NoticeResponse { .. } => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Bounds-checked reader over a message body.
struct Body(Bytes);

impl Body {
    fn need(&self, n: usize) -> PgResult<()> {
        if self.0.remaining() < n {
            return Err(PgError::Protocol("Truncated message body".to_string()));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> PgResult<Bytes> {
        self.need(n)?;
        Ok(self.0.split_to(n))
    }

    fn u8(&mut self) -> PgResult<u8> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn i16(&mut self) -> PgResult<i16> {
        self.need(2)?;
        Ok(self.0.get_i16())
    }

    fn i32(&mut self) -> PgResult<i32> {
        self.need(4)?;
        Ok(self.0.get_i32())
    }

    fn u32(&mut self) -> PgResult<u32> {
        self.need(4)?;
        Ok(self.0.get_u32())
    }

    /// Read a null-terminated string, falling back to lossy UTF-8.
    fn cstring(&mut self) -> PgResult<String> {
        let end = self
            .0
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

        let s = std::str::from_utf8(&self.0[..end])
            .map(|s| s.to_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.0[..end]).into_owned());

        self.0.advance(end + 1); // Skip the null terminator
        Ok(s)
    }

    /// Read error/notice response fields
    fn error_fields(&mut self) -> PgResult<HashMap<u8, String>> {
        let mut fields = HashMap::new();

        while self.0.remaining() > 0 {
            let field_type = self.u8()?;
            if field_type == 0 {
                break;
            }
            let value = self.cstring()?;
            fields.insert(field_type, value);
        }

        Ok(fields)
    }
}
