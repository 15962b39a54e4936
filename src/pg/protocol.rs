//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages used by the
//! driver. Frontend messages are appended to a [`MessageWriter`]; backend
//! frames are classified by [`BackendTag`] and decoded into
//! [`BackendMessage`].
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::Bytes;

use super::codec::{Cursor, MessageWriter};
use super::error::ServerError;
use crate::error::{Error, Result};
use crate::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// SASL mechanism we implement.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

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

impl TryFrom<u8> for TransactionStatus {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(Error::Protocol(format!(
                "Unknown transaction status: {:?}",
                other as char
            ))),
        }
    }
}

impl TransactionStatus {
    /// Inside a transaction block, failed or not.
    pub fn in_transaction(self) -> bool {
        !matches!(self, TransactionStatus::Idle)
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Startup message sent at connection start.
pub fn startup(w: &mut MessageWriter, user: &str, database: &str, options: &[(&str, &str)]) {
    w.begin_message(None)
        .i32(PROTOCOL_VERSION)
        .cstr("user")
        .cstr(user)
        .cstr("database")
        .cstr(database);
    for (key, value) in options {
        w.cstr(key).cstr(value);
    }
    w.u8(0).end_message();
}

/// Password message ('p'), cleartext or MD5.
pub fn password(w: &mut MessageWriter, password: &str) {
    w.begin_message(Some(b'p')).cstr(password).end_message();
}

/// SASL Initial Response message ('p').
pub fn sasl_initial_response(w: &mut MessageWriter, mechanism: &str, data: &[u8]) {
    w.begin_message(Some(b'p'))
        .cstr(mechanism)
        .i32(data.len() as i32)
        .bytes(data)
        .end_message();
}

/// SASL Response message ('p').
pub fn sasl_response(w: &mut MessageWriter, data: &[u8]) {
    w.begin_message(Some(b'p')).bytes(data).end_message();
}

/// Simple query message ('Q').
pub fn query(w: &mut MessageWriter, sql: &str) {
    w.begin_message(Some(b'Q')).cstr(sql).end_message();
}

/// Parse message ('P'). Parameter types are left for the server to infer.
pub fn parse(w: &mut MessageWriter, statement: &str, sql: &str) {
    w.begin_message(Some(b'P'))
        .cstr(statement)
        .cstr(sql)
        .i16(0)
        .end_message();
}

/// Bind message ('B') with every parameter and result column in text format.
pub fn bind(w: &mut MessageWriter, portal: &str, statement: &str, params: &[Option<String>]) {
    w.begin_message(Some(b'B'))
        .cstr(portal)
        .cstr(statement)
        .i16(0)
        .i16(params.len() as i16);
    for param in params {
        match param {
            None => {
                w.i32(-1);
            }
            Some(text) => {
                w.i32(text.len() as i32).raw_str(text);
            }
        }
    }
    w.i16(0).end_message();
}

/// Describe portal message ('D', 'P').
pub fn describe_portal(w: &mut MessageWriter, portal: &str) {
    w.begin_message(Some(b'D')).u8(b'P').cstr(portal).end_message();
}

/// Execute message ('E'). `max_rows` 0 means no limit.
pub fn execute(w: &mut MessageWriter, portal: &str, max_rows: i32) {
    w.begin_message(Some(b'E')).cstr(portal).i32(max_rows).end_message();
}

/// Close portal message ('C', 'P').
pub fn close_portal(w: &mut MessageWriter, portal: &str) {
    w.begin_message(Some(b'C')).u8(b'P').cstr(portal).end_message();
}

/// Flush message ('H').
pub fn flush(w: &mut MessageWriter) {
    w.empty_message(b'H');
}

/// Sync message ('S').
pub fn sync(w: &mut MessageWriter) {
    w.empty_message(b'S');
}

/// Terminate message ('X').
pub fn terminate(w: &mut MessageWriter) {
    w.empty_message(b'X');
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Tag byte of every backend message the driver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendTag {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

impl TryFrom<u8> for BackendTag {
    type Error = Error;

    /// An unknown tag means the stream can no longer be framed.
    fn try_from(tag: u8) -> Result<Self> {
        Ok(match tag {
            b'R' => BackendTag::Authentication,
            b'K' => BackendTag::BackendKeyData,
            b'2' => BackendTag::BindComplete,
            b'3' => BackendTag::CloseComplete,
            b'C' => BackendTag::CommandComplete,
            b'D' => BackendTag::DataRow,
            b'I' => BackendTag::EmptyQueryResponse,
            b'E' => BackendTag::ErrorResponse,
            b'n' => BackendTag::NoData,
            b'N' => BackendTag::NoticeResponse,
            b'A' => BackendTag::NotificationResponse,
            b't' => BackendTag::ParameterDescription,
            b'S' => BackendTag::ParameterStatus,
            b'1' => BackendTag::ParseComplete,
            b's' => BackendTag::PortalSuspended,
            b'Z' => BackendTag::ReadyForQuery,
            b'T' => BackendTag::RowDescription,
            other => {
                return Err(Error::Protocol(format!(
                    "Unknown message type: {:?} (0x{:02x})",
                    other as char, other
                )))
            }
        })
    }
}

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Authentication request variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
    /// An auth code without a branch (Kerberos, GSS, SSPI, ...).
    Unsupported(i32),
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    BackendKeyData { process_id: i32, secret_key: i32 },
    BindComplete,
    CloseComplete,
    CommandComplete { tag: String },
    DataRow { values: Vec<Option<Bytes>> },
    EmptyQueryResponse,
    ErrorResponse(ServerError),
    NoData,
    NoticeResponse(ServerError),
    NotificationResponse { process_id: i32, channel: String, payload: String },
    ParameterDescription { type_oids: Vec<Oid> },
    ParameterStatus { name: String, value: String },
    ParseComplete,
    PortalSuspended,
    ReadyForQuery { status: TransactionStatus },
    RowDescription { fields: Vec<FieldDescription> },
}

impl BackendMessage {
    /// Decode one frame produced by [`FrameBuffer`](super::codec::FrameBuffer).
    pub fn decode(tag: u8, body: Bytes) -> Result<Self> {
        let tag = BackendTag::try_from(tag)?;
        let mut c = Cursor::new(body);

        Ok(match tag {
            BackendTag::Authentication => BackendMessage::Authentication(decode_auth(&mut c)?),
            BackendTag::BackendKeyData => BackendMessage::BackendKeyData {
                process_id: c.i32()?,
                secret_key: c.i32()?,
            },
            BackendTag::BindComplete => BackendMessage::BindComplete,
            BackendTag::CloseComplete => BackendMessage::CloseComplete,
            BackendTag::CommandComplete => BackendMessage::CommandComplete { tag: c.cstr()? },
            BackendTag::DataRow => {
                let count = c.i16()?.max(0) as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = c.i32()?;
                    values.push(if len < 0 { None } else { Some(c.bytes(len as usize)?) });
                }
                BackendMessage::DataRow { values }
            }
            BackendTag::EmptyQueryResponse => BackendMessage::EmptyQueryResponse,
            BackendTag::ErrorResponse => BackendMessage::ErrorResponse(decode_fields(&mut c)?),
            BackendTag::NoData => BackendMessage::NoData,
            BackendTag::NoticeResponse => BackendMessage::NoticeResponse(decode_fields(&mut c)?),
            BackendTag::NotificationResponse => BackendMessage::NotificationResponse {
                process_id: c.i32()?,
                channel: c.cstr()?,
                payload: c.cstr()?,
            },
            BackendTag::ParameterDescription => {
                let count = c.i16()?.max(0) as usize;
                let mut type_oids = Vec::with_capacity(count);
                for _ in 0..count {
                    type_oids.push(Oid(c.u32()?));
                }
                BackendMessage::ParameterDescription { type_oids }
            }
            BackendTag::ParameterStatus => BackendMessage::ParameterStatus {
                name: c.cstr()?,
                value: c.cstr()?,
            },
            BackendTag::ParseComplete => BackendMessage::ParseComplete,
            BackendTag::PortalSuspended => BackendMessage::PortalSuspended,
            BackendTag::ReadyForQuery => BackendMessage::ReadyForQuery {
                status: TransactionStatus::try_from(c.u8()?)?,
            },
            BackendTag::RowDescription => {
                let count = c.i16()?.max(0) as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    fields.push(FieldDescription {
                        name: c.cstr()?,
                        table_oid: c.u32()?,
                        column_attr: c.i16()?,
                        type_oid: Oid(c.u32()?),
                        type_size: c.i16()?,
                        type_modifier: c.i32()?,
                        format: c.i16()?,
                    });
                }
                BackendMessage::RowDescription { fields }
            }
        })
    }
}

fn decode_auth(c: &mut Cursor) -> Result<AuthRequest> {
    let code = c.i32()?;
    Ok(match code {
        0 => AuthRequest::Ok,
        3 => AuthRequest::CleartextPassword,
        5 => {
            let salt = c.bytes(4)?;
            AuthRequest::Md5Password {
                salt: [salt[0], salt[1], salt[2], salt[3]],
            }
        }
        10 => {
            let mut mechanisms = Vec::new();
            while c.remaining() > 0 {
                let mechanism = c.cstr()?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            AuthRequest::Sasl { mechanisms }
        }
        11 => AuthRequest::SaslContinue { data: c.rest() },
        12 => AuthRequest::SaslFinal { data: c.rest() },
        other => AuthRequest::Unsupported(other),
    })
}

/// Error/notice response fields
fn decode_fields(c: &mut Cursor) -> Result<ServerError> {
    let mut fields = HashMap::new();
    while c.remaining() > 0 {
        let field_type = c.u8()?;
        if field_type == 0 {
            break;
        }
        fields.insert(field_type, c.cstr()?);
    }
    Ok(ServerError::from_fields(fields))
}

/// Row count at the tail of a command tag (`INSERT 0 5`, `UPDATE 3`, `SELECT 2`).
pub fn rows_from_tag(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::codec::FrameBuffer;

    fn frames(w: &mut MessageWriter) -> Vec<(u8, Bytes)> {
        let mut reader = FrameBuffer::new();
        reader.extend(&w.take());
        let mut out = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_startup_message_structure() {
        let mut w = MessageWriter::new();
        startup(&mut w, "test", "testdb", &[("application_name", "app")]);
        let encoded = w.take();

        let len = i32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len());
        let version = i32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(
            &encoded[8..],
            b"user\0test\0database\0testdb\0application_name\0app\0\0"
        );
    }

    #[test]
    fn test_bind_message_text_params() {
        let mut w = MessageWriter::new();
        bind(&mut w, "", "s1", &[Some("42".to_string()), None]);
        let (tag, body) = frames(&mut w).remove(0);
        assert_eq!(tag, b'B');

        let mut c = Cursor::new(body);
        assert_eq!(c.cstr().unwrap(), "");
        assert_eq!(c.cstr().unwrap(), "s1");
        assert_eq!(c.i16().unwrap(), 0); // all params text
        assert_eq!(c.i16().unwrap(), 2);
        assert_eq!(c.i32().unwrap(), 2);
        assert_eq!(&c.bytes(2).unwrap()[..], b"42");
        assert_eq!(c.i32().unwrap(), -1);
        assert_eq!(c.i16().unwrap(), 0); // all results text
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn test_extended_sequence_tags() {
        let mut w = MessageWriter::new();
        parse(&mut w, "", "SELECT 1");
        bind(&mut w, "", "", &[]);
        describe_portal(&mut w, "");
        execute(&mut w, "", 1);
        close_portal(&mut w, "");
        flush(&mut w);
        sync(&mut w);
        let tags: Vec<u8> = frames(&mut w).into_iter().map(|(t, _)| t).collect();
        assert_eq!(tags, b"PBDECHS".to_vec());
    }

    #[test]
    fn test_decode_row_description_and_data_row() {
        let mut w = MessageWriter::new();
        w.begin_message(Some(b'T'))
            .i16(1)
            .cstr("id")
            .i32(0)
            .i16(0)
            .i32(23)
            .i16(4)
            .i32(-1)
            .i16(0)
            .end_message();
        w.begin_message(Some(b'D'))
            .i16(2)
            .i32(1)
            .bytes(b"7")
            .i32(-1)
            .end_message();

        let mut decoded = frames(&mut w).into_iter();
        let (tag, body) = decoded.next().unwrap();
        match BackendMessage::decode(tag, body).unwrap() {
            BackendMessage::RowDescription { fields } => {
                assert_eq!(fields[0].name, "id");
                assert_eq!(fields[0].type_oid, Oid::INT4);
            }
            other => panic!("unexpected {:?}", other),
        }
        let (tag, body) = decoded.next().unwrap();
        match BackendMessage::decode(tag, body).unwrap() {
            BackendMessage::DataRow { values } => {
                assert_eq!(values[0].as_deref(), Some(&b"7"[..]));
                assert_eq!(values[1], None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_auth_variants() {
        let mut w = MessageWriter::new();
        w.begin_message(Some(b'R')).i32(5).bytes(&[1, 2, 3, 4]).end_message();
        w.begin_message(Some(b'R'))
            .i32(10)
            .cstr("SCRAM-SHA-256-PLUS")
            .cstr("SCRAM-SHA-256")
            .u8(0)
            .end_message();
        w.begin_message(Some(b'R')).i32(7).end_message();

        let decoded: Vec<_> = frames(&mut w)
            .into_iter()
            .map(|(t, b)| BackendMessage::decode(t, b).unwrap())
            .collect();
        assert!(matches!(
            &decoded[0],
            BackendMessage::Authentication(AuthRequest::Md5Password { salt: [1, 2, 3, 4] })
        ));
        match &decoded[1] {
            BackendMessage::Authentication(AuthRequest::Sasl { mechanisms }) => {
                assert_eq!(mechanisms, &["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            &decoded[2],
            BackendMessage::Authentication(AuthRequest::Unsupported(7))
        ));
    }

    #[test]
    fn test_unknown_tag_is_protocol_error() {
        let err = BackendMessage::decode(b'?', Bytes::new()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        let err = BackendMessage::decode(b'Z', Bytes::from_static(b"Q")).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_rows_from_tag() {
        assert_eq!(rows_from_tag("INSERT 0 5"), 5);
        assert_eq!(rows_from_tag("UPDATE 1"), 1);
        assert_eq!(rows_from_tag("SELECT 0"), 0);
        assert_eq!(rows_from_tag("CREATE TABLE"), 0);
        assert_eq!(rows_from_tag("LISTEN"), 0);
    }
}
