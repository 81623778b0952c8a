//! pgoutput message decoding
//!
//! Decodes the logical replication messages produced by the `pgoutput`
//! plugin (protocol version 1). Only the message kinds the ingester acts on
//! are fully decoded; everything else is surfaced as `Other` and skipped.
//!
//! All integers are big-endian. Timestamps are microseconds since the
//! PostgreSQL epoch (2000-01-01 00:00:00 UTC).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Buf;

/// Seconds between the Unix epoch and the PostgreSQL epoch
const PG_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// A decoded pgoutput message
#[derive(Debug, Clone, PartialEq)]
pub enum PgOutputMessage {
    Begin {
        final_lsn: u64,
        commit_ts_us: i64,
        xid: u32,
    },
    Commit {
        commit_lsn: u64,
        end_lsn: u64,
        commit_ts_us: i64,
    },
    Relation(Relation),
    Insert {
        relation_id: u32,
        tuple: Vec<TupleValue>,
    },
    /// A message kind the ingester does not act on
    Other(u8),
}

/// Relation metadata announced before row operations reference it
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub columns: Vec<String>,
}

/// One column value in a tuple
#[derive(Debug, Clone, PartialEq)]
pub enum TupleValue {
    Null,
    /// Unchanged TOAST value, not sent by the server
    Unchanged,
    Text(String),
}

/// Decoding errors
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message truncated")]
    Truncated,
    #[error("invalid utf8 in message")]
    InvalidUtf8,
    #[error("unexpected tuple kind: {0}")]
    UnexpectedTupleKind(u8),
    #[error("empty message")]
    Empty,
}

/// Decode one pgoutput message.
pub fn decode(data: &[u8]) -> Result<PgOutputMessage, DecodeError> {
    let mut buf = data;
    if buf.is_empty() {
        return Err(DecodeError::Empty);
    }

    let kind = buf.get_u8();
    match kind {
        b'B' => {
            ensure(&buf, 20)?;
            let final_lsn = buf.get_u64();
            let commit_ts_us = buf.get_i64();
            let xid = buf.get_u32();
            Ok(PgOutputMessage::Begin {
                final_lsn,
                commit_ts_us,
                xid,
            })
        }
        b'C' => {
            ensure(&buf, 25)?;
            let _flags = buf.get_u8();
            let commit_lsn = buf.get_u64();
            let end_lsn = buf.get_u64();
            let commit_ts_us = buf.get_i64();
            Ok(PgOutputMessage::Commit {
                commit_lsn,
                end_lsn,
                commit_ts_us,
            })
        }
        b'R' => {
            ensure(&buf, 4)?;
            let id = buf.get_u32();
            let namespace = read_cstring(&mut buf)?;
            let name = read_cstring(&mut buf)?;
            ensure(&buf, 3)?;
            let _replica_identity = buf.get_u8();
            let column_count = buf.get_u16();

            let mut columns = Vec::with_capacity(column_count as usize);
            for _ in 0..column_count {
                ensure(&buf, 1)?;
                let _flags = buf.get_u8();
                let column_name = read_cstring(&mut buf)?;
                ensure(&buf, 8)?;
                let _type_oid = buf.get_u32();
                let _type_modifier = buf.get_i32();
                columns.push(column_name);
            }

            Ok(PgOutputMessage::Relation(Relation {
                id,
                namespace,
                name,
                columns,
            }))
        }
        b'I' => {
            ensure(&buf, 5)?;
            let relation_id = buf.get_u32();
            let tuple_kind = buf.get_u8();
            if tuple_kind != b'N' {
                return Err(DecodeError::UnexpectedTupleKind(tuple_kind));
            }
            let tuple = read_tuple(&mut buf)?;
            Ok(PgOutputMessage::Insert {
                relation_id,
                tuple,
            })
        }
        other => Ok(PgOutputMessage::Other(other)),
    }
}

fn read_tuple(buf: &mut &[u8]) -> Result<Vec<TupleValue>, DecodeError> {
    ensure(buf, 2)?;
    let column_count = buf.get_u16();

    let mut values = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        ensure(buf, 1)?;
        match buf.get_u8() {
            b'n' => values.push(TupleValue::Null),
            b'u' => values.push(TupleValue::Unchanged),
            b't' => {
                ensure(buf, 4)?;
                let len = buf.get_i32() as usize;
                ensure(buf, len)?;
                let raw = buf[..len].to_vec();
                buf.advance(len);
                let text = String::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
                values.push(TupleValue::Text(text));
            }
            other => return Err(DecodeError::UnexpectedTupleKind(other)),
        }
    }

    Ok(values)
}

fn read_cstring(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::Truncated)?;
    let raw = buf[..end].to_vec();
    buf.advance(end + 1);
    String::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)
}

fn ensure(buf: &[u8], len: usize) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        Err(DecodeError::Truncated)
    } else {
        Ok(())
    }
}

/// Convert a PostgreSQL commit timestamp to wall-clock time.
pub fn pg_timestamp_to_system_time(us_since_pg_epoch: i64) -> SystemTime {
    let base = UNIX_EPOCH + Duration::from_secs(PG_EPOCH_UNIX_SECS);
    if us_since_pg_epoch >= 0 {
        base + Duration::from_micros(us_since_pg_epoch as u64)
    } else {
        base - Duration::from_micros(us_since_pg_epoch.unsigned_abs())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::BufMut;

    fn put_cstring(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(s.as_bytes());
        buf.put_u8(0);
    }

    pub(crate) fn begin_message(commit_ts_us: i64, xid: u32) -> Vec<u8> {
        let mut buf = vec![b'B'];
        buf.put_u64(0x0100_0000);
        buf.put_i64(commit_ts_us);
        buf.put_u32(xid);
        buf
    }

    pub(crate) fn commit_message(commit_ts_us: i64) -> Vec<u8> {
        let mut buf = vec![b'C'];
        buf.put_u8(0);
        buf.put_u64(0x0100_0000);
        buf.put_u64(0x0100_0008);
        buf.put_i64(commit_ts_us);
        buf
    }

    pub(crate) fn relation_message(id: u32, namespace: &str, name: &str, columns: &[&str]) -> Vec<u8> {
        let mut buf = vec![b'R'];
        buf.put_u32(id);
        put_cstring(&mut buf, namespace);
        put_cstring(&mut buf, name);
        buf.put_u8(b'd');
        buf.put_u16(columns.len() as u16);
        for column in columns {
            buf.put_u8(0);
            put_cstring(&mut buf, column);
            buf.put_u32(25); // text oid
            buf.put_i32(-1);
        }
        buf
    }

    pub(crate) fn insert_message(relation_id: u32, values: &[Option<&str>]) -> Vec<u8> {
        let mut buf = vec![b'I'];
        buf.put_u32(relation_id);
        buf.put_u8(b'N');
        buf.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(text) => {
                    buf.put_u8(b't');
                    buf.put_i32(text.len() as i32);
                    buf.extend_from_slice(text.as_bytes());
                }
                None => buf.put_u8(b'n'),
            }
        }
        buf
    }

    #[test]
    fn test_decode_begin() {
        let msg = decode(&begin_message(123_456, 42)).unwrap();
        assert_eq!(
            msg,
            PgOutputMessage::Begin {
                final_lsn: 0x0100_0000,
                commit_ts_us: 123_456,
                xid: 42,
            }
        );
    }

    #[test]
    fn test_decode_commit() {
        let msg = decode(&commit_message(123_456)).unwrap();
        assert!(matches!(
            msg,
            PgOutputMessage::Commit {
                commit_ts_us: 123_456,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_relation() {
        let raw = relation_message(77, "realtime", "messages", &["id", "topic", "payload"]);
        let msg = decode(&raw).unwrap();
        assert_eq!(
            msg,
            PgOutputMessage::Relation(Relation {
                id: 77,
                namespace: "realtime".to_string(),
                name: "messages".to_string(),
                columns: vec!["id".to_string(), "topic".to_string(), "payload".to_string()],
            })
        );
    }

    #[test]
    fn test_decode_insert_with_nulls() {
        let raw = insert_message(77, &[Some("abc"), None, Some("{}")]);
        let msg = decode(&raw).unwrap();
        assert_eq!(
            msg,
            PgOutputMessage::Insert {
                relation_id: 77,
                tuple: vec![
                    TupleValue::Text("abc".to_string()),
                    TupleValue::Null,
                    TupleValue::Text("{}".to_string()),
                ],
            }
        );
    }

    #[test]
    fn test_unhandled_kind_is_other() {
        assert_eq!(decode(&[b'Y', 1, 2, 3]).unwrap(), PgOutputMessage::Other(b'Y'));
    }

    #[test]
    fn test_truncated_messages_error() {
        assert!(matches!(decode(&[]), Err(DecodeError::Empty)));
        assert!(matches!(decode(&[b'B', 0, 1]), Err(DecodeError::Truncated)));

        let mut raw = insert_message(77, &[Some("abc")]);
        raw.truncate(raw.len() - 1);
        assert!(matches!(decode(&raw), Err(DecodeError::Truncated)));
    }

    #[test]
    fn test_pg_timestamp_conversion() {
        // 2000-01-01 00:00:00 UTC plus one second
        let t = pg_timestamp_to_system_time(1_000_000);
        let unix = t.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(unix, 946_684_801);
    }
}
