//! Binary codec for log records.
//!
//! Frame: `[length:4][type:1][payload:length][crc32:4]`, crc over type and
//! payload. All integers little endian.
//!
//! Prepare payload:
//! `[txn_pos:8][txn_offset:4][expected_version:4][flags:2][timestamp:8]`
//! `[event_id:16][stream:2+n][event_type:2+n][data:4+n][metadata:4+n]`
//!
//! Commit payload:
//! `[txn_pos:8][first_event_number:4][event_count:4][timestamp:8]`

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use uuid::Uuid;

use chronicle_core::{
    error::{Error, Result},
    types::RecordType,
    CommitRecord, LogRecord, PrepareFlags, PrepareRecord,
};

use super::types::{RECORD_OVERHEAD, RECORD_PREFIX_SIZE};

const COMMIT_PAYLOAD_SIZE: usize = 24;
const PREPARE_FIXED_SIZE: usize = 8 + 4 + 4 + 2 + 8 + 16 + 2 + 2 + 4 + 4;

/// Result of decoding a frame from a byte slice.
#[derive(Debug)]
pub enum DecodeOutcome {
    Complete { record: LogRecord, consumed: usize },
    /// The slice ends before the frame does.
    Incomplete,
    /// The bytes are not a valid frame.
    Corrupt(String),
}

/// Full frame length of `record` once encoded.
pub fn frame_len(record: &LogRecord) -> usize {
    payload_len(record) + RECORD_OVERHEAD
}

fn payload_len(record: &LogRecord) -> usize {
    match record {
        LogRecord::Commit(_) => COMMIT_PAYLOAD_SIZE,
        LogRecord::Prepare(p) => {
            PREPARE_FIXED_SIZE
                + p.stream_id.len()
                + p.event_type.len()
                + p.data.len()
                + p.metadata.len()
        }
    }
}

/// Encode `record` into a complete frame.
pub fn encode_frame(record: &LogRecord) -> Result<Vec<u8>> {
    let payload_len = payload_len(record);
    let mut buf = Vec::with_capacity(payload_len + RECORD_OVERHEAD);

    buf.write_u32::<LittleEndian>(payload_len as u32)?;
    buf.write_u8(record.record_type() as u8)?;
    match record {
        LogRecord::Prepare(p) => write_prepare(&mut buf, p)?,
        LogRecord::Commit(c) => write_commit(&mut buf, c)?,
    }

    let crc = crc32fast::hash(&buf[4..]);
    buf.write_u32::<LittleEndian>(crc)?;
    debug_assert_eq!(buf.len(), payload_len + RECORD_OVERHEAD);
    Ok(buf)
}

fn write_prepare(buf: &mut Vec<u8>, p: &PrepareRecord) -> Result<()> {
    if p.stream_id.len() > u16::MAX as usize || p.event_type.len() > u16::MAX as usize {
        return Err(Error::WriteError {
            message: "stream id or event type longer than 65535 bytes".to_string(),
            source: None,
        });
    }

    buf.write_u64::<LittleEndian>(p.transaction_position)?;
    buf.write_u32::<LittleEndian>(p.transaction_offset)?;
    buf.write_i32::<LittleEndian>(p.expected_version)?;
    buf.write_u16::<LittleEndian>(p.flags.bits())?;
    buf.write_i64::<LittleEndian>(p.timestamp)?;
    buf.write_all(p.event_id.as_bytes())?;
    buf.write_u16::<LittleEndian>(p.stream_id.len() as u16)?;
    buf.write_all(p.stream_id.as_bytes())?;
    buf.write_u16::<LittleEndian>(p.event_type.len() as u16)?;
    buf.write_all(p.event_type.as_bytes())?;
    buf.write_u32::<LittleEndian>(p.data.len() as u32)?;
    buf.write_all(&p.data)?;
    buf.write_u32::<LittleEndian>(p.metadata.len() as u32)?;
    buf.write_all(&p.metadata)?;
    Ok(())
}

fn write_commit(buf: &mut Vec<u8>, c: &CommitRecord) -> Result<()> {
    buf.write_u64::<LittleEndian>(c.transaction_position)?;
    buf.write_i32::<LittleEndian>(c.first_event_number)?;
    buf.write_u32::<LittleEndian>(c.event_count)?;
    buf.write_i64::<LittleEndian>(c.timestamp)?;
    Ok(())
}

/// Read the payload length from a frame prefix.
pub fn peek_payload_len(prefix: &[u8]) -> Option<usize> {
    let bytes: [u8; 4] = prefix.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes) as usize)
}

/// Decode the frame at the start of `buf`.
///
/// `max_payload` bounds the length field so that garbage does not look like a
/// huge record. With `verify` off the crc is not checked.
pub fn decode_frame(buf: &[u8], max_payload: usize, verify: bool) -> DecodeOutcome {
    if buf.len() < RECORD_PREFIX_SIZE {
        return DecodeOutcome::Incomplete;
    }
    let payload_len = match peek_payload_len(buf) {
        Some(len) => len,
        None => return DecodeOutcome::Incomplete,
    };
    if payload_len > max_payload {
        return DecodeOutcome::Corrupt(format!("record length {} exceeds chunk capacity", payload_len));
    }

    let total = payload_len + RECORD_OVERHEAD;
    if buf.len() < total {
        return DecodeOutcome::Incomplete;
    }

    let body = &buf[4..RECORD_PREFIX_SIZE + payload_len];
    if verify {
        let stored = u32::from_le_bytes([
            buf[total - 4],
            buf[total - 3],
            buf[total - 2],
            buf[total - 1],
        ]);
        if crc32fast::hash(body) != stored {
            return DecodeOutcome::Corrupt("record checksum mismatch".to_string());
        }
    }

    let record_type = match RecordType::try_from(body[0]) {
        Ok(t) => t,
        Err(tag) => return DecodeOutcome::Corrupt(format!("unknown record type {}", tag)),
    };
    let payload = &body[1..];

    let decoded = match record_type {
        RecordType::Prepare => read_prepare(payload).map(LogRecord::Prepare),
        RecordType::Commit => read_commit(payload).map(LogRecord::Commit),
    };
    match decoded {
        Ok(record) => DecodeOutcome::Complete { record, consumed: total },
        Err(e) => DecodeOutcome::Corrupt(format!("malformed payload: {}", e)),
    }
}

fn read_prepare(payload: &[u8]) -> std::io::Result<PrepareRecord> {
    let mut cursor = Cursor::new(payload);

    let transaction_position = cursor.read_u64::<LittleEndian>()?;
    let transaction_offset = cursor.read_u32::<LittleEndian>()?;
    let expected_version = cursor.read_i32::<LittleEndian>()?;
    let flags = PrepareFlags::from_bits(cursor.read_u16::<LittleEndian>()?);
    let timestamp = cursor.read_i64::<LittleEndian>()?;
    let mut id = [0u8; 16];
    cursor.read_exact(&mut id)?;

    let stream_len = cursor.read_u16::<LittleEndian>()? as usize;
    let stream_id = read_string(&mut cursor, stream_len)?;
    let type_len = cursor.read_u16::<LittleEndian>()? as usize;
    let event_type = read_string(&mut cursor, type_len)?;
    let data_len = cursor.read_u32::<LittleEndian>()? as usize;
    let data = read_bytes(&mut cursor, data_len)?;
    let meta_len = cursor.read_u32::<LittleEndian>()? as usize;
    let metadata = read_bytes(&mut cursor, meta_len)?;

    if cursor.position() as usize != payload.len() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "trailing bytes in prepare"));
    }

    Ok(PrepareRecord {
        transaction_position,
        transaction_offset,
        expected_version,
        flags,
        timestamp,
        event_id: Uuid::from_bytes(id),
        stream_id,
        event_type,
        data,
        metadata,
    })
}

fn read_commit(payload: &[u8]) -> std::io::Result<CommitRecord> {
    if payload.len() != COMMIT_PAYLOAD_SIZE {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad commit length"));
    }
    let mut cursor = Cursor::new(payload);
    Ok(CommitRecord {
        transaction_position: cursor.read_u64::<LittleEndian>()?,
        first_event_number: cursor.read_i32::<LittleEndian>()?,
        event_count: cursor.read_u32::<LittleEndian>()?,
        timestamp: cursor.read_i64::<LittleEndian>()?,
    })
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> std::io::Result<Bytes> {
    let start = cursor.position() as usize;
    let inner = *cursor.get_ref();
    let end = start
        .checked_add(len)
        .filter(|end| *end <= inner.len())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "field overruns record"))?;
    cursor.set_position(end as u64);
    Ok(Bytes::copy_from_slice(&inner[start..end]))
}

fn read_string(cursor: &mut Cursor<&[u8]>, len: usize) -> std::io::Result<String> {
    let bytes = read_bytes(cursor, len)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
