use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use chronicle_core::error::{Error, Result};

pub const CHUNK_MAGIC: &[u8; 8] = b"CHRNCHNK";
pub const CHUNK_FOOTER_MAGIC: &[u8; 8] = b"CHRNSEAL";
pub const CHUNK_VERSION: u32 = 1;
pub const CHUNK_HEADER_SIZE: usize = 64;
pub const CHUNK_FOOTER_SIZE: usize = 40;

/// `[length:4][type:1]` before the payload.
pub const RECORD_PREFIX_SIZE: usize = 5;
/// Prefix plus the trailing crc32.
pub const RECORD_OVERHEAD: usize = RECORD_PREFIX_SIZE + 4;

pub const CHUNK_FILE_EXTENSION: &str = "chk";
pub const SCAVENGE_TEMP_EXTENSION: &str = "scavenge";

const FOOTER_FLAG_COMPLETED: u32 = 0x1;

pub fn chunk_file_name(chunk_number: u32) -> String {
    format!("chunk-{:06}.{}", chunk_number, CHUNK_FILE_EXTENSION)
}

/// Parse `chunk-000042.chk` into `42`.
pub fn parse_chunk_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("chunk-")?
        .strip_suffix(".chk")?
        .parse()
        .ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_number: u32,
    /// Data capacity in bytes.
    pub chunk_size: u64,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Bumped every time a scavenge rewrites the chunk.
    pub scavenge_version: u32,
}

impl ChunkHeader {
    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(CHUNK_MAGIC)?;
        writer.write_u32::<LittleEndian>(CHUNK_VERSION)?;
        writer.write_u32::<LittleEndian>(self.chunk_number)?;
        writer.write_u64::<LittleEndian>(self.chunk_size)?;
        writer.write_i64::<LittleEndian>(self.created_at)?;
        writer.write_u32::<LittleEndian>(self.scavenge_version)?;
        writer.write_all(&[0u8; 28])?; // Reserved
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<[u8; CHUNK_HEADER_SIZE]> {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        let mut cursor = &mut buf[..];
        self.write_to(&mut cursor)?;
        Ok(buf)
    }

    pub fn read_from(mut reader: impl Read, chunk_number: u32) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != CHUNK_MAGIC {
            return Err(Error::corrupted(chunk_number, 0, "invalid chunk magic"));
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version != CHUNK_VERSION {
            return Err(Error::corrupted(
                chunk_number,
                0,
                format!("unsupported chunk version {}", version),
            ));
        }

        let header = ChunkHeader {
            chunk_number: reader.read_u32::<LittleEndian>()?,
            chunk_size: reader.read_u64::<LittleEndian>()?,
            created_at: reader.read_i64::<LittleEndian>()?,
            scavenge_version: reader.read_u32::<LittleEndian>()?,
        };

        if header.chunk_number != chunk_number {
            return Err(Error::corrupted(
                chunk_number,
                0,
                format!("header says chunk #{}", header.chunk_number),
            ));
        }
        Ok(header)
    }
}

/// Trailer written once when a chunk is sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub record_count: u64,
    /// Data bytes in use.
    pub logical_size: u64,
    pub completed: bool,
    /// crc32 of header and data.
    pub checksum: u32,
}

impl ChunkFooter {
    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_u64::<LittleEndian>(self.record_count)?;
        writer.write_u64::<LittleEndian>(self.logical_size)?;
        writer.write_u32::<LittleEndian>(if self.completed { FOOTER_FLAG_COMPLETED } else { 0 })?;
        writer.write_u32::<LittleEndian>(self.checksum)?;
        writer.write_all(&[0u8; 8])?; // Reserved
        writer.write_all(CHUNK_FOOTER_MAGIC)?;
        Ok(())
    }

    /// Returns `None` when `bytes` is not a footer.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CHUNK_FOOTER_SIZE || &bytes[32..40] != CHUNK_FOOTER_MAGIC {
            return None;
        }
        let mut reader = bytes;
        let record_count = reader.read_u64::<LittleEndian>().ok()?;
        let logical_size = reader.read_u64::<LittleEndian>().ok()?;
        let flags = reader.read_u32::<LittleEndian>().ok()?;
        let checksum = reader.read_u32::<LittleEndian>().ok()?;
        Some(ChunkFooter {
            record_count,
            logical_size,
            completed: flags & FOOTER_FLAG_COMPLETED != 0,
            checksum,
        })
    }
}

/// Public description of a chunk, used by stats and the scavenger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkInfo {
    pub chunk_number: u32,
    /// Logical position of the first data byte.
    pub start_position: u64,
    /// Logical position one past the last record.
    pub end_position: u64,
    pub completed: bool,
    pub scavenge_version: u32,
    pub file_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_file_names() {
        assert_eq!(chunk_file_name(42), "chunk-000042.chk");
        assert_eq!(parse_chunk_file_name("chunk-000042.chk"), Some(42));
        assert_eq!(parse_chunk_file_name("chunk-000042.chk.scavenge"), None);
        assert_eq!(parse_chunk_file_name("indexmap.json"), None);
    }

    #[test]
    fn test_header_layout() {
        let header = ChunkHeader {
            chunk_number: 7,
            chunk_size: 1 << 20,
            created_at: 1_700_000_000_000,
            scavenge_version: 2,
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(&bytes[..8], CHUNK_MAGIC);
        assert_eq!(ChunkHeader::read_from(&bytes[..], 7).unwrap(), header);
        assert!(ChunkHeader::read_from(&bytes[..], 8).is_err());
    }

    #[test]
    fn test_footer_parse() {
        let footer = ChunkFooter { record_count: 3, logical_size: 300, completed: true, checksum: 0xdead };
        let mut bytes = Vec::new();
        footer.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), CHUNK_FOOTER_SIZE);
        assert_eq!(ChunkFooter::parse(&bytes), Some(footer));

        bytes[39] ^= 0xff;
        assert_eq!(ChunkFooter::parse(&bytes), None);
    }
}
