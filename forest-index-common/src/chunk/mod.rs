//! The length-prefixed, versioned chunk container the index sidecar is
//! stored in.
//!
//! A chunk file is a four-byte type tag, a major/minor version pair, and
//! one or more chunks, each a length-prefixed header followed by a
//! length-prefixed data payload. This mirrors how COPC stores its
//! hierarchy pages inside a VLR (a tag, then length-prefixed entries),
//! adapted to a dedicated container rather than piggy-backing on LAS VLRs,
//! since the sidecar is a standalone file here.

use crate::error::{CoreError, FormatError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::path::Path;

/// `"IDX8"` as a little-endian u32, the chunk file's magic number.
pub const CHUNK_TYPE_OCTREE_INDEX: u32 = 0x3858_4449;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkVersion {
    pub major: u16,
    pub minor: u16,
}

pub const OCTREE_INDEX_VERSION_1_0: ChunkVersion = ChunkVersion { major: 1, minor: 0 };

/// One chunk: a type tag, a version, and a data payload. The header and
/// data lengths are written so that a reader who does not understand this
/// chunk's type can still skip over it.
pub struct Chunk {
    pub chunk_type: u32,
    pub version: ChunkVersion,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn read_from<R: Read>(path: &Path, mut r: R) -> Result<Self, CoreError> {
        let chunk_type = r.read_u32::<LittleEndian>().map_err(|e| CoreError::io(path, e))?;
        let major = r.read_u16::<LittleEndian>().map_err(|e| CoreError::io(path, e))?;
        let minor = r.read_u16::<LittleEndian>().map_err(|e| CoreError::io(path, e))?;
        let data_len = r.read_u64::<LittleEndian>().map_err(|e| CoreError::io(path, e))?;
        let mut data = vec![0u8; data_len as usize];
        r.read_exact(&mut data).map_err(|e| CoreError::io(path, e))?;
        Ok(Chunk {
            chunk_type,
            version: ChunkVersion { major, minor },
            data,
        })
    }

    pub fn write_to<W: Write>(&self, path: &Path, mut w: W) -> Result<(), CoreError> {
        w.write_u32::<LittleEndian>(self.chunk_type)
            .map_err(|e| CoreError::io(path, e))?;
        w.write_u16::<LittleEndian>(self.version.major)
            .map_err(|e| CoreError::io(path, e))?;
        w.write_u16::<LittleEndian>(self.version.minor)
            .map_err(|e| CoreError::io(path, e))?;
        w.write_u64::<LittleEndian>(self.data.len() as u64)
            .map_err(|e| CoreError::io(path, e))?;
        w.write_all(&self.data).map_err(|e| CoreError::io(path, e))
    }

    /// Verifies the chunk carries the expected type tag and a version this
    /// crate's reader understands (same major, minor no larger than what
    /// this crate was built against).
    pub fn expect(
        &self,
        path: &Path,
        chunk_type: u32,
        expected: ChunkVersion,
    ) -> Result<(), CoreError> {
        if self.chunk_type != chunk_type {
            return Err(FormatError {
                path: path.to_owned(),
                message: format!(
                    "expected chunk type {chunk_type:#010x}, found {:#010x}",
                    self.chunk_type
                ),
            }
            .into());
        }
        if self.version.major != expected.major || self.version.minor > expected.minor {
            return Err(FormatError {
                path: path.to_owned(),
                message: format!(
                    "unsupported chunk version {}.{} (expected {}.{} or earlier minor)",
                    self.version.major, self.version.minor, expected.major, expected.minor
                ),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn round_trips_through_bytes() {
        let chunk = Chunk {
            chunk_type: CHUNK_TYPE_OCTREE_INDEX,
            version: OCTREE_INDEX_VERSION_1_0,
            data: vec![1, 2, 3, 4, 5],
        };
        let mut buf = Vec::new();
        chunk.write_to(&PathBuf::from("test"), &mut buf).unwrap();
        let read_back = Chunk::read_from(&PathBuf::from("test"), buf.as_slice()).unwrap();
        assert_eq!(read_back.chunk_type, CHUNK_TYPE_OCTREE_INDEX);
        assert_eq!(read_back.version, OCTREE_INDEX_VERSION_1_0);
        assert_eq!(read_back.data, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn rejects_wrong_type() {
        let chunk = Chunk {
            chunk_type: 0xDEAD_BEEF,
            version: OCTREE_INDEX_VERSION_1_0,
            data: vec![],
        };
        let path = PathBuf::from("test");
        assert!(chunk
            .expect(&path, CHUNK_TYPE_OCTREE_INDEX, OCTREE_INDEX_VERSION_1_0)
            .is_err());
    }
}
