use std::io::{Read, Seek, SeekFrom, Write};

use log::debug;
use sha1::{Digest, Sha1};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Result, WimError};
use crate::wim::lookup::Sha1Hash;

/// Digest granularity of the integrity table.
pub const INTEGRITY_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct DiskIntegrityHeader {
    cb_size: U32,
    num_chunks: U32,
    chunk_size: U32,
}

const INTEGRITY_HEADER_SIZE: usize = 12;

/// Chunk-level SHA-1 digests over the pre-XML region of the archive.
pub struct IntegrityTable {
    pub chunk_size: u32,
    pub digests: Vec<Sha1Hash>,
}

impl IntegrityTable {
    /// Compute digests over `[start, end)` of `file`, re-reading it.
    pub fn compute(
        file: &mut (impl Read + Seek),
        start: u64,
        end: u64,
        show_progress: bool,
    ) -> Result<Self> {
        let mut digests = Vec::new();
        let total = end.saturating_sub(start);
        file.seek(SeekFrom::Start(start)).map_err(WimError::Read)?;

        let mut remaining = total;
        let mut buf = vec![0u8; INTEGRITY_CHUNK_SIZE.min(1 << 20) as usize];
        while remaining > 0 {
            let mut hasher = Sha1::new();
            let mut chunk_left = (INTEGRITY_CHUNK_SIZE as u64).min(remaining);
            while chunk_left > 0 {
                let want = buf.len().min(chunk_left as usize);
                file.read_exact(&mut buf[..want]).map_err(WimError::Read)?;
                hasher.update(&buf[..want]);
                chunk_left -= want as u64;
            }
            remaining -= (INTEGRITY_CHUNK_SIZE as u64).min(remaining);
            digests.push(hasher.finalize().into());
            if show_progress {
                debug!(
                    "integrity: hashed chunk {}/{}",
                    digests.len(),
                    total.div_ceil(INTEGRITY_CHUNK_SIZE as u64)
                );
            }
        }

        Ok(IntegrityTable {
            chunk_size: INTEGRITY_CHUNK_SIZE,
            digests,
        })
    }

    pub fn disk_size(&self) -> u64 {
        (INTEGRITY_HEADER_SIZE + self.digests.len() * 20) as u64
    }

    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        let hdr = DiskIntegrityHeader {
            cb_size: U32::new(self.disk_size() as u32),
            num_chunks: U32::new(self.digests.len() as u32),
            chunk_size: U32::new(self.chunk_size),
        };
        out.write_all(hdr.as_bytes()).map_err(WimError::Write)?;
        for digest in &self.digests {
            out.write_all(digest).map_err(WimError::Write)?;
        }
        Ok(())
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let (hdr, rest) = DiskIntegrityHeader::ref_from_prefix(data)
            .map_err(|_| WimError::Corrupt("integrity table too small"))?;
        let num = hdr.num_chunks.get() as usize;
        if hdr.cb_size.get() as usize != INTEGRITY_HEADER_SIZE + num * 20
            || rest.len() < num * 20
        {
            return Err(WimError::Corrupt("integrity table size mismatch"));
        }
        let digests = rest[..num * 20]
            .chunks_exact(20)
            .map(|c| {
                let mut digest = [0u8; 20];
                digest.copy_from_slice(c);
                digest
            })
            .collect();
        Ok(IntegrityTable {
            chunk_size: hdr.chunk_size.get(),
            digests,
        })
    }

    /// Check `[start, end)` of `file` against this table.
    pub fn verify(
        &self,
        file: &mut (impl Read + Seek),
        start: u64,
        end: u64,
    ) -> Result<bool> {
        let fresh = IntegrityTable::compute(file, start, end, false)?;
        Ok(fresh.digests == self.digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn compute_write_parse_round_trip() {
        let data = vec![0xabu8; 4096];
        let mut cursor = Cursor::new(data);
        let table = IntegrityTable::compute(&mut cursor, 100, 4096, false).unwrap();
        assert_eq!(table.digests.len(), 1);

        let mut disk = Vec::new();
        table.write_to(&mut disk).unwrap();
        assert_eq!(disk.len() as u64, table.disk_size());

        let parsed = IntegrityTable::parse(&disk).unwrap();
        assert_eq!(parsed.chunk_size, INTEGRITY_CHUNK_SIZE);
        assert_eq!(parsed.digests, table.digests);
        assert!(parsed.verify(&mut cursor, 100, 4096).unwrap());
    }

    #[test]
    fn verify_detects_corruption() {
        let mut cursor = Cursor::new(vec![1u8; 1000]);
        let table = IntegrityTable::compute(&mut cursor, 0, 1000, false).unwrap();
        let mut tampered = Cursor::new(vec![2u8; 1000]);
        assert!(!table.verify(&mut tampered, 0, 1000).unwrap());
    }

    #[test]
    fn empty_range_produces_no_digests() {
        let mut cursor = Cursor::new(vec![0u8; 10]);
        let table = IntegrityTable::compute(&mut cursor, 10, 10, false).unwrap();
        assert!(table.digests.is_empty());
        let mut disk = Vec::new();
        table.write_to(&mut disk).unwrap();
        assert_eq!(disk.len(), 12);
    }
}
