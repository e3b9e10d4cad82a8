use std::collections::HashMap;
use std::io::Write;

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Result, WimError};
use crate::wim::header::{DiskResourceEntry, ResourceEntry};

/// SHA-1 digest identifying a stream's contents.
pub type Sha1Hash = [u8; 20];

/// Index of a stream descriptor within the lookup table's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) usize);

/// Where a stream's bytes live.
#[derive(Debug, Clone)]
pub enum StreamSource {
    /// In the archive part identified by its part number, at the
    /// descriptor's resource entry.
    Archive { part_number: u16 },
    /// In memory (new metadata blobs, test fixtures).
    Buffer(Vec<u8>),
}

/// One distinct content-addressed stream.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub hash: Sha1Hash,
    /// Location within the source archive.
    pub resource: ResourceEntry,
    pub part_number: u16,
    /// Number of tree references (dentries across all images).
    pub refcnt: u32,
    pub source: StreamSource,
    /// Output reference count, used by the writer to emit each reachable
    /// stream exactly once. Zeroed at the start of every write.
    pub out_refcnt: u32,
    /// Location within the output archive, filled in by the writer.
    pub output: ResourceEntry,
}

impl StreamDescriptor {
    pub fn size(&self) -> u64 {
        self.resource.original_size
    }
}

/// On-disk lookup table entry, 50 bytes.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct DiskLookupEntry {
    resource: DiskResourceEntry,
    part_number: U16,
    refcnt: U32,
    hash: [u8; 20],
}

pub const LOOKUP_ENTRY_DISK_SIZE: usize = 50;

/// Record of one `merge` call, kept so `unmerge` can undo it exactly.
struct MergeRecord {
    prev_len: usize,
    added_hashes: Vec<Sha1Hash>,
}

/// In-memory index from content hash to stream descriptor.
///
/// Descriptors live in an arena; all cross-references (dentry trees, the
/// extraction planner's side tables) use [`StreamId`] indices into it.
#[derive(Default)]
pub struct LookupTable {
    streams: Vec<StreamDescriptor>,
    by_hash: HashMap<Sha1Hash, StreamId>,
    merges: Vec<MergeRecord>,
}

impl LookupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn lookup(&self, hash: &Sha1Hash) -> Option<StreamId> {
        self.by_hash.get(hash).copied()
    }

    pub fn get(&self, id: StreamId) -> &StreamDescriptor {
        &self.streams[id.0]
    }

    pub fn get_mut(&mut self, id: StreamId) -> &mut StreamDescriptor {
        &mut self.streams[id.0]
    }

    /// Insert a descriptor, replacing nothing: if the hash is already
    /// present the existing id is returned and the argument is dropped.
    pub fn insert(&mut self, desc: StreamDescriptor) -> StreamId {
        if let Some(id) = self.by_hash.get(&desc.hash) {
            return *id;
        }
        let id = StreamId(self.streams.len());
        self.by_hash.insert(desc.hash, id);
        self.streams.push(desc);
        id
    }

    pub fn iter(&self) -> impl Iterator<Item = (StreamId, &StreamDescriptor)> {
        self.streams
            .iter()
            .enumerate()
            .map(|(i, d)| (StreamId(i), d))
    }

    /// Zero every descriptor's output refcount. Called at the start of a
    /// write so the resource pass can detect first use.
    pub fn reset_output_refcounts(&mut self) {
        for desc in &mut self.streams {
            desc.out_refcnt = 0;
        }
    }

    /// Union a secondary (split-archive) table into this one. Entries
    /// whose hash already exists here are skipped: the primary wins on
    /// conflict. Metadata streams are never merged.
    pub fn merge(&mut self, secondary: &LookupTable) {
        let prev_len = self.streams.len();
        let mut added_hashes = Vec::new();
        for desc in &secondary.streams {
            if desc.resource.is_metadata() || self.by_hash.contains_key(&desc.hash) {
                continue;
            }
            let id = StreamId(self.streams.len());
            self.by_hash.insert(desc.hash, id);
            self.streams.push(desc.clone());
            added_hashes.push(desc.hash);
        }
        self.merges.push(MergeRecord {
            prev_len,
            added_hashes,
        });
    }

    /// Undo the most recent [`merge`](Self::merge), restoring the table to
    /// its pre-merge state exactly.
    pub fn unmerge(&mut self) {
        if let Some(record) = self.merges.pop() {
            for hash in &record.added_hashes {
                self.by_hash.remove(hash);
            }
            self.streams.truncate(record.prev_len);
        }
    }

    /// Serialise every descriptor written to the output (out_refcnt > 0)
    /// using its output resource entry.
    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        for desc in &self.streams {
            if desc.out_refcnt == 0 {
                continue;
            }
            let disk = DiskLookupEntry {
                resource: desc.output.to_disk(),
                part_number: U16::new(desc.part_number),
                refcnt: U32::new(desc.refcnt.max(1)),
                hash: desc.hash,
            };
            out.write_all(disk.as_bytes()).map_err(WimError::Write)?;
        }
        Ok(())
    }

    /// Parse a raw lookup-table region read from an archive.
    pub fn parse(data: &[u8], part_number: u16) -> Result<Self> {
        if data.len() % LOOKUP_ENTRY_DISK_SIZE != 0 {
            return Err(WimError::Corrupt("lookup table size not a multiple of 50"));
        }
        let mut table = LookupTable::new();
        for chunk in data.chunks_exact(LOOKUP_ENTRY_DISK_SIZE) {
            let disk = DiskLookupEntry::ref_from_bytes(chunk)
                .map_err(|_| WimError::Corrupt("short lookup table entry"))?;
            let resource = ResourceEntry::from_disk(&disk.resource);
            table.insert(StreamDescriptor {
                hash: disk.hash,
                resource,
                part_number: disk.part_number.get(),
                refcnt: disk.refcnt.get(),
                source: StreamSource::Archive { part_number },
                out_refcnt: 0,
                output: ResourceEntry::default(),
            });
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(hash_byte: u8, offset: u64, size: u64) -> StreamDescriptor {
        StreamDescriptor {
            hash: [hash_byte; 20],
            resource: ResourceEntry {
                offset,
                size,
                original_size: size,
                flags: 0,
            },
            part_number: 1,
            refcnt: 1,
            source: StreamSource::Buffer(vec![hash_byte; size as usize]),
            out_refcnt: 0,
            output: ResourceEntry::default(),
        }
    }

    #[test]
    fn insert_dedupes_by_hash() {
        let mut table = LookupTable::new();
        let a = table.insert(desc(1, 100, 10));
        let b = table.insert(desc(1, 999, 10));
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(a).resource.offset, 100);
    }

    #[test]
    fn merge_prefers_primary_and_unmerge_restores_exactly() {
        let mut primary = LookupTable::new();
        primary.insert(desc(1, 100, 10));
        primary.insert(desc(2, 200, 20));

        let mut secondary = LookupTable::new();
        secondary.insert(desc(2, 777, 20)); // conflict: primary must win
        secondary.insert(desc(3, 300, 30));

        primary.merge(&secondary);
        assert_eq!(primary.len(), 3);
        let two = primary.lookup(&[2u8; 20]).unwrap();
        assert_eq!(primary.get(two).resource.offset, 200);
        assert!(primary.lookup(&[3u8; 20]).is_some());

        primary.unmerge();
        assert_eq!(primary.len(), 2);
        assert!(primary.lookup(&[3u8; 20]).is_none());
        assert!(primary.lookup(&[1u8; 20]).is_some());
        assert!(primary.lookup(&[2u8; 20]).is_some());
    }

    #[test]
    fn write_round_trips_written_entries() {
        let mut table = LookupTable::new();
        let a = table.insert(desc(1, 0, 10));
        let b = table.insert(desc(2, 0, 20));
        table.get_mut(a).out_refcnt = 2;
        table.get_mut(a).output = ResourceEntry {
            offset: 208,
            size: 10,
            original_size: 10,
            flags: 0,
        };
        // b was not written to the output; it must not be serialised.
        let _ = b;

        let mut buf = Vec::new();
        table.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), LOOKUP_ENTRY_DISK_SIZE);

        let parsed = LookupTable::parse(&buf, 1).unwrap();
        assert_eq!(parsed.len(), 1);
        let id = parsed.lookup(&[1u8; 20]).unwrap();
        assert_eq!(parsed.get(id).resource.offset, 208);
        assert_eq!(parsed.get(id).refcnt, 2);
    }
}
