use std::io::{Read, Seek, SeekFrom, Write};

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Result, WimError};

/// WIM file magic: "MSWIM\0\0\0"
pub const WIM_MAGIC: [u8; 8] = *b"MSWIM\0\0\0";

/// Fixed on-disk header size in bytes. The header is written twice: a
/// placeholder at the start of a write, and the final version once every
/// resource offset is known.
pub const HEADER_DISK_SIZE: usize = 208;

/// Default format version.
pub const WIM_VERSION: u32 = 0x10d00;

/// Header flag: reparse-point fixups were applied at capture time.
pub const WIM_HDR_FLAG_RP_FIX: u32 = 0x0000_0080;

/// Resource flags (high byte of the packed size field).
pub const RESHDR_FLAG_FREE: u8 = 0x01;
pub const RESHDR_FLAG_METADATA: u8 = 0x02;
pub const RESHDR_FLAG_COMPRESSED: u8 = 0x04;
pub const RESHDR_FLAG_SPANNED: u8 = 0x08;

/// On-disk resource entry: a u64 whose low 7 bytes are the stored size and
/// whose high byte holds the flags, followed by the archive offset and the
/// uncompressed size.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct DiskResourceEntry {
    size_and_flags: U64,
    offset: U64,
    original_size: U64,
}

/// In-memory resource entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceEntry {
    pub offset: u64,
    pub size: u64,
    pub original_size: u64,
    pub flags: u8,
}

impl ResourceEntry {
    pub fn is_compressed(&self) -> bool {
        self.flags & RESHDR_FLAG_COMPRESSED != 0
    }

    pub fn is_metadata(&self) -> bool {
        self.flags & RESHDR_FLAG_METADATA != 0
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0 && self.offset == 0
    }

    pub(crate) fn to_disk(self) -> DiskResourceEntry {
        DiskResourceEntry {
            size_and_flags: U64::new((self.size & 0x00ff_ffff_ffff_ffff) | ((self.flags as u64) << 56)),
            offset: U64::new(self.offset),
            original_size: U64::new(self.original_size),
        }
    }

    pub(crate) fn from_disk(disk: &DiskResourceEntry) -> Self {
        let packed = disk.size_and_flags.get();
        ResourceEntry {
            offset: disk.offset.get(),
            size: packed & 0x00ff_ffff_ffff_ffff,
            original_size: disk.original_size.get(),
            flags: (packed >> 56) as u8,
        }
    }
}

/// On-disk WIM header, exactly [`HEADER_DISK_SIZE`] bytes.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct DiskHeader {
    magic: [u8; 8],
    hdr_size: U32,
    version: U32,
    flags: U32,
    chunk_size: U32,
    guid: [u8; 16],
    part_number: U16,
    total_parts: U16,
    image_count: U32,
    lookup_table_res: DiskResourceEntry,
    xml_res: DiskResourceEntry,
    boot_metadata_res: DiskResourceEntry,
    boot_idx: U32,
    integrity_res: DiskResourceEntry,
    unused: [u8; 60],
}

/// Parsed WIM header.
#[derive(Debug, Clone)]
pub struct WimHeader {
    pub version: u32,
    pub flags: u32,
    pub chunk_size: u32,
    pub guid: [u8; 16],
    pub part_number: u16,
    pub total_parts: u16,
    pub image_count: u32,
    pub lookup_table_res: ResourceEntry,
    pub xml_res: ResourceEntry,
    pub boot_metadata_res: ResourceEntry,
    pub boot_idx: u32,
    pub integrity_res: ResourceEntry,
}

impl WimHeader {
    /// Header for a fresh single-part archive with no images.
    pub fn new() -> Self {
        WimHeader {
            version: WIM_VERSION,
            flags: 0,
            chunk_size: 0,
            guid: rand::random(),
            part_number: 1,
            total_parts: 1,
            image_count: 0,
            lookup_table_res: ResourceEntry::default(),
            xml_res: ResourceEntry::default(),
            boot_metadata_res: ResourceEntry::default(),
            boot_idx: 0,
            integrity_res: ResourceEntry::default(),
        }
    }

    /// Serialise to the fixed 208-byte layout and write at the current
    /// position.
    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        let disk = DiskHeader {
            magic: WIM_MAGIC,
            hdr_size: U32::new(HEADER_DISK_SIZE as u32),
            version: U32::new(self.version),
            flags: U32::new(self.flags),
            chunk_size: U32::new(self.chunk_size),
            guid: self.guid,
            part_number: U16::new(self.part_number),
            total_parts: U16::new(self.total_parts),
            image_count: U32::new(self.image_count),
            lookup_table_res: self.lookup_table_res.to_disk(),
            xml_res: self.xml_res.to_disk(),
            boot_metadata_res: self.boot_metadata_res.to_disk(),
            boot_idx: U32::new(self.boot_idx),
            integrity_res: self.integrity_res.to_disk(),
            unused: [0u8; 60],
        };
        out.write_all(disk.as_bytes()).map_err(WimError::Write)
    }

    /// Read and validate a header from offset 0.
    pub fn read_from(file: &mut (impl Read + Seek)) -> Result<Self> {
        file.seek(SeekFrom::Start(0)).map_err(WimError::Read)?;
        let mut buf = [0u8; HEADER_DISK_SIZE];
        file.read_exact(&mut buf).map_err(WimError::Read)?;
        let disk = DiskHeader::ref_from_bytes(&buf)
            .map_err(|_| WimError::Corrupt("header too small"))?;

        if disk.magic != WIM_MAGIC {
            return Err(WimError::Corrupt("bad magic in header"));
        }
        if disk.hdr_size.get() as usize != HEADER_DISK_SIZE {
            return Err(WimError::Corrupt("unexpected header size"));
        }

        Ok(WimHeader {
            version: disk.version.get(),
            flags: disk.flags.get(),
            chunk_size: disk.chunk_size.get(),
            guid: disk.guid,
            part_number: disk.part_number.get(),
            total_parts: disk.total_parts.get(),
            image_count: disk.image_count.get(),
            lookup_table_res: ResourceEntry::from_disk(&disk.lookup_table_res),
            xml_res: ResourceEntry::from_disk(&disk.xml_res),
            boot_metadata_res: ResourceEntry::from_disk(&disk.boot_metadata_res),
            boot_idx: disk.boot_idx.get(),
            integrity_res: ResourceEntry::from_disk(&disk.integrity_res),
        })
    }
}

impl Default for WimHeader {
    fn default() -> Self {
        Self::new()
    }
}
