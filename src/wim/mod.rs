pub mod dentry;
pub mod header;
pub mod integrity;
pub mod lookup;
pub mod xml;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::error::{Result, WimError};
use crate::io::resource::Codec;
use dentry::{DentryTree, FILE_ATTRIBUTE_DIRECTORY, Inode};
use header::{ResourceEntry, WimHeader};
use lookup::{LookupTable, Sha1Hash, StreamDescriptor, StreamId, StreamSource};
use xml::{ImageInfo, WimInfo};

/// One image: its directory tree and the stream holding its serialised
/// metadata.
pub struct ImageMetadata {
    pub tree: DentryTree,
    pub metadata_stream: StreamId,
}

/// An open archive: header, stream index, per-image trees, and XML info.
/// Caller-scoped; the engine holds no global state.
pub struct WimStruct {
    pub path: Option<PathBuf>,
    pub(crate) file: Option<File>,
    pub hdr: WimHeader,
    pub lookup: LookupTable,
    pub images: Vec<ImageMetadata>,
    pub info: WimInfo,
    /// 1-based index of the selected image; 0 = none.
    pub current_image: u32,
    pub codec: Option<Box<dyn Codec>>,
}

impl WimStruct {
    /// An empty in-memory archive with no backing file.
    pub fn new() -> Self {
        WimStruct {
            path: None,
            file: None,
            hdr: WimHeader::new(),
            lookup: LookupTable::new(),
            images: Vec::new(),
            info: WimInfo::default(),
            current_image: 0,
            codec: None,
        }
    }

    /// Open an archive: header and lookup table are read eagerly; image
    /// trees stay empty until a metadata decoder populates them.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file =
            File::open(path).map_err(|e| WimError::open(path.to_path_buf(), e))?;
        let hdr = WimHeader::read_from(&mut file)?;

        let lt_res = hdr.lookup_table_res;
        let mut data = vec![0u8; lt_res.size as usize];
        if lt_res.size > 0 {
            file.seek(SeekFrom::Start(lt_res.offset))
                .map_err(WimError::Read)?;
            file.read_exact(&mut data).map_err(WimError::Read)?;
        }
        let lookup = LookupTable::parse(&data, hdr.part_number)?;

        let images: Vec<ImageMetadata> = lookup
            .iter()
            .filter(|(_, desc)| desc.resource.is_metadata())
            .map(|(id, _)| ImageMetadata {
                tree: DentryTree::new(Inode::new(1, FILE_ATTRIBUTE_DIRECTORY)),
                metadata_stream: id,
            })
            .collect();
        if images.len() as u32 != hdr.image_count {
            return Err(WimError::Corrupt(
                "image count disagrees with metadata stream count",
            ));
        }

        Ok(WimStruct {
            path: Some(path.to_path_buf()),
            file: Some(file),
            hdr,
            lookup,
            images,
            info: WimInfo::default(),
            current_image: 0,
            codec: None,
        })
    }

    pub fn image_count(&self) -> u32 {
        self.hdr.image_count
    }

    /// Select the image subsequent operations work on.
    pub fn select_image(&mut self, image: u32) -> Result<()> {
        if image == 0 || image as usize > self.images.len() {
            return Err(WimError::InvalidImage(image));
        }
        self.current_image = image;
        Ok(())
    }

    /// Content-addressed stream insertion: hashes `bytes`, adds a
    /// descriptor on first sight, bumps the reference count otherwise.
    pub fn add_stream(&mut self, bytes: Vec<u8>) -> Sha1Hash {
        let hash: Sha1Hash = Sha1::digest(&bytes).into();
        match self.lookup.lookup(&hash) {
            Some(id) => self.lookup.get_mut(id).refcnt += 1,
            None => {
                let len = bytes.len() as u64;
                self.lookup.insert(StreamDescriptor {
                    hash,
                    resource: ResourceEntry {
                        offset: 0,
                        size: len,
                        original_size: len,
                        flags: 0,
                    },
                    part_number: self.hdr.part_number,
                    refcnt: 1,
                    source: StreamSource::Buffer(bytes),
                    out_refcnt: 0,
                    output: ResourceEntry::default(),
                });
            }
        }
        hash
    }

    /// Append an image built in memory. `metadata_blob` is the image's
    /// serialised metadata resource (opaque to the engine).
    pub fn add_image(
        &mut self,
        tree: DentryTree,
        info: ImageInfo,
        metadata_blob: Vec<u8>,
    ) -> u32 {
        let hash: Sha1Hash = Sha1::digest(&metadata_blob).into();
        let len = metadata_blob.len() as u64;
        let metadata_stream = self.lookup.insert(StreamDescriptor {
            hash,
            resource: ResourceEntry {
                offset: 0,
                size: len,
                original_size: len,
                flags: header::RESHDR_FLAG_METADATA,
            },
            part_number: self.hdr.part_number,
            refcnt: 1,
            source: StreamSource::Buffer(metadata_blob),
            out_refcnt: 0,
            output: ResourceEntry::default(),
        });
        self.images.push(ImageMetadata {
            tree,
            metadata_stream,
        });
        self.info.images.push(info);
        self.hdr.image_count = self.images.len() as u32;
        self.hdr.image_count
    }
}

impl Default for WimStruct {
    fn default() -> Self {
        Self::new()
    }
}
