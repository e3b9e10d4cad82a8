use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Result, WimError};
use crate::wim::header::ResourceEntry;
use crate::wim::lookup::{LookupTable, StreamDescriptor, StreamId, StreamSource};

/// Decompressor for resources carrying the compressed flag.
///
/// Codec implementations live outside this crate; an archive opened
/// without one can still read its uncompressed resources, and any
/// compressed read fails with [`WimError::UnsupportedCodec`].
pub trait Codec {
    fn name(&self) -> &'static str;
    /// Decompress a whole resource. `original_size` is the declared
    /// uncompressed length; `chunk_size` is the archive's chunk size.
    fn decompress(&self, input: &[u8], original_size: u64, chunk_size: u32) -> Result<Vec<u8>>;
}

/// Open readers for every part of a (possibly split) archive, plus the
/// codec. Owns cloned file handles so the caller's borrows stay free
/// during an extraction.
pub(crate) struct ResourcePool<'a> {
    parts: Vec<(u16, File)>,
    codec: Option<&'a dyn Codec>,
    chunk_size: u32,
    /// Number of stream reads issued, for the one-read-per-stream
    /// accounting.
    pub reads: u64,
}

impl<'a> ResourcePool<'a> {
    pub fn new(
        primary: Option<&File>,
        primary_part: u16,
        swms: &[(u16, &File)],
        codec: Option<&'a dyn Codec>,
        chunk_size: u32,
    ) -> Result<Self> {
        let mut parts = Vec::new();
        if let Some(file) = primary {
            parts.push((
                primary_part,
                file.try_clone().map_err(WimError::Read)?,
            ));
        }
        for (part, file) in swms {
            parts.push((*part, file.try_clone().map_err(WimError::Read)?));
        }
        Ok(ResourcePool {
            parts,
            codec,
            chunk_size,
            reads: 0,
        })
    }

    fn part_file(&mut self, part: u16) -> Result<&mut File> {
        self.parts
            .iter_mut()
            .find(|(p, _)| *p == part)
            .map(|(_, f)| f)
            .ok_or(WimError::Corrupt("stream references a missing archive part"))
    }

    /// Read a whole stream into memory. Issues exactly one archive read.
    pub fn read_stream(&mut self, lookup: &LookupTable, id: StreamId) -> Result<Vec<u8>> {
        let desc = lookup.get(id);
        self.reads += 1;
        match &desc.source {
            StreamSource::Buffer(bytes) => {
                if bytes.len() as u64 != desc.resource.original_size {
                    return Err(WimError::Corrupt(
                        "buffered stream length disagrees with its descriptor",
                    ));
                }
                Ok(bytes.clone())
            }
            StreamSource::Archive { part_number } => {
                let part = *part_number;
                let entry = desc.resource;
                let codec = self.codec;
                let chunk_size = self.chunk_size;
                let file = self.part_file(part)?;
                read_resource(file, &entry, codec, chunk_size)
            }
        }
    }

    /// Read a stream and copy it to `out`.
    pub fn copy_stream_to(
        &mut self,
        lookup: &LookupTable,
        id: StreamId,
        out: &mut impl Write,
    ) -> Result<u64> {
        let bytes = self.read_stream(lookup, id)?;
        out.write_all(&bytes).map_err(WimError::Write)?;
        Ok(bytes.len() as u64)
    }
}

/// Read one resource from `file` per its entry, decompressing if needed.
pub fn read_resource(
    file: &mut (impl Read + Seek),
    entry: &ResourceEntry,
    codec: Option<&dyn Codec>,
    chunk_size: u32,
) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(entry.offset))
        .map_err(WimError::Read)?;
    let mut raw = vec![0u8; entry.size as usize];
    file.read_exact(&mut raw).map_err(WimError::Read)?;

    if entry.is_compressed() {
        let codec = codec.ok_or(WimError::UnsupportedCodec)?;
        let decoded = codec.decompress(&raw, entry.original_size, chunk_size)?;
        if decoded.len() as u64 != entry.original_size {
            return Err(WimError::Corrupt(
                "decompressed length disagrees with declared size",
            ));
        }
        Ok(decoded)
    } else {
        if entry.size != entry.original_size {
            return Err(WimError::Corrupt(
                "uncompressed resource sizes disagree",
            ));
        }
        Ok(raw)
    }
}

/// Copy a stream's bytes to the output archive at the current position and
/// record its final location in the descriptor's output entry.
///
/// Archive-sourced streams are copied raw (compressed bytes stay
/// compressed), so no codec is involved. The output position advances
/// monotonically; nothing is seeked backwards.
pub(crate) fn write_stream(
    out: &mut File,
    source_file: Option<&mut File>,
    desc: &mut StreamDescriptor,
    extra_flags: u8,
) -> Result<()> {
    let offset = out.stream_position().map_err(WimError::Write)?;
    let (size, original_size) = match &desc.source {
        StreamSource::Buffer(bytes) => {
            out.write_all(bytes).map_err(WimError::Write)?;
            (bytes.len() as u64, bytes.len() as u64)
        }
        StreamSource::Archive { .. } => {
            let src = source_file.ok_or(WimError::Read(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no source archive to copy the stream from",
            )))?;
            src.seek(SeekFrom::Start(desc.resource.offset))
                .map_err(WimError::Read)?;
            let copied = std::io::copy(&mut src.take(desc.resource.size), out)
                .map_err(WimError::Write)?;
            if copied != desc.resource.size {
                return Err(WimError::Read(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "short read while copying a stream",
                )));
            }
            (desc.resource.size, desc.resource.original_size)
        }
    };
    desc.output = ResourceEntry {
        offset,
        size,
        original_size,
        flags: desc.resource.flags | extra_flags,
    };
    Ok(())
}
