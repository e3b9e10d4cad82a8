use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::Path;

use log::debug;

use crate::api::{ImageSelector, WRITE_CHECK_INTEGRITY, WRITE_SHOW_PROGRESS};
use crate::error::{Result, WimError};
use crate::io::resource::write_stream;
use crate::wim::WimStruct;
use crate::wim::header::{HEADER_DISK_SIZE, RESHDR_FLAG_METADATA, ResourceEntry};
use crate::wim::integrity::IntegrityTable;
use crate::wim::lookup::Sha1Hash;
use crate::wim::xml::write_xml_data;

/// Write the archive to `path`.
///
/// Resources are streamed out first, then the lookup table, XML block,
/// optional integrity table, and finally the header is rewritten in
/// place with the recorded offsets.
pub fn write(wim: &mut WimStruct, path: &Path, image: ImageSelector, flags: u32) -> Result<()> {
    if let ImageSelector::Index(n) = image {
        if n == 0 || n > wim.hdr.image_count {
            return Err(WimError::InvalidImage(n));
        }
    }

    let mut out = begin_write(wim, path, flags)?;
    write_inner(wim, &mut out, image, flags)
}

/// Open the output and emit the placeholder header. The file is opened
/// for reading as well when the integrity pass will need to re-read it.
fn begin_write(wim: &WimStruct, path: &Path, flags: u32) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    if flags & WRITE_CHECK_INTEGRITY != 0 {
        options.read(true);
    }
    let mut out = options
        .open(path)
        .map_err(|e| WimError::open(path.to_path_buf(), e))?;
    wim.hdr.write_to(&mut out)?;
    Ok(out)
}

/// The write pipeline after the output is open and the placeholder
/// header is in place. Shared with the overwriter, which writes into a
/// temporary file instead.
pub(crate) fn write_inner(
    wim: &mut WimStruct,
    out: &mut File,
    image: ImageSelector,
    flags: u32,
) -> Result<()> {
    wim.lookup.reset_output_refcounts();

    let selected: Vec<u32> = match image {
        ImageSelector::All => (1..=wim.hdr.image_count).collect(),
        ImageSelector::Index(n) => vec![n],
    };

    for &img in &selected {
        debug!("writing file resources for image {img}");
        write_file_resources(wim, img, out)?;
    }
    for &img in &selected {
        debug!("writing metadata resource for image {img}");
        write_metadata_resource(wim, img, out)?;
    }

    finish_write(wim, out, image, flags)
}

/// Stream every file resource reachable from the image's tree to the
/// output, each distinct stream once, recording its new location.
fn write_file_resources(wim: &mut WimStruct, image: u32, out: &mut File) -> Result<()> {
    let WimStruct {
        images,
        lookup,
        file,
        ..
    } = wim;
    let tree = &images[image as usize - 1].tree;

    let flow = tree.walk_pre_order(tree.root(), &mut |d| {
        let inode = tree.inode_of(d);
        let mut hashes: Vec<&Sha1Hash> = Vec::new();
        if let Some(h) = &inode.unnamed_hash {
            hashes.push(h);
        }
        for ads in &inode.ads {
            if let Some(h) = &ads.hash {
                hashes.push(h);
            }
        }
        for hash in hashes {
            let Some(sid) = lookup.lookup(hash) else {
                return ControlFlow::Break(WimError::Corrupt(
                    "tree references a stream missing from the lookup table",
                ));
            };
            let desc = lookup.get_mut(sid);
            desc.out_refcnt += 1;
            if desc.out_refcnt == 1 {
                if let Err(e) = write_stream(out, file.as_mut(), desc, 0) {
                    return ControlFlow::Break(e);
                }
            }
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(e) => Err(e),
    }
}

fn write_metadata_resource(wim: &mut WimStruct, image: u32, out: &mut File) -> Result<()> {
    let WimStruct {
        images,
        lookup,
        file,
        ..
    } = wim;
    let sid = images[image as usize - 1].metadata_stream;
    let desc = lookup.get_mut(sid);
    desc.out_refcnt += 1;
    if desc.out_refcnt == 1 {
        write_stream(out, file.as_mut(), desc, RESHDR_FLAG_METADATA)?;
    }
    Ok(())
}

/// Write the lookup table, XML, and optional integrity table, recording
/// each offset from the current file position, then seek back to the
/// start and rewrite the header with the final resource entries. The
/// steps are strictly sequential; each depends on the position left by
/// the previous one.
fn finish_write(
    wim: &mut WimStruct,
    out: &mut File,
    image: ImageSelector,
    flags: u32,
) -> Result<()> {
    let lookup_table_offset = out.stream_position().map_err(WimError::Write)?;
    debug!("writing lookup table at offset {lookup_table_offset}");
    wim.lookup.write_to(out)?;

    let xml_data_offset = out.stream_position().map_err(WimError::Write)?;
    debug!("writing XML data at offset {xml_data_offset}");

    let mut hdr = wim.hdr.clone();
    let lookup_table_size = xml_data_offset - lookup_table_offset;
    hdr.lookup_table_res = ResourceEntry {
        offset: lookup_table_offset,
        size: lookup_table_size,
        original_size: lookup_table_size,
        flags: RESHDR_FLAG_METADATA,
    };

    // A subset write reports the whole archive's statistics in the XML.
    let total_bytes_hint = match image {
        ImageSelector::All => 0,
        ImageSelector::Index(_) => wim.info.total_bytes(),
    };
    write_xml_data(&wim.info, image, out, total_bytes_hint)?;

    let integrity_offset = out.stream_position().map_err(WimError::Write)?;
    let xml_data_size = integrity_offset - xml_data_offset;
    hdr.xml_res = ResourceEntry {
        offset: xml_data_offset,
        size: xml_data_size,
        original_size: xml_data_size,
        flags: 0,
    };

    if flags & WRITE_CHECK_INTEGRITY != 0 {
        debug!("writing integrity table at offset {integrity_offset}");
        let table = IntegrityTable::compute(
            out,
            HEADER_DISK_SIZE as u64,
            xml_data_offset,
            flags & WRITE_SHOW_PROGRESS != 0,
        )?;
        out.seek(SeekFrom::Start(integrity_offset))
            .map_err(WimError::Write)?;
        table.write_to(out)?;
        let end_offset = out.stream_position().map_err(WimError::Write)?;
        let integrity_size = end_offset - integrity_offset;
        hdr.integrity_res = ResourceEntry {
            offset: integrity_offset,
            size: integrity_size,
            original_size: integrity_size,
            flags: 0,
        };
    } else {
        hdr.integrity_res = ResourceEntry::default();
    }

    // The boot-metadata entry mirrors the bootable image's metadata
    // resource, or is zeroed when this write carries no bootable image.
    let boot_included = hdr.boot_idx != 0
        && hdr.boot_idx as usize <= wim.images.len()
        && match image {
            ImageSelector::All => true,
            ImageSelector::Index(n) => n == hdr.boot_idx,
        };
    if boot_included {
        let sid = wim.images[hdr.boot_idx as usize - 1].metadata_stream;
        hdr.boot_metadata_res = wim.lookup.get(sid).output;
    } else {
        hdr.boot_metadata_res = ResourceEntry::default();
    }

    if let ImageSelector::Index(n) = image {
        hdr.image_count = 1;
        hdr.boot_idx = if hdr.boot_idx == n { 1 } else { 0 };
    }

    out.seek(SeekFrom::Start(0)).map_err(WimError::Write)?;
    hdr.write_to(out)
}
