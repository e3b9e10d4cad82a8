use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;
use tempfile::Builder;

use crate::api::{ImageSelector, WRITE_CHECK_INTEGRITY, WRITE_SHOW_PROGRESS};
use crate::error::{Result, WimError};
use crate::wim::WimStruct;
use crate::wim::header::{HEADER_DISK_SIZE, ResourceEntry};
use crate::wim::integrity::IntegrityTable;
use crate::wim::xml::write_xml_data;
use crate::write::write_inner;

/// Replace the archive on disk with a freshly written one.
///
/// The new archive goes to a sibling temporary file (same directory,
/// basename plus a nine-character alphanumeric suffix) and is renamed
/// over the original only once it is complete, so a crash at any point
/// leaves the original intact. On rename failure the temporary is
/// unlinked.
pub fn overwrite(wim: &mut WimStruct, flags: u32) -> Result<()> {
    let path = wim.path.clone().ok_or(WimError::NoFilename)?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let dir = dir.unwrap_or(Path::new("."));
    let basename = path
        .file_name()
        .ok_or(WimError::NoFilename)?
        .to_string_lossy()
        .into_owned();

    debug!("replacing archive \"{}\"", path.display());

    let mut temp = Builder::new()
        .prefix(basename.as_str())
        .suffix("")
        .rand_bytes(9)
        .tempfile_in(dir)
        .map_err(|e| WimError::open(dir.to_path_buf(), e))?;

    {
        let out = temp.as_file_mut();
        wim.hdr.write_to(out)?;
        write_inner(wim, out, ImageSelector::All, flags)?;
        out.sync_all().map_err(WimError::Write)?;
    }

    // Close the original descriptor before renaming over it.
    wim.file = None;

    let temp_path = temp.path().to_path_buf();
    match temp.persist(&path) {
        Ok(file) => {
            wim.file = Some(file);
            Ok(())
        }
        // Dropping the failed persist's temporary unlinks it.
        Err(e) => Err(WimError::Rename {
            from: temp_path,
            to: path,
            source: e.error,
        }),
    }
}

/// Rewrite only the XML block and the header in place.
///
/// Valid when resource payloads and the lookup table are untouched. An
/// existing integrity table is reused when requested: its digests cover
/// only the pre-XML region, which this operation does not modify. With
/// integrity disabled the file is truncated to the new end, since the
/// previous tail may have been longer.
pub fn overwrite_xml_and_header(wim: &mut WimStruct, flags: u32) -> Result<()> {
    let path = wim.path.clone().ok_or(WimError::NoFilename)?;

    debug!(
        "overwriting XML and header of \"{}\", flags {flags:#x}",
        path.display()
    );

    // Reopen read-write, dropping the read-only handle.
    wim.file = None;
    let mut fp = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| WimError::open(path.clone(), e))?;

    let mut saved_table: Option<IntegrityTable> = None;
    if flags & WRITE_CHECK_INTEGRITY != 0 && wim.hdr.integrity_res.offset != 0 {
        let res = wim.hdr.integrity_res;
        let mut buf = vec![0u8; res.original_size as usize];
        fp.seek(SeekFrom::Start(res.offset)).map_err(WimError::Read)?;
        fp.read_exact(&mut buf).map_err(WimError::Read)?;
        saved_table = Some(IntegrityTable::parse(&buf)?);
    }

    fp.seek(SeekFrom::Start(wim.hdr.xml_res.offset))
        .map_err(WimError::Write)?;
    write_xml_data(&wim.info, ImageSelector::All, &mut fp, 0)?;

    let xml_end = fp.stream_position().map_err(WimError::Write)?;
    let xml_size = xml_end - wim.hdr.xml_res.offset;
    wim.hdr.xml_res.size = xml_size;
    wim.hdr.xml_res.original_size = xml_size;

    if flags & WRITE_CHECK_INTEGRITY != 0 {
        wim.hdr.integrity_res.offset = xml_end;
        match saved_table {
            Some(table) => {
                table.write_to(&mut fp)?;
            }
            None => {
                let pre_xml_end =
                    wim.hdr.lookup_table_res.offset + wim.hdr.lookup_table_res.size;
                let table = IntegrityTable::compute(
                    &mut fp,
                    HEADER_DISK_SIZE as u64,
                    pre_xml_end,
                    flags & WRITE_SHOW_PROGRESS != 0,
                )?;
                fp.seek(SeekFrom::Start(xml_end)).map_err(WimError::Write)?;
                table.write_to(&mut fp)?;
                let size = table.disk_size();
                wim.hdr.integrity_res.size = size;
                wim.hdr.integrity_res.original_size = size;
            }
        }
        wim.hdr.integrity_res.flags = 0;
    } else {
        fp.flush().map_err(WimError::Write)?;
        fp.set_len(xml_end).map_err(WimError::Write)?;
        wim.hdr.integrity_res = ResourceEntry::default();
    }

    fp.seek(SeekFrom::Start(0)).map_err(WimError::Write)?;
    wim.hdr.write_to(&mut fp)?;
    fp.sync_all().map_err(WimError::Write)?;

    wim.file = Some(fp);
    Ok(())
}
