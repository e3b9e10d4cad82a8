use std::fs::{self, File};
use std::io::Write as _;
use std::path::Path;

use log::{debug, warn};

use crate::api::{
    EXTRACT_HARDLINK, EXTRACT_MASK_PUBLIC, EXTRACT_MULTI_IMAGE, EXTRACT_NORPFIX, EXTRACT_NTFS,
    EXTRACT_RPFIX, EXTRACT_SEQUENTIAL, EXTRACT_SYMLINK, EXTRACT_TO_STDOUT, EXTRACT_UNIX_DATA,
    ExtractCommand, ImageSelector, ProgressEvent, ProgressSink,
};
use crate::apply::{
    ApplyArgs, ApplyBackend, ApplyContext, apply_dir_structure, apply_stream_list,
    apply_timestamps_tree, sort_stream_list_by_position,
};
use crate::error::{Result, WimError};
use crate::io::resource::ResourcePool;
use crate::plan::{self, ExtractPlan, LinkRegistry};
use crate::wim::WimStruct;
use crate::wim::dentry::{DentryId, DentryTree};
use crate::wim::header::WIM_HDR_FLAG_RP_FIX;
use crate::wim::lookup::LookupTable;

/// Extract a single image or every image to a directory.
///
/// With [`ImageSelector::All`], each image lands in a subdirectory of
/// `target` named after the image (or its index when the name is empty
/// or unusable as a directory name).
pub fn extract_image(
    wim: &mut WimStruct,
    image: ImageSelector,
    target: &Path,
    flags: u32,
    swms: &[WimStruct],
    progress: Option<&mut dyn FnMut(&ProgressEvent<'_>)>,
) -> Result<()> {
    let flags = flags & EXTRACT_MASK_PUBLIC;
    verify_swm_set(wim, swms)?;
    for swm in swms {
        wim.lookup.merge(&swm.lookup);
    }

    let mut sink = ProgressSink::new(progress);
    let mut registry = LinkRegistry::default();
    let ret = match image {
        ImageSelector::All => extract_all_images(
            wim,
            swms,
            target,
            flags | EXTRACT_MULTI_IMAGE,
            &mut registry,
            &mut sink,
        ),
        ImageSelector::Index(n) => {
            extract_single_image(wim, swms, n, target, flags, &mut registry, &mut sink)
        }
    };

    for _ in swms {
        wim.lookup.unmerge();
    }
    ret
}

/// Execute a batch of extraction commands against one image. Flags are
/// merged with `default_flags`; source paths are canonicalised. Secondary
/// split-archive tables are merged for the duration of the call and
/// unmerged on every exit path.
pub fn extract_files(
    wim: &mut WimStruct,
    image: u32,
    cmds: &[ExtractCommand],
    default_flags: u32,
    swms: &[WimStruct],
    progress: Option<&mut dyn FnMut(&ProgressEvent<'_>)>,
) -> Result<()> {
    let default_flags = default_flags & EXTRACT_MASK_PUBLIC;
    verify_swm_set(wim, swms)?;
    if cmds.is_empty() {
        return Ok(());
    }
    for swm in swms {
        wim.lookup.merge(&swm.lookup);
    }

    let mut cmds_copy: Vec<ExtractCommand> = cmds
        .iter()
        .map(|c| ExtractCommand {
            wim_source_path: canonicalize_wim_path(&c.wim_source_path),
            fs_dest_path: c.fs_dest_path.clone(),
            extract_flags: (default_flags | c.extract_flags) & EXTRACT_MASK_PUBLIC,
        })
        .collect();

    let mut sink = ProgressSink::new(progress);
    let mut registry = LinkRegistry::default();
    let ret = do_extract_files(wim, swms, image, &mut cmds_copy, &mut registry, &mut sink);

    for _ in swms {
        wim.lookup.unmerge();
    }
    ret
}

fn extract_all_images(
    wim: &mut WimStruct,
    swms: &[WimStruct],
    target: &Path,
    flags: u32,
    registry: &mut LinkRegistry,
    sink: &mut ProgressSink<'_>,
) -> Result<()> {
    match fs::metadata(target) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir(target).map_err(|e| WimError::mkdir(target.to_path_buf(), e))?;
        }
        Err(e) => return Err(WimError::stat(target.to_path_buf(), e)),
        Ok(meta) if !meta.is_dir() => return Err(WimError::NotDir(target.to_path_buf())),
        Ok(_) => {}
    }

    for image in 1..=wim.hdr.image_count {
        let name = wim.info.image_name(image).unwrap_or("").to_string();
        let subdir = if image_name_ok_as_dir(&name) {
            target.join(&name)
        } else {
            // Empty or unusable image name: fall back to the index.
            target.join(image.to_string())
        };
        extract_single_image(wim, swms, image, &subdir, flags, registry, sink)?;
    }
    Ok(())
}

fn extract_single_image(
    wim: &mut WimStruct,
    swms: &[WimStruct],
    image: u32,
    target: &Path,
    flags: u32,
    registry: &mut LinkRegistry,
    sink: &mut ProgressSink<'_>,
) -> Result<()> {
    let mut cmds = vec![ExtractCommand {
        wim_source_path: String::new(),
        fs_dest_path: target.to_path_buf(),
        extract_flags: flags,
    }];
    do_extract_files(wim, swms, image, &mut cmds, registry, sink)
}

fn do_extract_files(
    wim: &mut WimStruct,
    swms: &[WimStruct],
    image: u32,
    cmds: &mut [ExtractCommand],
    registry: &mut LinkRegistry,
    sink: &mut ProgressSink<'_>,
) -> Result<()> {
    wim.select_image(image)?;

    let mut found_link_cmd = false;
    let mut found_nolink_cmd = false;
    for cmd in cmds.iter_mut() {
        check_extract_command(cmd, wim.hdr.flags)?;
        if cmd.extract_flags & (EXTRACT_SYMLINK | EXTRACT_HARDLINK) != 0 {
            found_link_cmd = true;
        } else {
            found_nolink_cmd = true;
        }
        if found_link_cmd && found_nolink_cmd {
            return Err(WimError::InvalidParam(
                "link-mode flags must be consistent across extraction commands",
            ));
        }
    }

    for cmd in cmds.iter() {
        extract_tree(
            wim,
            swms,
            &cmd.wim_source_path,
            &cmd.fs_dest_path,
            cmd.extract_flags,
            registry,
            sink,
        )?;
    }
    Ok(())
}

/// Validate one extraction command and fill in defaulted flags.
fn check_extract_command(cmd: &mut ExtractCommand, wim_header_flags: u32) -> Result<()> {
    let is_entire_image = cmd.wim_source_path.is_empty();
    if cmd.fs_dest_path.as_os_str().is_empty() {
        return Err(WimError::InvalidParam("empty destination path"));
    }

    let mut flags = cmd.extract_flags;

    if flags & (EXTRACT_SYMLINK | EXTRACT_HARDLINK) == (EXTRACT_SYMLINK | EXTRACT_HARDLINK) {
        return Err(WimError::InvalidParam(
            "symlink and hardlink modes are mutually exclusive",
        ));
    }

    if cfg!(windows) {
        if flags & EXTRACT_UNIX_DATA != 0 {
            return Err(WimError::InvalidParam(
                "UNIX data cannot be restored on Windows",
            ));
        }
        if flags & (EXTRACT_SYMLINK | EXTRACT_HARDLINK) != 0 {
            return Err(WimError::InvalidParam(
                "linked extraction modes are not supported on Windows",
            ));
        }
    }

    if flags & EXTRACT_NTFS != 0 {
        if flags & (EXTRACT_SYMLINK | EXTRACT_HARDLINK) != 0 {
            return Err(WimError::InvalidParam(
                "link modes cannot apply directly to an NTFS volume",
            ));
        }
        if !is_entire_image {
            return Err(WimError::InvalidParam(
                "an NTFS volume target requires extracting a full image",
            ));
        }
        if flags & EXTRACT_UNIX_DATA != 0 {
            return Err(WimError::InvalidParam(
                "UNIX data cannot be restored onto an NTFS volume",
            ));
        }
        // The capability exists as a backend seam; this build does not
        // carry the volume writer.
        return Err(WimError::Unsupported(
            "this build does not include the raw NTFS apply backend",
        ));
    }

    if flags & (EXTRACT_RPFIX | EXTRACT_NORPFIX) == (EXTRACT_RPFIX | EXTRACT_NORPFIX) {
        return Err(WimError::InvalidParam(
            "rpfix and norpfix are mutually exclusive",
        ));
    }
    if flags & (EXTRACT_RPFIX | EXTRACT_NORPFIX) == 0
        && wim_header_flags & WIM_HDR_FLAG_RP_FIX != 0
        && is_entire_image
    {
        // Reparse fixups default on when the archive was captured with
        // them and a full image is being applied.
        flags |= EXTRACT_RPFIX;
    }
    if !is_entire_image && flags & EXTRACT_RPFIX != 0 {
        return Err(WimError::InvalidParam(
            "reparse fixups require extracting a full image",
        ));
    }

    cmd.extract_flags = flags;
    Ok(())
}

/// Extract the subtree at `source_path` of the selected image to
/// `target`, in three strictly ordered phases: directory structure,
/// stream payloads, timestamps.
fn extract_tree(
    wim: &mut WimStruct,
    swms: &[WimStruct],
    source_path: &str,
    target: &Path,
    flags: u32,
    registry: &mut LinkRegistry,
    sink: &mut ProgressSink<'_>,
) -> Result<()> {
    let image = wim.current_image;
    let idx = image as usize - 1;

    let root = {
        let tree = &mut wim.images[idx].tree;
        let root = tree
            .lookup_path(source_path)
            .ok_or_else(|| WimError::PathDoesNotExist(source_path.to_string()))?;
        tree.materialise_paths(root);
        root
    };

    let swm_files: Vec<(u16, &File)> = swms
        .iter()
        .filter_map(|s| s.file.as_ref().map(|f| (s.hdr.part_number, f)))
        .collect();
    let mut pool = ResourcePool::new(
        wim.file.as_ref(),
        wim.hdr.part_number,
        &swm_files,
        wim.codec.as_deref(),
        wim.hdr.chunk_size,
    )?;

    let tree = &wim.images[idx].tree;
    let mut plan = plan::plan(tree, root, &wim.lookup, flags, registry);

    if flags & EXTRACT_TO_STDOUT != 0 {
        return extract_dentry_to_stdout(tree, &wim.lookup, &plan, root, &mut pool);
    }

    let image_name = wim.info.image_name(image).unwrap_or("");
    if sink.enabled() {
        if source_path.is_empty() {
            sink.emit(&ProgressEvent::ExtractImageBegin {
                image,
                image_name,
                target,
                total_bytes: plan.total_bytes,
                num_streams: plan.num_streams,
            });
        } else {
            sink.emit(&ProgressEvent::ExtractTreeBegin {
                image,
                source_path,
                target,
                total_bytes: plan.total_bytes,
                num_streams: plan.num_streams,
            });
        }
    }

    let mut flags = flags;
    if flags & EXTRACT_SEQUENTIAL != 0 {
        if let Err(e) = sort_stream_list_by_position(&mut plan, &wim.lookup) {
            // Progress emission is not suppressed by this fallback.
            warn!("failed to sort streams by archive position ({e}); extracting in discovery order");
            flags &= !EXTRACT_SEQUENTIAL;
        }
    }

    let args = ApplyArgs {
        tree,
        lookup: &wim.lookup,
        extract_root: root,
        source_path,
        target,
        flags,
    };
    let backend = ApplyBackend::Normal;
    let mut ctx = ApplyContext::new(plan, registry);

    // On any error below, dropping `ctx` releases the realpath cache and
    // the transient needs-extraction / visited state in one place. An
    // NTFS volume, when that backend is present, is unmounted on the
    // same path.
    sink.emit(&ProgressEvent::ExtractDirStructureBegin);
    apply_dir_structure(&args, &mut ctx, &mut pool, &backend, sink)?;
    sink.emit(&ProgressEvent::ExtractDirStructureEnd);

    apply_stream_list(&args, &mut ctx, &mut pool, &backend, sink)?;

    sink.emit(&ProgressEvent::ApplyTimestamps);
    apply_timestamps_tree(&args, &backend)?;

    debug!(
        "extracted {} distinct streams with {} archive reads",
        ctx.plan.stream_list.len(),
        pool.reads
    );

    if sink.enabled() {
        if source_path.is_empty() {
            sink.emit(&ProgressEvent::ExtractImageEnd { image });
        } else {
            sink.emit(&ProgressEvent::ExtractTreeEnd { image });
        }
    }
    Ok(())
}

/// Write the extraction root's unnamed stream to standard output. Only
/// meaningful for regular files; fails before producing any output
/// otherwise.
fn extract_dentry_to_stdout(
    tree: &DentryTree,
    lookup: &LookupTable,
    plan: &ExtractPlan,
    root: DentryId,
    pool: &mut ResourcePool<'_>,
) -> Result<()> {
    let inode = tree.inode_of(root);
    if !inode.is_regular_file() {
        let path = tree.full_path(root).unwrap_or("").to_string();
        return Err(WimError::NotRegularFile(path));
    }
    if let Some(sid) = plan.nonempty_unnamed(tree, lookup, root) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        pool.copy_stream_to(lookup, sid, &mut lock)?;
        lock.flush().map_err(WimError::Write)?;
    }
    Ok(())
}

/// Check that the provided secondary parts form a complete, matching
/// split set for this archive.
fn verify_swm_set(wim: &WimStruct, swms: &[WimStruct]) -> Result<()> {
    if swms.is_empty() {
        return Ok(());
    }
    if wim.hdr.total_parts as usize != swms.len() + 1 {
        return Err(WimError::InvalidParam(
            "wrong number of split-archive parts supplied",
        ));
    }
    let mut seen = vec![false; swms.len() + 2];
    for swm in swms {
        if swm.hdr.guid != wim.hdr.guid {
            return Err(WimError::InvalidParam(
                "split-archive part belongs to a different archive",
            ));
        }
        let part = swm.hdr.part_number as usize;
        if part < 2 || part > wim.hdr.total_parts as usize || seen[part] {
            return Err(WimError::InvalidParam(
                "split-archive part numbers are inconsistent",
            ));
        }
        seen[part] = true;
    }
    Ok(())
}

/// Canonical in-image path: forward slashes, no leading or trailing
/// separator. The empty string names the image root.
fn canonicalize_wim_path(path: &str) -> String {
    let normalised = path.replace('\\', "/");
    normalised.trim_matches('/').to_string()
}

#[cfg(windows)]
const FORBIDDEN_NAME_CHARS: &[char] = &['/', '\\', '<', '>', ':', '"', '|', '?', '*'];
#[cfg(not(windows))]
const FORBIDDEN_NAME_CHARS: &[char] = &['/'];

fn image_name_ok_as_dir(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(FORBIDDEN_NAME_CHARS)
}
