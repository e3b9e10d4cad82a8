use std::fs::{self, File};
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use log::warn;

use crate::api::{
    EXTRACT_HARDLINK, EXTRACT_RPFIX, EXTRACT_SYMLINK, EXTRACT_UNIX_DATA, EXTRACT_VERBOSE,
    ProgressEvent, ProgressSink,
};
use crate::error::{Result, WimError};
use crate::io::resource::ResourcePool;
use crate::plan::{ExtractPlan, LinkRegistry};
use crate::wim::dentry::{DentryId, DentryTree, Inode, UnixData};
use crate::wim::lookup::{LookupTable, StreamId};

/// Seconds between 1601-01-01 and 1970-01-01.
const WINDOWS_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// Immutable inputs of one extraction.
pub(crate) struct ApplyArgs<'a> {
    pub tree: &'a DentryTree,
    pub lookup: &'a LookupTable,
    pub extract_root: DentryId,
    pub source_path: &'a str,
    pub target: &'a Path,
    pub flags: u32,
}

/// Mutable extraction state, alive for one `extract_tree` call. Dropping
/// it resets every transient per-dentry and per-stream flag.
pub(crate) struct ApplyContext<'a> {
    pub plan: ExtractPlan,
    pub registry: &'a mut LinkRegistry,
    pub completed_bytes: u64,
    target_realpath: Option<PathBuf>,
    current_stream: Option<(StreamId, Vec<u8>)>,
}

impl<'a> ApplyContext<'a> {
    pub fn new(plan: ExtractPlan, registry: &'a mut LinkRegistry) -> Self {
        ApplyContext {
            plan,
            registry,
            completed_bytes: 0,
            target_realpath: None,
            current_stream: None,
        }
    }

    /// Cached `realpath(target)`, resolved on first use. The target
    /// directory exists by then: the root dentry is applied before any
    /// descendant in pre-order.
    fn target_realpath(&mut self, target: &Path) -> Result<&Path> {
        if self.target_realpath.is_none() {
            let real = fs::canonicalize(target)
                .map_err(|e| WimError::stat(target.to_path_buf(), e))?;
            self.target_realpath = Some(real);
        }
        match &self.target_realpath {
            Some(p) => Ok(p),
            None => Err(WimError::Corrupt("realpath cache not populated")),
        }
    }

    /// Bytes of `sid`, read from the archive at most once per stream:
    /// the cache holds the stream currently being applied, so every
    /// dentry sharing it is written from the same read.
    fn stream_bytes(
        &mut self,
        pool: &mut ResourcePool<'_>,
        lookup: &LookupTable,
        sid: StreamId,
    ) -> Result<&[u8]> {
        let cached = matches!(&self.current_stream, Some((id, _)) if *id == sid);
        if !cached {
            let bytes = pool.read_stream(lookup, sid)?;
            self.current_stream = Some((sid, bytes));
        }
        match &self.current_stream {
            Some((_, bytes)) => Ok(bytes),
            None => Err(WimError::Corrupt("stream cache not populated")),
        }
    }
}

/// Backend capability set. The raw-NTFS variant is compiled out of this
/// build; requesting it fails during command validation.
pub(crate) enum ApplyBackend {
    Normal,
}

impl ApplyBackend {
    pub fn apply_dentry(
        &self,
        args: &ApplyArgs<'_>,
        ctx: &mut ApplyContext<'_>,
        pool: &mut ResourcePool<'_>,
        dentry: DentryId,
    ) -> Result<()> {
        match self {
            ApplyBackend::Normal => apply_dentry_normal(args, ctx, pool, dentry),
        }
    }

    pub fn apply_dentry_timestamps(
        &self,
        args: &ApplyArgs<'_>,
        dentry: DentryId,
    ) -> Result<()> {
        match self {
            ApplyBackend::Normal => apply_dentry_timestamps_normal(args, dentry),
        }
    }
}

/// Output path for a dentry: the target, plus the dentry's image path
/// with the extraction root's prefix removed.
pub(crate) fn output_path(args: &ApplyArgs<'_>, dentry: DentryId) -> Result<PathBuf> {
    if dentry == args.extract_root {
        return Ok(args.target.to_path_buf());
    }
    let full = args
        .tree
        .full_path(dentry)
        .ok_or(WimError::Corrupt("dentry path not materialised"))?;
    let suffix = if args.source_path.is_empty() {
        full
    } else {
        &full[args.source_path.len() + 1..]
    };
    Ok(args.target.join(suffix))
}

/// Sort the stream list by archive position so the payload phase reads
/// the archive front to back. Stable: ties keep discovery order.
pub(crate) fn sort_stream_list_by_position(
    plan: &mut ExtractPlan,
    lookup: &LookupTable,
) -> Result<()> {
    let mut array: Vec<(u64, StreamId)> = Vec::new();
    array
        .try_reserve_exact(plan.stream_list.len())
        .map_err(|_| WimError::Nomem("sorting the stream list"))?;
    for &sid in &plan.stream_list {
        array.push((lookup.get(sid).resource.offset, sid));
    }
    array.sort_by_key(|&(offset, _)| offset);
    plan.stream_list = array.into_iter().map(|(_, sid)| sid).collect();
    Ok(())
}

/// Apply a dentry if it still needs extraction. With `no_streams` set
/// (the directory-structure phase), dentries whose inode has a non-empty
/// unnamed stream are deferred to the payload phase.
fn maybe_apply_dentry(
    args: &ApplyArgs<'_>,
    ctx: &mut ApplyContext<'_>,
    pool: &mut ResourcePool<'_>,
    backend: &ApplyBackend,
    progress: &mut ProgressSink<'_>,
    dentry: DentryId,
    no_streams: bool,
) -> Result<()> {
    if !ctx.plan.needs(dentry) {
        return Ok(());
    }
    let inode = args.tree.inode_of(dentry);
    if no_streams
        && !inode.is_directory()
        && ctx
            .plan
            .nonempty_unnamed(args.tree, args.lookup, dentry)
            .is_some()
    {
        return Ok(());
    }
    if args.flags & EXTRACT_VERBOSE != 0 && progress.enabled() {
        if let Some(path) = args.tree.full_path(dentry) {
            progress.emit(&ProgressEvent::ExtractDentry { path });
        }
    }
    backend.apply_dentry(args, ctx, pool, dentry)?;
    ctx.plan.clear_needs(dentry);
    Ok(())
}

/// Phase A: create the directory structure, empty files, and symlink
/// placeholders, pre-order.
pub(crate) fn apply_dir_structure(
    args: &ApplyArgs<'_>,
    ctx: &mut ApplyContext<'_>,
    pool: &mut ResourcePool<'_>,
    backend: &ApplyBackend,
    progress: &mut ProgressSink<'_>,
) -> Result<()> {
    let flow = args.tree.walk_pre_order(args.extract_root, &mut |d| {
        match maybe_apply_dentry(args, ctx, pool, backend, progress, d, true) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(e),
        }
    });
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(e) => Err(e),
    }
}

/// Phase B: apply stream payloads, iterating the stream list in order so
/// a sorted list turns into sequential archive reads. Progress fires at
/// every 1% boundary and once at completion.
pub(crate) fn apply_stream_list(
    args: &ApplyArgs<'_>,
    ctx: &mut ApplyContext<'_>,
    pool: &mut ResourcePool<'_>,
    backend: &ApplyBackend,
    progress: &mut ProgressSink<'_>,
) -> Result<()> {
    let total = ctx.plan.total_bytes;
    let num_streams = ctx.plan.num_streams;
    let bytes_per_progress = total / 100;
    let mut next_progress = bytes_per_progress;
    let mut last_reported: Option<u64> = None;

    let order = ctx.plan.stream_list.clone();
    for sid in order {
        let dentries = ctx.plan.state_of(sid).dentries.clone();
        for dentry in dentries {
            maybe_apply_dentry(args, ctx, pool, backend, progress, dentry, false)?;
            if progress.enabled() && ctx.completed_bytes >= next_progress {
                progress.emit(&ProgressEvent::ExtractStreams {
                    completed_bytes: ctx.completed_bytes,
                    total_bytes: total,
                    num_streams,
                });
                last_reported = Some(ctx.completed_bytes);
                next_progress = if ctx.completed_bytes >= total {
                    u64::MAX
                } else {
                    (ctx.completed_bytes + bytes_per_progress).min(total)
                };
            }
        }
        ctx.current_stream = None;
    }

    if progress.enabled() && last_reported != Some(ctx.completed_bytes) {
        progress.emit(&ProgressEvent::ExtractStreams {
            completed_bytes: ctx.completed_bytes,
            total_bytes: total,
            num_streams,
        });
    }
    Ok(())
}

/// Phase C: apply timestamps depth-first, so stamping a parent directory
/// happens after all writes into it.
pub(crate) fn apply_timestamps_tree(
    args: &ApplyArgs<'_>,
    backend: &ApplyBackend,
) -> Result<()> {
    let flow = args.tree.walk_post_order(args.extract_root, &mut |d| {
        match backend.apply_dentry_timestamps(args, d) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(e),
        }
    });
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(e) => Err(e),
    }
}

fn apply_dentry_normal(
    args: &ApplyArgs<'_>,
    ctx: &mut ApplyContext<'_>,
    pool: &mut ResourcePool<'_>,
    dentry: DentryId,
) -> Result<()> {
    let path = output_path(args, dentry)?;
    let inode = args.tree.inode_of(dentry);

    if inode.is_directory() {
        fs::create_dir_all(&path).map_err(|e| WimError::mkdir(path.clone(), e))?;
    } else if inode.is_reparse_point() {
        apply_symlink(args, ctx, &path, inode)?;
    } else {
        match ctx.plan.nonempty_unnamed(args.tree, args.lookup, dentry) {
            None => {
                File::create(&path).map_err(|e| WimError::open(path.clone(), e))?;
            }
            Some(sid) => apply_regular_file(args, ctx, pool, &path, sid)?,
        }
    }

    if args.flags & EXTRACT_UNIX_DATA != 0 && !inode.is_reparse_point() {
        if let Some(unix) = inode.unix {
            apply_unix_data(&path, unix);
        }
    }
    Ok(())
}

fn apply_regular_file(
    args: &ApplyArgs<'_>,
    ctx: &mut ApplyContext<'_>,
    pool: &mut ResourcePool<'_>,
    path: &Path,
    sid: StreamId,
) -> Result<()> {
    let link_mode = args.flags & (EXTRACT_SYMLINK | EXTRACT_HARDLINK);

    if link_mode != 0 {
        if let Some(existing) = ctx.registry.get(sid).cloned() {
            // Second and later names of a shared stream become links to
            // the first materialised copy.
            remove_existing(path)?;
            if args.flags & EXTRACT_HARDLINK != 0 {
                fs::hard_link(&existing, path).map_err(WimError::Write)?;
            } else {
                make_symlink(&existing, path)?;
            }
            return Ok(());
        }
    }

    let mut file = File::create(path).map_err(|e| WimError::open(path.to_path_buf(), e))?;
    let len = {
        let bytes = ctx.stream_bytes(pool, args.lookup, sid)?;
        file.write_all(bytes).map_err(WimError::Write)?;
        bytes.len() as u64
    };
    ctx.completed_bytes += len;

    if link_mode != 0 {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        ctx.registry.insert(sid, canonical);
    }
    Ok(())
}

fn apply_symlink(
    args: &ApplyArgs<'_>,
    ctx: &mut ApplyContext<'_>,
    path: &Path,
    inode: &Inode,
) -> Result<()> {
    let reparse = inode
        .reparse
        .as_ref()
        .ok_or(WimError::Corrupt("reparse point without reparse data"))?;

    let target = if args.flags & EXTRACT_RPFIX != 0
        && !reparse.relative
        && reparse.target.starts_with('/')
    {
        // In-image absolute paths become absolute paths rooted at
        // realpath(target).
        let real = ctx.target_realpath(args.target)?;
        real.join(&reparse.target[1..])
    } else {
        PathBuf::from(&reparse.target)
    };

    remove_existing(path)?;
    make_symlink(&target, path)
}

#[cfg(unix)]
fn make_symlink(target: &Path, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path).map_err(WimError::Write)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, _path: &Path) -> Result<()> {
    Err(WimError::Unsupported(
        "symbolic links are not supported on this platform",
    ))
}

fn remove_existing(path: &Path) -> Result<()> {
    if fs::symlink_metadata(path).is_ok() {
        fs::remove_file(path).map_err(WimError::Write)?;
    }
    Ok(())
}

#[cfg(unix)]
fn apply_unix_data(path: &Path, unix: UnixData) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(unix.mode)) {
        warn!("failed to set mode {:o} on \"{}\": {e}", unix.mode, path.display());
    }
    if let Err(e) = std::os::unix::fs::chown(path, Some(unix.uid), Some(unix.gid)) {
        warn!(
            "failed to chown {}:{} \"{}\": {e}",
            unix.uid,
            unix.gid,
            path.display()
        );
    }
}

#[cfg(not(unix))]
fn apply_unix_data(path: &Path, _unix: UnixData) {
    warn!(
        "UNIX metadata on \"{}\" ignored on this platform",
        path.display()
    );
}

fn apply_dentry_timestamps_normal(args: &ApplyArgs<'_>, dentry: DentryId) -> Result<()> {
    let inode = args.tree.inode_of(dentry);
    if inode.last_write_time == 0 && inode.last_access_time == 0 {
        return Ok(());
    }
    let path = output_path(args, dentry)?;
    let atime = filetime_from_wim(inode.last_access_time);
    let mtime = filetime_from_wim(inode.last_write_time);
    if inode.is_reparse_point() {
        filetime::set_symlink_file_times(&path, atime, mtime).map_err(WimError::Write)
    } else {
        filetime::set_file_times(&path, atime, mtime).map_err(WimError::Write)
    }
}

fn filetime_from_wim(ts: u64) -> FileTime {
    let secs = (ts / 10_000_000) as i64 - WINDOWS_EPOCH_OFFSET_SECS;
    let nanos = ((ts % 10_000_000) * 100) as u32;
    FileTime::from_unix_time(secs, nanos)
}
