use std::path::{Path, PathBuf};

/// Extract flags. The public set is accepted from callers; bits outside
/// [`EXTRACT_MASK_PUBLIC`] are engine-internal.
pub const EXTRACT_NTFS: u32 = 1 << 0;
pub const EXTRACT_HARDLINK: u32 = 1 << 1;
pub const EXTRACT_SYMLINK: u32 = 1 << 2;
pub const EXTRACT_VERBOSE: u32 = 1 << 3;
pub const EXTRACT_SEQUENTIAL: u32 = 1 << 4;
pub const EXTRACT_UNIX_DATA: u32 = 1 << 5;
pub const EXTRACT_TO_STDOUT: u32 = 1 << 6;
pub const EXTRACT_RPFIX: u32 = 1 << 7;
pub const EXTRACT_NORPFIX: u32 = 1 << 8;
pub const EXTRACT_MASK_PUBLIC: u32 = 0x1ff;

/// Engine-internal: set during the directory-structure phase so stream
/// payloads are deferred.
pub const EXTRACT_NO_STREAMS: u32 = 1 << 30;
/// Engine-internal: set when extracting every image of the archive.
pub const EXTRACT_MULTI_IMAGE: u32 = 1 << 31;

/// Write flags.
pub const WRITE_CHECK_INTEGRITY: u32 = 1 << 0;
pub const WRITE_SHOW_PROGRESS: u32 = 1 << 1;

/// Selects one image of an archive, or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSelector {
    All,
    /// 1-based image index.
    Index(u32),
}

/// One extraction request: a path inside the image and a filesystem
/// destination.
#[derive(Debug, Clone)]
pub struct ExtractCommand {
    /// Canonical path inside the image; empty string = whole image.
    pub wim_source_path: String,
    pub fs_dest_path: PathBuf,
    pub extract_flags: u32,
}

/// Events reported through the progress callback, in emission order.
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    /// A whole-image extraction is starting (source path was empty).
    ExtractImageBegin {
        image: u32,
        image_name: &'a str,
        target: &'a Path,
        total_bytes: u64,
        num_streams: u64,
    },
    /// A subtree extraction is starting.
    ExtractTreeBegin {
        image: u32,
        source_path: &'a str,
        target: &'a Path,
        total_bytes: u64,
        num_streams: u64,
    },
    ExtractDirStructureBegin,
    ExtractDirStructureEnd,
    /// Per-dentry notification, emitted only with [`EXTRACT_VERBOSE`].
    ExtractDentry { path: &'a str },
    /// Stream payload progress: at every 1% boundary and at completion.
    ExtractStreams {
        completed_bytes: u64,
        total_bytes: u64,
        num_streams: u64,
    },
    ApplyTimestamps,
    ExtractTreeEnd { image: u32 },
    ExtractImageEnd { image: u32 },
}

/// Nullable progress callback, reborrowable across the engine's phases.
pub(crate) struct ProgressSink<'a> {
    func: Option<&'a mut dyn FnMut(&ProgressEvent<'_>)>,
}

impl<'a> ProgressSink<'a> {
    pub fn new(func: Option<&'a mut dyn FnMut(&ProgressEvent<'_>)>) -> Self {
        ProgressSink { func }
    }

    pub fn enabled(&self) -> bool {
        self.func.is_some()
    }

    pub fn emit(&mut self, event: &ProgressEvent<'_>) {
        if let Some(f) = self.func.as_mut() {
            f(event);
        }
    }
}
