pub mod api;
mod apply;
pub mod error;
mod extract;
pub mod io;
mod overwrite;
mod plan;
pub mod wim;
mod write;

pub use api::{
    EXTRACT_HARDLINK, EXTRACT_MASK_PUBLIC, EXTRACT_MULTI_IMAGE, EXTRACT_NO_STREAMS,
    EXTRACT_NORPFIX, EXTRACT_NTFS, EXTRACT_RPFIX, EXTRACT_SEQUENTIAL, EXTRACT_SYMLINK,
    EXTRACT_TO_STDOUT, EXTRACT_UNIX_DATA, EXTRACT_VERBOSE, ExtractCommand, ImageSelector,
    ProgressEvent, WRITE_CHECK_INTEGRITY, WRITE_SHOW_PROGRESS,
};
pub use error::{Result, WimError};
pub use extract::{extract_files, extract_image};
pub use io::resource::Codec;
pub use overwrite::{overwrite, overwrite_xml_and_header};
pub use wim::WimStruct;
pub use write::write;
