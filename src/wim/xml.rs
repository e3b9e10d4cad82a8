use std::io::Write;

use crate::api::ImageSelector;
use crate::error::{Result, WimError};

/// Per-image statistics carried in the XML block.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub name: String,
    pub description: Option<String>,
    pub dir_count: u64,
    pub file_count: u64,
    pub total_bytes: u64,
}

/// In-memory model of the archive's XML metadata.
#[derive(Debug, Clone, Default)]
pub struct WimInfo {
    pub images: Vec<ImageInfo>,
}

impl WimInfo {
    /// Sum of per-image byte counts, used as the archive-level
    /// `<TOTALBYTES>` when no hint overrides it.
    pub fn total_bytes(&self) -> u64 {
        self.images.iter().map(|i| i.total_bytes).sum()
    }

    pub fn image_name(&self, image: u32) -> Option<&str> {
        let idx = image.checked_sub(1)?;
        self.images.get(idx as usize).map(|i| i.name.as_str())
    }

    pub fn max_image_name_len(&self) -> usize {
        self.images.iter().map(|i| i.name.len()).max().unwrap_or(0)
    }
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

/// Render the XML block for the selected image(s) and write it UTF-16LE
/// with a little-endian BOM.
///
/// A non-zero `total_bytes_hint` replaces the recomputed archive-level
/// total, so a subset write still reports the original archive's
/// statistics. Selected images are renumbered from 1, matching the image
/// count forced into a single-image header.
pub fn write_xml_data(
    info: &WimInfo,
    selector: ImageSelector,
    out: &mut impl Write,
    total_bytes_hint: u64,
) -> Result<()> {
    let selected: Vec<&ImageInfo> = match selector {
        ImageSelector::All => info.images.iter().collect(),
        ImageSelector::Index(n) => {
            let image = n
                .checked_sub(1)
                .and_then(|i| info.images.get(i as usize))
                .ok_or(WimError::InvalidImage(n))?;
            vec![image]
        }
    };

    let total = if total_bytes_hint != 0 {
        total_bytes_hint
    } else {
        selected.iter().map(|i| i.total_bytes).sum()
    };

    let mut xml = String::new();
    xml.push_str("<WIM>");
    xml.push_str(&format!("<TOTALBYTES>{total}</TOTALBYTES>"));
    for (idx, image) in selected.iter().enumerate() {
        xml.push_str(&format!("<IMAGE INDEX=\"{}\">", idx + 1));
        if !image.name.is_empty() {
            xml.push_str("<NAME>");
            escape_into(&mut xml, &image.name);
            xml.push_str("</NAME>");
        }
        if let Some(desc) = &image.description {
            xml.push_str("<DESCRIPTION>");
            escape_into(&mut xml, desc);
            xml.push_str("</DESCRIPTION>");
        }
        xml.push_str(&format!("<DIRCOUNT>{}</DIRCOUNT>", image.dir_count));
        xml.push_str(&format!("<FILECOUNT>{}</FILECOUNT>", image.file_count));
        xml.push_str(&format!("<TOTALBYTES>{}</TOTALBYTES>", image.total_bytes));
        xml.push_str("</IMAGE>");
    }
    xml.push_str("</WIM>");

    // UTF-16LE with LE BOM.
    let mut bytes = Vec::with_capacity(2 + xml.len() * 2);
    bytes.extend_from_slice(&[0xff, 0xfe]);
    for unit in xml.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    out.write_all(&bytes).map_err(WimError::Write)
}
