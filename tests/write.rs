use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};

use tempfile::TempDir;
use wimpack::io::resource::read_resource;
use wimpack::wim::dentry::{DentryTree, FILE_ATTRIBUTE_DIRECTORY, Inode};
use wimpack::wim::header::{HEADER_DISK_SIZE, WimHeader};
use wimpack::wim::integrity::IntegrityTable;
use wimpack::wim::lookup::LOOKUP_ENTRY_DISK_SIZE;
use wimpack::wim::xml::ImageInfo;
use wimpack::{
    ImageSelector, WRITE_CHECK_INTEGRITY, WimError, WimStruct, overwrite,
    overwrite_xml_and_header, write,
};

fn file_inode(wim: &mut WimStruct, ino: u64, content: &[u8]) -> Inode {
    let hash = wim.add_stream(content.to_vec());
    let mut inode = Inode::new(ino, 0);
    inode.unnamed_hash = Some(hash);
    inode
}

/// Two-image archive; the second image is bootable and shares one stream
/// with the first.
fn two_image_archive() -> WimStruct {
    let mut wim = WimStruct::new();

    let mut tree1 = DentryTree::new(Inode::new(1, FILE_ATTRIBUTE_DIRECTORY));
    let shared = file_inode(&mut wim, 2, b"shared contents");
    tree1.add_child(tree1.root(), "shared.txt", shared);
    let only1 = file_inode(&mut wim, 3, b"only in one");
    tree1.add_child(tree1.root(), "one.txt", only1);
    wim.add_image(
        tree1,
        ImageInfo {
            name: "first".into(),
            total_bytes: 26,
            file_count: 2,
            dir_count: 1,
            ..Default::default()
        },
        b"metadata-first".to_vec(),
    );

    let mut tree2 = DentryTree::new(Inode::new(1, FILE_ATTRIBUTE_DIRECTORY));
    let shared = file_inode(&mut wim, 2, b"shared contents");
    tree2.add_child(tree2.root(), "shared.txt", shared);
    let only2 = file_inode(&mut wim, 3, b"only in two");
    tree2.add_child(tree2.root(), "two.txt", only2);
    wim.add_image(
        tree2,
        ImageInfo {
            name: "second".into(),
            total_bytes: 26,
            file_count: 2,
            dir_count: 1,
            ..Default::default()
        },
        b"metadata-second".to_vec(),
    );

    wim.hdr.boot_idx = 2;
    wim
}

fn decode_utf16le(bytes: &[u8]) -> String {
    assert_eq!(&bytes[..2], &[0xff, 0xfe], "XML must carry a LE BOM");
    let units: Vec<u16> = bytes[2..]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).unwrap()
}

fn read_region(file: &mut File, offset: u64, size: u64) -> Vec<u8> {
    let mut buf = vec![0u8; size as usize];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn finish_write_backpatches_the_header() {
    let mut wim = two_image_archive();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("two.wim");

    write(&mut wim, &path, ImageSelector::All, WRITE_CHECK_INTEGRITY).unwrap();

    let mut file = File::open(&path).unwrap();
    let hdr = WimHeader::read_from(&mut file).unwrap();

    assert_eq!(hdr.image_count, 2);
    assert_eq!(hdr.boot_idx, 2);

    // Layout: header, resources, lookup table, XML, integrity.
    assert!(hdr.lookup_table_res.offset >= HEADER_DISK_SIZE as u64);
    assert_eq!(
        hdr.xml_res.offset,
        hdr.lookup_table_res.offset + hdr.lookup_table_res.size
    );
    assert_eq!(
        hdr.integrity_res.offset,
        hdr.xml_res.offset + hdr.xml_res.size
    );
    let file_len = fs::metadata(&path).unwrap().len();
    assert_eq!(
        file_len,
        hdr.integrity_res.offset + hdr.integrity_res.size
    );

    // Three distinct file streams plus two metadata streams.
    assert_eq!(
        hdr.lookup_table_res.size,
        5 * LOOKUP_ENTRY_DISK_SIZE as u64
    );

    // Each recorded region decodes as what was promised there.
    let xml = decode_utf16le(&read_region(
        &mut file,
        hdr.xml_res.offset,
        hdr.xml_res.size,
    ));
    assert!(xml.contains("<NAME>first</NAME>"));
    assert!(xml.contains("<NAME>second</NAME>"));
    assert!(xml.contains("<TOTALBYTES>52</TOTALBYTES>"));

    let integrity = IntegrityTable::parse(&read_region(
        &mut file,
        hdr.integrity_res.offset,
        hdr.integrity_res.size,
    ))
    .unwrap();
    assert!(
        integrity
            .verify(&mut file, HEADER_DISK_SIZE as u64, hdr.xml_res.offset)
            .unwrap()
    );

    // The bootable image's metadata entry is mirrored in the header.
    let reopened = WimStruct::open(&path).unwrap();
    let boot_meta = reopened.lookup.get(reopened.images[1].metadata_stream);
    assert_eq!(hdr.boot_metadata_res, boot_meta.resource);
}

#[test]
fn written_archive_round_trips_through_open() {
    let mut wim = two_image_archive();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rt.wim");

    write(&mut wim, &path, ImageSelector::All, 0).unwrap();

    let reopened = WimStruct::open(&path).unwrap();
    assert_eq!(reopened.image_count(), 2);
    assert_eq!(reopened.lookup.len(), 5);

    // Every original stream is present with identical bytes.
    let mut file = File::open(&path).unwrap();
    for (_, desc) in wim.lookup.iter() {
        let id = reopened
            .lookup
            .lookup(&desc.hash)
            .expect("stream lost in round trip");
        let entry = reopened.lookup.get(id).resource;
        assert_eq!(entry.original_size, desc.resource.original_size);
        if entry.size > 0 {
            let bytes = read_resource(&mut file, &entry, None, 0).unwrap();
            let original =
                read_resource_from_buffer(&wim, &desc.hash).expect("missing source bytes");
            assert_eq!(bytes, original);
        }
    }
}

fn read_resource_from_buffer(wim: &WimStruct, hash: &[u8; 20]) -> Option<Vec<u8>> {
    use wimpack::wim::lookup::StreamSource;
    let id = wim.lookup.lookup(hash)?;
    match &wim.lookup.get(id).source {
        StreamSource::Buffer(bytes) => Some(bytes.clone()),
        StreamSource::Archive { .. } => None,
    }
}

#[test]
fn shared_streams_are_written_once() {
    let mut wim = two_image_archive();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dedup.wim");

    write(&mut wim, &path, ImageSelector::All, 0).unwrap();

    // 5 distinct streams even though "shared contents" is referenced by
    // both images.
    let reopened = WimStruct::open(&path).unwrap();
    assert_eq!(reopened.lookup.len(), 5);

    let sizes: u64 = reopened
        .lookup
        .iter()
        .map(|(_, d)| d.resource.size)
        .sum();
    let hdr = reopened.hdr.clone();
    // Resources fill the space between header and lookup table exactly:
    // no stream was copied twice.
    assert_eq!(
        hdr.lookup_table_res.offset - HEADER_DISK_SIZE as u64,
        sizes
    );
}

#[test]
fn single_image_write_forces_count_and_boot_index() {
    let dir = TempDir::new().unwrap();

    // Writing the bootable image: it becomes image 1 and stays bootable.
    let mut wim = two_image_archive();
    let path = dir.path().join("boot.wim");
    write(&mut wim, &path, ImageSelector::Index(2), 0).unwrap();
    let mut file = File::open(&path).unwrap();
    let hdr = WimHeader::read_from(&mut file).unwrap();
    assert_eq!(hdr.image_count, 1);
    assert_eq!(hdr.boot_idx, 1);
    assert_ne!(hdr.boot_metadata_res.size, 0);

    let xml = decode_utf16le(&read_region(
        &mut file,
        hdr.xml_res.offset,
        hdr.xml_res.size,
    ));
    assert!(xml.contains("<IMAGE INDEX=\"1\">"));
    assert!(!xml.contains("<IMAGE INDEX=\"2\">"));
    // Subset writes keep the whole archive's statistics.
    assert!(xml.contains("<TOTALBYTES>52</TOTALBYTES>"));

    // Writing the non-bootable image: the boot position is lost.
    let mut wim = two_image_archive();
    let path = dir.path().join("noboot.wim");
    write(&mut wim, &path, ImageSelector::Index(1), 0).unwrap();
    let mut file = File::open(&path).unwrap();
    let hdr = WimHeader::read_from(&mut file).unwrap();
    assert_eq!(hdr.image_count, 1);
    assert_eq!(hdr.boot_idx, 0);
    assert_eq!(hdr.boot_metadata_res.size, 0);
    assert_eq!(hdr.boot_metadata_res.offset, 0);
}

#[test]
fn write_rejects_a_bad_image_index() {
    let mut wim = two_image_archive();
    let dir = TempDir::new().unwrap();
    let err = write(
        &mut wim,
        &dir.path().join("x.wim"),
        ImageSelector::Index(3),
        0,
    )
    .unwrap_err();
    assert!(matches!(err, WimError::InvalidImage(3)));
}

#[test]
fn overwrite_replaces_the_archive_atomically() {
    let mut wim = two_image_archive();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("live.wim");

    write(&mut wim, &path, ImageSelector::All, 0).unwrap();
    wim.path = Some(path.clone());

    wim.info.images[0].name = "renamed".into();
    overwrite(&mut wim, 0).unwrap();

    let mut file = File::open(&path).unwrap();
    let hdr = WimHeader::read_from(&mut file).unwrap();
    let xml = decode_utf16le(&read_region(
        &mut file,
        hdr.xml_res.offset,
        hdr.xml_res.size,
    ));
    assert!(xml.contains("<NAME>renamed</NAME>"));

    // No temporary file left behind.
    let entries: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, ["live.wim"]);
}

#[test]
fn failed_overwrite_leaves_the_original_intact() {
    use wimpack::wim::header::ResourceEntry;
    use wimpack::wim::lookup::{StreamDescriptor, StreamSource};

    let mut wim = two_image_archive();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("precious.wim");
    write(&mut wim, &path, ImageSelector::All, 0).unwrap();
    let original_bytes = fs::read(&path).unwrap();

    // Sabotage: reference a stream that claims to live in an archive
    // part we do not have open, so the rewrite fails partway through.
    wim.path = Some(path.clone());
    let bad_hash = [0xeeu8; 20];
    wim.lookup.insert(StreamDescriptor {
        hash: bad_hash,
        resource: ResourceEntry {
            offset: 999,
            size: 10,
            original_size: 10,
            flags: 0,
        },
        part_number: 1,
        refcnt: 1,
        source: StreamSource::Archive { part_number: 1 },
        out_refcnt: 0,
        output: ResourceEntry::default(),
    });
    let mut bad = Inode::new(99, 0);
    bad.unnamed_hash = Some(bad_hash);
    let root = wim.images[0].tree.root();
    wim.images[0].tree.add_child(root, "bad.bin", bad);

    // The archive was built in memory, so there is no source handle to
    // copy an archive-resident stream from: the rewrite fails partway.
    let err = overwrite(&mut wim, 0).unwrap_err();
    assert!(matches!(err, WimError::Read(_)));

    // The original is byte-identical and no temporary survived.
    assert_eq!(fs::read(&path).unwrap(), original_bytes);
    let entries: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, ["precious.wim"]);
}

#[test]
fn overwrite_without_a_filename_is_refused() {
    let mut wim = two_image_archive();
    assert!(matches!(overwrite(&mut wim, 0), Err(WimError::NoFilename)));
    assert!(matches!(
        overwrite_xml_and_header(&mut wim, 0),
        Err(WimError::NoFilename)
    ));
}

#[test]
fn overwrite_xml_and_header_is_idempotent() {
    let mut wim = two_image_archive();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("meta.wim");
    write(&mut wim, &path, ImageSelector::All, 0).unwrap();

    // Work on the reopened archive so the header carries the on-disk
    // offsets.
    let mut reopened = WimStruct::open(&path).unwrap();
    reopened.info.images = wim.info.images.clone();
    reopened.info.images[1].description = Some("patched".into());

    overwrite_xml_and_header(&mut reopened, 0).unwrap();
    let after_first = fs::read(&path).unwrap();

    overwrite_xml_and_header(&mut reopened, 0).unwrap();
    let after_second = fs::read(&path).unwrap();
    assert_eq!(after_first, after_second);

    let mut file = File::open(&path).unwrap();
    let hdr = WimHeader::read_from(&mut file).unwrap();
    let xml = decode_utf16le(&read_region(
        &mut file,
        hdr.xml_res.offset,
        hdr.xml_res.size,
    ));
    assert!(xml.contains("<DESCRIPTION>patched</DESCRIPTION>"));
    // Integrity disabled: the file ends exactly at the XML.
    assert_eq!(
        fs::metadata(&path).unwrap().len(),
        hdr.xml_res.offset + hdr.xml_res.size
    );
    assert_eq!(hdr.integrity_res.size, 0);
}

#[test]
fn overwrite_xml_and_header_reuses_a_valid_integrity_table() {
    let mut wim = two_image_archive();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checked.wim");
    write(&mut wim, &path, ImageSelector::All, WRITE_CHECK_INTEGRITY).unwrap();

    let mut file = File::open(&path).unwrap();
    let hdr_before = WimHeader::read_from(&mut file).unwrap();
    let table_before = read_region(
        &mut file,
        hdr_before.integrity_res.offset,
        hdr_before.integrity_res.size,
    );
    drop(file);

    let mut reopened = WimStruct::open(&path).unwrap();
    reopened.info.images = wim.info.images.clone();
    reopened.info.images[0].description = Some("longer description than before".into());
    overwrite_xml_and_header(&mut reopened, WRITE_CHECK_INTEGRITY).unwrap();

    let mut file = File::open(&path).unwrap();
    let hdr_after = WimHeader::read_from(&mut file).unwrap();

    // The table moved behind the new XML but its bytes are unchanged:
    // it covers only pre-XML regions.
    assert_eq!(
        hdr_after.integrity_res.offset,
        hdr_after.xml_res.offset + hdr_after.xml_res.size
    );
    assert_eq!(hdr_after.integrity_res.size, hdr_before.integrity_res.size);
    let table_after = read_region(
        &mut file,
        hdr_after.integrity_res.offset,
        hdr_after.integrity_res.size,
    );
    assert_eq!(table_before, table_after);

    let table = IntegrityTable::parse(&table_after).unwrap();
    assert!(
        table
            .verify(&mut file, HEADER_DISK_SIZE as u64, hdr_after.xml_res.offset)
            .unwrap()
    );
}
