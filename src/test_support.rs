//! Fixture builders shared by the unit tests

use std::{
    fs,
    io::{Cursor, Write},
    path::{Path, PathBuf},
};

use zip::{CompressionMethod, ZipWriter, write::FileOptions};

use crate::container::ZipContainer;

/// Builds an archive holding `entries` as stored entries, in the given order
pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::<()>::default().compression_method(CompressionMethod::Stored);

    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }

    zip.finish().unwrap().into_inner()
}

pub(crate) fn zip_container(entries: &[(&str, &[u8])]) -> ZipContainer<Cursor<Vec<u8>>> {
    ZipContainer::new(Cursor::new(zip_bytes(entries))).unwrap()
}

/// Writes an archive named `name` into `dir`
pub(crate) fn write_zip(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, zip_bytes(entries)).unwrap();
    path
}

/// Writes `entries` as files below `dir`
pub(crate) fn write_dir(dir: &Path, entries: &[(&str, &[u8])]) {
    for (name, data) in entries {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
    }
}

pub(crate) const CONTAINER_XML: &[u8] = br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;
