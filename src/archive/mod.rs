//! # Archive Header Format
//!
//! This module defines the header that describes an archive's tree and blobs,
//! and its fixed binary layout. All integers are big-endian.
//!
//! ```text
//! repeat folder_count times:
//!   u32 parent_id | u8 kind | u32 data_ref | u8 name_len | name bytes
//! repeat data_count times:
//!   u32 offset | u32 size | [u8; 32] hash
//! u32 folder_count
//! u32 total_payload_size
//! ```
//!
//! On disk the encoded header is LZMA-compressed and followed by a `u32`
//! trailer holding the compressed length, so a reader can find it from the
//! end of the file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::Serialize;

use crate::common::{ContentHash, Folder, OffsetTable};
use crate::ArchiverError;

/// `data_ref` of a record that has no payload: folders and empty files.
pub const NO_DATA: u32 = u32::MAX;

/// Fixed part of a folder record, without the name.
pub const FOLDER_RECORD_FIXED_SIZE: usize = 4 + 1 + 4 + 1;
pub const DATA_RECORD_SIZE: usize = 4 + 4 + ContentHash::LEN;
/// `folder_count` + `total_payload_size`.
pub const HEADER_TAIL_SIZE: usize = 8;
pub const TRAILER_SIZE: u64 = 4;

/// What a [`FolderRecord`] stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordKind {
    /// A directory.
    PlainFolder,
    /// The root of an expanded zip/jar container.
    ArchiveRootFolder,
    /// A file; its bytes live in the payload unless `data_ref` is [`NO_DATA`].
    DataLeaf,
}

impl RecordKind {
    pub fn to_flags(self) -> u8 {
        match self {
            RecordKind::PlainFolder => 0,
            RecordKind::ArchiveRootFolder => 1,
            RecordKind::DataLeaf => 2,
        }
    }

    pub fn from_flags(flags: u8) -> Result<Self, ArchiverError> {
        match flags {
            0 => Ok(RecordKind::PlainFolder),
            1 => Ok(RecordKind::ArchiveRootFolder),
            2 => Ok(RecordKind::DataLeaf),
            other => Err(ArchiverError::MalformedHeader(format!("unknown record flags {:#04x}", other))),
        }
    }

    pub fn is_folder(self) -> bool {
        !matches!(self, RecordKind::DataLeaf)
    }
}

/// One node of the flattened tree. Its id is its 1-based position in
/// [`Header::folders`]; `parent_id` is 0 only for the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderRecord {
    pub parent_id: u32,
    pub kind: RecordKind,
    pub data_ref: u32,
    pub name: String,
}

/// Location of one distinct blob in the uncompressed payload stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataRecord {
    pub offset: u32,
    pub size: u32,
    pub hash: ContentHash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Header {
    pub folders: Vec<FolderRecord>,
    pub data: Vec<DataRecord>,
    pub total_payload_size: u32,
}

impl Header {
    pub fn new(total_payload_size: u32) -> Self {
        Header {
            folders: Vec::new(),
            data: Vec::new(),
            total_payload_size,
        }
    }

    /// Flattens `root` in pre-order and lists every blob of `offsets`.
    ///
    /// Each folder is followed by one leaf record per file it holds, then by
    /// its subfolders. Files are linked to their blob by offset; empty files
    /// get [`NO_DATA`].
    pub fn build(root: &Folder, offsets: &OffsetTable, total_payload_size: u32) -> Result<Self, ArchiverError> {
        let mut header = Header::new(total_payload_size);
        for (location, hash) in offsets.iter() {
            header.data.push(DataRecord {
                offset: location.offset,
                size: location.size,
                hash: *hash,
            });
        }
        header.fold_tree(0, root, offsets)?;
        Ok(header)
    }

    fn fold_tree(&mut self, parent_id: u32, folder: &Folder, offsets: &OffsetTable) -> Result<(), ArchiverError> {
        let id = self.fold(parent_id, folder, offsets)?;
        for sub in &folder.folders {
            self.fold_tree(id, sub, offsets)?;
        }
        Ok(())
    }

    /// Appends the record for `folder` and the leaf records of its files.
    /// Returns the id given to `folder`.
    fn fold(&mut self, parent_id: u32, folder: &Folder, offsets: &OffsetTable) -> Result<u32, ArchiverError> {
        let kind = if folder.is_container {
            RecordKind::ArchiveRootFolder
        } else {
            RecordKind::PlainFolder
        };
        let id = self.push(FolderRecord {
            parent_id,
            kind,
            data_ref: NO_DATA,
            name: folder.name.clone(),
        })?;

        for file in &folder.files {
            let data_ref = if file.size == 0 {
                NO_DATA
            } else {
                offsets
                    .location_of(&file.hash)
                    .map(|loc| loc.offset)
                    .ok_or_else(|| ArchiverError::InvalidArgument(format!("no stored blob for '{}' ({})", file.name, file.hash)))?
            };
            self.push(FolderRecord {
                parent_id: id,
                kind: RecordKind::DataLeaf,
                data_ref,
                name: file.name.clone(),
            })?;
        }
        Ok(id)
    }

    fn push(&mut self, record: FolderRecord) -> Result<u32, ArchiverError> {
        if record.name.len() > u8::MAX as usize {
            return Err(ArchiverError::TooLarge(format!("name '{}' is longer than 255 bytes", record.name)));
        }
        let id = u32::try_from(self.folders.len() + 1)
            .map_err(|_| ArchiverError::TooLarge("too many records".into()))?;
        self.folders.push(record);
        Ok(id)
    }

    /// Record with the given 1-based id.
    pub fn record(&self, id: u32) -> Option<&FolderRecord> {
        (id as usize).checked_sub(1).and_then(|i| self.folders.get(i))
    }

    /// Serializes the header into its binary layout.
    pub fn encode(&self) -> Result<Vec<u8>, ArchiverError> {
        let names: usize = self.folders.iter().map(|f| f.name.len()).sum();
        let mut buf = Vec::with_capacity(
            self.folders.len() * FOLDER_RECORD_FIXED_SIZE + names + self.data.len() * DATA_RECORD_SIZE + HEADER_TAIL_SIZE,
        );

        for rec in &self.folders {
            let name_len = u8::try_from(rec.name.len())
                .map_err(|_| ArchiverError::TooLarge(format!("name '{}' is longer than 255 bytes", rec.name)))?;
            buf.extend_from_slice(&rec.parent_id.to_be_bytes());
            buf.push(rec.kind.to_flags());
            buf.extend_from_slice(&rec.data_ref.to_be_bytes());
            buf.push(name_len);
            buf.extend_from_slice(rec.name.as_bytes());
        }

        for rec in &self.data {
            buf.extend_from_slice(&rec.offset.to_be_bytes());
            buf.extend_from_slice(&rec.size.to_be_bytes());
            buf.extend_from_slice(rec.hash.as_bytes());
        }

        let count = u32::try_from(self.folders.len()).map_err(|_| ArchiverError::TooLarge("too many records".into()))?;
        buf.extend_from_slice(&count.to_be_bytes());
        buf.extend_from_slice(&self.total_payload_size.to_be_bytes());
        Ok(buf)
    }

    /// Parses bytes produced by [`Header::encode`].
    ///
    /// Data records come back sorted by ascending offset, which is the order
    /// the payload has to be read in.
    pub fn decode(bytes: &[u8]) -> Result<Self, ArchiverError> {
        if bytes.len() < HEADER_TAIL_SIZE {
            return Err(ArchiverError::MalformedHeader(format!("{} bytes is shorter than the header tail", bytes.len())));
        }
        let records_end = bytes.len() - HEADER_TAIL_SIZE;
        let folder_count = read_u32(bytes, records_end)?;
        let total_payload_size = read_u32(bytes, records_end + 4)?;

        let mut header = Header::new(total_payload_size);
        let mut pos = 0usize;
        for i in 0..folder_count {
            if pos + FOLDER_RECORD_FIXED_SIZE > records_end {
                return Err(ArchiverError::MalformedHeader(format!(
                    "folder record {} of {} runs past the data records",
                    i + 1,
                    folder_count
                )));
            }
            let parent_id = read_u32(bytes, pos)?;
            let kind = RecordKind::from_flags(bytes[pos + 4])?;
            let data_ref = read_u32(bytes, pos + 5)?;
            let name_len = bytes[pos + 9] as usize;
            let name_start = pos + FOLDER_RECORD_FIXED_SIZE;
            let name_end = name_start + name_len;
            if name_end > records_end {
                return Err(ArchiverError::MalformedHeader(format!("name of folder record {} runs past the data records", i + 1)));
            }
            if parent_id > i {
                return Err(ArchiverError::MalformedHeader(format!(
                    "record {} points at parent {} which does not precede it",
                    i + 1,
                    parent_id
                )));
            }
            let name = std::str::from_utf8(&bytes[name_start..name_end])
                .map_err(|_| ArchiverError::MalformedHeader(format!("name of record {} is not valid UTF-8", i + 1)))?
                .to_string();
            header.folders.push(FolderRecord {
                parent_id,
                kind,
                data_ref,
                name,
            });
            pos = name_end;
        }

        let remaining = records_end - pos;
        if remaining % DATA_RECORD_SIZE != 0 {
            return Err(ArchiverError::MalformedHeader(format!(
                "{} trailing bytes are not a whole number of data records",
                remaining
            )));
        }

        header.data.reserve(remaining / DATA_RECORD_SIZE);
        while pos < records_end {
            let mut hash = [0u8; ContentHash::LEN];
            hash.copy_from_slice(&bytes[pos + 8..pos + DATA_RECORD_SIZE]);
            header.data.push(DataRecord {
                offset: read_u32(bytes, pos)?,
                size: read_u32(bytes, pos + 4)?,
                hash: ContentHash::from_bytes(hash),
            });
            pos += DATA_RECORD_SIZE;
        }
        header.data.sort_by_key(|d| d.offset);

        Ok(header)
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, ArchiverError> {
    bytes
        .get(at..at + 4)
        .and_then(|s| <[u8; 4]>::try_from(s).ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| ArchiverError::MalformedHeader(format!("truncated field at byte {}", at)))
}

/// Appends the compressed header and its length trailer to `out`.
pub fn write_trailer<W: Write>(out: &mut W, compressed_header: &[u8]) -> Result<(), ArchiverError> {
    let len = u32::try_from(compressed_header.len())
        .map_err(|_| ArchiverError::TooLarge("compressed header exceeds 4 GiB".into()))?;
    out.write_all(compressed_header)?;
    out.write_all(&len.to_be_bytes())?;
    Ok(())
}

/// Where the pieces of an archive file sit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLayout {
    /// Byte length of the compressed payload, which starts at offset 0.
    pub payload_len: u64,
    /// Byte length of the compressed header, which follows the payload.
    pub header_len: u64,
}

/// Reads the trailer and returns the compressed header bytes along with the
/// file layout.
pub fn read_compressed_header(file: &mut File, path: &Path) -> Result<(Vec<u8>, ArchiveLayout), ArchiverError> {
    let file_len = file.metadata().map_err(|e| ArchiverError::io(e, path))?.len();
    if file_len < TRAILER_SIZE {
        return Err(ArchiverError::CorruptHeader(format!("file is only {} bytes long", file_len)));
    }

    file.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))
        .map_err(|e| ArchiverError::CorruptHeader(format!("unable to seek to trailer: {}", e)))?;
    let mut trailer = [0u8; 4];
    file.read_exact(&mut trailer)
        .map_err(|e| ArchiverError::CorruptHeader(format!("unable to read trailer: {}", e)))?;
    let header_len = u32::from_be_bytes(trailer) as u64;

    if header_len > file_len - TRAILER_SIZE {
        return Err(ArchiverError::CorruptHeader(format!(
            "trailer claims a {} byte header in a {} byte file",
            header_len, file_len
        )));
    }
    let payload_len = file_len - TRAILER_SIZE - header_len;

    file.seek(SeekFrom::Start(payload_len))
        .map_err(|e| ArchiverError::CorruptHeader(format!("unable to seek to header: {}", e)))?;
    let mut compressed = vec![0u8; header_len as usize];
    file.read_exact(&mut compressed)
        .map_err(|e| ArchiverError::CorruptHeader(format!("unable to read header: {}", e)))?;

    Ok((compressed, ArchiveLayout { payload_len, header_len }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BlobLocation, DedupIndex, ROOT_NAME};

    fn sample_header() -> Header {
        let mut h = Header::new(11);
        h.folders = vec![
            FolderRecord { parent_id: 0, kind: RecordKind::PlainFolder, data_ref: NO_DATA, name: ROOT_NAME.into() },
            FolderRecord { parent_id: 1, kind: RecordKind::DataLeaf, data_ref: 5, name: "b.txt".into() },
            FolderRecord { parent_id: 1, kind: RecordKind::ArchiveRootFolder, data_ref: NO_DATA, name: "lib.jar".into() },
            FolderRecord { parent_id: 3, kind: RecordKind::DataLeaf, data_ref: 0, name: "a.class".into() },
            FolderRecord { parent_id: 3, kind: RecordKind::DataLeaf, data_ref: NO_DATA, name: "empty".into() },
        ];
        h.data = vec![
            DataRecord { offset: 5, size: 6, hash: ContentHash::of(b"second") },
            DataRecord { offset: 0, size: 5, hash: ContentHash::of(b"first") },
        ];
        h
    }

    #[test]
    fn encode_layout_is_big_endian() -> Result<(), ArchiverError> {
        let mut h = Header::new(0x0102_0304);
        h.folders.push(FolderRecord { parent_id: 0, kind: RecordKind::ArchiveRootFolder, data_ref: NO_DATA, name: "ab".into() });
        let bytes = h.encode()?;

        assert_eq!(
            bytes,
            [
                0, 0, 0, 0, // parent
                1, // flags
                0xFF, 0xFF, 0xFF, 0xFF, // data ref
                2, b'a', b'b', // name
                0, 0, 0, 1, // folder count
                1, 2, 3, 4, // payload size
            ]
        );
        Ok(())
    }

    #[test]
    fn decode_restores_records_and_sorts_data() -> Result<(), ArchiverError> {
        let h = sample_header();
        let decoded = Header::decode(&h.encode()?)?;

        assert_eq!(decoded.folders, h.folders);
        assert_eq!(decoded.total_payload_size, 11);
        let offsets: Vec<_> = decoded.data.iter().map(|d| d.offset).collect();
        assert_eq!(offsets, [0, 5]);
        assert_eq!(decoded.data[0].hash, ContentHash::of(b"first"));
        Ok(())
    }

    #[test]
    fn decode_rejects_inflated_folder_count() -> Result<(), ArchiverError> {
        let mut bytes = sample_header().encode()?;
        let at = bytes.len() - 8;
        bytes[at..at + 4].copy_from_slice(&1000u32.to_be_bytes());
        assert!(matches!(Header::decode(&bytes), Err(ArchiverError::MalformedHeader(_))));
        Ok(())
    }

    #[test]
    fn decode_rejects_partial_data_record() -> Result<(), ArchiverError> {
        let mut bytes = sample_header().encode()?;
        let at = bytes.len() - 8;
        bytes.remove(at - 1);
        assert!(matches!(Header::decode(&bytes), Err(ArchiverError::MalformedHeader(_))));
        Ok(())
    }

    #[test]
    fn decode_rejects_forward_parent() -> Result<(), ArchiverError> {
        let mut h = sample_header();
        h.folders[1].parent_id = 4;
        assert!(matches!(Header::decode(&h.encode()?), Err(ArchiverError::MalformedHeader(_))));
        Ok(())
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(matches!(Header::decode(&[0, 0, 0]), Err(ArchiverError::MalformedHeader(_))));
    }

    #[test]
    fn build_assigns_preorder_ids() -> Result<(), ArchiverError> {
        let mut index = DedupIndex::new();
        let mut offsets = OffsetTable::new();
        let mut root = Folder::new(ROOT_NAME, false);

        let (a, _) = index.new_file("a.txt", b"hello");
        offsets.record(BlobLocation { offset: 0, size: 5 }, a.hash);
        let (empty, _) = index.new_file("empty", b"");
        root.add_file(a)?;
        root.add_file(empty)?;

        let f1 = root.add_folder(Folder::new("f1", false))?;
        let zip = f1.add_folder(Folder::new("f3.zip", true))?;
        let (inner, _) = index.new_file("f4", b"hello");
        zip.add_file(inner)?;
        root.add_folder(Folder::new("z", false))?;

        let h = Header::build(&root, &offsets, 5)?;
        let summary: Vec<_> = h.folders.iter().map(|r| (r.parent_id, r.kind, r.data_ref, r.name.as_str())).collect();
        assert_eq!(
            summary,
            [
                (0, RecordKind::PlainFolder, NO_DATA, ROOT_NAME),
                (1, RecordKind::DataLeaf, 0, "a.txt"),
                (1, RecordKind::DataLeaf, NO_DATA, "empty"),
                (1, RecordKind::PlainFolder, NO_DATA, "f1"),
                (4, RecordKind::ArchiveRootFolder, NO_DATA, "f3.zip"),
                (5, RecordKind::DataLeaf, 0, "f4"),
                (1, RecordKind::PlainFolder, NO_DATA, "z"),
            ]
        );
        for (i, rec) in h.folders.iter().enumerate() {
            assert!(rec.parent_id as usize <= i);
        }
        assert_eq!(h.data.len(), 1);
        assert_eq!(h.record(5).map(|r| r.name.as_str()), Some("f3.zip"));
        assert!(h.record(0).is_none());
        Ok(())
    }

    #[test]
    fn long_names_are_rejected() {
        let mut root = Folder::new(ROOT_NAME, false);
        root.folders.push(Folder::new(&"x".repeat(256), false));
        assert!(matches!(
            Header::build(&root, &OffsetTable::new(), 0),
            Err(ArchiverError::TooLarge(_))
        ));
    }

    #[test]
    fn trailer_points_back_at_header() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.rpk");
        {
            let mut f = File::create(&path)?;
            f.write_all(b"payload")?;
            write_trailer(&mut f, b"HDR")?;
        }
        let mut f = File::open(&path)?;
        let (compressed, layout) = read_compressed_header(&mut f, &path)?;
        assert_eq!(compressed, b"HDR");
        assert_eq!(layout, ArchiveLayout { payload_len: 7, header_len: 3 });
        Ok(())
    }

    #[test]
    fn oversized_trailer_is_corrupt() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.rpk");
        std::fs::write(&path, [0u8, 1, 0xFF, 0xFF, 0xFF, 0xFF])?;
        let mut f = File::open(&path)?;
        assert!(matches!(read_compressed_header(&mut f, &path), Err(ArchiverError::CorruptHeader(_))));

        std::fs::write(&path, [0u8, 1])?;
        let mut f = File::open(&path)?;
        assert!(matches!(read_compressed_header(&mut f, &path), Err(ArchiverError::CorruptHeader(_))));
        Ok(())
    }
}
