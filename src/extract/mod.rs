//! # Extraction Module
//!
//! Rebuilds a directory tree from an archive:
//!
//! 1. The trailer and the compressed header are read from the end of the file.
//! 2. Every folder and every empty file is created, walking the header's
//!    records in order. Records below a container root are routed into a zip
//!    file instead of the filesystem.
//! 3. The payload is decompressed front to back; each blob is written to
//!    every file that references it.
//!
//! A failed unpack removes the destination directory again.

mod zip_sink;
pub use zip_sink::ZipSinks;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::archive::{read_compressed_header, ArchiveLayout, FolderRecord, Header, RecordKind, NO_DATA};
use crate::fsx;
use crate::payload::{decompress_block, PayloadReader};
use crate::progress::{Observer, Operation};
use crate::ArchiverError;

/// Where a header record ends up on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A real path below the destination directory.
    Disk(PathBuf),
    /// An entry inside the zip file at `archive`. An empty `inner` is the
    /// container itself.
    Zipped { archive: PathBuf, inner: String },
}

impl Target {
    fn child(&self, record: &FolderRecord) -> Target {
        match self {
            Target::Disk(dir) if record.kind == RecordKind::ArchiveRootFolder => Target::Zipped {
                archive: dir.join(&record.name),
                inner: String::new(),
            },
            Target::Disk(dir) => Target::Disk(dir.join(&record.name)),
            Target::Zipped { archive, inner } if inner.is_empty() => Target::Zipped {
                archive: archive.clone(),
                inner: record.name.clone(),
            },
            Target::Zipped { archive, inner } => Target::Zipped {
                archive: archive.clone(),
                inner: format!("{}/{}", inner, record.name),
            },
        }
    }
}

/// A record name must be one path component on this platform. `\` is an
/// ordinary character on Unix.
fn check_name(id: usize, name: &str) -> Result<(), ArchiverError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', std::path::MAIN_SEPARATOR]) {
        return Err(ArchiverError::CorruptHeader(format!("record {} has unusable name '{}'", id, name)));
    }
    Ok(())
}

/// Resolves the output location of every record of `header`, in record order.
///
/// The root record (the only one with parent 0) maps to `dest` itself and
/// adds no path segment.
pub fn resolve_targets(header: &Header, dest: &Path) -> Result<Vec<Target>, ArchiverError> {
    let mut targets: Vec<Target> = Vec::with_capacity(header.folders.len());
    if header.folders.is_empty() {
        return Err(ArchiverError::CorruptHeader("header has no root record".into()));
    }

    for (i, record) in header.folders.iter().enumerate() {
        let id = i + 1;
        let target = if record.parent_id == 0 {
            if i != 0 || !record.kind.is_folder() {
                return Err(ArchiverError::CorruptHeader(format!("record {} claims to be a second root", id)));
            }
            Target::Disk(dest.to_path_buf())
        } else {
            let parent_idx = record.parent_id as usize - 1;
            let parent = header
                .folders
                .get(parent_idx)
                .filter(|_| parent_idx < i)
                .ok_or_else(|| ArchiverError::CorruptHeader(format!("record {} has unknown parent {}", id, record.parent_id)))?;
            if !parent.kind.is_folder() {
                return Err(ArchiverError::CorruptHeader(format!("record {} is placed below file record {}", id, record.parent_id)));
            }
            check_name(id, &record.name)?;
            targets[parent_idx].child(record)
        };
        targets.push(target);
    }
    Ok(targets)
}

/// Reads and decodes the header of the archive at `path`.
///
/// Every failure is reported as [`ArchiverError::CorruptHeader`].
pub fn load_header(file: &mut File, path: &Path) -> Result<(Header, ArchiveLayout), ArchiverError> {
    let (compressed, layout) = read_compressed_header(file, path)?;
    let plain = decompress_block(&compressed)
        .map_err(|e| ArchiverError::CorruptHeader(format!("unable to decompress header: {}", e)))?;
    let header = Header::decode(&plain).map_err(|e| match e {
        ArchiverError::MalformedHeader(msg) => ArchiverError::CorruptHeader(msg),
        other => ArchiverError::CorruptHeader(other.to_string()),
    })?;
    Ok((header, layout))
}

/// Reads the header of `archive` without extracting anything.
pub fn read_header(archive: &Path) -> Result<Header, ArchiverError> {
    check_archive(archive)?;
    let mut file = File::open(archive).map_err(|e| ArchiverError::io(e, archive))?;
    Ok(load_header(&mut file, archive)?.0)
}

fn check_archive(archive: &Path) -> Result<(), ArchiverError> {
    match fs::metadata(archive) {
        Ok(meta) if meta.is_dir() => Err(ArchiverError::IsADirectory(archive.to_path_buf())),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ArchiverError::PathNotFound(archive.to_path_buf())),
        Err(e) => Err(ArchiverError::io(e, archive)),
    }
}

/// Progress of one unpack call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    HeaderLoaded,
    StructureBuilt,
    PayloadDistributed,
    Closed,
}

struct Unpacker<'a> {
    archive: &'a Path,
    dest: &'a Path,
    observer: &'a dyn Observer,
    stage: Stage,
    processed: usize,
    total: usize,
}

impl<'a> Unpacker<'a> {
    fn advance(&mut self, stage: Stage) {
        debug!(from = ?self.stage, to = ?stage, "unpack stage");
        self.stage = stage;
    }

    fn tick(&mut self) {
        self.processed += 1;
        self.observer.unpack_progress(self.processed, self.total);
    }

    fn run(&mut self) -> Result<(), ArchiverError> {
        let mut file = File::open(self.archive).map_err(|e| ArchiverError::io(e, self.archive))?;
        let (header, layout) = load_header(&mut file, self.archive)?;
        self.total = header.folders.len();
        self.advance(Stage::HeaderLoaded);
        debug!(records = header.folders.len(), blobs = header.data.len(), payload = header.total_payload_size, "header loaded");

        let targets = resolve_targets(&header, self.dest)?;
        let mut sinks = ZipSinks::new();
        let written = self
            .build_structure(&header, &targets, &mut sinks)
            .and_then(|_| self.distribute(&header, &targets, &mut sinks, &mut file, layout));
        let closed = sinks.finish();
        written?;
        closed?;
        self.advance(Stage::Closed);
        Ok(())
    }

    /// Creates every folder, container and empty file.
    fn build_structure(&mut self, header: &Header, targets: &[Target], sinks: &mut ZipSinks) -> Result<(), ArchiverError> {
        for (record, target) in header.folders.iter().zip(targets) {
            match (record.kind, target) {
                (RecordKind::DataLeaf, _) if record.data_ref != NO_DATA => continue,
                (RecordKind::DataLeaf, target) => write_leaf(target, &[], sinks)?,
                (_, Target::Disk(dir)) => fs::create_dir_all(dir).map_err(|e| ArchiverError::io(e, dir))?,
                (_, Target::Zipped { archive, inner }) if inner.is_empty() => {
                    sinks.open(archive)?;
                }
                (_, Target::Zipped { archive, inner }) => sinks.add_directory(archive, inner)?,
            }
            self.tick();
        }
        self.advance(Stage::StructureBuilt);
        Ok(())
    }

    /// Streams the payload and writes each blob to every file sharing it.
    fn distribute(
        &mut self,
        header: &Header,
        targets: &[Target],
        sinks: &mut ZipSinks,
        file: &mut File,
        layout: ArchiveLayout,
    ) -> Result<(), ArchiverError> {
        let mut leaves: HashMap<u32, Vec<usize>> = HashMap::new();
        for (i, record) in header.folders.iter().enumerate() {
            if record.kind == RecordKind::DataLeaf && record.data_ref != NO_DATA {
                leaves.entry(record.data_ref).or_default().push(i);
            }
        }

        file.seek(SeekFrom::Start(0)).map_err(|e| ArchiverError::io(e, self.archive))?;
        let mut reader = PayloadReader::new(io::BufReader::new(file.take(layout.payload_len)))?;

        for data in &header.data {
            if u64::from(data.offset) != reader.consumed() {
                return Err(ArchiverError::CorruptHeader(format!(
                    "blob {} starts at {} but the payload is at {}",
                    data.hash,
                    data.offset,
                    reader.consumed()
                )));
            }
            let body = reader.read_exactly(u64::from(data.size))?;
            let Some(users) = leaves.remove(&data.offset) else {
                debug!(offset = data.offset, "blob has no users");
                continue;
            };
            for idx in users {
                write_leaf(&targets[idx], &body, sinks)?;
                self.tick();
            }
        }

        let expected = u64::from(header.total_payload_size);
        if reader.consumed() != expected {
            return Err(ArchiverError::TruncatedPayload {
                expected,
                actual: reader.consumed(),
            });
        }
        if let Some((offset, users)) = leaves.iter().next() {
            return Err(ArchiverError::CorruptHeader(format!(
                "{} file(s) refer to missing blob at offset {}",
                users.len(),
                offset
            )));
        }
        self.advance(Stage::PayloadDistributed);
        Ok(())
    }
}

fn write_leaf(target: &Target, body: &[u8], sinks: &mut ZipSinks) -> Result<(), ArchiverError> {
    match target {
        Target::Disk(path) => fs::write(path, body).map_err(|e| ArchiverError::io(e, path)),
        Target::Zipped { archive, inner } => sinks.add_file(archive, inner, body),
    }
}

/// Unpacks `archive` into the new directory `dest`.
pub fn unpack_with(archive: &Path, dest: &Path, observer: &dyn Observer) -> Result<(), ArchiverError> {
    check_archive(archive)?;
    if fs::symlink_metadata(dest).is_ok() {
        return Err(ArchiverError::AlreadyExists(dest.to_path_buf()));
    }
    info!(archive = %archive.display(), dest = %dest.display(), "unpacking");

    let mut unpacker = Unpacker {
        archive,
        dest,
        observer,
        stage: Stage::Validating,
        processed: 0,
        total: 0,
    };
    match unpacker.run() {
        Ok(()) => {
            info!(records = unpacker.total, "unpack finished");
            observer.finished(Operation::Unpack);
            Ok(())
        }
        Err(e) => {
            warn!(stage = ?unpacker.stage, error = %e, "unpack failed, removing destination");
            if let Err(cleanup) = fsx::remove_dir_recursive(dest) {
                warn!(dest = %dest.display(), error = %cleanup, "unable to remove partial output");
            }
            Err(e)
        }
    }
}
