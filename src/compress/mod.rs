//! # Packing Pipeline
//!
//! Walks a source directory, hashes every file, writes each distinct content
//! once into the compressed payload and finally appends the compressed header
//! and its trailer.
//!
//! `.zip`/`.jar` files met during the walk are opened and their entries are
//! packed as a virtual subtree below a container folder. Containers found
//! inside a container are not expanded; they are stored like any other file.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::{write_trailer, Header};
use crate::common::{BlobLocation, DedupIndex, File, Folder, OffsetTable, ROOT_NAME};
use crate::fsx;
use crate::payload::{compress_block, PayloadWriter, DEFAULT_LEVEL};
use crate::progress::{HashEvent, Observer, Operation};
use crate::ArchiverError;

/// Upper bound for the buffer preallocated from a zip entry's declared size.
const MAX_SIZE_HINT: u64 = 1 << 20;

/// Holds all configuration options for a pack operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackOptions {
    /// LZMA preset (0-9) used for both payload and header.
    pub level: u32,
    /// Also write `<archive>.header.json` and `<archive>.header` next to the archive.
    pub dump_header: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        PackOptions {
            level: DEFAULT_LEVEL,
            dump_header: false,
        }
    }
}

/// State of a single pack: the dedup tables and the payload writer.
pub struct PackSession<'a> {
    options: PackOptions,
    observer: &'a dyn Observer,
    index: DedupIndex,
    offsets: OffsetTable,
    writer: PayloadWriter,
    /// Header dumps written by the current pack, removed again on failure.
    dumped: Vec<PathBuf>,
}

impl<'a> PackSession<'a> {
    pub fn new(options: PackOptions, observer: &'a dyn Observer) -> Self {
        let writer = PayloadWriter::new(options.level);
        PackSession {
            options,
            observer,
            index: DedupIndex::new(),
            offsets: OffsetTable::new(),
            writer,
            dumped: Vec::new(),
        }
    }

    /// Dedup index of the last pack.
    pub fn dedup_index(&self) -> &DedupIndex {
        &self.index
    }

    /// Offset table of the last pack.
    pub fn offsets(&self) -> &OffsetTable {
        &self.offsets
    }

    /// Packs `source` into `dest` and returns the header that was written.
    ///
    /// `dest` is removed again if anything fails after it was created.
    pub fn pack(&mut self, source: &Path, dest: &Path) -> Result<Header, ArchiverError> {
        check_source_and_dest(source, dest)?;
        info!(source = %source.display(), dest = %dest.display(), "packing");

        match self.run(source, dest) {
            Ok(header) => {
                info!(
                    records = header.folders.len(),
                    blobs = header.data.len(),
                    payload = header.total_payload_size,
                    "pack finished"
                );
                self.observer.finished(Operation::Pack);
                Ok(header)
            }
            Err(e) => {
                for path in std::iter::once(dest.to_path_buf()).chain(self.dumped.drain(..)) {
                    if let Err(cleanup) = fs::remove_file(&path) {
                        if cleanup.kind() != io::ErrorKind::NotFound {
                            warn!(path = %path.display(), error = %cleanup, "unable to remove partial output");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    fn run(&mut self, source: &Path, dest: &Path) -> Result<Header, ArchiverError> {
        self.index.clear();
        self.offsets.clear();
        self.dumped.clear();
        self.writer.open(dest)?;

        let walked = self.walk(source);
        // The stream is finished even when the walk failed so the file handle is released.
        let closed = self.writer.close();
        let root = walked?;
        let total = closed?;
        let total = u32::try_from(total)
            .map_err(|_| ArchiverError::TooLarge(format!("payload of {} bytes exceeds 4 GiB", total)))?;

        let header = Header::build(&root, &self.offsets, total)?;
        let encoded = header.encode()?;
        if self.options.dump_header {
            dump_header(dest, &header, &encoded, &mut self.dumped)?;
        }

        let compressed = compress_block(&encoded, self.options.level)?;
        let mut out = OpenOptions::new()
            .append(true)
            .open(dest)
            .map_err(|e| ArchiverError::io(e, dest))?;
        write_trailer(&mut out, &compressed)?;
        out.sync_all().map_err(|e| ArchiverError::io(e, dest))?;
        debug!(plain = encoded.len(), compressed = compressed.len(), "header written");

        Ok(header)
    }

    /// Builds the folder tree for `source`, writing blobs as they are found.
    fn walk(&mut self, source: &Path) -> Result<Folder, ArchiverError> {
        let mut root = Folder::new(ROOT_NAME, false);
        self.observer.folder_created(&root.name, false);

        for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source.to_path_buf());
                ArchiverError::io(e.into(), path)
            })?;
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                debug!(path = %entry.path().display(), "skipping symlink");
                continue;
            }

            let relative = entry.path().strip_prefix(source).map_err(|_| {
                ArchiverError::InvalidArgument(format!("'{}' is outside '{}'", entry.path().display(), source.display()))
            })?;
            let mut components = path_components(relative)?;
            let Some(name) = components.pop() else {
                continue;
            };
            let parent = root.ensure_segments(&components);

            if file_type.is_dir() {
                parent.ensure_segments(&[name]);
                self.observer.folder_created(name, false);
            } else if fsx::is_container(name) {
                let mut container = Folder::new(name, true);
                self.observer.folder_created(name, true);
                self.read_container(&mut container, entry.path())?;
                parent.push_folder(container)?;
            } else {
                let body = fs::read(entry.path()).map_err(|e| ArchiverError::io(e, entry.path()))?;
                let file = self.add_blob(name, &body)?;
                parent.push_file(file)?;
            }
        }
        Ok(root)
    }

    /// Packs the entries of the zip file at `path` into `container`.
    fn read_container(&mut self, container: &mut Folder, path: &Path) -> Result<(), ArchiverError> {
        let file = fs::File::open(path).map_err(|e| ArchiverError::io(e, path))?;
        let mut archive = zip::ZipArchive::new(BufReader::new(file))?;
        debug!(path = %path.display(), entries = archive.len(), "expanding container");

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().to_string();
            if entry.is_dir() {
                container.ensure_path(&name)?;
                self.observer.folder_created(&name, false);
            } else {
                // Declared sizes are untrusted; the hint only saves a few reallocations.
                let mut body = Vec::with_capacity(entry.size().min(MAX_SIZE_HINT) as usize);
                entry.read_to_end(&mut body).map_err(|e| ArchiverError::io(e, path.join(&name)))?;
                let file = self.add_blob(&name, &body)?;
                container.add_file(file)?;
            }
        }
        Ok(())
    }

    /// Hashes `body` and stores it if its content is new.
    fn add_blob(&mut self, name: &str, body: &[u8]) -> Result<File, ArchiverError> {
        let (file, is_new) = self.index.new_file(name, body);
        self.observer.hashed(&HashEvent {
            name,
            size: file.size,
            hash: file.hash,
            is_new,
        });

        if is_new && !body.is_empty() {
            let end = self.writer.written() + body.len() as u64;
            if end > u32::MAX as u64 {
                return Err(ArchiverError::TooLarge(format!("payload would grow past 4 GiB at '{}'", name)));
            }
            let offset = self.writer.write(body)?;
            let location = BlobLocation {
                offset: offset as u32,
                size: body.len() as u32,
            };
            self.offsets.record(location, file.hash);
            self.observer.compressed(body.len() as u64, self.writer.written());
            debug!(file = %name, offset, size = body.len(), hash = %file.hash, "stored blob");
        }

        Ok(file)
    }
}

/// The names along `relative`, each kept as one literal segment.
///
/// Names that are not valid UTF-8 cannot be stored in the header and are
/// rejected rather than rewritten.
fn path_components(relative: &Path) -> Result<Vec<&str>, ArchiverError> {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s),
            _ => None,
        })
        .map(|s| {
            s.to_str().ok_or_else(|| {
                ArchiverError::InvalidArgument(format!("'{}' is not a valid UTF-8 name", relative.display()))
            })
        })
        .collect()
}

fn check_source_and_dest(source: &Path, dest: &Path) -> Result<(), ArchiverError> {
    let meta = match fs::metadata(source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ArchiverError::PathNotFound(source.to_path_buf())),
        Err(e) => return Err(ArchiverError::io(e, source)),
    };
    if !meta.is_dir() {
        return Err(ArchiverError::NotADirectory(source.to_path_buf()));
    }
    if fs::symlink_metadata(dest).is_ok() {
        return Err(ArchiverError::AlreadyExists(dest.to_path_buf()));
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

/// Writes the header as pretty JSON and as raw encoded bytes next to `dest`.
/// Every file created is pushed onto `written`.
fn dump_header(dest: &Path, header: &Header, encoded: &[u8], written: &mut Vec<PathBuf>) -> Result<(), ArchiverError> {
    let json_path = with_suffix(dest, ".header.json");
    let json = serde_json::to_vec_pretty(header)?;
    fs::write(&json_path, json).map_err(|e| ArchiverError::io(e, &json_path))?;
    written.push(json_path);

    let raw_path = with_suffix(dest, ".header");
    fs::write(&raw_path, encoded).map_err(|e| ArchiverError::io(e, &raw_path))?;
    written.push(raw_path);
    Ok(())
}

/// Packs `source` into a new archive at `dest`.
pub fn pack_with(source: &Path, dest: &Path, options: &PackOptions, observer: &dyn Observer) -> Result<(), ArchiverError> {
    PackSession::new(options.clone(), observer).pack(source, dest)?;
    Ok(())
}
