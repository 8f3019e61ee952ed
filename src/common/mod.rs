//! # Content Model
//!
//! In-memory tree of folders and files built while packing, plus the two
//! per-pack tables that drive deduplication:
//!
//! - [`DedupIndex`]: content hash → every [`File`] sharing that content.
//! - [`OffsetTable`]: first payload offset of every distinct, non-empty blob.
//!
//! Nothing in here touches the filesystem.

use std::collections::HashMap;
use std::fmt;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::ArchiverError;

/// Name given to the synthetic top-level folder of every pack.
pub const ROOT_NAME: &str = "_root_";

/// SHA-256 over the decimal length of the content followed by the content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const LEN: usize = 32;

    /// Hashes `body` the way the archive keys its blobs.
    pub fn of(body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(body.len().to_string().as_bytes());
        hasher.update(body);
        ContentHash(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ContentHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A regular file, on disk or inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub name: String,
    pub size: u64,
    pub hash: ContentHash,
}

/// A directory on disk, or the root of an expanded container when
/// `is_container` is set.
#[derive(Debug, Clone, Default)]
pub struct Folder {
    pub name: String,
    pub is_container: bool,
    pub folders: Vec<Folder>,
    pub files: Vec<File>,
}

/// Zip entry names always use `/`, whatever the host platform.
fn is_separator(c: char) -> bool {
    c == '/'
}

/// Splits a `/`-separated relative path into its non-empty segments.
///
/// `.` segments are dropped; `..` is rejected so nothing can climb out of the
/// tree it is added to.
fn segments(path: &str) -> Result<Vec<&str>, ArchiverError> {
    let mut out = Vec::new();
    for seg in path.split(is_separator) {
        match seg {
            "" | "." => {}
            ".." => {
                return Err(ArchiverError::InvalidArgument(format!(
                    "parent directory component in '{}'",
                    path
                )))
            }
            s => out.push(s),
        }
    }
    Ok(out)
}

/// Splits `name` into (parent path, last segment).
fn split_name(name: &str) -> Result<(Vec<&str>, &str), ArchiverError> {
    let mut segs = segments(name)?;
    match segs.pop() {
        Some(base) => Ok((segs, base)),
        None => Err(ArchiverError::InvalidArgument(format!("empty name '{}'", name))),
    }
}

impl Folder {
    /// Creates an empty folder. Trailing separators are stripped from `name`.
    pub fn new(name: &str, is_container: bool) -> Self {
        let trimmed = name.trim_end_matches(is_separator);
        let name = if trimmed.is_empty() { name } else { trimmed };
        Folder {
            name: name.to_string(),
            is_container,
            folders: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Direct child folder with the given name, if any.
    pub fn find_child(&self, name: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.name == name)
    }

    /// Walks `path` below this folder, creating every missing folder on the
    /// way, and returns the deepest one. An empty path returns `self`.
    pub fn ensure_path(&mut self, path: &str) -> Result<&mut Folder, ArchiverError> {
        let segs = segments(path)?;
        Ok(self.ensure_segments(&segs))
    }

    /// Like [`Folder::ensure_path`], but every element of `segs` is taken as
    /// one literal folder name. Used for names read from disk, which may
    /// legally contain characters such as `\`.
    pub fn ensure_segments<S: AsRef<str>>(&mut self, segs: &[S]) -> &mut Folder {
        let mut current = self;
        for seg in segs {
            let seg = seg.as_ref();
            let idx = match current.folders.iter().position(|f| f.name == seg) {
                Some(idx) => idx,
                None => {
                    current.folders.push(Folder::new(seg, false));
                    current.folders.len() - 1
                }
            };
            current = &mut current.folders[idx];
        }
        current
    }

    /// Appends `file`. A name with separators (as found in zip entries) is
    /// placed below the matching subfolders, which are created on demand.
    pub fn add_file(&mut self, mut file: File) -> Result<(), ArchiverError> {
        let (parents, base) = split_name(&file.name)?;
        let base = base.to_string();
        let target = self.ensure_segments(&parents);
        file.name = base;
        target.files.push(file);
        Ok(())
    }

    /// Appends `file` as a direct child, without looking at separators.
    pub fn push_file(&mut self, file: File) -> Result<(), ArchiverError> {
        if file.name.is_empty() {
            return Err(ArchiverError::InvalidArgument("empty file name".into()));
        }
        self.files.push(file);
        Ok(())
    }

    /// Appends `folder` as a direct child, without looking at separators.
    pub fn push_folder(&mut self, folder: Folder) -> Result<&mut Folder, ArchiverError> {
        if folder.name.is_empty() {
            return Err(ArchiverError::InvalidArgument("empty folder name".into()));
        }
        self.folders.push(folder);
        let last = self.folders.len() - 1;
        Ok(&mut self.folders[last])
    }

    /// Appends `folder` and returns it, following the same placement rule as
    /// [`Folder::add_file`].
    pub fn add_folder(&mut self, mut folder: Folder) -> Result<&mut Folder, ArchiverError> {
        let (parents, base) = split_name(&folder.name)?;
        let base = base.to_string();
        let target = self.ensure_segments(&parents);
        folder.name = base;
        target.folders.push(folder);
        let last = target.folders.len() - 1;
        Ok(&mut target.folders[last])
    }

    /// Number of folders in this subtree, `self` included.
    pub fn folder_count(&self) -> usize {
        1 + self.folders.iter().map(Folder::folder_count).sum::<usize>()
    }

    /// Number of files in this subtree.
    pub fn file_count(&self) -> usize {
        self.files.len() + self.folders.iter().map(Folder::file_count).sum::<usize>()
    }
}

/// Content hash → every file carrying that content, in discovery order.
#[derive(Debug, Default)]
pub struct DedupIndex {
    entries: HashMap<ContentHash, Vec<File>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes `body`, records the resulting file and reports whether this is
    /// the first time the content has been seen.
    pub fn new_file(&mut self, name: &str, body: &[u8]) -> (File, bool) {
        let file = File {
            name: name.to_string(),
            size: body.len() as u64,
            hash: ContentHash::of(body),
        };
        let list = self.entries.entry(file.hash).or_default();
        let is_new = list.is_empty();
        list.push(file.clone());
        (file, is_new)
    }

    pub fn files_for(&self, hash: &ContentHash) -> &[File] {
        self.entries.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct contents.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One stored blob: where it starts in the uncompressed payload and how long it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobLocation {
    pub offset: u32,
    pub size: u32,
}

/// Payload offset of every distinct blob, in first-write order.
#[derive(Debug, Default)]
pub struct OffsetTable {
    order: Vec<(BlobLocation, ContentHash)>,
    by_hash: HashMap<ContentHash, BlobLocation>,
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a blob. Later records for an already known hash are ignored.
    pub fn record(&mut self, location: BlobLocation, hash: ContentHash) {
        if self.by_hash.contains_key(&hash) {
            return;
        }
        self.by_hash.insert(hash, location);
        self.order.push((location, hash));
    }

    pub fn location_of(&self, hash: &ContentHash) -> Option<BlobLocation> {
        self.by_hash.get(hash).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(BlobLocation, ContentHash)> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.by_hash.clear();
    }
}
