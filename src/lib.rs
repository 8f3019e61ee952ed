//! # repack Core Library
//!
//! Packs a directory tree into a single deduplicated archive and unpacks it
//! again. `.zip` and `.jar` files found in the tree are opened and their
//! entries deduplicated together with ordinary files; on unpack they are
//! rebuilt as zip files.
//!
//! ## Key Modules
//!
//! - [`common`]: the in-memory tree, content hashes and the dedup tables.
//! - [`archive`]: the binary header format and the archive trailer.
//! - [`payload`]: the LZMA stream that holds every distinct blob once.
//! - [`compress`]: the packing pipeline.
//! - [`extract`]: the unpacking pipeline.
//!
//! ## Examples
//!
//! ```no_run
//! use std::path::Path;
//!
//! repack::pack(Path::new("tree"), Path::new("tree.rpk"))?;
//! repack::unpack(Path::new("tree.rpk"), Path::new("restored"))?;
//! # Ok::<(), repack::ArchiverError>(())
//! ```

use std::path::Path;

pub mod archive;
pub mod cli;
pub mod common;
pub mod compress;
pub mod error;
pub mod extract;
pub mod payload;
pub mod progress;
pub use error::ArchiverError;

// Cross-platform filesystem helpers
pub mod fsx;

pub use compress::{pack_with, PackOptions};
pub use extract::{read_header, unpack_with};

/// Packs the directory `source` into a new archive at `dest` with default options.
pub fn pack(source: &Path, dest: &Path) -> Result<(), ArchiverError> {
    pack_with(source, dest, &PackOptions::default(), &progress::NoopObserver)
}

/// Unpacks `archive` into the new directory `dest`.
pub fn unpack(archive: &Path, dest: &Path) -> Result<(), ArchiverError> {
    unpack_with(archive, dest, &progress::NoopObserver)
}
