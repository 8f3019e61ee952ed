//! Zip files being rebuilt during an unpack.
//!
//! A container is written as entries arrive, which is in header order for
//! folders and empty files and in payload order for everything else. Each
//! zip therefore stays open, keyed by its path on disk, until the whole
//! unpack is done.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::ArchiverError;

#[derive(Default)]
pub struct ZipSinks {
    writers: BTreeMap<PathBuf, ZipWriter<BufWriter<File>>>,
}

impl ZipSinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of zip files opened so far.
    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Returns the writer for `archive`, creating the file on first use.
    pub fn open(&mut self, archive: &Path) -> Result<&mut ZipWriter<BufWriter<File>>, ArchiverError> {
        if !self.writers.contains_key(archive) {
            if let Some(parent) = archive.parent() {
                fs::create_dir_all(parent).map_err(|e| ArchiverError::io(e, parent))?;
            }
            let file = File::create(archive).map_err(|e| ArchiverError::io(e, archive))?;
            debug!(path = %archive.display(), "opened zip for writing");
            self.writers.insert(archive.to_path_buf(), ZipWriter::new(BufWriter::new(file)));
        }
        self.writers
            .get_mut(archive)
            .ok_or_else(|| ArchiverError::InvalidArgument(format!("no zip writer for '{}'", archive.display())))
    }

    pub fn add_directory(&mut self, archive: &Path, inner: &str) -> Result<(), ArchiverError> {
        let options = FileOptions::default().unix_permissions(0o755);
        self.open(archive)?.add_directory(inner, options)?;
        Ok(())
    }

    pub fn add_file(&mut self, archive: &Path, inner: &str, body: &[u8]) -> Result<(), ArchiverError> {
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);
        let writer = self.open(archive)?;
        writer.start_file(inner, options)?;
        writer.write_all(body).map_err(|e| ArchiverError::io(e, archive))?;
        Ok(())
    }

    /// Writes the central directory of every open zip and closes it.
    /// All writers are closed even if one fails; the first error is returned.
    pub fn finish(self) -> Result<(), ArchiverError> {
        let mut first_err = None;
        for (path, mut writer) in self.writers {
            let res = writer
                .finish()
                .map_err(ArchiverError::from)
                .and_then(|mut out| out.flush().map_err(|e| ArchiverError::io(e, &path)));
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
