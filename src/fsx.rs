//! Filesystem helpers shared by the pack and unpack pipelines.

use std::io;
use std::path::Path;

/// Extensions of files that are expanded as containers while packing.
pub const CONTAINER_EXTENSIONS: &[&str] = &["zip", "jar"];

/// True if `name` ends in one of [`CONTAINER_EXTENSIONS`], ignoring case.
pub fn is_container(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| CONTAINER_EXTENSIONS.iter().any(|c| ext.eq_ignore_ascii_case(c)))
        .unwrap_or(false)
}

/// Removes `dir` and everything below it. A missing directory is not an error.
pub fn remove_dir_recursive(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_extensions_ignore_case() {
        assert!(is_container("rt.jar"));
        assert!(is_container("Bundle.ZIP"));
        assert!(is_container("dir/lib.Jar"));
        assert!(!is_container("notes.txt"));
        assert!(!is_container("zip"));
        assert!(!is_container("archive.zip.bak"));
    }

    #[test]
    fn remove_missing_dir_is_ok() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("a");
        std::fs::create_dir_all(target.join("b/c"))?;
        std::fs::write(target.join("b/c/f"), b"x")?;

        remove_dir_recursive(&target)?;
        assert!(!target.exists());
        remove_dir_recursive(&target)?;
        Ok(())
    }
}
